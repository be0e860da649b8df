//! `gm login|register|logout`: account credentials.

use anyhow::{Context, Result, anyhow};
use gm_link::ApiError;
use tracing::info;

use super::{Workspace, password_or_prompt};

pub async fn login_command(
    workspace: &Workspace,
    username: &str,
    password: Option<String>,
) -> Result<()> {
    let password = password_or_prompt(password)?;
    let session = workspace.session()?;
    let user = session
        .api()
        .login(username, &password)
        .await
        .map_err(login_failure)?;
    eprintln!("Signed in as {}", user.username);
    Ok(())
}

/// A refused login is reported plainly; anything else keeps its cause.
fn login_failure(err: ApiError) -> anyhow::Error {
    if err.is_unauthorized() {
        anyhow!("Wrong username or password")
    } else {
        anyhow::Error::new(err).context("Login failed")
    }
}

pub async fn register_command(
    workspace: &Workspace,
    username: &str,
    display_name: Option<&str>,
    password: Option<String>,
) -> Result<()> {
    let password = password_or_prompt(password)?;
    let session = workspace.session()?;
    let user = session
        .api()
        .register(username, display_name.unwrap_or(username), &password)
        .await
        .context("Registration failed")?;
    eprintln!("Account {} created and signed in", user.username);
    Ok(())
}

pub fn logout_command(workspace: &Workspace) -> Result<()> {
    let session = workspace.session()?;
    session.api().logout().context("Failed to clear credentials")?;
    info!(path = %workspace.credentials_path().display(), "credentials cleared");
    eprintln!("Signed out");
    Ok(())
}
