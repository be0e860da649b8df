//! `gm create|join|rejoin|start|info|leave`: game session membership.

use anyhow::{Context, Result, bail};
use gm_link::JoinedSession;
use gm_link::models::SessionInfo;

use super::Workspace;

pub async fn create_command(workspace: &Workspace) -> Result<()> {
    let session = workspace.session()?;
    let joined = session
        .api()
        .create_session()
        .await
        .context("Failed to create session")?;
    report_joined(&joined);
    eprintln!("Share the code {} with your players", joined.session_code);
    Ok(())
}

pub async fn join_command(workspace: &Workspace, code: &str, name: &str) -> Result<()> {
    let session = workspace.session()?;
    let joined = session
        .api()
        .join_session(code, name)
        .await
        .with_context(|| format!("Failed to join session {code}"))?;
    report_joined(&joined);
    Ok(())
}

pub fn rejoin_command(workspace: &Workspace) -> Result<()> {
    let session = workspace.session()?;
    let identity = match session.api().rejoin() {
        Ok(identity) => identity,
        Err(gm_link::ApiError::NotAuthenticated) => {
            bail!("No stored session to rejoin; use `gm join <code> <name>`")
        }
        Err(e) => return Err(e).context("Failed to restore session"),
    };
    let code = identity.session_code.as_deref().unwrap_or("(unknown)");
    let role = if identity.is_gm { "game master" } else { "player" };
    eprintln!("Session {code} restored as {role}; run `gm watch` to reconnect");
    Ok(())
}

pub async fn start_command(workspace: &Workspace) -> Result<()> {
    let session = workspace.session()?;
    let identity = session.api().identity();
    if identity.session_code.is_none() {
        bail!("No session to start; use `gm create` first");
    }
    if !identity.is_gm {
        bail!("Only the game master can start the session");
    }
    session
        .api()
        .start_session()
        .await
        .context("Failed to start session")?;
    eprintln!("Session started");
    Ok(())
}

pub async fn info_command(workspace: &Workspace, as_json: bool) -> Result<()> {
    let session = workspace.session()?;
    if session.api().identity().session_code.is_none() {
        bail!("Not in a session; use `gm create` or `gm join <code> <name>`");
    }
    let info = session
        .api()
        .session_info()
        .await
        .context("Failed to fetch session")?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        eprintln!("{}", describe_info(&info));
    }
    Ok(())
}

fn describe_info(info: &SessionInfo) -> String {
    let state = match (info.is_active, info.session_started) {
        (false, _) => "ended",
        (true, false) => "waiting to start",
        (true, true) => "in play",
    };
    let players = match info.player_count {
        1 => "1 player".to_string(),
        n => format!("{n} players"),
    };
    format!("Session {}: {state}, {players}", info.code)
}

/// Forget the session locally. A running `gm watch` announces its own
/// departure when it exits through `/leave`.
pub fn leave_command(workspace: &Workspace) -> Result<()> {
    let session = workspace.session()?;
    let identity = session.api().identity();
    if identity.session_code.is_none() && !identity.can_rejoin {
        eprintln!("Not in a session");
        return Ok(());
    }
    session.api().leave_session().context("Failed to leave session")?;
    eprintln!("Left the session");
    Ok(())
}

fn report_joined(joined: &JoinedSession) {
    if joined.is_gm {
        eprintln!("Running session {} as game master", joined.session_code);
        return;
    }
    match joined.player_id {
        Some(id) => eprintln!("Joined session {} as player {id}", joined.session_code),
        None => eprintln!("Joined session {}", joined.session_code),
    }
    if let Some(character_id) = joined.character_id {
        eprintln!("  character: {character_id}");
    }
}
