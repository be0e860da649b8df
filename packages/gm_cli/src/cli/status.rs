//! `gm status`: stored identity and the effective configuration.

use anyhow::Result;
use gm_link::StoredIdentity;
use serde_json::{Value, json};

use super::Workspace;

pub fn status_command(workspace: &Workspace, as_json: bool) -> Result<()> {
    let session = workspace.session()?;
    let identity = session.api().identity();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status_json(workspace, &identity))?);
        return Ok(());
    }

    let config = workspace.config();
    eprintln!("Data directory: {}", workspace.data_dir().display());
    eprintln!("  api:        {}", config.api.base_url);
    eprintln!("  stream:     {}", config.stream.url);
    eprintln!("  credential: {:?}", config.api.placement);
    eprintln!(
        "  retries:    {} (base delay {}ms)",
        config.stream.max_attempts,
        config.stream.base_delay.as_millis()
    );

    match &identity.user {
        Some(user) => eprintln!("Signed in as {}", user.username),
        None if identity.authenticated => eprintln!("Holding a session credential"),
        None => eprintln!("Not signed in"),
    }
    match &identity.session_code {
        Some(code) if identity.is_gm => eprintln!("Session {code} (game master)"),
        Some(code) => match identity.player_id {
            Some(id) => eprintln!("Session {code} (player {id})"),
            None => eprintln!("Session {code}"),
        },
        None => eprintln!("No session"),
    }
    if identity.can_rejoin {
        eprintln!("  rejoin:     available");
    }
    Ok(())
}

fn status_json(workspace: &Workspace, identity: &StoredIdentity) -> Value {
    let config = workspace.config();
    json!({
        "data_dir": workspace.data_dir(),
        "api_base_url": config.api.base_url.as_str(),
        "stream_url": config.stream.url.as_str(),
        "user": identity.user.as_ref().map(|u| &u.username),
        "authenticated": identity.authenticated,
        "session_code": identity.session_code,
        "player_id": identity.player_id,
        "is_gm": identity.is_gm,
        "can_rejoin": identity.can_rejoin,
    })
}
