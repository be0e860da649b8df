//! `gm watch`: hold the streaming channel open and follow the session.
//!
//! Lines typed on stdin are sent as chat, except for slash commands:
//! `/roll <dice> [reason]`, `/ready`, `/unready`, `/init`, `/who`, `/start`,
//! `/leave` (announce departure and forget the session) and `/quit`
//! (disconnect but keep the session for `gm rejoin`).

use std::io::BufRead;

use anyhow::{Context, Result, bail};
use gm_link::events::ServerEvent;
use gm_link::{EventKind, SessionEnd, SessionExit, SessionHandle, listener_fn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Workspace;

const FOLLOWED: &[EventKind] = &[
    EventKind::Connected,
    EventKind::Disconnected,
    EventKind::PlayerJoined,
    EventKind::PlayerLeft,
    EventKind::SessionStarted,
    EventKind::Chat,
    EventKind::DiceResult,
    EventKind::CombatStarted,
    EventKind::CombatEnded,
    EventKind::TurnChanged,
    EventKind::InitiativeRolled,
];

pub async fn watch_command(workspace: &Workspace) -> Result<()> {
    let mut session = workspace.session()?;
    let identity = session.api().identity();
    let Some(code) = identity.session_code.clone() else {
        bail!("No session to watch; use `gm create` or `gm join <code> <name>`");
    };

    let printer = listener_fn("terminal", |event| {
        if let Some(line) = describe(event) {
            println!("{line}");
        }
        Ok(())
    });
    for kind in FOLLOWED {
        session.dispatcher_mut().register(*kind, printer.clone());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            ctrl_c.cancel();
        }
    });
    tokio::spawn(read_input(session.handle(), cancel.clone()));

    eprintln!("Watching session {code}. Type to chat, /quit to stop.");
    let exit = session.run(cancel.clone()).await;
    cancel.cancel();

    match exit.context("Lost the streaming channel")? {
        SessionExit::Cancelled => eprintln!("Disconnected; `gm rejoin` resumes session {code}"),
        SessionExit::Ended(SessionEnd::Ended) => eprintln!("The session has ended"),
        SessionExit::Ended(SessionEnd::Left) => eprintln!("Left session {code}"),
        SessionExit::Ended(SessionEnd::LoggedOut) => {
            bail!("Signed out: the service no longer accepts the stored credentials")
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Chat(String),
    Roll { dice: String, reason: Option<String> },
    Ready(bool),
    Initiative,
    Who,
    Start,
    Leave,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Chat(line.to_string()));
    };

    let mut parts = command.splitn(3, char::is_whitespace);
    let input = match parts.next().unwrap_or_default() {
        "roll" => match parts.next().filter(|d| !d.is_empty()) {
            Some(dice) => Input::Roll {
                dice: dice.to_string(),
                reason: parts.next().map(str::trim).filter(|r| !r.is_empty()).map(String::from),
            },
            None => Input::Unknown(line.to_string()),
        },
        "ready" => Input::Ready(true),
        "unready" => Input::Ready(false),
        "init" => Input::Initiative,
        "who" => Input::Who,
        "start" => Input::Start,
        "leave" => Input::Leave,
        "quit" => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    };
    Some(input)
}

/// Stdin is read on a plain thread; a blocking read inside the runtime
/// would hold up shutdown until the next line arrives.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin");
                    return;
                }
            }
        }
        debug!("stdin closed");
    });
    rx
}

async fn read_input(handle: SessionHandle, cancel: CancellationToken) {
    let mut lines = spawn_stdin_reader();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            return;
        };
        let Some(input) = parse_input(&line) else {
            continue;
        };
        if let Err(e) = apply(&handle, &cancel, input).await {
            warn!(error = %format!("{e:#}"), "command failed");
        }
    }
}

async fn apply(handle: &SessionHandle, cancel: &CancellationToken, input: Input) -> Result<()> {
    match input {
        Input::Chat(message) => handle.chat(&message)?,
        Input::Roll { dice, reason } => handle.roll_dice(&dice, reason.as_deref())?,
        Input::Ready(is_ready) => handle.api().set_ready(is_ready).await?,
        Input::Initiative => {
            let roll = handle.api().roll_initiative().await?;
            eprintln!("Initiative: {}", roll.roll);
        }
        Input::Who => {
            for player in handle.api().consumers().roster.players() {
                let online = match player.is_online {
                    Some(false) => " (away)",
                    _ => "",
                };
                let ready = if player.is_ready { " ready" } else { "" };
                let gm = if player.is_gm { " [GM]" } else { "" };
                eprintln!("  {}{gm}{ready}{online}", player.name);
            }
        }
        Input::Start => handle.api().start_session().await?,
        Input::Leave => handle.leave().await?,
        Input::Quit => cancel.cancel(),
        Input::Unknown(line) => eprintln!("Unknown command: {line}"),
    }
    Ok(())
}

fn describe(event: &ServerEvent) -> Option<String> {
    let line = match event {
        ServerEvent::Connected => "* connected".to_string(),
        ServerEvent::Disconnected => "* disconnected".to_string(),
        ServerEvent::PlayerJoined(e) => format!("* {} joined", e.player_name),
        ServerEvent::PlayerLeft(e) => format!("* player {} left", e.player_id),
        ServerEvent::SessionStarted(_) => "* the session has started".to_string(),
        ServerEvent::Chat(e) => format!("<{}> {}", e.player_name, e.message),
        ServerEvent::DiceResult(e) => {
            let mut line = format!("* {} rolled {}: {}", e.player_name, e.dice, e.total);
            if let Some(reason) = &e.reason {
                line.push_str(&format!(" ({reason})"));
            }
            line
        }
        ServerEvent::CombatStarted(_) => "* combat started".to_string(),
        ServerEvent::CombatEnded => "* combat ended".to_string(),
        ServerEvent::TurnChanged(e) => {
            format!("* round {}: {}'s turn", e.round_number, e.character_name)
        }
        ServerEvent::InitiativeRolled(e) => {
            let who = e.character_name.as_deref().unwrap_or(&e.player_name);
            format!("* {who} rolled {} for initiative", e.roll)
        }
        _ => return None,
    };
    Some(line)
}
