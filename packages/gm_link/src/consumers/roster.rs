//! Player roster and session/stream status.
//!
//! Merge rules:
//! - join: add if absent, otherwise mark online.
//! - leave: mark offline. Entries are never removed, so readiness survives.
//! - ready: overwrite readiness of the matching entry.
//!
//! `set_ready_local` writes the same field a `player_ready` echo would, with
//! the same value, so local and remote application commute.

use std::sync::RwLock;

use tracing::debug;

use super::{Consumer, ResyncScope, ResyncSender, read, write};
use crate::error::ListenerError;
use crate::events::protocol::{PlayerJoined, PlayerReady};
use crate::events::{EventKind, Listener, ServerEvent};
use crate::models::Player;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterState {
    pub players: Vec<Player>,
    /// Whether the streaming channel is currently open.
    pub connected: bool,
    pub session_started: bool,
    pub session_code: Option<String>,
}

pub struct Roster {
    state: RwLock<RosterState>,
    resync: ResyncSender,
}

impl Roster {
    pub fn new(resync: ResyncSender) -> Self {
        Self {
            state: RwLock::new(RosterState::default()),
            resync,
        }
    }

    pub fn snapshot(&self) -> RosterState {
        read(&self.state).clone()
    }

    pub fn players(&self) -> Vec<Player> {
        read(&self.state).players.clone()
    }

    pub fn player(&self, player_id: i64) -> Option<Player> {
        read(&self.state)
            .players
            .iter()
            .find(|p| p.id == player_id)
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        read(&self.state).connected
    }

    /// Replace the list with a fetched one, keeping locally observed
    /// connectivity for players the fetch does not report it for.
    pub fn replace_players(&self, players: Vec<Player>) {
        let mut state = write(&self.state);
        let merged = players
            .into_iter()
            .map(|mut fetched| {
                if fetched.is_online.is_none() {
                    fetched.is_online = state
                        .players
                        .iter()
                        .find(|p| p.id == fetched.id)
                        .and_then(|p| p.is_online);
                }
                fetched
            })
            .collect();
        state.players = merged;
        debug!(count = state.players.len(), "roster replaced");
    }

    /// Optimistic readiness change after the request succeeded.
    pub fn set_ready_local(&self, player_id: i64, is_ready: bool) {
        let mut state = write(&self.state);
        if let Some(player) = state.players.iter_mut().find(|p| p.id == player_id) {
            player.is_ready = is_ready;
        }
    }

    pub fn mark_session_started(&self, session_code: Option<String>) {
        let mut state = write(&self.state);
        state.session_started = true;
        if session_code.is_some() {
            state.session_code = session_code;
        }
    }

    pub fn clear(&self) {
        let mut state = write(&self.state);
        let connected = state.connected;
        *state = RosterState {
            connected,
            ..RosterState::default()
        };
    }

    fn on_joined(&self, joined: &PlayerJoined) {
        let mut state = write(&self.state);
        match state.players.iter_mut().find(|p| p.id == joined.player_id) {
            Some(player) => player.is_online = Some(true),
            None => state.players.push(Player {
                id: joined.player_id,
                name: joined.player_name.clone(),
                is_gm: joined.is_gm,
                is_online: Some(true),
                is_ready: false,
                can_move: false,
            }),
        }
    }

    fn on_left(&self, player_id: i64) {
        let known = {
            let mut state = write(&self.state);
            match state.players.iter_mut().find(|p| p.id == player_id) {
                Some(player) => {
                    player.is_online = Some(false);
                    true
                }
                None => false,
            }
        };
        if !known {
            self.resync.request(ResyncScope::Players, "player_left for unknown player");
        }
    }

    fn on_ready(&self, ready: &PlayerReady) {
        let known = {
            let mut state = write(&self.state);
            match state.players.iter_mut().find(|p| p.id == ready.player_id) {
                Some(player) => {
                    player.is_ready = ready.is_ready;
                    true
                }
                None => false,
            }
        };
        if !known {
            self.resync.request(ResyncScope::Players, "player_ready for unknown player");
        }
    }
}

impl Listener for Roster {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        match event {
            ServerEvent::Connected => write(&self.state).connected = true,
            ServerEvent::Disconnected => write(&self.state).connected = false,
            ServerEvent::PlayerJoined(joined) => self.on_joined(joined),
            ServerEvent::PlayerLeft(left) => self.on_left(left.player_id),
            ServerEvent::PlayerReady(ready) => self.on_ready(ready),
            ServerEvent::SessionStarted(started) => {
                self.mark_session_started(started.session_code.clone())
            }
            ServerEvent::SessionEnded(_) => self.clear(),
            _ => {}
        }
        Ok(())
    }
}

impl Consumer for Roster {
    const EVENTS: &'static [EventKind] = &[
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::PlayerJoined,
        EventKind::PlayerLeft,
        EventKind::PlayerReady,
        EventKind::SessionStarted,
        EventKind::SessionEnded,
    ];
}
