//! Maps and the tokens placed on them.
//!
//! Token additions are add-if-absent by id and token updates are field-wise
//! overwrites, so applying the local result of a request and the echoed event
//! in either order leaves the same board. Any event that refers to a map or
//! token this board does not hold triggers a refetch of all maps.

use std::sync::RwLock;

use tracing::debug;

use super::{Consumer, ResyncScope, ResyncSender, read, write};
use crate::error::ListenerError;
use crate::events::protocol::{TokenAdded, TokenRemoved, TokenUpdated};
use crate::events::{EventKind, Listener, ServerEvent};
use crate::models::{GameMap, MapToken, TokenPatch};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardState {
    pub maps: Vec<GameMap>,
    pub active_map_id: Option<String>,
}

impl BoardState {
    fn map_mut(&mut self, map_id: &str) -> Option<&mut GameMap> {
        self.maps.iter_mut().find(|m| m.id == map_id)
    }

    fn add_map(&mut self, map: GameMap) -> bool {
        if self.maps.iter().any(|m| m.id == map.id) {
            return false;
        }
        if map.is_active {
            self.active_map_id = Some(map.id.clone());
        }
        self.maps.push(map);
        true
    }

    fn activate(&mut self, map_id: &str) -> bool {
        if !self.maps.iter().any(|m| m.id == map_id) {
            return false;
        }
        for map in &mut self.maps {
            map.is_active = map.id == map_id;
        }
        self.active_map_id = Some(map_id.to_string());
        true
    }

    /// `None` when the map is unknown.
    fn add_token(&mut self, map_id: &str, token: MapToken) -> Option<bool> {
        let map = self.map_mut(map_id)?;
        if map.token(&token.id).is_some() {
            return Some(false);
        }
        map.tokens.push(token);
        Some(true)
    }

    /// `None` when the map is unknown.
    fn remove_token(&mut self, map_id: &str, token_id: &str) -> Option<bool> {
        let map = self.map_mut(map_id)?;
        let before = map.tokens.len();
        map.tokens.retain(|t| t.id != token_id);
        Some(map.tokens.len() != before)
    }

    /// `None` when the map or token is unknown.
    fn patch_token(&mut self, map_id: &str, token_id: &str, patch: &TokenPatch) -> Option<()> {
        let token = self.map_mut(map_id)?.token_mut(token_id)?;
        patch.apply_to(token);
        Some(())
    }
}

pub struct MapBoard {
    state: RwLock<BoardState>,
    resync: ResyncSender,
}

impl MapBoard {
    pub fn new(resync: ResyncSender) -> Self {
        Self {
            state: RwLock::new(BoardState::default()),
            resync,
        }
    }

    pub fn snapshot(&self) -> BoardState {
        read(&self.state).clone()
    }

    pub fn map(&self, map_id: &str) -> Option<GameMap> {
        read(&self.state).maps.iter().find(|m| m.id == map_id).cloned()
    }

    pub fn active_map(&self) -> Option<GameMap> {
        let state = read(&self.state);
        let active = state.active_map_id.as_deref()?;
        state.maps.iter().find(|m| m.id == active).cloned()
    }

    pub fn token(&self, map_id: &str, token_id: &str) -> Option<MapToken> {
        read(&self.state)
            .maps
            .iter()
            .find(|m| m.id == map_id)?
            .token(token_id)
            .cloned()
    }

    /// Replace every map with a fetched list.
    pub fn replace_maps(&self, maps: Vec<GameMap>) {
        let mut state = write(&self.state);
        state.active_map_id = maps.iter().find(|m| m.is_active).map(|m| m.id.clone());
        state.maps = maps;
        debug!(count = state.maps.len(), "maps replaced");
    }

    pub fn clear(&self) {
        *write(&self.state) = BoardState::default();
    }

    /// Local result of a successful token creation.
    pub fn add_token_local(&self, token: MapToken) {
        let map_id = token.map_id.clone();
        let added = write(&self.state).add_token(&map_id, token);
        if added.is_none() {
            self.resync.request(ResyncScope::Maps, "created token on unknown map");
        }
    }

    /// Local result of a successful token update.
    pub fn update_token_local(&self, map_id: &str, token_id: &str, patch: &TokenPatch) {
        if write(&self.state).patch_token(map_id, token_id, patch).is_none() {
            self.resync.request(ResyncScope::Maps, "updated unknown token");
        }
    }

    /// Local result of a successful token removal.
    pub fn remove_token_local(&self, map_id: &str, token_id: &str) {
        if write(&self.state).remove_token(map_id, token_id).is_none() {
            self.resync.request(ResyncScope::Maps, "removed token on unknown map");
        }
    }

    /// Local result of a successful map creation.
    pub fn add_map_local(&self, map: GameMap) {
        write(&self.state).add_map(map);
    }

    fn on_token_added(&self, added: &TokenAdded) {
        let outcome = write(&self.state).add_token(&added.map_id, added.token.clone());
        match outcome {
            Some(true) => {}
            Some(false) => debug!(token_id = %added.token.id, "token already present"),
            None => self
                .resync
                .request(ResyncScope::Maps, "token_added for unknown map"),
        }
    }

    fn on_token_updated(&self, updated: &TokenUpdated) {
        let applied =
            write(&self.state).patch_token(&updated.map_id, &updated.token_id, &updated.changes);
        if applied.is_none() {
            self.resync
                .request(ResyncScope::Maps, "token_updated for unknown map or token");
        }
    }

    fn on_token_removed(&self, removed: &TokenRemoved) {
        let outcome = write(&self.state).remove_token(&removed.map_id, &removed.token_id);
        match outcome {
            Some(true) => {}
            Some(false) => debug!(token_id = %removed.token_id, "token already gone"),
            None => self
                .resync
                .request(ResyncScope::Maps, "token_removed for unknown map"),
        }
    }
}

impl Listener for MapBoard {
    fn name(&self) -> &'static str {
        "board"
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        match event {
            ServerEvent::MapCreated(created) => {
                write(&self.state).add_map(created.map.clone());
            }
            ServerEvent::MapChanged(changed) => {
                if !write(&self.state).activate(&changed.map_id) {
                    self.resync
                        .request(ResyncScope::Maps, "map_changed to unknown map");
                }
            }
            ServerEvent::TokenAdded(added) => self.on_token_added(added),
            ServerEvent::TokenUpdated(updated) => self.on_token_updated(updated),
            ServerEvent::TokenRemoved(removed) => self.on_token_removed(removed),
            ServerEvent::SessionEnded(_) => self.clear(),
            _ => {}
        }
        Ok(())
    }
}

impl Consumer for MapBoard {
    const EVENTS: &'static [EventKind] = &[
        EventKind::MapCreated,
        EventKind::MapChanged,
        EventKind::TokenAdded,
        EventKind::TokenUpdated,
        EventKind::TokenRemoved,
        EventKind::SessionEnded,
    ];
}
