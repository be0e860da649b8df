//! Characters visible in the session, plus the locally selected one.

use std::sync::RwLock;

use tracing::debug;

use super::{Consumer, ResyncScope, ResyncSender, read, write};
use crate::error::ListenerError;
use crate::events::{EventKind, Listener, ServerEvent};
use crate::models::Character;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacterState {
    pub characters: Vec<Character>,
    pub selected: Option<i64>,
}

pub struct CharacterRoster {
    state: RwLock<CharacterState>,
    resync: ResyncSender,
}

impl CharacterRoster {
    pub fn new(resync: ResyncSender) -> Self {
        Self {
            state: RwLock::new(CharacterState::default()),
            resync,
        }
    }

    pub fn snapshot(&self) -> CharacterState {
        read(&self.state).clone()
    }

    pub fn characters(&self) -> Vec<Character> {
        read(&self.state).characters.clone()
    }

    pub fn character(&self, character_id: i64) -> Option<Character> {
        read(&self.state)
            .characters
            .iter()
            .find(|c| c.id == character_id)
            .cloned()
    }

    pub fn selected(&self) -> Option<Character> {
        let state = read(&self.state);
        let id = state.selected?;
        state.characters.iter().find(|c| c.id == id).cloned()
    }

    /// Returns false when the character is not held.
    pub fn select(&self, character_id: Option<i64>) -> bool {
        let mut state = write(&self.state);
        match character_id {
            Some(id) if !state.characters.iter().any(|c| c.id == id) => false,
            other => {
                state.selected = other;
                true
            }
        }
    }

    pub fn replace_characters(&self, characters: Vec<Character>) {
        let mut state = write(&self.state);
        let still_held = state
            .selected
            .is_none_or(|id| characters.iter().any(|c| c.id == id));
        if !still_held {
            state.selected = None;
        }
        state.characters = characters;
        debug!(count = state.characters.len(), "characters replaced");
    }

    /// Local result of a successful create or update: the full record the
    /// service returned, written whole, exactly as the echo would write it.
    pub fn upsert_local(&self, character: Character) {
        let mut state = write(&self.state);
        match state.characters.iter_mut().find(|c| c.id == character.id) {
            Some(existing) => *existing = character,
            None => state.characters.push(character),
        }
    }

    pub fn clear(&self) {
        *write(&self.state) = CharacterState::default();
    }

    fn replace_known(&self, character: &Character) -> bool {
        let mut state = write(&self.state);
        match state.characters.iter_mut().find(|c| c.id == character.id) {
            Some(existing) => {
                *existing = character.clone();
                true
            }
            None => false,
        }
    }

    fn set_hp(&self, character_id: i64, hp: i32) -> bool {
        let mut state = write(&self.state);
        match state.characters.iter_mut().find(|c| c.id == character_id) {
            Some(character) => {
                character.current_hp = hp;
                true
            }
            None => false,
        }
    }
}

impl Listener for CharacterRoster {
    fn name(&self) -> &'static str {
        "characters"
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        match event {
            ServerEvent::CharacterCreated(created) => {
                let mut state = write(&self.state);
                if !state.characters.iter().any(|c| c.id == created.character.id) {
                    state.characters.push(created.character.clone());
                }
            }
            ServerEvent::CharacterUpdated(updated) => {
                if !self.replace_known(&updated.character) {
                    self.resync
                        .request(ResyncScope::Characters, "character_updated for unknown character");
                }
            }
            ServerEvent::CharacterDeleted(deleted) => {
                let mut state = write(&self.state);
                state.characters.retain(|c| c.id != deleted.character_id);
                if state.selected == Some(deleted.character_id) {
                    state.selected = None;
                }
            }
            ServerEvent::HpChanged(changed) => {
                if !self.set_hp(changed.character_id, changed.hp) {
                    self.resync
                        .request(ResyncScope::Characters, "hp_changed for unknown character");
                }
            }
            ServerEvent::SessionEnded(_) => self.clear(),
            _ => {}
        }
        Ok(())
    }
}

impl Consumer for CharacterRoster {
    const EVENTS: &'static [EventKind] = &[
        EventKind::CharacterCreated,
        EventKind::CharacterUpdated,
        EventKind::CharacterDeleted,
        EventKind::HpChanged,
        EventKind::SessionEnded,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::protocol::{CharacterChanged, CharacterDeleted, HpChanged};

    fn roster() -> (CharacterRoster, tokio::sync::mpsc::UnboundedReceiver<ResyncScope>) {
        let (resync, rx) = ResyncSender::channel();
        (CharacterRoster::new(resync), rx)
    }

    fn character(id: i64, hp: i32) -> Character {
        Character {
            id,
            player_id: 1,
            name: format!("hero{id}"),
            max_hp: 20,
            current_hp: hp,
            ..Character::default()
        }
    }

    fn created(c: Character) -> ServerEvent {
        ServerEvent::CharacterCreated(CharacterChanged { character: c })
    }

    #[test]
    fn test_created_is_add_if_absent() {
        let (roster, _rx) = roster();
        roster.upsert_local(character(1, 20));
        roster.on_event(&created(character(1, 20))).unwrap();
        assert_eq!(roster.characters().len(), 1);
    }

    #[test]
    fn test_updated_replaces_or_resyncs() {
        let (roster, mut rx) = roster();
        roster.on_event(&created(character(1, 20))).unwrap();

        let mut renamed = character(1, 20);
        renamed.name = "Renamed".into();
        roster
            .on_event(&ServerEvent::CharacterUpdated(CharacterChanged {
                character: renamed,
            }))
            .unwrap();
        assert_eq!(roster.character(1).unwrap().name, "Renamed");
        assert!(rx.try_recv().is_err());

        roster
            .on_event(&ServerEvent::CharacterUpdated(CharacterChanged {
                character: character(2, 5),
            }))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), ResyncScope::Characters);
        assert!(roster.character(2).is_none());
    }

    #[test]
    fn test_hp_changed() {
        let (roster, mut rx) = roster();
        roster.on_event(&created(character(1, 20))).unwrap();
        roster
            .on_event(&ServerEvent::HpChanged(HpChanged {
                character_id: 1,
                hp: 13,
                damage: Some(7),
                heal: None,
            }))
            .unwrap();
        assert_eq!(roster.character(1).unwrap().current_hp, 13);

        roster
            .on_event(&ServerEvent::HpChanged(HpChanged {
                character_id: 99,
                hp: 1,
                damage: None,
                heal: Some(1),
            }))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), ResyncScope::Characters);
    }

    #[test]
    fn test_deleted_clears_selection() {
        let (roster, _rx) = roster();
        roster.replace_characters(vec![character(1, 20), character(2, 20)]);
        assert!(roster.select(Some(2)));
        assert!(!roster.select(Some(7)));

        roster
            .on_event(&ServerEvent::CharacterDeleted(CharacterDeleted { character_id: 2 }))
            .unwrap();
        assert!(roster.selected().is_none());
        assert_eq!(roster.characters().len(), 1);
    }

    #[test]
    fn test_replace_drops_stale_selection() {
        let (roster, _rx) = roster();
        roster.replace_characters(vec![character(1, 20)]);
        roster.select(Some(1));
        roster.replace_characters(vec![character(3, 20)]);
        assert_eq!(roster.snapshot().selected, None);
    }
}
