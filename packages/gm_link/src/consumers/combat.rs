//! Combat status and the initiative list.
//!
//! The list holds at most one entry per participant: players keyed by player
//! id, NPCs by character id. Snapshot rows name NPCs without their character
//! id; such a row is keyed by name until a roll event for the same name
//! supplies the id. A repeated roll overwrites the roll in place and leaves
//! the entry's insertion sequence alone, so the list after any set of rolls
//! depends only on each participant's latest roll and first-seen order.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use super::{Consumer, ResyncScope, ResyncSender, read, write};
use crate::error::ListenerError;
use crate::events::protocol::{CombatStarted, InitiativeRolled, TurnChanged};
use crate::events::{EventKind, Listener, ServerEvent};
use crate::models::{
    CombatSnapshot, InitiativeEntry, NPC_PLAYER_ID, ParticipantKey, UNNAMED_NPC,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombatState {
    pub active: bool,
    pub combat_id: Option<i64>,
    pub round: u32,
    pub current_turn: Option<TurnChanged>,
    /// Sorted by [`InitiativeEntry::initiative_order`].
    pub initiative: Vec<InitiativeEntry>,
    /// This client's own roll, which the service only reports back to the GM.
    pub my_roll: Option<i32>,
    next_seq: u64,
}

impl CombatState {
    /// Row held for `key`. An NPC keyed by character id also claims a row
    /// listed under its name only, which then takes on the id.
    fn position(&mut self, key: &ParticipantKey, name: &str) -> Option<usize> {
        if let Some(index) = self.initiative.iter().position(|e| e.key() == *key) {
            return Some(index);
        }
        let ParticipantKey::Npc(character_id) = key else {
            return None;
        };
        let named = ParticipantKey::NpcNamed(name.to_string());
        let index = self.initiative.iter().position(|e| e.key() == named)?;
        self.initiative[index].character_id = Some(*character_id);
        Some(index)
    }

    fn upsert(&mut self, mut entry: InitiativeEntry) {
        let key = entry.key();
        let name = entry.display_name().to_string();
        match self.position(&key, &name) {
            Some(index) => self.initiative[index].roll = entry.roll,
            None => {
                entry.seq = self.next_seq;
                self.next_seq += 1;
                self.initiative.push(entry);
            }
        }
        self.initiative.sort_by(InitiativeEntry::initiative_order);
    }
}

pub struct CombatTracker {
    state: RwLock<CombatState>,
    resync: ResyncSender,
}

impl CombatTracker {
    pub fn new(resync: ResyncSender) -> Self {
        Self {
            state: RwLock::new(CombatState::default()),
            resync,
        }
    }

    pub fn snapshot(&self) -> CombatState {
        read(&self.state).clone()
    }

    pub fn initiative(&self) -> Vec<InitiativeEntry> {
        read(&self.state).initiative.clone()
    }

    pub fn is_active(&self) -> bool {
        read(&self.state).active
    }

    pub fn has_rolled(&self) -> bool {
        read(&self.state).my_roll.is_some()
    }

    pub fn reset(&self) {
        *write(&self.state) = CombatState::default();
    }

    /// Replace local state with a fetched snapshot. NPC character ids
    /// already learned from roll events are carried over by name, and rows
    /// naming the same participant twice are merged.
    pub fn replace(&self, snapshot: CombatSnapshot) {
        let mut state = write(&self.state);
        let my_roll = state.my_roll;
        let known_npcs: HashMap<String, i64> = state
            .initiative
            .iter()
            .filter(|e| e.is_npc)
            .filter_map(|e| Some((e.display_name().to_string(), e.character_id?)))
            .collect();
        *state = CombatState::default();
        let CombatSnapshot::Active(combat) = snapshot else {
            debug!("no active combat");
            return;
        };

        state.active = combat.is_active;
        state.combat_id = Some(combat.id);
        state.round = combat.round_number;
        state.my_roll = my_roll;
        for mut entry in combat.initiative_list.unwrap_or_default() {
            if entry.is_npc && entry.character_id.is_none() {
                entry.character_id = known_npcs.get(entry.display_name()).copied();
            }
            state.upsert(entry);
        }
        debug!(
            combat_id = combat.id,
            entries = state.initiative.len(),
            "combat state replaced"
        );
    }

    /// Record this client's roll after the request succeeded. Only `my_roll`
    /// is written; list entries come from events, so the two never conflict.
    pub fn record_own_roll(&self, roll: i32) {
        write(&self.state).my_roll = Some(roll);
    }

    fn on_started(&self, started: &CombatStarted) {
        let mut state = write(&self.state);
        *state = CombatState {
            active: true,
            combat_id: started.combat_id,
            round: started.round_number.unwrap_or(1),
            ..CombatState::default()
        };
    }

    fn on_initiative(&self, rolled: &InitiativeRolled) -> Result<(), ListenerError> {
        let npc = |character_id| InitiativeEntry {
            player_id: NPC_PLAYER_ID,
            player_name: "NPC".into(),
            character_id,
            character_name: Some(
                rolled
                    .character_name
                    .clone()
                    .unwrap_or_else(|| UNNAMED_NPC.into()),
            ),
            roll: Some(rolled.roll),
            is_npc: true,
            seq: 0,
        };
        let entry = match (rolled.is_npc, rolled.character_id, rolled.player_id) {
            (true, Some(character_id), _) => npc(Some(character_id)),
            (true, None, _) if rolled.character_name.is_some() => npc(None),
            (_, _, Some(player_id)) => InitiativeEntry {
                player_id,
                player_name: rolled.player_name.clone(),
                character_id: rolled.character_id,
                character_name: rolled.character_name.clone(),
                roll: Some(rolled.roll),
                is_npc: false,
                seq: 0,
            },
            _ => {
                return Err(ListenerError::Apply {
                    consumer: "combat",
                    event: EventKind::InitiativeRolled.to_string(),
                    reason: "roll names no player or NPC character".into(),
                });
            }
        };

        let mut state = write(&self.state);
        if !state.active {
            drop(state);
            self.resync
                .request(ResyncScope::Combat, "initiative roll outside known combat");
            return Ok(());
        }
        state.upsert(entry);
        Ok(())
    }
}

impl Listener for CombatTracker {
    fn name(&self) -> &'static str {
        "combat"
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        match event {
            ServerEvent::CombatStarted(started) => self.on_started(started),
            ServerEvent::CombatEnded => self.reset(),
            ServerEvent::TurnChanged(turn) => {
                let mut state = write(&self.state);
                state.round = turn.round_number;
                state.current_turn = Some(turn.clone());
            }
            ServerEvent::InitiativeRolled(rolled) => return self.on_initiative(rolled),
            ServerEvent::SessionEnded(_) => self.reset(),
            _ => {}
        }
        Ok(())
    }
}

impl Consumer for CombatTracker {
    const EVENTS: &'static [EventKind] = &[
        EventKind::CombatStarted,
        EventKind::CombatEnded,
        EventKind::TurnChanged,
        EventKind::InitiativeRolled,
        EventKind::SessionEnded,
    ];
}
