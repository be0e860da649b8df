//! Reconciliation consumers: per-domain state that merges streamed events
//! with locally applied optimistic changes.
//!
//! Consumers never fetch on their own. When an event references something
//! not held locally they ask for a resynchronization of their scope, and the
//! session loop performs the fetch and hands the result back.

pub mod board;
pub mod characters;
pub mod combat;
pub mod dice;
pub mod roster;

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::info;

use crate::events::{EventDispatcher, EventKind, Listener};

pub use board::{BoardState, MapBoard};
pub use characters::{CharacterRoster, CharacterState};
pub use combat::{CombatState, CombatTracker};
pub use dice::DiceLog;
pub use roster::{Roster, RosterState};

/// Collection a consumer can ask to have refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResyncScope {
    Players,
    Combat,
    Maps,
    Characters,
}

impl ResyncScope {
    pub const ALL: [ResyncScope; 4] = [
        ResyncScope::Players,
        ResyncScope::Combat,
        ResyncScope::Maps,
        ResyncScope::Characters,
    ];
}

/// Handle consumers use to request a resynchronization.
#[derive(Debug, Clone)]
pub struct ResyncSender {
    tx: mpsc::UnboundedSender<ResyncScope>,
}

impl ResyncSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResyncScope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, scope: ResyncScope, reason: &str) {
        info!(?scope, reason, "resynchronization requested");
        // A closed receiver means the session loop is gone; nothing to refresh.
        let _ = self.tx.send(scope);
    }
}

/// Lifecycle contract shared by every consumer. The dispatcher suppresses
/// duplicate registrations, so `attach` may be called any number of times.
pub trait Consumer: Listener + Sized + 'static {
    /// Events this consumer handles.
    const EVENTS: &'static [EventKind];

    /// Register for every event in [`Self::EVENTS`]. Returns how many
    /// registrations were new.
    fn attach(self: &Arc<Self>, dispatcher: &mut EventDispatcher) -> usize {
        let listener: Arc<dyn Listener> = self.clone();
        Self::EVENTS
            .iter()
            .filter(|kind| dispatcher.register(**kind, listener.clone()))
            .count()
    }

    fn detach(self: &Arc<Self>, dispatcher: &mut EventDispatcher) {
        let listener: Arc<dyn Listener> = self.clone();
        for kind in Self::EVENTS {
            dispatcher.unregister(*kind, &listener);
        }
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// All consumers of one client session.
#[derive(Clone)]
pub struct Consumers {
    pub roster: Arc<Roster>,
    pub combat: Arc<CombatTracker>,
    pub board: Arc<MapBoard>,
    pub characters: Arc<CharacterRoster>,
    pub dice: Arc<DiceLog>,
}

impl Consumers {
    pub fn new(resync: ResyncSender) -> Self {
        Self {
            roster: Arc::new(Roster::new(resync.clone())),
            combat: Arc::new(CombatTracker::new(resync.clone())),
            board: Arc::new(MapBoard::new(resync.clone())),
            characters: Arc::new(CharacterRoster::new(resync)),
            dice: Arc::new(DiceLog::new()),
        }
    }

    pub fn attach_all(&self, dispatcher: &mut EventDispatcher) -> usize {
        self.roster.attach(dispatcher)
            + self.combat.attach(dispatcher)
            + self.board.attach(dispatcher)
            + self.characters.attach(dispatcher)
            + self.dice.attach(dispatcher)
    }

    pub fn detach_all(&self, dispatcher: &mut EventDispatcher) {
        self.roster.detach(dispatcher);
        self.combat.detach(dispatcher);
        self.board.detach(dispatcher);
        self.characters.detach(dispatcher);
        self.dice.detach(dispatcher);
    }

    /// Drop everything tied to the current game session.
    pub fn clear_session_state(&self) {
        self.roster.clear();
        self.combat.reset();
        self.board.clear();
        self.characters.clear();
        self.dice.clear();
    }
}
