//! Recent dice results, newest first.

use std::collections::VecDeque;
use std::sync::RwLock;

use super::{Consumer, read, write};
use crate::error::ListenerError;
use crate::events::{EventKind, Listener, ServerEvent};
use crate::models::DiceResult;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Default)]
pub struct DiceLog {
    history: RwLock<VecDeque<DiceResult>>,
}

impl DiceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<DiceResult> {
        read(&self.history).front().cloned()
    }

    pub fn history(&self) -> Vec<DiceResult> {
        read(&self.history).iter().cloned().collect()
    }

    pub fn clear(&self) {
        write(&self.history).clear();
    }

    fn push(&self, result: DiceResult) {
        let mut history = write(&self.history);
        history.push_front(result);
        history.truncate(HISTORY_LIMIT);
    }
}

impl Listener for DiceLog {
    fn name(&self) -> &'static str {
        "dice"
    }

    fn on_event(&self, event: &ServerEvent) -> Result<(), ListenerError> {
        match event {
            ServerEvent::DiceResult(result) => self.push(result.clone()),
            ServerEvent::SessionEnded(_) => self.clear(),
            _ => {}
        }
        Ok(())
    }
}

impl Consumer for DiceLog {
    const EVENTS: &'static [EventKind] = &[EventKind::DiceResult, EventKind::SessionEnded];
}
