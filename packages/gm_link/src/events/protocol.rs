//! Typed streaming-channel events.
//!
//! Every event the service is known to send has an [`EventKind`] and a
//! payload struct describing its shape. Names outside that set decode to
//! [`ServerEvent::Other`] with the raw payload, so newer servers keep working.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Character, DiceResult, GameMap, MapToken, TokenPatch};
use crate::stream::frame::Envelope;

/// Closed set of known event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Local: the streaming channel opened.
    Connected,
    /// Local: the streaming channel closed.
    Disconnected,
    Error,
    Ping,
    PlayerJoined,
    PlayerLeft,
    PlayerReady,
    SessionStarted,
    SessionEnded,
    CharacterCreated,
    CharacterUpdated,
    CharacterDeleted,
    HpChanged,
    DiceResult,
    Chat,
    CombatStarted,
    CombatEnded,
    TurnChanged,
    InitiativeRolled,
    MapCreated,
    MapChanged,
    TokenAdded,
    TokenUpdated,
    TokenRemoved,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        Self::Connected,
        Self::Disconnected,
        Self::Error,
        Self::Ping,
        Self::PlayerJoined,
        Self::PlayerLeft,
        Self::PlayerReady,
        Self::SessionStarted,
        Self::SessionEnded,
        Self::CharacterCreated,
        Self::CharacterUpdated,
        Self::CharacterDeleted,
        Self::HpChanged,
        Self::DiceResult,
        Self::Chat,
        Self::CombatStarted,
        Self::CombatEnded,
        Self::TurnChanged,
        Self::InitiativeRolled,
        Self::MapCreated,
        Self::MapChanged,
        Self::TokenAdded,
        Self::TokenUpdated,
        Self::TokenRemoved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::PlayerJoined => "player_joined",
            Self::PlayerLeft => "player_left",
            Self::PlayerReady => "player_ready",
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
            Self::CharacterCreated => "character_created",
            Self::CharacterUpdated => "character_updated",
            Self::CharacterDeleted => "character_deleted",
            Self::HpChanged => "hp_changed",
            Self::DiceResult => "dice_result",
            Self::Chat => "chat",
            Self::CombatStarted => "combat_started",
            Self::CombatEnded => "combat_ended",
            Self::TurnChanged => "turn_changed",
            Self::InitiativeRolled => "initiative_rolled",
            Self::MapCreated => "map_created",
            Self::MapChanged => "map_changed",
            Self::TokenAdded => "token_added",
            Self::TokenUpdated => "token_updated",
            Self::TokenRemoved => "token_removed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoined {
    pub player_id: i64,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub is_gm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeft {
    pub player_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerReady {
    pub player_id: i64,
    #[serde(default)]
    pub player_name: String,
    pub is_ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStarted {
    pub session_id: Option<i64>,
    pub session_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionEnded {
    pub reason: Option<String>,
}

/// Full character record, sent on create and on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterChanged {
    pub character: Character,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterDeleted {
    pub character_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpChanged {
    pub character_id: i64,
    pub hp: i32,
    #[serde(default)]
    pub damage: Option<i32>,
    #[serde(default)]
    pub heal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub player_id: Option<i64>,
    #[serde(default)]
    pub player_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatStarted {
    #[serde(alias = "id")]
    pub combat_id: Option<i64>,
    pub round_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnChanged {
    pub participant_id: i64,
    pub character_id: i64,
    #[serde(default)]
    pub character_name: String,
    pub round_number: u32,
}

/// An initiative roll. Player rolls carry `player_id`; NPC rolls carry
/// `character_id` and `is_npc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeRolled {
    #[serde(default)]
    pub player_id: Option<i64>,
    #[serde(default)]
    pub character_id: Option<i64>,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub character_name: Option<String>,
    pub roll: i32,
    #[serde(default)]
    pub is_npc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapCreated {
    pub map: GameMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapChanged {
    pub map_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub background_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAdded {
    pub map_id: String,
    pub token: MapToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUpdated {
    pub map_id: String,
    pub token_id: String,
    #[serde(default)]
    pub changes: TokenPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRemoved {
    pub map_id: String,
    pub token_id: String,
}

// =============================================================================
// ServerEvent
// =============================================================================

/// One event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected,
    Disconnected,
    Error(ErrorPayload),
    Ping(Value),
    PlayerJoined(PlayerJoined),
    PlayerLeft(PlayerLeft),
    PlayerReady(PlayerReady),
    SessionStarted(SessionStarted),
    SessionEnded(SessionEnded),
    CharacterCreated(CharacterChanged),
    CharacterUpdated(CharacterChanged),
    CharacterDeleted(CharacterDeleted),
    HpChanged(HpChanged),
    DiceResult(DiceResult),
    Chat(ChatMessage),
    CombatStarted(CombatStarted),
    CombatEnded,
    TurnChanged(TurnChanged),
    InitiativeRolled(InitiativeRolled),
    MapCreated(MapCreated),
    MapChanged(MapChanged),
    TokenAdded(TokenAdded),
    TokenUpdated(TokenUpdated),
    TokenRemoved(TokenRemoved),
    /// An event name outside the known set.
    Other { name: String, payload: Value },
}

impl ServerEvent {
    /// Decode an envelope. A known name with a payload of the wrong shape is
    /// an error; an unknown name always decodes to [`ServerEvent::Other`].
    pub fn decode(envelope: Envelope) -> Result<Self, serde_json::Error> {
        let Some(kind) = EventKind::from_name(&envelope.event) else {
            return Ok(Self::Other {
                name: envelope.event,
                payload: envelope.payload,
            });
        };

        let p = envelope.payload;
        let event = match kind {
            EventKind::Connected => Self::Connected,
            EventKind::Disconnected => Self::Disconnected,
            EventKind::Error => Self::Error(serde_json::from_value(p)?),
            EventKind::Ping => Self::Ping(p),
            EventKind::PlayerJoined => Self::PlayerJoined(serde_json::from_value(p)?),
            EventKind::PlayerLeft => Self::PlayerLeft(serde_json::from_value(p)?),
            EventKind::PlayerReady => Self::PlayerReady(serde_json::from_value(p)?),
            EventKind::SessionStarted => Self::SessionStarted(serde_json::from_value(p)?),
            EventKind::SessionEnded => Self::SessionEnded(serde_json::from_value(p)?),
            EventKind::CharacterCreated => Self::CharacterCreated(serde_json::from_value(p)?),
            EventKind::CharacterUpdated => Self::CharacterUpdated(serde_json::from_value(p)?),
            EventKind::CharacterDeleted => Self::CharacterDeleted(serde_json::from_value(p)?),
            EventKind::HpChanged => Self::HpChanged(serde_json::from_value(p)?),
            EventKind::DiceResult => Self::DiceResult(serde_json::from_value(p)?),
            EventKind::Chat => Self::Chat(serde_json::from_value(p)?),
            EventKind::CombatStarted => Self::CombatStarted(serde_json::from_value(p)?),
            EventKind::CombatEnded => Self::CombatEnded,
            EventKind::TurnChanged => Self::TurnChanged(serde_json::from_value(p)?),
            EventKind::InitiativeRolled => Self::InitiativeRolled(serde_json::from_value(p)?),
            EventKind::MapCreated => Self::MapCreated(serde_json::from_value(p)?),
            EventKind::MapChanged => Self::MapChanged(serde_json::from_value(p)?),
            EventKind::TokenAdded => Self::TokenAdded(serde_json::from_value(p)?),
            EventKind::TokenUpdated => Self::TokenUpdated(serde_json::from_value(p)?),
            EventKind::TokenRemoved => Self::TokenRemoved(serde_json::from_value(p)?),
        };
        Ok(event)
    }

    /// `None` for [`ServerEvent::Other`].
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Error(_) => EventKind::Error,
            Self::Ping(_) => EventKind::Ping,
            Self::PlayerJoined(_) => EventKind::PlayerJoined,
            Self::PlayerLeft(_) => EventKind::PlayerLeft,
            Self::PlayerReady(_) => EventKind::PlayerReady,
            Self::SessionStarted(_) => EventKind::SessionStarted,
            Self::SessionEnded(_) => EventKind::SessionEnded,
            Self::CharacterCreated(_) => EventKind::CharacterCreated,
            Self::CharacterUpdated(_) => EventKind::CharacterUpdated,
            Self::CharacterDeleted(_) => EventKind::CharacterDeleted,
            Self::HpChanged(_) => EventKind::HpChanged,
            Self::DiceResult(_) => EventKind::DiceResult,
            Self::Chat(_) => EventKind::Chat,
            Self::CombatStarted(_) => EventKind::CombatStarted,
            Self::CombatEnded => EventKind::CombatEnded,
            Self::TurnChanged(_) => EventKind::TurnChanged,
            Self::InitiativeRolled(_) => EventKind::InitiativeRolled,
            Self::MapCreated(_) => EventKind::MapCreated,
            Self::MapChanged(_) => EventKind::MapChanged,
            Self::TokenAdded(_) => EventKind::TokenAdded,
            Self::TokenUpdated(_) => EventKind::TokenUpdated,
            Self::TokenRemoved(_) => EventKind::TokenRemoved,
            Self::Other { .. } => return None,
        };
        Some(kind)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Other { name, .. } => name,
            known => known.kind().map(EventKind::as_str).unwrap_or_default(),
        }
    }
}
