//! Domain records exchanged with the game-master service.
//!
//! Field names follow the service's JSON exactly. Records the service may
//! send partially carry `#[serde(default)]` so an older server does not
//! break decoding.

use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Session and players
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_gm: bool,
    /// Connectivity as seen through join/leave events. `None` until the first
    /// such event for this player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub can_move: bool,
}

/// State of the session the active credential belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionInfo {
    pub id: i64,
    pub code: String,
    pub is_active: bool,
    pub session_started: bool,
    pub player_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

// =============================================================================
// Characters
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub id: i64,
    pub player_id: i64,
    pub name: String,
    pub class_name: Option<String>,
    pub level: i32,
    pub strength: i32,
    pub dexterity: i32,
    pub constitution: i32,
    pub intelligence: i32,
    pub wisdom: i32,
    pub charisma: i32,
    pub max_hp: i32,
    pub current_hp: i32,
}

// =============================================================================
// Maps and tokens
// =============================================================================

fn default_scale() -> f64 {
    1.0
}

fn default_layer() -> String {
    "tokens".to_string()
}

fn default_token_type() -> String {
    "character".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapToken {
    pub id: String,
    pub map_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(rename = "type", default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub character_id: Option<i64>,
}

/// Partial token mutation, as carried by `token_updated` and sent by
/// [`crate::api::GmApi::update_token`].
///
/// Numeric and layer fields are `Some` only when present. Nullable fields use
/// `Option<Option<_>>`: absent leaves the token untouched, `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub label: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub color: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub icon: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub character_id: Option<Option<i64>>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from an absent field (`None`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl TokenPatch {
    /// Merge the present fields into `token`, leaving the rest untouched.
    ///
    /// Each field is overwritten with a fixed value, so applying the same
    /// patch twice yields the same token as applying it once.
    pub fn apply_to(&self, token: &mut MapToken) {
        if let Some(x) = self.x {
            token.x = x;
        }
        if let Some(y) = self.y {
            token.y = y;
        }
        if let Some(scale) = self.scale {
            token.scale = scale;
        }
        if let Some(rotation) = self.rotation {
            token.rotation = rotation;
        }
        if let Some(layer) = &self.layer {
            token.layer = layer.clone();
        }
        if let Some(label) = &self.label {
            token.label = label.clone();
        }
        if let Some(color) = &self.color {
            token.color = color.clone();
        }
        if let Some(icon) = &self.icon {
            token.icon = icon.clone();
        }
        if let Some(character_id) = self.character_id {
            token.character_id = character_id;
        }
    }
}

/// Fields needed to place a new token on a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewToken {
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_layer")]
    pub layer: String,
    #[serde(rename = "type", default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
}

impl NewToken {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            scale: default_scale(),
            rotation: 0.0,
            layer: default_layer(),
            token_type: default_token_type(),
            label: None,
            color: None,
            icon: None,
            character_id: None,
        }
    }
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_grid_scale() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMap {
    pub id: String,
    #[serde(default)]
    pub session_id: i64,
    pub name: String,
    #[serde(default)]
    pub background_url: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_grid_scale")]
    pub grid_scale: u32,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub tokens: Vec<MapToken>,
}

impl GameMap {
    pub fn token(&self, token_id: &str) -> Option<&MapToken> {
        self.tokens.iter().find(|t| t.id == token_id)
    }

    pub fn token_mut(&mut self, token_id: &str) -> Option<&mut MapToken> {
        self.tokens.iter_mut().find(|t| t.id == token_id)
    }
}

// =============================================================================
// Dice
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiceResult {
    pub player_id: Option<i64>,
    pub player_name: String,
    pub dice: String,
    pub rolls: Vec<i32>,
    pub modifier: i32,
    pub total: i32,
    pub formula: Option<String>,
    pub reason: Option<String>,
    pub timestamp: Option<String>,
}

// =============================================================================
// Combat and initiative
// =============================================================================

/// Identity of a participant in the initiative list.
///
/// Players are keyed by player id. NPCs have no player, so they are keyed by
/// the character they stand for. Snapshot rows from `GET /combat` carry no
/// character id, so an NPC known only from a snapshot is keyed by its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParticipantKey {
    Player(i64),
    Npc(i64),
    NpcNamed(String),
}

/// Player id the service uses for NPC entries.
pub const NPC_PLAYER_ID: i64 = 0;

/// Display name used for an NPC that arrives without one.
pub const UNNAMED_NPC: &str = "Unknown NPC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeEntry {
    pub player_id: i64,
    pub player_name: String,
    #[serde(default)]
    pub character_id: Option<i64>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub roll: Option<i32>,
    #[serde(default)]
    pub is_npc: bool,
    /// Insertion sequence, used as the stable tie-break.
    #[serde(skip)]
    pub seq: u64,
}

impl InitiativeEntry {
    pub fn key(&self) -> ParticipantKey {
        match (self.is_npc, self.character_id) {
            (true, Some(character_id)) => ParticipantKey::Npc(character_id),
            (true, None) => ParticipantKey::NpcNamed(self.display_name().to_string()),
            (false, _) => ParticipantKey::Player(self.player_id),
        }
    }

    /// Character name when present, otherwise the player name.
    pub fn display_name(&self) -> &str {
        match self.character_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ if self.is_npc && self.player_name.is_empty() => UNNAMED_NPC,
            _ => &self.player_name,
        }
    }

    /// Rolled entries first, higher rolls first, then insertion order.
    pub fn initiative_order(a: &Self, b: &Self) -> Ordering {
        match (a.roll, b.roll) {
            (Some(ra), Some(rb)) => rb.cmp(&ra),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then(a.seq.cmp(&b.seq))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatParticipant {
    pub id: i64,
    pub character_id: i64,
    pub character_name: String,
    pub initiative: i32,
    pub current_hp: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Combat {
    pub id: i64,
    pub is_active: bool,
    #[serde(default)]
    pub round_number: u32,
    #[serde(default)]
    pub current_turn_id: Option<i64>,
    #[serde(default)]
    pub participants: Vec<CombatParticipant>,
    #[serde(default)]
    pub initiative_list: Option<Vec<InitiativeEntry>>,
}

/// Response of `GET /combat`: the active combat, or `{"active": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CombatSnapshot {
    Active(Combat),
    Inactive { active: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeRoll {
    pub roll: i32,
    #[serde(default)]
    pub player_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> MapToken {
        serde_json::from_value(serde_json::json!({
            "id": "t1",
            "map_id": "m1",
            "x": 10.0,
            "y": 20.0,
            "label": "Goblin",
            "color": "#ff0000",
        }))
        .unwrap()
    }

    #[test]
    fn test_token_defaults() {
        let t = token();
        assert_eq!(t.scale, 1.0);
        assert_eq!(t.layer, "tokens");
        assert_eq!(t.token_type, "character");
        assert!(t.icon.is_none());
    }

    #[test]
    fn test_patch_leaves_untouched_fields() {
        let mut t = token();
        let patch: TokenPatch = serde_json::from_value(serde_json::json!({"x": 55.0})).unwrap();
        patch.apply_to(&mut t);
        assert_eq!(t.x, 55.0);
        assert_eq!(t.y, 20.0);
        assert_eq!(t.label.as_deref(), Some("Goblin"));
        assert_eq!(t.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn test_patch_null_clears_nullable_field() {
        let mut t = token();
        let patch: TokenPatch =
            serde_json::from_value(serde_json::json!({"label": null})).unwrap();
        assert_eq!(patch.label, Some(None));
        patch.apply_to(&mut t);
        assert!(t.label.is_none());
        assert_eq!(t.color.as_deref(), Some("#ff0000"));
    }

    #[test]
    fn test_patch_serializes_only_present_fields() {
        let patch = TokenPatch {
            x: Some(1.0),
            icon: Some(None),
            ..Default::default()
        };
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value, serde_json::json!({"x": 1.0, "icon": null}));
    }

    #[test]
    fn test_initiative_order() {
        let entry = |seq, roll| InitiativeEntry {
            player_id: seq as i64 + 1,
            player_name: format!("p{seq}"),
            character_id: None,
            character_name: None,
            roll,
            is_npc: false,
            seq,
        };
        let mut list = vec![
            entry(0, Some(12)),
            entry(1, Some(18)),
            entry(2, None),
            entry(3, Some(7)),
        ];
        list.sort_by(InitiativeEntry::initiative_order);
        let rolls: Vec<_> = list.iter().map(|e| e.roll).collect();
        assert_eq!(rolls, vec![Some(18), Some(12), Some(7), None]);
    }

    #[test]
    fn test_participant_key() {
        let npc = InitiativeEntry {
            player_id: NPC_PLAYER_ID,
            player_name: "NPC".into(),
            character_id: Some(9),
            character_name: Some("Orc".into()),
            roll: None,
            is_npc: true,
            seq: 0,
        };
        assert_eq!(npc.key(), ParticipantKey::Npc(9));
        let listed = InitiativeEntry {
            character_id: None,
            ..npc.clone()
        };
        assert_eq!(listed.key(), ParticipantKey::NpcNamed("Orc".into()));
        let player = InitiativeEntry {
            is_npc: false,
            player_id: 4,
            ..npc
        };
        assert_eq!(player.key(), ParticipantKey::Player(4));
    }

    #[test]
    fn test_combat_snapshot_variants() {
        let inactive: CombatSnapshot =
            serde_json::from_value(serde_json::json!({"active": false})).unwrap();
        assert_eq!(inactive, CombatSnapshot::Inactive { active: false });

        let active: CombatSnapshot = serde_json::from_value(serde_json::json!({
            "id": 3,
            "is_active": true,
            "round_number": 2,
            "initiative_list": [{"player_id": 1, "player_name": "A", "roll": 12}],
        }))
        .unwrap();
        let CombatSnapshot::Active(combat) = active else {
            panic!("expected active combat");
        };
        assert_eq!(combat.id, 3);
        assert_eq!(combat.initiative_list.unwrap().len(), 1);
    }
}
