//! Typed request-channel operations: account and session flows, the fetches
//! behind resynchronization, and actions that update local state once the
//! service has accepted them.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::Error as _;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::consumers::{Consumers, ResyncScope};
use crate::credentials::{CredentialPair, CredentialSlot, CredentialStore, keys};
use crate::error::ApiError;
use crate::http::ApiRequest;
use crate::models::{
    Character, CombatSnapshot, GameMap, InitiativeRoll, MapToken, NewToken, Player, SessionInfo,
    TokenPatch, User,
};
use crate::renewal::RenewalCoordinator;

/// Credentials and identity handed out by `/session` and `/session/join`.
///
/// Older servers name the access credential `gm_token` or `token` and send no
/// renewal credential; newer ones send `access_token` and `refresh_token`
/// alongside the legacy names.
#[derive(Debug, Deserialize)]
struct SessionGrant {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    gm_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    player_id: Option<i64>,
    #[serde(default)]
    session_code: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    character_id: Option<i64>,
}

impl SessionGrant {
    fn pair(&self) -> Option<CredentialPair> {
        let access = self
            .access_token
            .as_ref()
            .or(self.token.as_ref())
            .or(self.gm_token.as_ref())?;
        Some(CredentialPair::new(access.clone(), self.refresh_token.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct AuthGrant {
    user: User,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Outcome of creating or joining a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSession {
    pub session_code: String,
    pub player_id: Option<i64>,
    pub character_id: Option<i64>,
    pub is_gm: bool,
}

/// Identifiers kept in the credential store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredIdentity {
    pub user: Option<User>,
    pub session_code: Option<String>,
    pub player_id: Option<i64>,
    pub is_gm: bool,
    pub authenticated: bool,
    pub can_rejoin: bool,
}

pub struct GmApi {
    coordinator: Arc<RenewalCoordinator>,
    consumers: Consumers,
}

impl GmApi {
    pub fn new(coordinator: Arc<RenewalCoordinator>, consumers: Consumers) -> Self {
        Self {
            coordinator,
            consumers,
        }
    }

    pub fn coordinator(&self) -> &Arc<RenewalCoordinator> {
        &self.coordinator
    }

    pub fn consumers(&self) -> &Consumers {
        &self.consumers
    }

    fn store(&self) -> &dyn CredentialStore {
        self.coordinator.store().as_ref()
    }

    pub fn identity(&self) -> StoredIdentity {
        let store = self.store();
        StoredIdentity {
            user: store
                .get(keys::USER)
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            session_code: store.get(keys::SESSION_CODE),
            player_id: store.get(keys::PLAYER_ID).and_then(|id| id.parse().ok()),
            is_gm: store.get(keys::IS_GM).as_deref() == Some("true"),
            authenticated: store.get(keys::ACCESS_TOKEN).is_some(),
            can_rejoin: store.get(keys::SESSION_ACCESS_TOKEN).is_some(),
        }
    }

    // =========================================================================
    // Account
    // =========================================================================

    pub async fn login(&self, username: &str, password: &str) -> Result<User, ApiError> {
        let request = ApiRequest::post(
            "/users/login",
            json!({ "username": username, "password": password }),
        )
        .anonymous();
        self.establish_account(request).await
    }

    pub async fn register(
        &self,
        username: &str,
        display_name: &str,
        password: &str,
    ) -> Result<User, ApiError> {
        let request = ApiRequest::post(
            "/users/register",
            json!({
                "username": username,
                "display_name": display_name,
                "password": password,
            }),
        )
        .anonymous();
        self.establish_account(request).await
    }

    async fn establish_account(&self, request: ApiRequest) -> Result<User, ApiError> {
        let grant: AuthGrant = self.coordinator.call(request).await?;
        let store = self.store();
        CredentialPair::new(grant.access_token, grant.refresh_token)
            .save(store, CredentialSlot::Active)?;
        store.set(keys::USER, &serde_json::to_string(&grant.user)?)?;

        self.coordinator.reset_session_end();
        self.coordinator.publish_credential();
        info!(user = %grant.user.username, "signed in");
        Ok(grant.user)
    }

    /// Remove every credential and identifier and drop local session state.
    pub fn logout(&self) -> Result<(), ApiError> {
        self.consumers.clear_session_state();
        self.coordinator.logout()
    }

    // =========================================================================
    // Game session
    // =========================================================================

    /// Open a new session with this client as its game master.
    pub async fn create_session(&self) -> Result<JoinedSession, ApiError> {
        let grant: SessionGrant = self
            .coordinator
            .call(ApiRequest::post_empty("/session").anonymous())
            .await?;
        self.establish_session(grant, true)
    }

    pub async fn join_session(&self, code: &str, name: &str) -> Result<JoinedSession, ApiError> {
        let request =
            ApiRequest::post("/session/join", json!({ "code": code, "name": name })).anonymous();
        let grant: SessionGrant = self.coordinator.call(request).await?;
        self.establish_session(grant, false)
    }

    fn establish_session(
        &self,
        grant: SessionGrant,
        is_gm: bool,
    ) -> Result<JoinedSession, ApiError> {
        let pair = grant.pair().ok_or_else(|| {
            ApiError::Decode(serde_json::Error::custom(
                "session response carried no access credential",
            ))
        })?;
        let session_code = grant
            .session_code
            .clone()
            .or(grant.code.clone())
            .unwrap_or_default();

        let store = self.store();
        // Keep the account pair aside while the session pair is active.
        if store.get(keys::SESSION_ACCESS_TOKEN).is_none() {
            if let Some(account) = CredentialPair::load(store, CredentialSlot::Active) {
                account.save(store, CredentialSlot::Account)?;
            }
        }
        pair.save(store, CredentialSlot::Active)?;
        pair.save(store, CredentialSlot::Session)?;

        let is_gm_flag = if is_gm { "true" } else { "false" };
        let player_id = grant.player_id.map(|id| id.to_string());
        let mut sets = vec![
            (keys::IS_GM, is_gm_flag),
            (keys::SESSION_CODE, session_code.as_str()),
        ];
        let mut removes = Vec::new();
        match &player_id {
            Some(id) => sets.push((keys::PLAYER_ID, id.as_str())),
            None => removes.push(keys::PLAYER_ID),
        }
        store.apply(&sets, &removes)?;

        self.consumers.clear_session_state();
        self.coordinator.reset_session_end();
        self.coordinator.publish_credential();
        info!(
            session_code = %session_code,
            player_id = ?grant.player_id,
            is_gm,
            "session established"
        );
        Ok(JoinedSession {
            session_code,
            player_id: grant.player_id,
            character_id: grant.character_id,
            is_gm,
        })
    }

    /// Make the kept session pair active again.
    pub fn rejoin(&self) -> Result<StoredIdentity, ApiError> {
        let store = self.store();
        let pair = CredentialPair::load(store, CredentialSlot::Session)
            .ok_or(ApiError::NotAuthenticated)?;
        pair.save(store, CredentialSlot::Active)?;

        self.coordinator.reset_session_end();
        self.coordinator.publish_credential();
        let identity = self.identity();
        info!(session_code = ?identity.session_code, "rejoining session");
        Ok(identity)
    }

    /// Forget the session and restore the account pair, if one was kept.
    /// The streaming side of leaving is [`crate::session::LinkSession::leave`].
    pub fn leave_session(&self) -> Result<(), ApiError> {
        let store = self.store();
        let account = CredentialPair::load(store, CredentialSlot::Account);

        CredentialPair::clear(store, CredentialSlot::Session)?;
        store.remove_many(&[keys::IS_GM, keys::PLAYER_ID, keys::SESSION_CODE])?;
        match account {
            Some(pair) => {
                pair.save(store, CredentialSlot::Active)?;
                CredentialPair::clear(store, CredentialSlot::Account)?;
            }
            None => CredentialPair::clear(store, CredentialSlot::Active)?,
        }

        self.consumers.clear_session_state();
        self.coordinator.publish_credential();
        info!("left session");
        Ok(())
    }

    pub async fn session_info(&self) -> Result<SessionInfo, ApiError> {
        self.coordinator.call(ApiRequest::get("/session")).await
    }

    // =========================================================================
    // Resynchronization
    // =========================================================================

    pub async fn fetch_players(&self) -> Result<Vec<Player>, ApiError> {
        self.coordinator.call(ApiRequest::get("/session/players")).await
    }

    pub async fn fetch_combat(&self) -> Result<CombatSnapshot, ApiError> {
        self.coordinator.call(ApiRequest::get("/combat")).await
    }

    pub async fn fetch_maps(&self) -> Result<Vec<GameMap>, ApiError> {
        self.coordinator.call(ApiRequest::get("/session/maps")).await
    }

    pub async fn fetch_characters(&self) -> Result<Vec<Character>, ApiError> {
        self.coordinator.call(ApiRequest::get("/characters")).await
    }

    /// Refetch one collection and replace the matching consumer's state.
    pub async fn resync(&self, scope: ResyncScope) -> Result<(), ApiError> {
        match scope {
            ResyncScope::Players => self
                .consumers
                .roster
                .replace_players(self.fetch_players().await?),
            ResyncScope::Combat => self.consumers.combat.replace(self.fetch_combat().await?),
            ResyncScope::Maps => self.consumers.board.replace_maps(self.fetch_maps().await?),
            ResyncScope::Characters => self
                .consumers
                .characters
                .replace_characters(self.fetch_characters().await?),
        }
        info!(?scope, "resynchronization complete");
        Ok(())
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Set this player's readiness. The local roster entry is written with
    /// the value the `player_ready` echo will carry, so order does not matter.
    pub async fn set_ready(&self, is_ready: bool) -> Result<(), ApiError> {
        self.coordinator
            .execute(ApiRequest::post("/session/ready", json!({ "is_ready": is_ready })))
            .await?;
        if let Some(player_id) = self.identity().player_id {
            self.consumers.roster.set_ready_local(player_id, is_ready);
        }
        Ok(())
    }

    pub async fn start_session(&self) -> Result<(), ApiError> {
        self.coordinator
            .execute(ApiRequest::post_empty("/session/start"))
            .await?;
        self.consumers.roster.mark_session_started(None);
        Ok(())
    }

    /// Place a token. The returned token is added if absent, as is the
    /// `token_added` echo, so whichever lands second is a no-op.
    pub async fn add_token(&self, map_id: &str, token: &NewToken) -> Result<MapToken, ApiError> {
        let body = serde_json::to_value(token)?;
        let created: MapToken = self
            .coordinator
            .call(ApiRequest::post(format!("/maps/{map_id}/tokens"), body))
            .await?;
        self.consumers.board.add_token_local(created.clone());
        Ok(created)
    }

    /// Change some fields of a token. The patch is applied field-wise, which
    /// is idempotent, so it commutes with a `token_updated` echo of the same
    /// change.
    pub async fn update_token(
        &self,
        token_id: &str,
        patch: &TokenPatch,
    ) -> Result<MapToken, ApiError> {
        let body = serde_json::to_value(patch)?;
        let updated: MapToken = self
            .coordinator
            .call(ApiRequest::patch(format!("/tokens/{token_id}"), body))
            .await?;
        self.consumers
            .board
            .update_token_local(&updated.map_id, token_id, patch);
        Ok(updated)
    }

    /// Take a token off the board (game master only). Removal by id is
    /// idempotent, so the `token_removed` echo may land on either side.
    pub async fn remove_token(&self, map_id: &str, token_id: &str) -> Result<(), ApiError> {
        self.coordinator
            .execute(ApiRequest::delete(format!("/tokens/{token_id}")))
            .await?;
        self.consumers.board.remove_token_local(map_id, token_id);
        Ok(())
    }

    /// Roll initiative for this player. Only the own-roll marker is set
    /// locally; the list itself is written by `initiative_rolled` events.
    pub async fn roll_initiative(&self) -> Result<InitiativeRoll, ApiError> {
        let roll: InitiativeRoll = self
            .coordinator
            .call(ApiRequest::post_empty("/combat/initiative"))
            .await?;
        self.consumers.combat.record_own_roll(roll.roll);
        debug!(roll = roll.roll, "initiative rolled");
        Ok(roll)
    }

    pub async fn create_character(&self, fields: &Value) -> Result<Character, ApiError> {
        let created: Character = self
            .coordinator
            .call(ApiRequest::post("/characters", fields.clone()))
            .await?;
        self.consumers.characters.upsert_local(created.clone());
        Ok(created)
    }

    /// The service answers with the full record, the same one the
    /// `character_updated` echo carries, so both writes converge.
    pub async fn update_character(
        &self,
        character_id: i64,
        changes: &Value,
    ) -> Result<Character, ApiError> {
        let updated: Character = self
            .coordinator
            .call(ApiRequest::patch(
                format!("/characters/{character_id}"),
                changes.clone(),
            ))
            .await?;
        self.consumers.characters.upsert_local(updated.clone());
        Ok(updated)
    }
}
