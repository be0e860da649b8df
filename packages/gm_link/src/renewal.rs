//! RenewalCoordinator: request execution with single-flight credential renewal.
//!
//! Every authenticated request carries the stored access credential. When one
//! comes back unauthorized, exactly one caller (the leader) renews the pair;
//! callers that hit the same failure meanwhile queue behind it and resume
//! with its outcome, in arrival order. A request is retried at most once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::credentials::{self, CredentialPair, CredentialSlot, CredentialStore, keys};
use crate::error::{ApiError, RenewalError};
use crate::http::{ApiRequest, ApiResponse, HttpTransport};
use crate::session::SessionEnd;

type Waiter = oneshot::Sender<Result<String, RenewalError>>;

enum RenewalState {
    Idle,
    InFlight { waiters: Vec<Waiter> },
}

/// Body returned by the renewal endpoint.
#[derive(Debug, Deserialize)]
struct RenewedPair {
    #[serde(alias = "token")]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct RenewalCoordinator {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CredentialStore>,
    renewal_path: String,
    state: Mutex<RenewalState>,
    credential_tx: watch::Sender<Option<String>>,
    session_end_tx: watch::Sender<Option<SessionEnd>>,
}

impl RenewalCoordinator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CredentialStore>,
        renewal_path: impl Into<String>,
    ) -> Self {
        let (credential_tx, _) = watch::channel(store.get(keys::ACCESS_TOKEN));
        let (session_end_tx, _) = watch::channel(None);
        Self {
            transport,
            store,
            renewal_path: renewal_path.into(),
            state: Mutex::new(RenewalState::Idle),
            credential_tx,
            session_end_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// The active access credential as last published. Changes on renewal,
    /// login, join, and logout.
    pub fn subscribe_credential(&self) -> watch::Receiver<Option<String>> {
        self.credential_tx.subscribe()
    }

    /// Set once the session ends, by logout or by the server.
    pub fn subscribe_session_end(&self) -> watch::Receiver<Option<SessionEnd>> {
        self.session_end_tx.subscribe()
    }

    /// Re-read the active credential from the store and publish it.
    pub fn publish_credential(&self) {
        let current = self.store.get(keys::ACCESS_TOKEN);
        self.credential_tx.send_if_modified(|published| {
            if *published == current {
                return false;
            }
            *published = current;
            true
        });
    }

    pub fn signal_session_end(&self, reason: SessionEnd) {
        info!(?reason, "session ended");
        self.session_end_tx.send_replace(Some(reason));
    }

    /// Clear the end-of-session signal when a new session is established.
    pub fn reset_session_end(&self) {
        self.session_end_tx.send_replace(None);
    }

    /// Remove every credential and identifier, then signal `LoggedOut`.
    pub fn logout(&self) -> Result<(), ApiError> {
        let cleared = credentials::clear_all(self.store.as_ref());
        self.publish_credential();
        self.signal_session_end(SessionEnd::LoggedOut);
        cleared.map_err(ApiError::from)
    }

    fn force_logout(&self, cause: &RenewalError) {
        warn!(error = %cause, "renewal failed, forcing logout");
        if let Err(e) = self.logout() {
            error!(error = %e, "failed to clear credentials during forced logout");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RenewalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `request` and decode a 2xx body as `T`.
    pub async fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, ApiError> {
        let body = self.execute(request).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Send `request`, renewing the credential once on an authorization
    /// failure. Returns the body of a 2xx response.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value, ApiError> {
        if !request.authenticated {
            return self.transport.execute(&request, None).await?.into_result();
        }

        let credential = self
            .store
            .get(keys::ACCESS_TOKEN)
            .ok_or(ApiError::NotAuthenticated)?;
        let response = self.transport.execute(&request, Some(&credential)).await?;
        if !response.is_unauthorized() {
            return response.into_result();
        }

        debug!(path = %request.path, "request unauthorized, renewing credential");
        let fresh = self.renewed_credential(&credential).await?;

        // Second attempt; a repeated 401 surfaces as `Unauthorized`.
        let retried: ApiResponse = self.transport.execute(&request, Some(&fresh)).await?;
        retried.into_result()
    }

    /// A credential newer than `stale`: either one already stored by an
    /// earlier renewal, or the outcome of the in-flight or a new renewal.
    async fn renewed_credential(&self, stale: &str) -> Result<String, RenewalError> {
        let queued = {
            let mut state = self.lock_state();
            if let RenewalState::InFlight { waiters } = &mut *state {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                info!(queued = waiters.len(), "request queued behind renewal");
                Some(rx)
            } else {
                match self.store.get(keys::ACCESS_TOKEN) {
                    Some(current) if current != stale => return Ok(current),
                    _ => {}
                }
                *state = RenewalState::InFlight {
                    waiters: Vec::new(),
                };
                None
            }
        };

        if let Some(rx) = queued {
            return rx.await.unwrap_or(Err(RenewalError::Abandoned));
        }

        let guard = InFlightGuard {
            state: &self.state,
            armed: true,
        };
        let outcome = self.renew(stale).await;
        let waiters = guard.finish();

        if !waiters.is_empty() {
            debug!(released = waiters.len(), ok = outcome.is_ok(), "releasing queued requests");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if let Err(e) = &outcome {
            self.force_logout(e);
        }
        outcome
    }

    async fn renew(&self, stale: &str) -> Result<String, RenewalError> {
        let renewal = self
            .store
            .get(keys::REFRESH_TOKEN)
            .ok_or(RenewalError::MissingRenewalCredential)?;

        info!("renewing access credential");
        let request =
            ApiRequest::post(&self.renewal_path, json!({ "refresh_token": renewal })).anonymous();
        let response = self
            .transport
            .execute(&request, None)
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;
        if !response.is_success() {
            return Err(RenewalError::Rejected {
                status: response.status,
            });
        }

        let renewed: RenewedPair = serde_json::from_value(response.body)
            .map_err(|e| RenewalError::Decode(e.to_string()))?;
        let pair = CredentialPair::new(
            renewed.access_token,
            Some(renewed.refresh_token.unwrap_or(renewal)),
        );

        let store = self.store.as_ref();
        let store_err = |e: crate::error::StoreError| RenewalError::Store(e.to_string());
        pair.save(store, CredentialSlot::Active).map_err(store_err)?;
        // Keep the rejoin copy current when the session pair is the one in use.
        if store.get(keys::SESSION_ACCESS_TOKEN).as_deref() == Some(stale) {
            pair.save(store, CredentialSlot::Session).map_err(store_err)?;
        }

        self.credential_tx.send_replace(Some(pair.access.clone()));
        info!("access credential renewed");
        Ok(pair.access)
    }
}

/// Resets the in-flight state if the renewing caller is dropped mid-renewal,
/// failing its queued requests with `Abandoned`.
struct InFlightGuard<'a> {
    state: &'a Mutex<RenewalState>,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn take_waiters(&self) -> Vec<Waiter> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *state, RenewalState::Idle) {
            RenewalState::InFlight { waiters } => waiters,
            RenewalState::Idle => Vec::new(),
        }
    }

    fn finish(mut self) -> Vec<Waiter> {
        self.armed = false;
        self.take_waiters()
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let waiters = self.take_waiters();
        warn!(queued = waiters.len(), "renewal abandoned");
        for waiter in waiters {
            let _ = waiter.send(Err(RenewalError::Abandoned));
        }
    }
}
