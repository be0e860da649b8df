//! LinkSession: the loop tying the streaming channel, the dispatcher, the
//! consumers, and the request channel together.
//!
//! The loop follows the published access credential (reconnecting when it
//! changes), feeds decoded events to the dispatcher, runs coalesced
//! resynchronizations, and stops on logout, on the end of the game session,
//! or when the streaming channel gives up.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::GmApi;
use crate::config::{LinkConfig, StreamConfig};
use crate::consumers::{Consumers, ResyncScope, ResyncSender};
use crate::credentials::CredentialStore;
use crate::error::{ApiError, StreamError};
use crate::events::{EventDispatcher, ServerEvent, decode_or_drop};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::renewal::RenewalCoordinator;
use crate::stream::{ConnectionManager, ConnectionState, Connector, StreamEvent, WsConnector};

/// Why the session is over, as published on the session signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Credentials were removed, by request or after a failed renewal.
    LoggedOut,
    /// The service ended the game session.
    Ended,
    /// This client left the game session.
    Left,
}

/// How [`LinkSession::run`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Ended(SessionEnd),
    Cancelled,
}

pub struct LinkSession {
    api: Arc<GmApi>,
    manager: Arc<ConnectionManager>,
    stream_rx: mpsc::Receiver<StreamEvent>,
    resync_rx: mpsc::UnboundedReceiver<ResyncScope>,
    dispatcher: EventDispatcher,
}

impl LinkSession {
    /// Wire the network transports described by `config`.
    pub fn open(config: &LinkConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let transport = Arc::new(ReqwestTransport::new(config.api.clone())?);
        let connector = Arc::new(WsConnector::new(config.stream.channel_capacity));
        Ok(Self::with_transports(
            transport,
            connector,
            store,
            config.stream.clone(),
            &config.api.renewal_path,
        ))
    }

    pub fn with_transports(
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        stream: StreamConfig,
        renewal_path: &str,
    ) -> Self {
        let coordinator = Arc::new(RenewalCoordinator::new(transport, store, renewal_path));
        let (resync, resync_rx) = ResyncSender::channel();
        let consumers = Consumers::new(resync);
        let mut dispatcher = EventDispatcher::new();
        consumers.attach_all(&mut dispatcher);
        let (manager, stream_rx) = ConnectionManager::new(connector, stream);

        Self {
            api: Arc::new(GmApi::new(coordinator, consumers)),
            manager: Arc::new(manager),
            stream_rx,
            resync_rx,
            dispatcher,
        }
    }

    pub fn api(&self) -> &Arc<GmApi> {
        &self.api
    }

    pub fn consumers(&self) -> &Consumers {
        self.api.consumers()
    }

    /// Register additional listeners before calling [`Self::run`].
    pub fn dispatcher_mut(&mut self) -> &mut EventDispatcher {
        &mut self.dispatcher
    }

    /// A cloneable handle for acting on the session while `run` owns it.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            api: self.api.clone(),
            manager: self.manager.clone(),
        }
    }

    /// Drive the session until it ends, `cancel` fires, or the streaming
    /// channel exhausts its retries.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SessionExit, StreamError> {
        let coordinator = self.api.coordinator().clone();
        let mut credential_rx = coordinator.subscribe_credential();
        let mut session_end_rx = coordinator.subscribe_session_end();

        let already_ended = *session_end_rx.borrow_and_update();
        if let Some(end) = already_ended {
            return Ok(SessionExit::Ended(end));
        }
        let initial = credential_rx.borrow_and_update().clone();
        match initial {
            Some(credential) => self.manager.connect(&credential),
            None => info!("no active credential, waiting for sign-in"),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.manager.disconnect();
                    return Ok(SessionExit::Cancelled);
                }
                Ok(()) = session_end_rx.changed() => {
                    let end = *session_end_rx.borrow_and_update();
                    if let Some(end) = end {
                        self.manager.disconnect();
                        return Ok(SessionExit::Ended(end));
                    }
                }
                Ok(()) = credential_rx.changed() => {
                    let credential = credential_rx.borrow_and_update().clone();
                    let ending = session_end_rx.borrow().is_some();
                    if !ending {
                        self.follow_credential(credential);
                    }
                }
                Some(scope) = self.resync_rx.recv() => {
                    let scopes = coalesce(scope, &mut self.resync_rx);
                    self.resync(scopes).await;
                }
                Some(event) = self.stream_rx.recv() => {
                    if let Some(exit) = self.on_stream_event(event).await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    fn follow_credential(&self, credential: Option<String>) {
        match credential {
            Some(credential) if self.manager.is_active_for(&credential) => {}
            Some(credential) => {
                info!("active credential changed, reconnecting");
                self.manager.connect(&credential);
            }
            None => self.manager.disconnect(),
        }
    }

    async fn on_stream_event(
        &mut self,
        event: StreamEvent,
    ) -> Result<Option<SessionExit>, StreamError> {
        match event {
            StreamEvent::Connected => {
                self.dispatch(&ServerEvent::Connected);
                // Events sent while the channel was down are gone; refetch.
                self.resync(ResyncScope::ALL.into_iter().collect()).await;
            }
            StreamEvent::Disconnected => self.dispatch(&ServerEvent::Disconnected),
            StreamEvent::Failed(err) => {
                error!(error = %err, "streaming channel failed");
                return Err(err);
            }
            StreamEvent::Message(envelope) => {
                let Some(event) = decode_or_drop(envelope) else {
                    return Ok(None);
                };
                if let ServerEvent::Error(payload) = &event {
                    warn!(message = %payload.message, "service reported an error");
                }
                self.dispatch(&event);
                if let ServerEvent::SessionEnded(ended) = &event {
                    return Ok(Some(self.end_by_service(ended.reason.as_deref())));
                }
            }
        }
        Ok(None)
    }

    fn end_by_service(&self, reason: Option<&str>) -> SessionExit {
        info!(reason = ?reason, "session ended by service");
        self.manager.disconnect();
        self.api.coordinator().signal_session_end(SessionEnd::Ended);
        if let Err(e) = self.api.leave_session() {
            error!(error = %e, "failed to clear session credentials");
        }
        SessionExit::Ended(SessionEnd::Ended)
    }

    fn dispatch(&self, event: &ServerEvent) {
        match self.dispatcher.dispatch(event) {
            Ok(listeners) => debug!(event = %event.name(), listeners, "event dispatched"),
            Err(e) => warn!(event = %event.name(), error = %e, "listener failed"),
        }
    }

    async fn resync(&self, scopes: BTreeSet<ResyncScope>) {
        for scope in scopes {
            if let Err(e) = self.api.resync(scope).await {
                warn!(?scope, error = %e, "resynchronization failed");
            }
        }
    }
}

/// `first` plus every request already queued behind it, once each.
fn coalesce(
    first: ResyncScope,
    rx: &mut mpsc::UnboundedReceiver<ResyncScope>,
) -> BTreeSet<ResyncScope> {
    let mut scopes = BTreeSet::from([first]);
    let mut requests = 1;
    while let Ok(scope) = rx.try_recv() {
        scopes.insert(scope);
        requests += 1;
    }
    if requests > scopes.len() {
        debug!(requests, scopes = scopes.len(), "coalesced resynchronization requests");
    }
    scopes
}

/// Outbound side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    api: Arc<GmApi>,
    manager: Arc<ConnectionManager>,
}

impl SessionHandle {
    pub fn api(&self) -> &Arc<GmApi> {
        &self.api
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn roll_dice(&self, dice: &str, reason: Option<&str>) -> Result<(), StreamError> {
        self.manager
            .send("roll_dice", &json!({ "dice": dice, "reason": reason }))
    }

    pub fn chat(&self, message: &str) -> Result<(), StreamError> {
        self.manager.send("chat", &json!({ "message": message }))
    }

    /// Announce the departure, close the channel, and forget the session.
    /// A running [`LinkSession::run`] returns `Ended(Left)`.
    pub async fn leave(&self) -> Result<(), ApiError> {
        self.manager.leave().await;
        self.api.coordinator().signal_session_end(SessionEnd::Left);
        self.api.leave_session()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::task::JoinHandle;

    use crate::credentials::{CredentialPair, CredentialSlot, MemoryCredentialStore, keys};
    use crate::http::Method;
    use crate::http::fake::{FakeHttp, RENEWAL_PATH};
    use crate::stream::frame::Envelope;
    use crate::stream::manager::tests::{FakeConnector, FakeServer, Script, test_config};

    struct Harness {
        http: Arc<FakeHttp>,
        connector: Arc<FakeConnector>,
        store: Arc<MemoryCredentialStore>,
        consumers: Consumers,
        handle: SessionHandle,
        cancel: CancellationToken,
        task: JoinHandle<Result<SessionExit, StreamError>>,
    }

    fn start(script: Vec<Script>, http: FakeHttp) -> Harness {
        let http = Arc::new(http);
        let connector = FakeConnector::scripted(script);
        let store = Arc::new(MemoryCredentialStore::new());
        CredentialPair::new("acc", Some("ref".into()))
            .save(store.as_ref(), CredentialSlot::Active)
            .unwrap();

        let mut session = LinkSession::with_transports(
            http.clone(),
            connector.clone(),
            store.clone(),
            test_config(),
            RENEWAL_PATH,
        );
        let consumers = session.consumers().clone();
        let handle = session.handle();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move { session.run(run_cancel).await });

        Harness {
            http,
            connector,
            store,
            consumers,
            handle,
            cancel,
            task,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn connected(h: &Harness) -> FakeServer {
        wait_until(|| h.handle.connection_state() == ConnectionState::Connected).await;
        h.connector.take_server()
    }

    async fn push(server: &FakeServer, event: &str, payload: Value) {
        let frame = Envelope::new(event, payload).encode().unwrap();
        server.to_client.send(frame).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_consumers() {
        let h = start(vec![Script::Accept], FakeHttp::new("acc"));
        let server = connected(&h).await;

        push(
            &server,
            "player_joined",
            json!({"player_id": 4, "player_name": "Di", "is_gm": false}),
        )
        .await;
        wait_until(|| h.consumers.roster.player(4).is_some()).await;
        assert!(h.consumers.roster.is_connected());

        h.cancel.cancel();
        assert_eq!(h.task.await.unwrap(), Ok(SessionExit::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_triggers_full_resync() {
        let http = FakeHttp::new("acc");
        http.route(
            Method::Get,
            "/session/maps",
            json!([{"id": "m1", "name": "Cave", "is_active": true}]),
        );
        let h = start(vec![Script::Accept], http);
        let _server = connected(&h).await;

        wait_until(|| !h.http.calls_to("/characters").is_empty()).await;
        assert_eq!(h.consumers.board.active_map().unwrap().id, "m1");
        for path in ["/session/players", "/combat", "/session/maps", "/characters"] {
            assert_eq!(h.http.calls_to(path).len(), 1, "{path}");
        }
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_update_for_unknown_map_refetches_maps() {
        let http = FakeHttp::new("acc");
        http.route(
            Method::Get,
            "/session/maps",
            json!([{"id": "m1", "name": "Cave", "is_active": true}]),
        );
        let h = start(vec![Script::Accept], http);
        let server = connected(&h).await;
        wait_until(|| h.consumers.board.map("m1").is_some()).await;

        h.http.route(
            Method::Get,
            "/session/maps",
            json!([
                {"id": "m1", "name": "Cave", "is_active": true},
                {"id": "m2", "name": "Keep", "tokens": [
                    {"id": "t1", "map_id": "m2", "x": 10.0, "y": 10.0}
                ]},
            ]),
        );
        push(
            &server,
            "token_updated",
            json!({"map_id": "m2", "token_id": "t1", "changes": {"x": 10.0}}),
        )
        .await;

        wait_until(|| h.consumers.board.map("m2").is_some()).await;
        assert_eq!(h.http.calls_to("/session/maps").len(), 2);
        assert_eq!(h.consumers.board.token("m2", "t1").unwrap().x, 10.0);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped() {
        let h = start(vec![Script::Accept], FakeHttp::new("acc"));
        let server = connected(&h).await;

        server.to_client.send("{not json".into()).await.unwrap();
        push(&server, "player_left", json!({"who": "?"})).await;
        push(
            &server,
            "player_joined",
            json!({"player_id": 1, "player_name": "Ann"}),
        )
        .await;

        wait_until(|| h.consumers.roster.player(1).is_some()).await;
        assert_eq!(h.handle.connection_state(), ConnectionState::Connected);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_ended_event_stops_and_clears() {
        let h = start(vec![Script::Accept], FakeHttp::new("acc"));
        CredentialPair::new("acc", Some("ref".into()))
            .save(h.store.as_ref(), CredentialSlot::Session)
            .unwrap();
        h.store.set(keys::PLAYER_ID, "3").unwrap();
        let server = connected(&h).await;

        push(&server, "session_ended", json!({"reason": "GM closed the table"})).await;

        let exit = h.task.await.unwrap();
        assert_eq!(exit, Ok(SessionExit::Ended(SessionEnd::Ended)));
        assert!(h.store.get(keys::SESSION_ACCESS_TOKEN).is_none());
        assert!(h.store.get(keys::PLAYER_ID).is_none());
        assert_eq!(h.handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_stops_session() {
        let h = start(vec![Script::Accept], FakeHttp::new("acc"));
        let _server = connected(&h).await;

        h.handle.api().logout().unwrap();

        let exit = h.task.await.unwrap();
        assert_eq!(exit, Ok(SessionExit::Ended(SessionEnd::LoggedOut)));
        assert_eq!(h.handle.connection_state(), ConnectionState::Disconnected);
        assert_eq!(h.connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_change_reconnects_with_new_credential() {
        let h = start(vec![Script::Accept, Script::Accept], FakeHttp::new("acc"));
        let _first = connected(&h).await;

        CredentialPair::new("session-acc", None)
            .save(h.store.as_ref(), CredentialSlot::Session)
            .unwrap();
        h.handle.api().rejoin().unwrap();

        wait_until(|| h.connector.open_count() == 2).await;
        let opened = h.connector.opened.lock().unwrap().clone();
        assert!(opened[1].ends_with("token=session-acc"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surfaces_error() {
        let h = start(vec![], FakeHttp::new("acc"));
        let exit = h.task.await.unwrap();
        assert_eq!(exit, Err(StreamError::RetriesExhausted { attempts: 3 }));
        assert_eq!(h.connector.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_sends_leave_and_ends() {
        let h = start(vec![Script::Accept], FakeHttp::new("acc"));
        let mut server = connected(&h).await;

        h.handle.chat("hello table").unwrap();
        h.handle.roll_dice("1d20+3", Some("stealth")).unwrap();
        h.handle.leave().await.unwrap();

        let mut sent = Vec::new();
        while let Some(frame) = server.from_client.recv().await {
            let value: Value = serde_json::from_str(&frame).unwrap();
            sent.push(value["type"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(sent, vec!["chat", "roll_dice", "leave"]);

        let exit = h.task.await.unwrap();
        assert_eq!(exit, Ok(SessionExit::Ended(SessionEnd::Left)));
        assert!(h.store.get(keys::ACCESS_TOKEN).is_none());
    }

    #[test]
    fn test_coalesce_deduplicates_queued_requests() {
        let (resync, mut rx) = ResyncSender::channel();
        for scope in [ResyncScope::Maps, ResyncScope::Players, ResyncScope::Maps] {
            resync.request(scope, "test");
        }
        let first = rx.try_recv().unwrap();
        let scopes = coalesce(first, &mut rx);
        assert_eq!(
            scopes.into_iter().collect::<Vec<_>>(),
            vec![ResyncScope::Players, ResyncScope::Maps]
        );
    }
}
