//! ConnectionManager: the single streaming-channel connection of a client.
//!
//! Each `connect` creates a new handle (generation + cancellation token) and
//! spawns a driver task that opens the channel, pumps frames, and reopens it
//! with linear backoff after a close. Superseding or disconnecting bumps the
//! generation, so a stale driver can no longer touch shared state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::{Envelope, encode_outbound};
use super::transport::{Connector, StreamChannel};
use crate::config::StreamConfig;
use crate::credentials::redact;
use crate::error::StreamError;

/// Lifecycle of the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the delay before retry number `attempt`.
    ReconnectPending { attempt: u32 },
}

/// What the driver reports to whoever consumes the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Disconnected,
    Message(Envelope),
    /// Fatal for this session. The manager is `Disconnected` when this arrives.
    Failed(StreamError),
}

struct Handle {
    state: ConnectionState,
    credential: Option<String>,
    generation: u64,
    cancel: Option<CancellationToken>,
    outbound: Option<mpsc::Sender<String>>,
}

impl Handle {
    fn idle() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            credential: None,
            generation: 0,
            cancel: None,
            outbound: None,
        }
    }
}

/// Shared between the manager and its driver task.
struct Shared {
    handle: Mutex<Handle>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Handle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` only while `generation` is still the live handle.
    fn update(&self, generation: u64, f: impl FnOnce(&mut Handle)) -> bool {
        let mut handle = self.lock();
        if handle.generation != generation {
            return false;
        }
        f(&mut handle);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }
}

/// Owns the streaming channel. Explicitly constructed; any number of
/// independent managers can coexist.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<StreamEvent>,
}

impl ConnectionManager {
    /// Create a manager and the receiver its stream events arrive on.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: StreamConfig,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let manager = Self {
            connector,
            config,
            shared: Arc::new(Shared {
                handle: Mutex::new(Handle::idle()),
            }),
            events_tx,
        };
        (manager, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// True only while `Connecting` or `Connected` for exactly `credential`.
    pub fn is_active_for(&self, credential: &str) -> bool {
        let handle = self.shared.lock();
        matches!(
            handle.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) && handle.credential.as_deref() == Some(credential)
    }

    /// Open the channel for `credential`, superseding any existing handle.
    ///
    /// A no-op when the manager is already active for the same credential.
    pub fn connect(&self, credential: &str) {
        if self.is_active_for(credential) {
            debug!(token = %redact(credential), "already connected with this credential");
            return;
        }

        let (generation, cancel) = {
            let mut handle = self.shared.lock();
            if let Some(previous) = handle.cancel.take() {
                previous.cancel();
            }
            handle.generation += 1;
            let cancel = CancellationToken::new();
            handle.cancel = Some(cancel.clone());
            handle.credential = Some(credential.to_string());
            handle.outbound = None;
            handle.state = ConnectionState::Connecting;
            (handle.generation, cancel)
        };

        let driver = Driver {
            connector: self.connector.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            events_tx: self.events_tx.clone(),
            generation,
            cancel,
            credential: credential.to_string(),
        };
        tokio::spawn(driver.run());
    }

    /// Tear down the handle. Cancels a pending retry before returning, closes
    /// the channel, and clears the bound credential. Idempotent.
    pub fn disconnect(&self) {
        let was_live = {
            let mut handle = self.shared.lock();
            let was_live = matches!(
                handle.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if let Some(cancel) = handle.cancel.take() {
                cancel.cancel();
            }
            if handle.state != ConnectionState::Disconnected || handle.credential.is_some() {
                handle.generation += 1;
                info!("streaming channel disconnected");
            }
            handle.credential = None;
            handle.outbound = None;
            handle.state = ConnectionState::Disconnected;
            was_live
        };

        if was_live {
            let _ = self.events_tx.try_send(StreamEvent::Disconnected);
        }
    }

    /// Send one outbound frame. Fails when the channel is not open.
    pub fn send<P: Serialize + ?Sized>(&self, event: &str, payload: &P) -> Result<(), StreamError> {
        let outbound = {
            let handle = self.shared.lock();
            match (&handle.state, &handle.outbound) {
                (ConnectionState::Connected, Some(tx)) => tx.clone(),
                _ => return Err(StreamError::NotConnected),
            }
        };
        let text = encode_outbound(event, payload).map_err(|e| StreamError::Encode(e.to_string()))?;
        outbound
            .try_send(text)
            .map_err(|_| StreamError::NotConnected)
    }

    /// Announce a deliberate departure, give it time to flush, then disconnect.
    pub async fn leave(&self) {
        match self.send("leave", &json!({})) {
            Ok(()) => tokio::time::sleep(self.config.leave_grace).await,
            Err(e) => debug!(error = %e, "leave message not sent"),
        }
        self.disconnect();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut handle = self.shared.lock();
        if let Some(cancel) = handle.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Per-handle task: connect, pump, back off, repeat.
struct Driver {
    connector: Arc<dyn Connector>,
    config: StreamConfig,
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<StreamEvent>,
    generation: u64,
    cancel: CancellationToken,
    credential: String,
}

impl Driver {
    async fn run(self) {
        let url = self.config.endpoint_for(&self.credential);
        // Retries since the last successful open.
        let mut attempt: u32 = 0;

        loop {
            info!(
                url = %self.config.url,
                token = %redact(&self.credential),
                attempt = attempt,
                "connecting streaming channel"
            );

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.connector.open(&url) => result,
            };

            match opened {
                Ok(channel) => {
                    attempt = 0;
                    if !self.pump(channel).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt, "streaming channel open failed");
                }
            }

            if self.cancel.is_cancelled() || !self.shared.is_current(self.generation) {
                return;
            }
            self.emit(StreamEvent::Disconnected).await;

            if attempt >= self.config.max_attempts {
                self.give_up().await;
                return;
            }
            attempt += 1;

            let delay = self.config.retry_delay(attempt);
            if !self.shared.update(self.generation, |h| {
                h.state = ConnectionState::ReconnectPending { attempt };
                h.outbound = None;
            }) {
                return;
            }
            info!(
                attempt = attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.shared.update(self.generation, |h| {
                h.state = ConnectionState::Connecting;
            }) {
                return;
            }
        }
    }

    /// Run one open channel until it closes. Returns `false` when the handle
    /// was cancelled or superseded rather than closed by the remote side.
    async fn pump(&self, channel: StreamChannel) -> bool {
        let StreamChannel {
            mut inbound,
            outbound,
        } = channel;

        let bound = self.shared.update(self.generation, |h| {
            h.state = ConnectionState::Connected;
            h.outbound = Some(outbound.clone());
        });
        if !bound || self.cancel.is_cancelled() {
            return false;
        }
        info!(url = %self.config.url, "streaming channel connected");
        self.emit(StreamEvent::Connected).await;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                frame = inbound.recv() => frame,
            };
            let Some(text) = frame else {
                break;
            };

            let envelope = match Envelope::parse(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, len = text.len(), "malformed frame, dropped");
                    continue;
                }
            };

            if envelope.event == "ping" {
                match encode_outbound("pong", &json!({})) {
                    Ok(pong) => {
                        if outbound.try_send(pong).is_err() {
                            debug!("pong not sent, outbound channel full or closed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode pong"),
                }
            }

            self.emit(StreamEvent::Message(envelope)).await;
        }

        info!(url = %self.config.url, "streaming channel closed");
        true
    }

    async fn give_up(&self) {
        let gave_up = self.shared.update(self.generation, |h| {
            h.state = ConnectionState::Disconnected;
            h.credential = None;
            h.outbound = None;
            h.cancel = None;
        });
        if gave_up {
            error!(
                attempts = self.config.max_attempts,
                "streaming channel retries exhausted"
            );
            self.emit(StreamEvent::Failed(StreamError::RetriesExhausted {
                attempts: self.config.max_attempts,
            }))
            .await;
        }
    }

    async fn emit(&self, event: StreamEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.events_tx.send(event).await.is_err() {
            debug!("stream event receiver dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Url;

    /// What the fake does on each `open`.
    pub(crate) enum Script {
        Fail,
        /// Accept; the test drives the server side through the returned ends.
        Accept,
    }

    /// Server-side ends of an accepted fake connection.
    pub(crate) struct FakeServer {
        pub to_client: mpsc::Sender<String>,
        pub from_client: mpsc::Receiver<String>,
    }

    #[derive(Default)]
    pub(crate) struct FakeConnector {
        script: Mutex<VecDeque<Script>>,
        pub opened: Mutex<Vec<String>>,
        servers: Mutex<Vec<FakeServer>>,
    }

    impl FakeConnector {
        pub(crate) fn scripted(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        pub(crate) fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        pub(crate) fn take_server(&self) -> FakeServer {
            self.servers.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, url: &str) -> Result<StreamChannel, StreamError> {
            self.opened.lock().unwrap().push(url.to_string());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail);
            match step {
                Script::Fail => Err(StreamError::Connect("refused".into())),
                Script::Accept => {
                    let (to_client, inbound) = mpsc::channel(16);
                    let (outbound, from_client) = mpsc::channel(16);
                    self.servers.lock().unwrap().push(FakeServer {
                        to_client,
                        from_client,
                    });
                    Ok(StreamChannel { inbound, outbound })
                }
            }
        }
    }

    pub(crate) fn test_config() -> StreamConfig {
        let mut config = StreamConfig::for_url(Url::parse("ws://gm.test/ws").unwrap());
        config.max_attempts = 3;
        config.base_delay = Duration::from_secs(2);
        config.leave_grace = Duration::from_millis(100);
        config
    }

    async fn next(rx: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
        rx.recv().await.expect("stream event channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_connected() {
        let connector = FakeConnector::scripted(vec![Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(manager.is_active_for("T1"));
        assert!(!manager.is_active_for("T2"));

        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            connector.opened.lock().unwrap()[0],
            "ws://gm.test/ws?token=T1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_same_credential_after_server_close() {
        let connector = FakeConnector::scripted(vec![Script::Accept, Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);

        let start = tokio::time::Instant::now();
        drop(connector.take_server());

        assert_eq!(next(&mut rx).await, StreamEvent::Disconnected);
        assert_eq!(
            manager.state(),
            ConnectionState::ReconnectPending { attempt: 1 }
        );

        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(manager.state(), ConnectionState::Connected);
        let opened = connector.opened.lock().unwrap();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0], opened[1]);
        assert!(manager.is_active_for("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = FakeConnector::scripted(vec![]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        let mut disconnects = 0;
        let failure = loop {
            match next(&mut rx).await {
                StreamEvent::Disconnected => disconnects += 1,
                StreamEvent::Failed(e) => break e,
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(failure, StreamError::RetriesExhausted { attempts: 3 });
        // Initial open plus three retries.
        assert_eq!(connector.open_count(), 4);
        assert_eq!(disconnects, 4);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_active_for("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_linear() {
        let connector = FakeConnector::scripted(vec![]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        let start = tokio::time::Instant::now();
        manager.connect("T1");
        while !matches!(next(&mut rx).await, StreamEvent::Failed(_)) {}
        // 2s + 4s + 6s between the four opens.
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let connector = FakeConnector::scripted(vec![]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Disconnected);
        assert_eq!(
            manager.state(),
            ConnectionState::ReconnectPending { attempt: 1 }
        );

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_same_credential_is_noop() {
        let connector = FakeConnector::scripted(vec![Script::Accept, Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        manager.connect("T1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_credential_supersedes_handle() {
        let connector = FakeConnector::scripted(vec![Script::Accept, Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        manager.connect("T2");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);

        assert!(manager.is_active_for("T2"));
        assert!(!manager.is_active_for("T1"));
        let opened = connector.opened.lock().unwrap();
        assert_eq!(opened[1], "ws://gm.test/ws?token=T2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_forwarded_and_ping_answered() {
        let connector = FakeConnector::scripted(vec![Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        let mut server = connector.take_server();

        server.to_client.send("{garbage".into()).await.unwrap();
        server
            .to_client
            .send(r#"{"type":"ping","payload":{}}"#.into())
            .await
            .unwrap();
        server
            .to_client
            .send(r#"{"event":"player_left","data":{"player_id":2}}"#.into())
            .await
            .unwrap();

        let StreamEvent::Message(ping) = next(&mut rx).await else {
            panic!("expected ping message");
        };
        assert_eq!(ping.event, "ping");
        let StreamEvent::Message(left) = next(&mut rx).await else {
            panic!("expected player_left message");
        };
        assert_eq!(left.event, "player_left");
        assert_eq!(left.payload, json!({"player_id": 2}));

        let pong = server.from_client.recv().await.unwrap();
        let pong: serde_json::Value = serde_json::from_str(&pong).unwrap();
        assert_eq!(pong, json!({"type": "pong", "payload": {}}));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let connector = FakeConnector::scripted(vec![Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        assert_eq!(
            manager.send("chat", &json!({"message": "hi"})),
            Err(StreamError::NotConnected)
        );

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        let mut server = connector.take_server();
        manager.send("chat", &json!({"message": "hi"})).unwrap();
        let sent: serde_json::Value =
            serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(sent, json!({"type": "chat", "payload": {"message": "hi"}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_sends_then_disconnects() {
        let connector = FakeConnector::scripted(vec![Script::Accept]);
        let (manager, mut rx) = ConnectionManager::new(connector.clone(), test_config());

        manager.connect("T1");
        assert_eq!(next(&mut rx).await, StreamEvent::Connected);
        let mut server = connector.take_server();

        manager.leave().await;
        let sent: serde_json::Value =
            serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(sent["type"], "leave");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(next(&mut rx).await, StreamEvent::Disconnected);
    }
}
