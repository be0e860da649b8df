//! Transport seam for the streaming channel.
//!
//! A [`Connector`] opens one connection and exposes it as a pair of text
//! channels. The inbound receiver ends when the remote side closes; dropping
//! the outbound sender closes the connection from our side.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use crate::error::StreamError;

/// One open streaming connection.
pub struct StreamChannel {
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<StreamChannel, StreamError>;
}

/// WebSocket connector over tokio-tungstenite.
pub struct WsConnector {
    capacity: usize,
}

impl WsConnector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<StreamChannel, StreamError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(StreamError::from_tungstenite)?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (in_tx, in_rx) = mpsc::channel::<String>(self.capacity);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);

        // Writer: drain outbound channel → socket. Ends when every sender is dropped.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(tungstenite::Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
            debug!("websocket writer finished");
        });

        // Reader: socket → inbound channel. Ends on close, error, or when the
        // receiving side goes away.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = in_tx.closed() => break,
                    msg = ws_read.next() => {
                        match msg {
                            Some(Ok(tungstenite::Message::Text(text))) => {
                                if in_tx.send(text.as_str().to_owned()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(tungstenite::Message::Close(frame))) => {
                                debug!(?frame, "websocket closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "websocket read failed");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("websocket reader finished");
        });

        Ok(StreamChannel {
            inbound: in_rx,
            outbound: out_tx,
        })
    }
}
