//! # gm_link
//!
//! Client library for a live tabletop game-master session.
//!
//! ## Overview
//!
//! A client talks to the service over two channels:
//! - a request channel (HTTP) for actions and authoritative snapshots, with
//!   single-flight renewal of an expiring access credential;
//! - a streaming channel (WebSocket) delivering session events, reconnected
//!   with linear backoff under the same credential.
//!
//! Events are decoded into [`ServerEvent`]s and fanned out by an
//! [`EventDispatcher`] to reconciliation consumers (roster, combat, map
//! board, characters, dice), which merge them with the results of the
//! client's own requests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gm_link::{FileCredentialStore, LinkConfig, LinkSession};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let data_dir = std::path::Path::new("/tmp/gm");
//! let config = LinkConfig::load(data_dir)?;
//! let store = Arc::new(FileCredentialStore::open(data_dir)?);
//!
//! let mut session = LinkSession::open(&config, store)?;
//! session.api().join_session("ABC123", "Ann").await?;
//! let exit = session.run(CancellationToken::new()).await?;
//! println!("session over: {exit:?}");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod consumers;
pub mod credentials;
pub mod error;
pub mod events;
pub mod http;
pub mod models;
pub mod renewal;
pub mod session;
pub mod stream;

pub use api::{GmApi, JoinedSession, StoredIdentity};
pub use config::{FileConfig, LinkConfig, load_config};
pub use consumers::{Consumer, Consumers, ResyncScope};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{ApiError, ConfigError, ListenerError, RenewalError, StoreError, StreamError};
pub use events::{EventDispatcher, EventKind, Listener, ServerEvent, listener_fn};
pub use renewal::RenewalCoordinator;
pub use session::{LinkSession, SessionEnd, SessionExit, SessionHandle};
pub use stream::{ConnectionManager, ConnectionState};
