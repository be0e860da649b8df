use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [stream]
//                    max_attempts = 8
//
//   env var:         GM_STREAM__MAX_ATTEMPTS=8   (double underscore = nesting)
//
//   (single underscore stays within field names: GM_API__BASE_URL)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
}

/// How the access credential is attached to requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialPlacement {
    /// `Authorization: Bearer <token>`
    #[default]
    Header,
    /// `?token=<token>`, for older deployments.
    Query,
    Both,
}

impl CredentialPlacement {
    pub fn uses_header(self) -> bool {
        matches!(self, Self::Header | Self::Both)
    }

    pub fn uses_query(self) -> bool {
        matches!(self, Self::Query | Self::Both)
    }
}

/// Request channel tunables (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub credential_placement: CredentialPlacement,
    #[serde(default = "default_renewal_path")]
    pub renewal_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            credential_placement: CredentialPlacement::default(),
            renewal_path: default_renewal_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_renewal_path() -> String {
    "/auth/refresh".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Streaming channel tunables (lives under `[stream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    /// Base URL of the streaming endpoint. Derived from `api.base_url` when unset.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_stream_path")]
    pub path: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_leave_grace_ms")]
    pub leave_grace_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            path: default_stream_path(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            leave_grace_ms: default_leave_grace_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_stream_path() -> String {
    "/ws".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_leave_grace_ms() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    256
}

/// Layer defaults, `<data_dir>/config.toml`, then `GM_*` env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("GM_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Request channel configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Base URL every request path is appended to
    pub base_url: Url,
    pub placement: CredentialPlacement,
    pub renewal_path: String,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn from_file(fc: &ApiFileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: parse_url("api.base_url", &fc.base_url)?,
            placement: fc.credential_placement,
            renewal_path: fc.renewal_path.clone(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        })
    }

    /// Full URL for `path` under the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        join_path("api path", &self.base_url, path)
    }
}

/// Streaming channel configuration (runtime view).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Streaming endpoint without the credential
    pub url: Url,
    /// Retries after a close before giving up
    pub max_attempts: u32,
    /// Retry `n` waits `base_delay * n`
    pub base_delay: Duration,
    /// Pause between the leave message and closing the channel
    pub leave_grace: Duration,
    pub channel_capacity: usize,
}

impl StreamConfig {
    pub fn from_file(fc: &StreamFileConfig, api_base: &Url) -> Result<Self, ConfigError> {
        let base = match &fc.url {
            Some(url) => parse_url("stream.url", url)?,
            None => derive_stream_base(api_base)?,
        };
        Ok(Self {
            url: join_path("stream.path", &base, &fc.path)?,
            max_attempts: fc.max_attempts,
            base_delay: Duration::from_millis(fc.base_delay_ms),
            leave_grace: Duration::from_millis(fc.leave_grace_ms),
            channel_capacity: fc.channel_capacity.max(1),
        })
    }

    /// Defaults pointed at `url`, for callers that build config in code.
    pub fn for_url(url: Url) -> Self {
        let fc = StreamFileConfig::default();
        Self {
            url,
            max_attempts: fc.max_attempts,
            base_delay: Duration::from_millis(fc.base_delay_ms),
            leave_grace: Duration::from_millis(fc.leave_grace_ms),
            channel_capacity: fc.channel_capacity,
        }
    }

    /// The URL to open for `credential`, passed as the `token` query parameter.
    pub fn endpoint_for(&self, credential: &str) -> String {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", credential);
        url.into()
    }

    /// Delay before retry number `attempt` (starting at 1).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Everything the library needs, resolved from one [`FileConfig`].
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub api: ApiConfig,
    pub stream: StreamConfig,
}

impl LinkConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        let api = ApiConfig::from_file(&fc.api)?;
        let stream = StreamConfig::from_file(&fc.stream, &api.base_url)?;
        Ok(Self { api, stream })
    }

    /// Load the layered config for `data_dir` and resolve it.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let fc: FileConfig = load_config(data_dir).extract().map_err(Box::new)?;
        Self::from_file(&fc)
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Append `path` to `base`, keeping any path `base` already has.
fn join_path(field: &'static str, base: &Url, path: &str) -> Result<Url, ConfigError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    parse_url(field, &joined)
}

/// Origin of the request URL with `http→ws` / `https→wss`.
fn derive_stream_base(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConfigError::InvalidUrl {
                field: "api.base_url",
                value: api_base.to_string(),
                reason: format!("cannot derive a streaming URL from scheme {other:?}"),
            });
        }
    };

    let mut origin = api_base.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
        .set_scheme(scheme)
        .map_err(|()| ConfigError::InvalidUrl {
            field: "api.base_url",
            value: api_base.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
    Ok(origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_api_file_config_defaults() {
        let d = ApiFileConfig::default();
        assert_eq!(d.base_url, "http://localhost:8000/api");
        assert_eq!(d.credential_placement, CredentialPlacement::Header);
        assert_eq!(d.renewal_path, "/auth/refresh");
        assert_eq!(d.request_timeout_secs, 30);
    }

    #[test]
    fn test_stream_file_config_defaults() {
        let d = StreamFileConfig::default();
        assert!(d.url.is_none());
        assert_eq!(d.path, "/ws");
        assert_eq!(d.max_attempts, 5);
        assert_eq!(d.base_delay_ms, 2000);
        assert_eq!(d.leave_grace_ms, 100);
        assert_eq!(d.channel_capacity, 256);
    }

    // ── derived URLs ────────────────────────────────────────────────────

    #[test]
    fn test_stream_url_derived_from_api_origin() {
        let cfg = LinkConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(cfg.stream.url.as_str(), "ws://localhost:8000/ws");
    }

    #[test]
    fn test_stream_url_https_becomes_wss() {
        let fc = FileConfig {
            api: ApiFileConfig {
                base_url: "https://gm.example.com/api".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = LinkConfig::from_file(&fc).unwrap();
        assert_eq!(cfg.stream.url.as_str(), "wss://gm.example.com/ws");
    }

    #[test]
    fn test_stream_url_override() {
        let fc = FileConfig {
            stream: StreamFileConfig {
                url: Some("wss://stream.example.com".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = LinkConfig::from_file(&fc).unwrap();
        assert_eq!(cfg.stream.url.as_str(), "wss://stream.example.com/ws");
    }

    #[test]
    fn test_endpoint_for_adds_token_query() {
        let cfg = LinkConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(
            cfg.stream.endpoint_for("abc def"),
            "ws://localhost:8000/ws?token=abc+def"
        );
    }

    #[test]
    fn test_api_endpoint_keeps_base_path() {
        let cfg = LinkConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(
            cfg.api.endpoint("/session/players").unwrap().as_str(),
            "http://localhost:8000/api/session/players"
        );
    }

    #[test]
    fn test_retry_delay_is_linear() {
        let cfg = LinkConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(cfg.stream.retry_delay(1), Duration::from_millis(2000));
        assert_eq!(cfg.stream.retry_delay(3), Duration::from_millis(6000));
    }

    #[test]
    fn test_invalid_base_url() {
        let fc = FileConfig {
            api: ApiFileConfig {
                base_url: "not a url".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = LinkConfig::from_file(&fc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { field: "api.base_url", .. }));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.api.base_url, "http://localhost:8000/api");
        assert_eq!(fc.stream.max_attempts, 5);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[api]\nbase_url = \"https://gm.example.com/api\"\ncredential_placement = \"both\"\n\n[stream]\nmax_attempts = 8\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.api.base_url, "https://gm.example.com/api");
        assert_eq!(fc.api.credential_placement, CredentialPlacement::Both);
        assert_eq!(fc.stream.max_attempts, 8);
        assert_eq!(fc.stream.base_delay_ms, 2000);

        let cfg = LinkConfig::load(tmp.path()).unwrap();
        assert!(cfg.api.placement.uses_header());
        assert!(cfg.api.placement.uses_query());
    }
}
