//! Transport seam for the request channel.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One request, described independently of how it is sent so it can be
/// replayed with a different credential.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path under the configured base URL, e.g. `/session/players`.
    pub path: String,
    pub body: Option<Value>,
    /// Whether the access credential is attached.
    pub authenticated: bool,
}

impl ApiRequest {
    fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, None)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path, Some(body))
    }

    /// POST without a body.
    pub fn post_empty(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path, None)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path, Some(body))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path, None)
    }

    /// Send without the access credential.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// The body of a 2xx response, or the matching [`ApiError`].
    pub fn into_result(self) -> Result<Value, ApiError> {
        if self.is_success() {
            return Ok(self.body);
        }
        if self.is_unauthorized() {
            return Err(ApiError::Unauthorized);
        }
        let message = match &self.body {
            Value::Object(map) => match map.get("detail") {
                Some(Value::String(detail)) => detail.clone(),
                Some(other) => other.to_string(),
                None => self.body.to_string(),
            },
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Err(ApiError::Status {
            status: self.status,
            message,
        })
    }
}

/// Sends one request. Non-2xx statuses are returned as responses, not
/// errors, so the caller can react to authorization failures.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        credential: Option<&str>,
    ) -> Result<ApiResponse, ApiError>;
}

/// [`HttpTransport`] over a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ReqwestTransport {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ApiError::from_reqwest)?;
        Ok(Self { client, config })
    }

    /// The wire form of `request`. The credential is attached only to
    /// authenticated requests, where the configured placement puts it.
    pub fn build(
        &self,
        request: &ApiRequest,
        credential: Option<&str>,
    ) -> Result<reqwest::Request, ApiError> {
        let url = self
            .config
            .endpoint(&request.path)
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let mut builder = self.client.request(request.method.as_reqwest(), url);
        if let Some(token) = credential.filter(|_| request.authenticated) {
            if self.config.placement.uses_header() {
                builder = builder.bearer_auth(token);
            }
            if self.config.placement.uses_query() {
                builder = builder.query(&[("token", token)]);
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.build().map_err(ApiError::from_reqwest)
    }
}

/// Empty bodies read as `null`. A 2xx body must be JSON; any other status
/// keeps a non-JSON body as text so it can still be reported.
fn decode_body(status: u16, text: String) -> Result<Value, ApiError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(&text) {
        Ok(body) => Ok(body),
        Err(e) if (200..300).contains(&status) => Err(ApiError::Decode(e)),
        Err(_) => Ok(Value::String(text)),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        credential: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let wire = self.build(request, credential)?;
        let response = self
            .client
            .execute(wire)
            .await
            .map_err(ApiError::from_reqwest)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(ApiError::from_reqwest)?;
        debug!(
            method = ?request.method,
            path = %request.path,
            status = status,
            "request completed"
        );

        let body = decode_body(status, text)?;
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    pub(crate) const RENEWAL_PATH: &str = "/auth/refresh";

    pub(crate) enum RenewalBehavior {
        Issue { access: String, refresh: String },
        /// Hand out a pair the service then keeps refusing.
        IssueRefused { access: String, refresh: String },
        Reject,
    }

    /// In-memory service: accepts one access credential, answers renewals,
    /// and serves canned bodies per route.
    pub(crate) struct FakeHttp {
        pub valid_access: Mutex<String>,
        pub renewal: Mutex<RenewalBehavior>,
        pub renewal_delay: Duration,
        pub renewal_calls: AtomicUsize,
        pub routes: Mutex<HashMap<(Method, String), Value>>,
        pub log: Mutex<Vec<(ApiRequest, Option<String>)>>,
    }

    impl FakeHttp {
        pub(crate) fn new(valid_access: &str) -> Self {
            Self {
                valid_access: Mutex::new(valid_access.to_string()),
                renewal: Mutex::new(RenewalBehavior::Issue {
                    access: "fresh-access".into(),
                    refresh: "fresh-refresh".into(),
                }),
                renewal_delay: Duration::from_millis(50),
                renewal_calls: AtomicUsize::new(0),
                routes: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn route(&self, method: Method, path: &str, body: Value) {
            self.routes
                .lock()
                .unwrap()
                .insert((method, path.to_string()), body);
        }

        pub(crate) fn renewal_count(&self) -> usize {
            self.renewal_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn calls_to(&self, path: &str) -> Vec<(ApiRequest, Option<String>)> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(req, _)| req.path == path)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeHttp {
        async fn execute(
            &self,
            request: &ApiRequest,
            credential: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            self.log
                .lock()
                .unwrap()
                .push((request.clone(), credential.map(str::to_string)));

            if request.path == RENEWAL_PATH {
                self.renewal_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.renewal_delay).await;
                let issued = match &*self.renewal.lock().unwrap() {
                    RenewalBehavior::Issue { access, refresh } => {
                        Some((access.clone(), refresh.clone(), true))
                    }
                    RenewalBehavior::IssueRefused { access, refresh } => {
                        Some((access.clone(), refresh.clone(), false))
                    }
                    RenewalBehavior::Reject => None,
                };
                return Ok(match issued {
                    Some((access, refresh, accepted)) => {
                        if accepted {
                            *self.valid_access.lock().unwrap() = access.clone();
                        }
                        ApiResponse {
                            status: 200,
                            body: json!({"access_token": access, "refresh_token": refresh}),
                        }
                    }
                    None => ApiResponse {
                        status: 401,
                        body: json!({"detail": "refresh token expired"}),
                    },
                });
            }

            if request.authenticated {
                let valid = self.valid_access.lock().unwrap().clone();
                if credential != Some(valid.as_str()) {
                    return Ok(ApiResponse {
                        status: 401,
                        body: json!({"detail": "token expired"}),
                    });
                }
            }

            let routed = self
                .routes
                .lock()
                .unwrap()
                .get(&(request.method, request.path.clone()))
                .cloned();
            Ok(match routed {
                Some(body) => ApiResponse { status: 200, body },
                None => ApiResponse {
                    status: 404,
                    body: json!({"detail": "Not Found"}),
                },
            })
        }
    }
}
