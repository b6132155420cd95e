//! Request-reply client for the kernel endpoints of one session.
//!
//! Every call carries the session id and the current skew token as
//! headers. A 401 that blames the token triggers one token refresh from the
//! landing page and one retry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use supervisor::{NegotiationError, StartupNegotiator, SERVER_TOKEN_HEADER};
use url::Url;

pub const SESSION_ID_HEADER: &str = "Marimo-Session-Id";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("marimo returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to refresh server token: {0}")]
    Refresh(#[from] NegotiationError),
}

impl ApiError {
    /// 401 whose body says the token is invalid.
    pub fn is_invalid_token(&self) -> bool {
        match self {
            ApiError::Status { status: 401, body } => {
                let body = body.to_ascii_lowercase();
                body.contains("invalid") && body.contains("token")
            }
            _ => false,
        }
    }

    /// 5xx whose body says the session is invalid.
    pub fn is_invalid_session(&self) -> bool {
        match self {
            ApiError::Status { status, body } if *status >= 500 => {
                let body = body.to_ascii_lowercase();
                body.contains("invalid") && body.contains("session")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub cell_ids: Vec<String>,
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub cell_ids: Vec<String>,
    pub codes: Vec<String>,
    pub names: Vec<String>,
    pub configs: Vec<Value>,
    pub filename: String,
    /// When false the server only renders the file and returns it.
    pub persist: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiateRequest {
    pub object_ids: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallRequest {
    pub function_call_id: String,
    pub namespace: String,
    pub function_name: String,
    pub args: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest<'a> {
    cell_id: &'a str,
}

#[derive(Serialize)]
struct InstallMissingPackagesRequest<'a> {
    manager: &'a str,
    versions: &'a HashMap<String, String>,
}

struct ApiInner {
    client: reqwest::Client,
    base_url: Url,
    landing_url: Url,
    session_id: String,
    token: RwLock<String>,
    negotiator: StartupNegotiator,
}

/// Cheap to clone; clones share the token.
#[derive(Clone)]
pub struct KernelApi {
    inner: Arc<ApiInner>,
}

impl KernelApi {
    pub fn new(
        base_url: Url,
        landing_url: Url,
        session_id: String,
        token: String,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let negotiator = StartupNegotiator::new(timeout)?;
        Ok(Self {
            inner: Arc::new(ApiInner {
                client,
                base_url,
                landing_url,
                session_id,
                token: RwLock::new(token),
                negotiator,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn token(&self) -> String {
        self.inner
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: String) {
        *self
            .inner
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Fetch a fresh skew token from the landing page.
    pub async fn refresh_token(&self) -> Result<String, ApiError> {
        let values = self.inner.negotiator.fetch(&self.inner.landing_url).await?;
        self.set_token(values.skew_token.clone());
        debug!("[bridge] Refreshed server token");
        Ok(values.skew_token)
    }

    async fn send_once<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.inner.base_url.join(path)?;
        let response = self
            .inner
            .client
            .post(url)
            .header(SESSION_ID_HEADER, &self.inner.session_id)
            .header(SERVER_TOKEN_HEADER, self.token())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ApiError> {
        match self.send_once(path, body).await {
            Err(e) if e.is_invalid_token() => {
                warn!("[bridge] Server token rejected on {}, refreshing", path);
                self.refresh_token().await?;
                self.send_once(path, body).await
            }
            other => other,
        }
    }

    pub async fn run(&self, request: &RunRequest) -> Result<(), ApiError> {
        self.post("api/kernel/run", request).await.map(|_| ())
    }

    pub async fn delete(&self, cell_id: &str) -> Result<(), ApiError> {
        self.post("api/kernel/delete", &DeleteRequest { cell_id })
            .await
            .map(|_| ())
    }

    /// Returns the rendered notebook source.
    pub async fn save(&self, request: &SaveRequest) -> Result<String, ApiError> {
        let response = self.post("api/kernel/save", request).await?;
        Ok(response.text().await?)
    }

    pub async fn instantiate(&self, request: &InstantiateRequest) -> Result<(), ApiError> {
        self.post("api/kernel/instantiate", request).await.map(|_| ())
    }

    pub async fn interrupt(&self) -> Result<(), ApiError> {
        self.post("api/kernel/interrupt", &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    pub async fn install_missing_packages(
        &self,
        manager: &str,
        versions: &HashMap<String, String>,
    ) -> Result<(), ApiError> {
        self.post(
            "api/kernel/install_missing_packages",
            &InstallMissingPackagesRequest { manager, versions },
        )
        .await
        .map(|_| ())
    }

    pub async fn restart_session(&self) -> Result<(), ApiError> {
        self.post("api/kernel/restart_session", &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    pub async fn function_call(&self, request: &FunctionCallRequest) -> Result<(), ApiError> {
        self.post("api/kernel/function_call", request)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, body: &str) -> ApiError {
        ApiError::Status {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_invalid_token_detection() {
        assert!(status(401, "Invalid server token").is_invalid_token());
        assert!(!status(401, "Unauthorized").is_invalid_token());
        assert!(!status(403, "invalid token").is_invalid_token());
    }

    #[test]
    fn test_invalid_session_detection() {
        assert!(status(500, "Invalid session id").is_invalid_session());
        assert!(status(503, "invalid session").is_invalid_session());
        assert!(!status(500, "internal error").is_invalid_session());
        assert!(!status(404, "invalid session").is_invalid_session());
    }

    #[test]
    fn test_request_bodies_are_camel_case() {
        let run = serde_json::to_value(RunRequest {
            cell_ids: vec!["a".into()],
            codes: vec!["x = 1".into()],
        })
        .unwrap();
        assert_eq!(run, serde_json::json!({"cellIds": ["a"], "codes": ["x = 1"]}));

        let call = serde_json::to_value(FunctionCallRequest {
            function_call_id: "f1".into(),
            namespace: "ns".into(),
            function_name: "fn".into(),
            args: serde_json::json!({"k": 1}),
        })
        .unwrap();
        assert_eq!(call["functionCallId"], "f1");
        assert_eq!(call["functionName"], "fn");
    }
}
