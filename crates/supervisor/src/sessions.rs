//! Enumeration and termination of notebook sessions on the server.
//!
//! The server owns its sessions; we only list and shut them down.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Header carrying the skew token on authenticated calls.
pub const SERVER_TOKEN_HEADER: &str = "Marimo-Server-Token";

/// A live notebook session as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub initialization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunningNotebooks {
    #[serde(default)]
    files: Vec<Session>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShutdownSessionRequest<'a> {
    session_id: &'a str,
}

/// HTTP client for the `/api/home` session endpoints.
#[derive(Clone)]
pub struct SessionsClient {
    client: reqwest::Client,
}

impl SessionsClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// `POST /api/home/running_notebooks`
    pub async fn list(&self, base_url: &Url, skew_token: &str) -> anyhow::Result<Vec<Session>> {
        let url = base_url.join("api/home/running_notebooks")?;
        let response = self
            .client
            .post(url)
            .header(SERVER_TOKEN_HEADER, skew_token)
            .json(&serde_json::json!({}))
            .send()
            .await?
            .error_for_status()?;
        let body: RunningNotebooks = response.json().await?;
        Ok(body.files)
    }

    /// `POST /api/home/shutdown_session`
    pub async fn shutdown(
        &self,
        base_url: &Url,
        skew_token: &str,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let url = base_url.join("api/home/shutdown_session")?;
        self.client
            .post(url)
            .header(SERVER_TOKEN_HEADER, skew_token)
            .json(&ShutdownSessionRequest { session_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
