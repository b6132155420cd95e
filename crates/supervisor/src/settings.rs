//! Server settings.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/marimo-host/settings.json
//! - Linux: ~/.config/marimo-host/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\marimo-host\settings.json
//!
//! They are read-only inputs to command building and URL composition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use kernel_launch::{Executable, MarimoCmdBuilder, MarimoMode};
use serde::{Deserialize, Serialize};
use url::Url;

/// Where the user prefers notebooks to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserPreference {
    #[default]
    Embedded,
    System,
}

/// What to do with a server left over from a previous run of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Treat the leftover server as stale and stop it.
    #[default]
    ForceRestart,
    /// Keep the leftover server if it is healthy and renegotiates.
    Reuse,
}

/// Settings for launching and talking to the marimo server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the marimo executable
    pub marimo_path: Option<String>,
    /// Python interpreter used as `<python> -m marimo` when no marimo path is set
    pub python_path: Option<String>,
    pub host: String,
    /// First port to try; the coordinator probes upward from here
    pub port: u16,
    pub https: bool,
    pub enable_token: bool,
    pub token_password: Option<String>,
    pub debug: bool,
    pub sandbox: bool,
    pub watch: bool,
    pub browser: BrowserPreference,
    pub health_interval_secs: u64,
    pub health_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Number of /health polls (500ms apart) after spawning
    pub startup_attempts: u32,
    pub recovery: RecoveryPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            marimo_path: None,
            python_path: None,
            host: "localhost".to_string(),
            port: 2818,
            https: false,
            enable_token: false,
            token_password: None,
            debug: false,
            sandbox: false,
            watch: false,
            browser: BrowserPreference::Embedded,
            health_interval_secs: 30,
            health_timeout_ms: 1000,
            fetch_timeout_ms: 3000,
            startup_attempts: 20,
            recovery: RecoveryPolicy::ForceRestart,
        }
    }
}

impl ServerSettings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// The password to present to a token-protected server, if any.
    pub fn access_token(&self) -> Option<&str> {
        if !self.enable_token {
            return None;
        }
        self.token_password.as_deref().filter(|p| !p.is_empty())
    }

    /// Build the shell command that launches the server for `target`.
    pub fn command(&self, target: &Path, port: u16) -> String {
        MarimoCmdBuilder::new()
            .executable(Executable::resolve(
                self.marimo_path.as_deref(),
                self.python_path.as_deref(),
            ))
            .debug(self.debug)
            .mode(MarimoMode::Edit)
            .file_or_dir(target.to_string_lossy())
            .host(self.host.clone())
            .port(port)
            .headless(true)
            .enable_token(self.enable_token)
            .token_password(self.token_password.clone())
            .sandbox(self.sandbox)
            .watch(self.watch)
            .build()
    }

    /// `http(s)://host:port/`
    pub fn base_url(&self, port: u16) -> Result<Url, url::ParseError> {
        let scheme = if self.https { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, port))
    }

    /// Landing page URL, carrying the access token when one is configured.
    pub fn landing_url(&self, port: u16) -> Result<Url, url::ParseError> {
        let mut url = self.base_url(port)?;
        if let Some(token) = self.access_token() {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url)
    }

    /// Push-channel URL for one notebook session.
    pub fn ws_url(&self, port: u16, session_id: &str, file: &str) -> Result<Url, url::ParseError> {
        let scheme = if self.https { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}:{}/ws", scheme, self.host, port))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            query.append_pair("file", file);
            if let Some(token) = self.access_token() {
                query.append_pair("access_token", token);
            }
        }
        Ok(url)
    }
}

/// Get the default path to the settings file.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marimo-host")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
/// or can't be parsed.
pub fn load_settings(path: &Path) -> ServerSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        ServerSettings::default()
    }
}

/// Save settings to disk.
pub fn save_settings(path: &Path, settings: &ServerSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
