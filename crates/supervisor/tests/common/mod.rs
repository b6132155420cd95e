//! In-process stand-ins for the marimo server and the process transport.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kernel_launch::command::port_from_command;
use kernel_launch::{LaunchError, ProcessTransport};
use serde_json::{json, Value};
use supervisor::{ServerSettings, ServerLifecycleCoordinator, StateStore};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Landing {
    Normal,
    MissingVersion,
    AuthRedirect,
}

/// Behaviour shared by every fake server instance a test brings up.
pub struct FakeMarimo {
    pub healthy: AtomicBool,
    pub landing: Mutex<Landing>,
    pub sessions: Mutex<Vec<Value>>,
    pub shutdowns: Mutex<Vec<String>>,
    pub session_list_calls: AtomicUsize,
    instances: AtomicUsize,
}

impl FakeMarimo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            landing: Mutex::new(Landing::Normal),
            sessions: Mutex::new(Vec::new()),
            shutdowns: Mutex::new(Vec::new()),
            session_list_calls: AtomicUsize::new(0),
            instances: AtomicUsize::new(0),
        })
    }

    pub fn set_landing(&self, landing: Landing) {
        *self.landing.lock().unwrap() = landing;
    }

    /// Serve on `listener` until the returned task is aborted.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let instance = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        let port = listener.local_addr().unwrap().port();
        let state = Instance {
            marimo: self.clone(),
            token: format!("tok-{}-{}", port, instance),
        };
        let app = Router::new()
            .route("/", get(landing))
            .route("/health", get(health))
            .route("/auth/login", get(|| async { Html("<form>login</form>") }))
            .route("/api/home/running_notebooks", post(running_notebooks))
            .route("/api/home/shutdown_session", post(shutdown_session))
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        })
    }
}

#[derive(Clone)]
struct Instance {
    marimo: Arc<FakeMarimo>,
    token: String,
}

async fn health(State(s): State<Instance>) -> StatusCode {
    if s.marimo.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn landing(State(s): State<Instance>) -> Response {
    let landing = *s.marimo.landing.lock().unwrap();
    let version = match landing {
        Landing::AuthRedirect => return Redirect::temporary("/auth/login").into_response(),
        Landing::MissingVersion => String::new(),
        Landing::Normal => r#"<marimo-version data-version="0.9.14" hidden></marimo-version>"#.to_string(),
    };
    Html(format!(
        r#"<!DOCTYPE html><html><head>
<marimo-server-token data-token="{}" hidden></marimo-server-token>
<marimo-user-config data-config='{{"display": {{"theme": "light"}}}}' hidden></marimo-user-config>
{}
</head><body></body></html>"#,
        s.token, version
    ))
    .into_response()
}

async fn running_notebooks(State(s): State<Instance>) -> Json<Value> {
    s.marimo.session_list_calls.fetch_add(1, Ordering::SeqCst);
    let files = s.marimo.sessions.lock().unwrap().clone();
    Json(json!({ "files": files }))
}

async fn shutdown_session(State(s): State<Instance>, Json(body): Json<Value>) -> StatusCode {
    match body["sessionId"].as_str() {
        Some(id) => {
            s.marimo.shutdowns.lock().unwrap().push(id.to_string());
            StatusCode::OK
        }
        None => StatusCode::BAD_REQUEST,
    }
}

/// Reserve a port nobody is listening on.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

struct Running {
    pid: u32,
    server: Option<JoinHandle<()>>,
}

/// Transport that "launches" marimo by starting a [`FakeMarimo`] on the
/// port named in the command.
pub struct FakeTransport {
    pub marimo: Arc<FakeMarimo>,
    pub spawn_delay: Duration,
    pub spawns: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    /// Pids that `attach` reports as alive.
    pub alive_pids: Mutex<Vec<u32>>,
    pub stopped_pids: Mutex<Vec<u32>>,
    /// Spawned servers die before they ever listen.
    pub exit_on_spawn: AtomicBool,
    current: tokio::sync::Mutex<Option<Running>>,
}

impl FakeTransport {
    pub fn new(marimo: Arc<FakeMarimo>) -> Self {
        Self::with_delay(marimo, Duration::ZERO)
    }

    pub fn with_delay(marimo: Arc<FakeMarimo>, spawn_delay: Duration) -> Self {
        Self {
            marimo,
            spawn_delay,
            spawns: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            alive_pids: Mutex::new(Vec::new()),
            stopped_pids: Mutex::new(Vec::new()),
            exit_on_spawn: AtomicBool::new(false),
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Kill the server without telling anyone, as a crash would.
    pub async fn crash(&self) {
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_mut() {
            if let Some(server) = running.server.take() {
                server.abort();
                let _ = server.await;
            }
        }
    }

    async fn stop_running(&self, running: Running) {
        if let Some(server) = running.server {
            server.abort();
            let _ = server.await;
        }
        self.alive_pids.lock().unwrap().retain(|p| *p != running.pid);
        self.stopped_pids.lock().unwrap().push(running.pid);
    }
}

#[async_trait]
impl ProcessTransport for FakeTransport {
    async fn spawn(&self, command: &str) -> Result<u32, LaunchError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.stop_running(previous).await;
        }
        tokio::time::sleep(self.spawn_delay).await;

        let n = self.spawns.fetch_add(1, Ordering::SeqCst) + 1;
        self.commands.lock().unwrap().push(command.to_string());
        let spawn_error = |source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        };
        let port = port_from_command(command).ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no --port in command",
            ))
        })?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(spawn_error)?;

        let pid = 40_000 + n as u32;
        let server = if self.exit_on_spawn.load(Ordering::SeqCst) {
            drop(listener);
            None
        } else {
            Some(self.marimo.serve(listener))
        };
        *current = Some(Running { pid, server });
        Ok(pid)
    }

    async fn attach(&self, pid: u32) -> Result<bool, LaunchError> {
        if !self.alive_pids.lock().unwrap().contains(&pid) {
            return Ok(false);
        }
        *self.current.lock().await = Some(Running { pid, server: None });
        Ok(true)
    }

    async fn stop(&self) -> Result<(), LaunchError> {
        let mut current = self.current.lock().await;
        if let Some(running) = current.take() {
            self.stop_running(running).await;
        }
        Ok(())
    }

    async fn pid(&self) -> Option<u32> {
        self.current.lock().await.as_ref().map(|r| r.pid)
    }

    async fn is_running(&self) -> bool {
        match self.current.lock().await.as_ref() {
            Some(Running {
                server: Some(server),
                ..
            }) => !server.is_finished(),
            Some(Running { pid, server: None }) => self.alive_pids.lock().unwrap().contains(pid),
            None => false,
        }
    }
}

pub fn test_settings(port: u16) -> ServerSettings {
    ServerSettings {
        host: "127.0.0.1".to_string(),
        port,
        health_timeout_ms: 500,
        fetch_timeout_ms: 2000,
        startup_attempts: 10,
        ..Default::default()
    }
}

pub struct Harness {
    pub coordinator: ServerLifecycleCoordinator,
    pub transport: Arc<FakeTransport>,
    pub marimo: Arc<FakeMarimo>,
    pub store: Arc<StateStore>,
    pub tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Duration::ZERO, |_| {})
    }

    pub fn build(spawn_delay: Duration, configure: impl FnOnce(&mut ServerSettings)) -> Self {
        let tmp = TempDir::new().unwrap();
        let marimo = FakeMarimo::new();
        let transport = Arc::new(FakeTransport::with_delay(marimo.clone(), spawn_delay));
        let store = Arc::new(StateStore::new(tmp.path().join("state.json")));
        let mut settings = test_settings(free_port());
        configure(&mut settings);
        let coordinator = ServerLifecycleCoordinator::new(
            settings,
            tmp.path().join("notebooks"),
            transport.clone(),
            store.clone(),
        )
        .unwrap();
        Self {
            coordinator,
            transport,
            marimo,
            store,
            tmp,
        }
    }
}
