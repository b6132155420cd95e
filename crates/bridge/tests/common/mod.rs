//! Fake marimo server for one notebook session: landing page, kernel
//! endpoints and the `/ws` push channel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge::{BridgeEventReceiver, BridgeOptions, KernelBridge};
use serde_json::{json, Value};
use supervisor::{Prompter, ServerSettings, StartupResult, StateStore};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub endpoint: String,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub body: Value,
}

pub struct ServerState {
    pub valid_token: Mutex<String>,
    pub invalid_session: AtomicBool,
    pub answer_function_calls: AtomicBool,
    pub requests: Mutex<Vec<Recorded>>,
    pub connections: Mutex<Vec<HashMap<String, String>>>,
    /// Push sockets that have ended, from either side.
    pub closed_connections: AtomicUsize,
    push: broadcast::Sender<String>,
    hangup: watch::Sender<u64>,
}

impl ServerState {
    pub fn calls_to(&self, endpoint: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed_connections.load(Ordering::SeqCst)
    }
}

pub struct FakeKernelServer {
    pub state: Arc<ServerState>,
    pub port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeKernelServer {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(ServerState {
            valid_token: Mutex::new("tok-1".to_string()),
            invalid_session: AtomicBool::new(false),
            answer_function_calls: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            closed_connections: AtomicUsize::new(0),
            push,
            hangup: watch::channel(0).0,
        });
        let app = Router::new()
            .route("/", get(landing))
            .route("/ws", get(ws_handler))
            .route("/api/kernel/:endpoint", post(kernel_endpoint))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            state,
            port,
            handle,
        }
    }

    /// Send a push message to every connected session.
    pub fn push(&self, op: &str, data: Value) {
        let _ = self
            .state
            .push
            .send(json!({ "op": op, "data": data }).to_string());
    }

    /// Close every open push socket from the server side.
    pub fn hang_up(&self) {
        self.state.hangup.send_modify(|n| *n += 1);
    }

    pub async fn wait_for_closed(&self, count: usize) {
        for _ in 0..100 {
            if self.state.closed_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} closed push connection(s)", count);
    }

    pub async fn wait_for_connections(&self, count: usize) {
        for _ in 0..100 {
            if self.state.connection_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} push connection(s)", count);
    }
}

impl Drop for FakeKernelServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn landing(State(state): State<Arc<ServerState>>) -> Html<String> {
    let token = state.valid_token.lock().unwrap().clone();
    Html(format!(
        r#"<html><head>
<marimo-server-token data-token="{}" hidden></marimo-server-token>
<marimo-user-config data-config="{{}}" hidden></marimo-user-config>
<marimo-version data-version="0.9.14" hidden></marimo-version>
</head></html>"#,
        token
    ))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(
    mut socket: WebSocket,
    query: HashMap<String, String>,
    state: Arc<ServerState>,
) {
    let mut push = state.push.subscribe();
    let mut hangup = state.hangup.subscribe();
    state.connections.lock().unwrap().push(query);
    loop {
        tokio::select! {
            _ = hangup.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            message = push.recv() => match message {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.closed_connections.fetch_add(1, Ordering::SeqCst);
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn kernel_endpoint(
    Path(endpoint): Path<String>,
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let recorded = Recorded {
        endpoint: endpoint.clone(),
        session_id: header(&headers, "marimo-session-id"),
        token: header(&headers, "marimo-server-token"),
        body: body.clone(),
    };
    state.requests.lock().unwrap().push(recorded.clone());

    let valid = state.valid_token.lock().unwrap().clone();
    if recorded.token.as_deref() != Some(valid.as_str()) {
        return (StatusCode::UNAUTHORIZED, "Invalid server token").into_response();
    }
    if state.invalid_session.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid session id").into_response();
    }

    match endpoint.as_str() {
        "save" => "import marimo\n\napp = marimo.App()\n".into_response(),
        "function_call" => {
            if state.answer_function_calls.load(Ordering::SeqCst) {
                let failed = body["functionName"] == "explode";
                let status = if failed {
                    json!({"state": "error", "message": "kaboom"})
                } else {
                    json!({"state": "success"})
                };
                let result = json!({
                    "op": "function-call-result",
                    "data": {
                        "function_call_id": body["functionCallId"],
                        "return_value": {"echo": body["args"]},
                        "status": status,
                    }
                });
                let _ = state.push.send(result.to_string());
            }
            Json(json!({"success": true})).into_response()
        }
        _ => Json(json!({"success": true})).into_response(),
    }
}

/// Prompter that answers every question the same way after a delay.
pub struct ScriptedPrompter {
    pub choice: Option<usize>,
    pub delay: Duration,
    pub prompts: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(choice: Option<usize>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            choice,
            delay,
            prompts: AtomicUsize::new(0),
        })
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn choose(&self, _message: &str, _choices: &[&str]) -> Option<usize> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.choice
    }
}

pub struct Session {
    pub server: FakeKernelServer,
    pub bridge: KernelBridge,
    pub events: BridgeEventReceiver,
    pub prompter: Arc<ScriptedPrompter>,
    pub file: PathBuf,
    pub tmp: TempDir,
}

impl Session {
    pub async fn open() -> Self {
        Self::open_with(ScriptedPrompter::new(None, Duration::ZERO)).await
    }

    pub async fn open_with(prompter: Arc<ScriptedPrompter>) -> Self {
        let server = FakeKernelServer::start().await;
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("notebook.py");
        let settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port: server.port,
            fetch_timeout_ms: 2000,
            ..Default::default()
        };
        let startup = Arc::new(StartupResult {
            port: server.port,
            skew_token: "tok-1".to_string(),
            version: "0.9.14".to_string(),
            user_config: json!({}),
        });
        let (bridge, events) = KernelBridge::start(BridgeOptions {
            settings,
            startup,
            file: file.clone(),
            store: Arc::new(StateStore::new(tmp.path().join("state.json"))),
            prompter: prompter.clone(),
        })
        .await
        .unwrap();
        server.wait_for_connections(1).await;
        Self {
            server,
            bridge,
            events,
            prompter,
            file,
            tmp,
        }
    }

    pub async fn next_event(&mut self) -> bridge::BridgeEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a bridge event")
            .expect("bridge event channel closed")
    }
}
