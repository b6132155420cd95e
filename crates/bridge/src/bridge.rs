//! Dual-channel connection to one notebook session on a running server.
//!
//! Commands go out as authenticated HTTP calls ([`KernelApi`]); events come
//! in on the `/ws` push channel and are decoded into [`Operation`]s, turned
//! into [`BridgeEvent`]s and handed to the UI through a
//! [`BridgeEventReceiver`].
//!
//! The bridge reads the coordinator's startup result once and then runs on
//! its own. When the server reports the session as invalid, the bridge
//! closes the push channel and asks the user whether to reconnect; at most
//! one such prompt is in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use supervisor::state::scope_key;
use supervisor::{Prompter, ServerSettings, StartupResult, StateStore};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::api::{
    ApiError, FunctionCallRequest, InstantiateRequest, KernelApi, RunRequest, SaveRequest,
};
use crate::execution::{ExecutionEvent, ExecutionTracker};
use crate::gate::NamedGate;
use crate::protocol::{Alert, FunctionCallResult, KernelReady, Operation};
use crate::registry::{RegistryError, RequestRegistry, SendFn};

/// Gate name for the invalid-session reconnect flow.
pub const SESSION_INVALID_GATE: &str = "session-invalid";

pub const RECONNECT_CHOICE: &str = "Reconnect";

const EVENT_BUFFER: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("marimo session is no longer valid: {0}")]
    SessionInvalid(ApiError),

    #[error("Failed to open push channel: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Function call failed: {0}")]
    FunctionCall(String),

    #[error("Bridge has been disposed")]
    Disposed,
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Connect(Box::new(e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HydratedCell {
    pub id: String,
    pub name: String,
    pub code: String,
}

/// Events relayed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Initial cells of the session. Sent once.
    Hydrate {
        cells: Vec<HydratedCell>,
        resumed: bool,
    },
    Execution(ExecutionEvent),
    CompletedRun,
    Interrupted,
    Alert(Alert),
    Banner(Alert),
    MissingPackages {
        packages: Vec<String>,
        isolated: bool,
    },
    InstallingPackages {
        packages: HashMap<String, String>,
    },
    KernelStartupError {
        error: String,
    },
    Reconnected,
    Reload,
    /// An operation the bridge passes through untouched.
    Relay {
        op: String,
        data: Value,
    },
    Disconnected {
        reason: String,
    },
}

/// Receiver for [`BridgeEvent`]s.
pub struct BridgeEventReceiver {
    rx: mpsc::Receiver<BridgeEvent>,
}

impl BridgeEventReceiver {
    /// Returns `None` once the bridge is gone.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }
}

/// Everything needed to open a bridge.
pub struct BridgeOptions {
    pub settings: ServerSettings,
    pub startup: Arc<StartupResult>,
    /// Notebook file the session is for.
    pub file: PathBuf,
    pub store: Arc<StateStore>,
    pub prompter: Arc<dyn Prompter>,
}

/// Payload of an out-of-band function call.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub namespace: String,
    pub function_name: String,
    pub args: Value,
}

struct Channel {
    sink: WsSink,
    reader: JoinHandle<()>,
}

struct BridgeInner {
    settings: ServerSettings,
    port: u16,
    file: String,
    scope: String,
    api: KernelApi,
    store: Arc<StateStore>,
    prompter: Arc<dyn Prompter>,
    registry: RequestRegistry<FunctionCall, FunctionCallResult>,
    tracker: Mutex<ExecutionTracker>,
    events: mpsc::Sender<BridgeEvent>,
    channel: Mutex<Option<Channel>>,
    /// Bumped whenever the push channel is closed on purpose, so a reader
    /// task from an older channel can tell its close was expected.
    channel_epoch: AtomicU64,
    hydrated: AtomicBool,
    disposed: AtomicBool,
    gate: NamedGate,
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        // The reader owns the read half; without this the socket outlives every handle.
        let channel = self
            .channel
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            channel.reader.abort();
        }
    }
}

/// Handle to a bridged session. Clones share the same connection.
#[derive(Clone)]
pub struct KernelBridge {
    inner: Arc<BridgeInner>,
}

fn new_session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("s_{}", &id[..6])
}

impl KernelBridge {
    /// Open a session against the server described by `options.startup`.
    pub async fn start(options: BridgeOptions) -> Result<(Self, BridgeEventReceiver), BridgeError> {
        let BridgeOptions {
            settings,
            startup,
            file,
            store,
            prompter,
        } = options;
        let port = startup.port;
        let session_id = new_session_id();
        let api = KernelApi::new(
            settings.base_url(port)?,
            settings.landing_url(port)?,
            session_id.clone(),
            startup.skew_token.clone(),
            settings.fetch_timeout(),
        )?;
        let (events, rx) = mpsc::channel(EVENT_BUFFER);

        let inner = Arc::new_cyclic(|weak: &Weak<BridgeInner>| {
            let weak = weak.clone();
            let send: SendFn<FunctionCall> = Box::new(move |id, call| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => KernelBridge { inner }.send_function_call(id, call).await,
                        None => Err(RegistryError::Disconnected),
                    }
                }
                .boxed()
            });
            BridgeInner {
                scope: scope_key(&file),
                file: file.to_string_lossy().into_owned(),
                settings,
                port,
                api,
                store,
                prompter,
                registry: RequestRegistry::new(send),
                tracker: Mutex::new(ExecutionTracker::new()),
                events,
                channel: Mutex::new(None),
                channel_epoch: AtomicU64::new(0),
                hydrated: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                gate: NamedGate::new(),
            }
        });

        let bridge = KernelBridge { inner };
        bridge.open_channel().await?;
        info!(
            "[bridge] Session {} open for {} on port {}",
            session_id, bridge.inner.file, port
        );
        Ok((bridge, BridgeEventReceiver { rx }))
    }

    pub fn session_id(&self) -> &str {
        self.inner.api.session_id()
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_hydrated(&self) -> bool {
        self.inner.hydrated.load(Ordering::SeqCst)
    }

    /// Function calls still waiting for their result.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.pending_count()
    }

    fn tracker(&self) -> MutexGuard<'_, ExecutionTracker> {
        self.inner
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn emit(&self, event: BridgeEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("[bridge] Event receiver dropped");
        }
    }

    // =========================================================================
    // Push channel
    // =========================================================================

    async fn open_channel(&self) -> Result<(), BridgeError> {
        let url = self
            .inner
            .settings
            .ws_url(self.inner.port, self.session_id(), &self.inner.file)?;
        debug!("[bridge] Connecting push channel {}", url);
        let (stream, _) = connect_async(url.as_str()).await?;
        let (sink, mut source) = stream.split();

        let epoch = self.inner.channel_epoch.load(Ordering::SeqCst);
        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let bridge = KernelBridge { inner };
                match message {
                    Ok(Message::Text(text)) => bridge.handle_text(&text).await,
                    Ok(Message::Close(frame)) => {
                        debug!("[bridge] Push channel closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[bridge] Push channel error: {}", e);
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                KernelBridge { inner }.on_channel_closed(epoch).await;
            }
        });

        let previous = self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Channel { sink, reader });
        if let Some(previous) = previous {
            previous.reader.abort();
        }
        Ok(())
    }

    async fn close_channel(&self) {
        self.inner.channel_epoch.fetch_add(1, Ordering::SeqCst);
        let channel = self
            .inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut channel) = channel {
            channel.reader.abort();
            if let Err(e) = channel.sink.close().await {
                debug!("[bridge] Error closing push channel: {}", e);
            }
        }
    }

    async fn on_channel_closed(&self, epoch: u64) {
        if self.inner.disposed.load(Ordering::SeqCst)
            || self.inner.channel_epoch.load(Ordering::SeqCst) != epoch
        {
            return;
        }
        warn!("[bridge] Push channel for {} closed", self.session_id());
        self.inner.registry.reject_all(RegistryError::Disconnected);
        self.tracker().clear();
        self.emit(BridgeEvent::Disconnected {
            reason: "push channel closed".to_string(),
        })
        .await;
    }

    async fn handle_text(&self, text: &str) {
        match Operation::decode(text) {
            Ok(op) => self.dispatch(op).await,
            Err(e) => warn!("[bridge] Malformed push message: {}", e),
        }
    }

    /// Act on one decoded push-channel operation.
    pub async fn dispatch(&self, op: Operation) {
        let name = op.name().to_string();
        match op {
            Operation::KernelReady(ready) => self.hydrate(ready).await,
            Operation::CellOp(cell_op) => {
                let events = self.tracker().handle(cell_op);
                for event in events {
                    self.emit(BridgeEvent::Execution(event)).await;
                }
            }
            Operation::FunctionCallResult(result) => {
                let id = result.function_call_id.clone();
                if !self.inner.registry.resolve(&id, result) {
                    debug!("[bridge] Late or duplicate function call result {}", id);
                }
            }
            Operation::CompletedRun => self.emit(BridgeEvent::CompletedRun).await,
            Operation::Interrupted => self.emit(BridgeEvent::Interrupted).await,
            Operation::Alert(alert) => self.emit(BridgeEvent::Alert(alert)).await,
            Operation::Banner(banner) => self.emit(BridgeEvent::Banner(banner)).await,
            Operation::MissingPackageAlert(alert) => {
                self.emit(BridgeEvent::MissingPackages {
                    packages: alert.packages,
                    isolated: alert.isolated,
                })
                .await
            }
            Operation::InstallingPackageAlert(alert) => {
                self.emit(BridgeEvent::InstallingPackages {
                    packages: alert.packages,
                })
                .await
            }
            Operation::KernelStartupError(e) => {
                error!("[bridge] Kernel failed to start: {}", e.error);
                self.emit(BridgeEvent::KernelStartupError { error: e.error })
                    .await
            }
            Operation::Reconnected => self.emit(BridgeEvent::Reconnected).await,
            Operation::Reload => self.emit(BridgeEvent::Reload).await,
            Operation::Variables(data)
            | Operation::VariableValues(data)
            | Operation::Datasets(data)
            | Operation::RemoveUiElements(data)
            | Operation::SendUiElementMessage(data)
            | Operation::UpdateCellCodes(data)
            | Operation::UpdateCellIds(data)
            | Operation::FocusCell(data)
            | Operation::CompletionResult(data)
            | Operation::QueryParamsSet(data)
            | Operation::QueryParamsAppend(data)
            | Operation::QueryParamsDelete(data)
            | Operation::QueryParamsClear(data) => {
                self.emit(BridgeEvent::Relay { op: name, data }).await
            }
            Operation::Unknown { op, data } => {
                warn!("[bridge] Unhandled operation {}: {}", op, data);
            }
        }
    }

    async fn hydrate(&self, ready: KernelReady) {
        if self.inner.hydrated.swap(true, Ordering::SeqCst) {
            debug!("[bridge] Ignoring repeated kernel-ready");
            return;
        }
        let KernelReady {
            cell_ids,
            codes,
            names,
            resumed,
        } = ready;
        let cells: Vec<HydratedCell> = cell_ids
            .into_iter()
            .zip(codes)
            .enumerate()
            .map(|(i, (id, code))| HydratedCell {
                id,
                code,
                name: names.get(i).cloned().unwrap_or_else(|| "_".to_string()),
            })
            .collect();
        info!("[bridge] Hydrating {} cell(s)", cells.len());
        self.emit(BridgeEvent::Hydrate { cells, resumed }).await;
    }

    // =========================================================================
    // Session invalidation
    // =========================================================================

    /// Map an API result, starting the reconnect flow when the server says
    /// the session is gone.
    async fn guard<T>(&self, result: Result<T, ApiError>) -> Result<T, BridgeError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_invalid_session() => {
                self.handle_invalid_session().await;
                Err(BridgeError::SessionInvalid(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_invalid_session(&self) {
        let Some(_guard) = self.inner.gate.try_enter(SESSION_INVALID_GATE) else {
            debug!("[bridge] Invalid-session flow already running");
            return;
        };
        warn!("[bridge] Session {} is no longer valid", self.session_id());
        self.close_channel().await;
        self.inner.registry.reject_all(RegistryError::Disconnected);
        self.tracker().clear();
        self.emit(BridgeEvent::Disconnected {
            reason: "session is no longer valid".to_string(),
        })
        .await;

        let choice = self
            .inner
            .prompter
            .choose(
                "The marimo session is no longer valid. Reconnect?",
                &[RECONNECT_CHOICE],
            )
            .await;
        if choice == Some(0) {
            if let Err(e) = self.reconnect().await {
                error!("[bridge] Reconnect failed: {}", e);
            }
        }
    }

    /// Refresh the server token and reopen the push channel.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        info!("[bridge] Reconnecting session {}", self.session_id());
        self.close_channel().await;
        self.inner.api.refresh_token().await?;
        self.open_channel().await?;
        self.emit(BridgeEvent::Reconnected).await;
        Ok(())
    }

    // =========================================================================
    // Outbound operations
    // =========================================================================

    pub async fn run(&self, cell_ids: Vec<String>, codes: Vec<String>) -> Result<(), BridgeError> {
        debug!("[bridge] run {:?}", cell_ids);
        let result = self.inner.api.run(&RunRequest { cell_ids, codes }).await;
        self.guard(result).await
    }

    pub async fn delete(&self, cell_id: &str) -> Result<(), BridgeError> {
        let result = self.inner.api.delete(cell_id).await;
        self.guard(result).await
    }

    /// Returns the notebook source the server rendered.
    pub async fn save(&self, request: SaveRequest) -> Result<String, BridgeError> {
        let result = self.inner.api.save(&request).await;
        self.guard(result).await
    }

    /// Send the initial values of UI elements.
    pub async fn instantiate(
        &self,
        object_ids: Vec<String>,
        values: Vec<Value>,
    ) -> Result<(), BridgeError> {
        let result = self
            .inner
            .api
            .instantiate(&InstantiateRequest { object_ids, values })
            .await;
        self.guard(result).await
    }

    pub async fn interrupt(&self) -> Result<(), BridgeError> {
        let result = self.inner.api.interrupt().await;
        self.guard(result).await
    }

    /// Install packages with `manager` and remember it for this notebook.
    pub async fn install_missing_packages(
        &self,
        manager: &str,
        versions: HashMap<String, String>,
    ) -> Result<(), BridgeError> {
        if let Err(e) = self.inner.store.set_package_manager(&self.inner.scope, manager) {
            warn!("[bridge] Failed to remember package manager: {}", e);
        }
        let result = self
            .inner
            .api
            .install_missing_packages(manager, &versions)
            .await;
        self.guard(result).await
    }

    /// The package manager last used for this notebook.
    pub fn last_package_manager(&self) -> Option<String> {
        self.inner.store.package_manager(&self.inner.scope)
    }

    pub async fn restart_session(&self) -> Result<(), BridgeError> {
        let result = self.inner.api.restart_session().await;
        self.guard(result).await
    }

    /// Call a function registered in the kernel and wait for its result,
    /// which arrives as `function-call-result` on the push channel.
    pub async fn function_call(
        &self,
        namespace: &str,
        function_name: &str,
        args: Value,
    ) -> Result<Value, BridgeError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        let result = self
            .inner
            .registry
            .request(FunctionCall {
                namespace: namespace.to_string(),
                function_name: function_name.to_string(),
                args,
            })
            .await?;
        if result.is_error() {
            let message = result
                .status
                .message
                .or(result.status.title)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(BridgeError::FunctionCall(message));
        }
        Ok(result.return_value)
    }

    async fn send_function_call(&self, id: String, call: FunctionCall) -> Result<(), RegistryError> {
        let request = FunctionCallRequest {
            function_call_id: id,
            namespace: call.namespace,
            function_name: call.function_name,
            args: call.args,
        };
        let result = self.inner.api.function_call(&request).await;
        self.guard(result)
            .await
            .map_err(|e| RegistryError::Send(e.to_string()))
    }

    /// Close the push channel and reject every pending call.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[bridge] Disposing session {}", self.session_id());
        self.close_channel().await;
        self.inner.registry.reject_all(RegistryError::Disconnected);
        self.tracker().clear();
    }
}
