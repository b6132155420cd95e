//! Bridge between one notebook session and a running marimo server.
//!
//! - [`KernelBridge`]: the session connection (HTTP commands out, push
//!   events in)
//! - [`RequestRegistry`]: correlation of out-of-band requests and responses
//! - [`Operation`]: decoded push-channel messages
//! - [`ExecutionTracker`]: per-cell run state derived from `cell-op`
//! - [`NamedGate`]: keeps at most one flow per purpose in flight

pub mod api;
pub mod bridge;
pub mod execution;
pub mod gate;
pub mod protocol;
pub mod registry;
pub mod text;

pub use api::{ApiError, KernelApi, SaveRequest, SESSION_ID_HEADER};
pub use bridge::{
    BridgeError, BridgeEvent, BridgeEventReceiver, BridgeOptions, HydratedCell, KernelBridge,
};
pub use execution::{ExecutionEvent, ExecutionTracker};
pub use gate::NamedGate;
pub use protocol::{CellStatus, Operation};
pub use registry::{RegistryError, RequestRegistry};
pub use text::{dedent, indent};
