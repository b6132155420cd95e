//! Launching and supervising the external marimo server process.
//!
//! This crate holds the process-level pieces the lifecycle coordinator
//! builds on:
//!
//! - Free-port discovery via connect probes
//! - The `marimo edit` command line builder
//! - A process transport that runs the server and can re-attach to a
//!   server left behind by an earlier run
//!
//! ```ignore
//! use kernel_launch::{port, MarimoCmdBuilder, ProcessTransport, ShellTransport};
//!
//! let port = port::try_port(2818).await?;
//! let cmd = MarimoCmdBuilder::new().file_or_dir("notebooks").port(port).headless(true).build();
//! let pid = ShellTransport::default().spawn(&cmd).await?;
//! ```

pub mod command;
pub mod port;
pub mod process;
pub mod transport;

// Re-export commonly used items
pub use command::{Executable, MarimoCmdBuilder, MarimoMode};
pub use port::PortError;
pub use transport::{LaunchError, ProcessTransport, ShellTransport};
