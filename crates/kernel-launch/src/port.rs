//! Free-port discovery for the marimo server.
//!
//! A port is considered free when nothing accepts a TCP connection on it.
//! This is a connect probe rather than a bind probe: a successful connection
//! means some process is already listening there.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::debug;
use tokio::net::TcpStream;

/// How long a single connect attempt may take before the port is treated
/// as free. Loopback refusals are immediate, so this only matters for
/// filtered ports.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors from port discovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("No free port found at or above {0}")]
    Exhausted(u16),
}

/// Returns `true` when nothing is listening on `port` at the loopback address.
pub async fn is_free(port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
        .await
    {
        // Something answered; drop the stream straight away.
        Ok(Ok(_stream)) => false,
        Ok(Err(_)) => true,
        Err(_) => true,
    }
}

/// Probe upward from `start` until a free port is found.
///
/// The search walks the whole port range; it only fails when every port
/// from `start` to 65535 is occupied.
pub async fn try_port(start: u16) -> Result<u16, PortError> {
    let mut port = start;
    loop {
        if is_free(port).await {
            debug!("[port] Found free port {}", port);
            return Ok(port);
        }
        debug!("[port] Port {} is taken", port);
        port = port.checked_add(1).ok_or(PortError::Exhausted(start))?;
    }
}
