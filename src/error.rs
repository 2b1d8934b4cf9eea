// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Error types for the host-port boundary.
//!
//! Guest-visible register accesses never return a [`PortError`] — per the
//! error taxonomy, those outcomes are encoded directly in the `i32` the
//! access returns. `PortError` is only surfaced at `Uart::init`, and
//! internally at `reconfigure()` before it gets downgraded to a logged
//! diagnostic line.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Cause of a host serial port open or reconfigure failure.
#[derive(Debug)]
pub enum PortError {
    /// The named device does not exist on this host.
    DeviceNotFound(String),
    /// The host library rejected the requested baud/framing parameters.
    InvalidParameters(String),
    /// Any other I/O failure while opening, reconfiguring or driving the
    /// port (including failures to assert DTR/RTS after opening).
    Io(io::Error),
}

impl Display for PortError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PortError::DeviceNotFound(path) => write!(f, "device not found: {}", path),
            PortError::InvalidParameters(msg) => write!(f, "parameters rejected: {}", msg),
            PortError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PortError {
    fn from(err: io::Error) -> Self {
        PortError::Io(err)
    }
}

impl From<serialport::Error> for PortError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => PortError::DeviceNotFound(err.description),
            serialport::ErrorKind::InvalidInput => PortError::InvalidParameters(err.description),
            serialport::ErrorKind::Io(io_kind) => PortError::Io(io::Error::new(io_kind, err.description)),
            serialport::ErrorKind::Unknown => {
                PortError::Io(io::Error::new(io::ErrorKind::Other, err.description))
            }
        }
    }
}
