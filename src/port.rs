// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Port Controller: translates register state into host serial port
//! parameters and owns the host device handle.
//!
//! [`HostPort`] is the seam between the Access Dispatcher in [`crate::uart`]
//! and a real serial cable, generic over its backing I/O the same way a
//! writer is generic over its output sink. The production implementation,
//! [`SerialBackend`], wraps the `serialport` crate; tests use an in-memory
//! stub instead.

use std::io;
use std::time::Duration;

use crate::error::PortError;

/// Number of data bits per frame, derived from LCR bits 1:0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    Eight,
}

/// Parity mode, derived from LCR bits 5:4:3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit fixed to 1 (mark).
    Mark,
    /// Parity bit fixed to 0 (space).
    Space,
}

/// Stop bits, derived from LCR bit 2 (and word length, for the 1.5 case).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopBits {
    /// 1 stop bit.
    One,
    /// 1.5 stop bits (only reachable with 5 data bits).
    OnePointFive,
    /// 2 stop bits.
    Two,
}

/// Framing and speed translated from the current LCR/divisor, independent
/// of which concrete host library ends up consuming it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortConfig {
    /// Bits per second.
    pub baud_rate: u32,
    /// Data bits per frame.
    pub data_bits: DataBits,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits per frame.
    pub stop_bits: StopBits,
}

impl PortConfig {
    /// 115200 8-N-1, the framing `init` opens with before the guest has
    /// programmed anything, so the first open doesn't depend on whatever
    /// the host library defaults to (see DESIGN.md).
    pub const DEFAULT: PortConfig = PortConfig {
        baud_rate: 115_200,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
    };
}

/// Bounded wait applied to both the host open/reconfigure call and to a
/// single blocking byte read (~1s to the first byte, 1s between bytes,
/// collapsed here into one read-call timeout).
pub const HOST_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything the Access Dispatcher needs from a host serial port.
///
/// Implementations own the device handle and are responsible for making
/// `reconfigure` idempotent: closing an already-closed port, or opening over
/// an already-open one, must not panic or leak a handle.
pub trait HostPort {
    /// Opens `path` with `config`. Closes any existing handle first.
    fn open(&mut self, path: &str, config: PortConfig) -> Result<(), PortError>;

    /// Closes the host device if open. Idempotent.
    fn close(&mut self);

    /// Whether the host device is currently open.
    fn is_open(&self) -> bool;

    /// Number of bytes the host currently has buffered for receive, or 0 if
    /// the port is closed or the host library can't tell us.
    fn bytes_available(&mut self) -> usize;

    /// Reads exactly one byte, blocking up to [`HOST_IO_TIMEOUT`].
    ///
    /// Only called after `bytes_available` reported at least one byte; the
    /// bounded wait is kept anyway because the host can race between the
    /// count and the read; that race is a known hazard, not something
    /// this crate papers over.
    fn read_byte(&mut self) -> io::Result<u8>;

    /// Writes exactly one byte, blocking until the host consumes it.
    /// Returns the number of bytes the host library reports as written.
    fn write_byte(&mut self, byte: u8) -> io::Result<usize>;

    /// Asserts or deasserts DTR.
    fn set_dtr(&mut self, on: bool) -> io::Result<()>;

    /// Asserts or deasserts RTS. Driven from MCR bit 5 (AFE), not the
    /// canonical RTS bit — see `uart::MCR_AFE_BIT`.
    fn set_rts(&mut self, on: bool) -> io::Result<()>;

    /// Closes then reopens with the given parameters. The default
    /// implementation is the whole of the Port Controller's reconfiguration
    /// contract; backends only need to implement the primitives above.
    fn reconfigure(&mut self, path: &str, config: PortConfig) -> Result<(), PortError> {
        self.close();
        self.open(path, config)
    }
}

fn resolve_device_path(path: &str) -> String {
    if cfg!(windows) {
        format!(r"\\.\{}", path)
    } else {
        path.to_string()
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        // The `serialport` crate (like most host serial APIs) only models
        // none/odd/even in hardware; mark/space parity has no wire-level
        // equivalent it exposes, so we fall back to the closest even/odd
        // polarity rather than silently dropping the guest's request.
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd | Parity::Mark => serialport::Parity::Odd,
            Parity::Even | Parity::Space => serialport::Parity::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            // The host library has no 1.5-stop-bit mode either; 2 is the
            // closer of the two it does offer.
            StopBits::One => serialport::StopBits::One,
            StopBits::OnePointFive | StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Production [`HostPort`] backed by a real OS serial device via the
/// `serialport` crate.
pub struct SerialBackend {
    inner: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialBackend {
    /// Creates a backend with no device open yet.
    pub fn new() -> Self {
        SerialBackend { inner: None }
    }
}

impl Default for SerialBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPort for SerialBackend {
    fn open(&mut self, path: &str, config: PortConfig) -> Result<(), PortError> {
        self.close();
        let resolved = resolve_device_path(path);
        let port = serialport::new(resolved, config.baud_rate)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .timeout(HOST_IO_TIMEOUT)
            .open()?;
        self.inner = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.inner = None;
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn bytes_available(&mut self) -> usize {
        self.inner
            .as_mut()
            .and_then(|port| port.bytes_to_read().ok())
            .unwrap_or(0) as usize
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let port = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
        let mut buf = [0u8; 1];
        io::Read::read_exact(port, &mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<usize> {
        let port = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
        io::Write::write(port, &[byte])
    }

    fn set_dtr(&mut self, on: bool) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(port) => port.write_data_terminal_ready(on),
            None => Ok(()),
        }
    }

    fn set_rts(&mut self, on: bool) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(port) => port.write_request_to_send(on),
            None => Ok(()),
        }
    }
}
