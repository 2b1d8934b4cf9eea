// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Emulation of the register-level interface of a TI TL16C2550-class
//! dual-UART, bridging an emulated guest's register accesses to a real
//! asynchronous serial port on the host.
//!
//! An embedder that performs address decoding constructs a [`Uart`], calls
//! [`Uart::init`] once with a host device path, and then forwards every
//! guest register access in its 8-byte window to [`Uart::read`] /
//! [`Uart::write`]. The UART reconfigures the host port on its own whenever
//! the guest reprograms baud, framing or modem-control bits; the embedder
//! never has to know about that.
//!
//! This crate does not model cycle-accurate timing, true FIFO queueing with
//! threshold interrupts, interrupt-line signalling, modem-status-change
//! interrupts, break-signal generation, or automatic hardware flow-control
//! negotiation.

#![deny(missing_docs)]

pub mod error;
pub mod port;
pub mod uart;

pub use error::PortError;
pub use port::{DataBits, HostPort, Parity, PortConfig, SerialBackend, StopBits};
pub use uart::{Uart, OSCILLATOR_HZ};
