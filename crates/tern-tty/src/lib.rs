//! Monitor-based terminal driver.
//!
//! The driver mediates between asynchronous hardware interrupts and blocking
//! client calls for a fixed array of terminals. Every exported operation and
//! both interrupt handlers run under a single driver-wide lock, with
//! condition variables (Mesa semantics) marking the points where a caller
//! may suspend: readers waiting for a complete line, writers waiting for
//! room in the output ring, and both gated to one concurrent caller per
//! terminal.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

mod driver;
mod hw;
mod ring;

pub use driver::{TermStats, TtyDriver};
pub use hw::Hardware;

/// Number of hardware terminals in the system.
pub const NUM_TERMINALS: usize = 4;

/// Capacity of each input, output, and echo ring buffer.
pub const BUFFER_SIZE: usize = 4096;

/// Failures reported by the driver's blocking operations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TtyError {
    /// The driver was initialized twice.
    #[error("terminal driver is already initialized")]
    AlreadyInitialized,
    /// An operation ran before the driver was initialized.
    #[error("terminal driver is not initialized")]
    NotInitialized,
    /// The terminal index is outside `0..NUM_TERMINALS`.
    #[error("terminal {0} is out of range")]
    BadTerminal(usize),
    /// The terminal was initialized twice.
    #[error("terminal {0} is already initialized")]
    TerminalAlreadyInitialized(usize),
    /// A read or write targeted a terminal that was never initialized.
    #[error("terminal {0} is not initialized")]
    TerminalNotInitialized(usize),
    /// The hardware rejected terminal initialization.
    #[error("hardware failed to initialize terminal {0}")]
    Hardware(usize),
}
