//! Shared protocol types for the tern kernel, terminal driver, and file
//! server.
//!
//! The file server speaks a fixed-size request/reply message over the
//! kernel's IPC primitive; both sides of that exchange (the server and the
//! client library) depend on this crate for the message layout, the typed
//! ids, and the copy-in/copy-out memory handle that travels with each
//! request.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub mod ipc;
pub mod proto;

/// Maximum length of a pathname, including the terminator byte.
pub const MAXPATHNAMELEN: usize = 256;

/// Maximum depth of symbolic link traversal before a loop is assumed.
pub const MAXSYMLINKS: usize = 20;

/// Maximum number of simultaneously open files per client.
pub const MAX_OPEN_FILES: usize = 16;

/// Status code stored in a reply's type field (and returned by syscalls) on
/// failure.
pub const ERROR_STATUS: i32 = -1;

/// Unique identifier for a process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Pid(pub i32);

impl Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Inode number on the file server's disk.
///
/// Directory entries store inode numbers as 16-bit values, so that is the
/// real bound on the id space; the wire protocol widens them to `i32`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Inum(pub i16);

impl Inum {
    /// The reserved "free directory entry" marker.
    pub const FREE: Inum = Inum(0);

    /// Widen to the wire representation.
    pub fn as_i32(self) -> i32 {
        i32::from(self.0)
    }
}

impl Display for Inum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Client-local file descriptor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Fd(pub i32);

impl Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
