//! Message-passing file server and its client library.
//!
//! The server owns a UNIX-style on-disk file system: an inode table and data
//! blocks behind a pair of LRU caches, free-inode and free-block maps built
//! by scanning the disk at startup, and a path resolver that honors
//! symbolic links and `.`/`..`/trailing-slash semantics. Clients talk to it
//! through the fixed-size message protocol in [`tern_core::proto`], sending
//! requests over a bounded channel and letting the server copy payloads
//! through the [`ClientMemory`](tern_core::ipc::ClientMemory) handle.
//!
//! Every request is processed atomically with respect to every other; the
//! only suspension points are disk reads and writes on cache misses and
//! evictions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

pub mod cache;
pub mod client;
pub mod dir;
pub mod disk;
pub mod free;
pub mod layout;
pub mod mkfs;
pub mod path;
pub mod server;

pub use client::{FsClient, OpenFile, Stat};
pub use server::FsServer;

/// Failures surfaced by the file server and the client library.
#[derive(Debug, Error)]
pub enum FsError {
    /// A malformed argument: bad descriptor, oversize path, negative size.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),
    /// An allocation failed: no free inodes, blocks, or descriptors.
    #[error("out of {0}")]
    ResourceExhausted(&'static str),
    /// The presented reuse stamp no longer matches the inode.
    #[error("stale file handle")]
    StaleHandle,
    /// Path resolution found nothing.
    #[error("no such file or directory")]
    NotFound,
    /// The target name already exists.
    #[error("file already exists")]
    AlreadyExists,
    /// The operation does not apply to directories.
    #[error("is a directory")]
    IsDirectory,
    /// A path component or operand must be a directory and is not.
    #[error("not a directory")]
    NotDirectory,
    /// The operand must be a symbolic link and is not.
    #[error("not a symbolic link")]
    NotSymlink,
    /// The directory still has live entries.
    #[error("directory not empty")]
    NotEmpty,
    /// Symbolic link traversal exceeded the depth bound.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    /// The server replied with the failure status (the wire protocol
    /// carries no further detail).
    #[error("request failed")]
    RequestFailed,
    /// The request channel to the server is closed.
    #[error("file server is not running")]
    ServerUnavailable,
    /// A payload copy through the sender's memory failed.
    #[error(transparent)]
    Memory(#[from] tern_core::ipc::MemoryError),
    /// Underlying disk failure.
    #[error("disk i/o: {0}")]
    Io(#[from] std::io::Error),
}
