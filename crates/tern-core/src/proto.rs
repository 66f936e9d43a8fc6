//! The fixed-size file server message and its request codes.

use bytes::{Buf, BufMut};

use crate::ERROR_STATUS;

/// Size in bytes of every request and reply message.
pub const MESSAGE_SIZE: usize = 32;

/// The 32-byte message exchanged with the file server.
///
/// Requests fill the fields according to the request kind; replies mutate the
/// same message in place. `addr1` and `addr2` address buffers in the sender's
/// memory, reachable through the [`ClientMemory`](crate::ipc::ClientMemory)
/// handle that accompanies the message, except where a handler overloads them
/// as extra scalar slots (seek's current offset, stat's link count, the
/// read/write reuse stamp).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Message {
    /// Request code on the way in, status on the way out.
    pub kind: i32,
    /// First scalar argument or result.
    pub data1: i32,
    /// Second scalar argument or result.
    pub data2: i32,
    /// Third scalar argument or result.
    pub data3: i32,
    /// First buffer address in the sender's memory.
    pub addr1: u64,
    /// Second buffer address in the sender's memory.
    pub addr2: u64,
}

impl Message {
    /// Build a request message for the given kind.
    pub fn request(kind: RequestKind) -> Self {
        Message {
            kind: kind as i32,
            ..Default::default()
        }
    }

    /// Whether this reply carries the failure status.
    pub fn is_error(&self) -> bool {
        self.kind == ERROR_STATUS
    }

    /// Mark this message as a failed reply.
    pub fn set_error(&mut self) {
        self.kind = ERROR_STATUS;
    }

    /// Serialize into exactly [`MESSAGE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.kind);
        buf.put_i32_le(self.data1);
        buf.put_i32_le(self.data2);
        buf.put_i32_le(self.data3);
        buf.put_u64_le(self.addr1);
        buf.put_u64_le(self.addr2);
    }

    /// Deserialize from exactly [`MESSAGE_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Self {
        Message {
            kind: buf.get_i32_le(),
            data1: buf.get_i32_le(),
            data2: buf.get_i32_le(),
            data3: buf.get_i32_le(),
            addr1: buf.get_u64_le(),
            addr2: buf.get_u64_le(),
        }
    }
}

/// The sixteen file server operations, identified by the message type code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum RequestKind {
    /// Resolve a pathname and return its inode handle.
    Open = 1,
    /// Release a file descriptor (client-local, never sent on the wire).
    Close = 2,
    /// Create a regular file, truncating an existing one.
    Create = 3,
    /// Read bytes at an offset.
    Read = 4,
    /// Write bytes at an offset, growing the file.
    Write = 5,
    /// Compute a new file position.
    Seek = 6,
    /// Add a hard link.
    Link = 7,
    /// Remove a directory entry.
    Unlink = 8,
    /// Create a symbolic link.
    SymLink = 9,
    /// Read a symbolic link's target without following it.
    ReadLink = 10,
    /// Create a directory.
    MkDir = 11,
    /// Remove an empty directory.
    RmDir = 12,
    /// Change the client's working directory.
    ChDir = 13,
    /// Report a file's type, size, and link count.
    Stat = 14,
    /// Flush dirty cache state to disk.
    Sync = 15,
    /// Flush and terminate the server.
    Shutdown = 16,
}

impl RequestKind {
    /// Decode a wire type code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => RequestKind::Open,
            2 => RequestKind::Close,
            3 => RequestKind::Create,
            4 => RequestKind::Read,
            5 => RequestKind::Write,
            6 => RequestKind::Seek,
            7 => RequestKind::Link,
            8 => RequestKind::Unlink,
            9 => RequestKind::SymLink,
            10 => RequestKind::ReadLink,
            11 => RequestKind::MkDir,
            12 => RequestKind::RmDir,
            13 => RequestKind::ChDir,
            14 => RequestKind::Stat,
            15 => RequestKind::Sync,
            16 => RequestKind::Shutdown,
            _ => return None,
        })
    }
}

/// Reference point for a seek request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SeekWhence {
    /// Offset is absolute.
    Set = 0,
    /// Offset is relative to the current position.
    Cur = 1,
    /// Offset is relative to the end of the file.
    End = 2,
}

impl SeekWhence {
    /// Decode a wire whence code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => SeekWhence::Set,
            1 => SeekWhence::Cur,
            2 => SeekWhence::End,
            _ => return None,
        })
    }
}
