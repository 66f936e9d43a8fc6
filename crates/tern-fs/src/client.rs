//! Client-side library for talking to the file server.
//!
//! Holds the per-process state the server deliberately does not track: the
//! open-file table with per-descriptor offsets and reuse stamps, and the
//! current working directory with the reuse stamp observed at ChDir time.
//! Each call validates its arguments locally, registers its buffers with
//! the request's memory handle, and sends one message.

use async_channel::Sender;
use tern_core::ipc::{ClientMemory, Envelope};
use tern_core::proto::{Message, RequestKind, SeekWhence};
use tern_core::{Fd, Inum, MAXPATHNAMELEN, MAX_OPEN_FILES};
use tracing::debug;

use crate::layout::{InodeType, ROOTINODE};
use crate::FsError;

// Addresses under which request buffers are registered. Any distinct
// values work; the server only ever echoes them back through the memory
// handle.
const PATH_ADDR: u64 = 0x1000;
const PATH2_ADDR: u64 = 0x2000;
const DATA_ADDR: u64 = 0x3000;

/// One open file: the inode handle and the cursor position.
#[derive(Clone, Copy, Debug)]
pub struct OpenFile {
    /// Inode the descriptor refers to.
    pub inum: Inum,
    /// Reuse stamp observed when the file was opened.
    pub reuse: i32,
    /// Current file position.
    pub offset: i32,
}

/// Result of a Stat request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stat {
    /// Inode number of the file.
    pub inum: Inum,
    /// File type.
    pub kind: InodeType,
    /// Size in bytes.
    pub size: i32,
    /// Hard link count.
    pub nlink: i32,
}

/// A connection to the file server.
pub struct FsClient {
    requests: Sender<Envelope>,
    files: [Option<OpenFile>; MAX_OPEN_FILES],
    cwd: Inum,
    cwd_reuse: i32,
}

impl FsClient {
    /// Connect over the given request channel. The working directory
    /// starts at the root.
    pub fn new(requests: Sender<Envelope>) -> Self {
        FsClient {
            requests,
            files: [None; MAX_OPEN_FILES],
            cwd: ROOTINODE,
            cwd_reuse: 1,
        }
    }

    /// The current working directory's inode and reuse stamp.
    pub fn cwd(&self) -> (Inum, i32) {
        (self.cwd, self.cwd_reuse)
    }

    /// Open the file named by `path`. Opening a directory is allowed.
    pub async fn open(&mut self, path: &str) -> Result<Fd, FsError> {
        let path = check_path(path)?;
        self.free_slot()?;

        let mut msg = self.path_request(RequestKind::Open);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());

        let (reply, _) = self.transact(msg, mem).await?;
        self.install_fd(reply.data1, reply.data2)
    }

    /// Create (or truncate) the regular file named by `path` and open it.
    pub async fn create(&mut self, path: &str) -> Result<Fd, FsError> {
        let path = check_path(path)?;
        self.free_slot()?;

        let mut msg = self.path_request(RequestKind::Create);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());

        let (reply, _) = self.transact(msg, mem).await?;
        self.install_fd(reply.data1, reply.data2)
    }

    /// Release a file descriptor. Purely client-local.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let slot = self.slot_of(fd)?;
        self.files[slot] = None;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at the current position, advancing it
    /// by the number of bytes read.
    pub async fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let slot = self.slot_of(fd)?;
        let file = self.files[slot].expect("validated slot");

        let mut msg = Message::request(RequestKind::Read);
        msg.data1 = file.inum.as_i32();
        msg.data2 = file.offset;
        msg.data3 = buf.len().min(i32::MAX as usize) as i32;
        msg.addr1 = DATA_ADDR;
        msg.addr2 = file.reuse as u64;
        let mut mem = ClientMemory::new();
        mem.register(DATA_ADDR, vec![0; buf.len()]);

        let (reply, mut mem) = self.transact(msg, mem).await?;
        let count = reply.data1 as usize;
        let data = mem.take(DATA_ADDR).ok_or(FsError::RequestFailed)?;
        buf[..count].copy_from_slice(&data[..count]);
        self.files[slot].as_mut().expect("validated slot").offset += count as i32;
        Ok(count)
    }

    /// Write `data` at the current position, advancing it by the number of
    /// bytes written.
    pub async fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize, FsError> {
        let slot = self.slot_of(fd)?;
        let file = self.files[slot].expect("validated slot");

        let mut msg = Message::request(RequestKind::Write);
        msg.data1 = file.inum.as_i32();
        msg.data2 = file.offset;
        msg.data3 = data.len().min(i32::MAX as usize) as i32;
        msg.addr1 = DATA_ADDR;
        msg.addr2 = file.reuse as u64;
        let mut mem = ClientMemory::new();
        mem.register(DATA_ADDR, data.to_vec());

        let (reply, _) = self.transact(msg, mem).await?;
        let count = reply.data1;
        self.files[slot].as_mut().expect("validated slot").offset += count;
        Ok(count as usize)
    }

    /// Move the file position of `fd`. Positions past EOF are legal; the
    /// next write fills the gap with zeros.
    pub async fn seek(&mut self, fd: Fd, offset: i32, whence: SeekWhence) -> Result<i32, FsError> {
        let slot = self.slot_of(fd)?;
        let file = self.files[slot].expect("validated slot");

        let mut msg = Message::request(RequestKind::Seek);
        msg.data1 = file.inum.as_i32();
        msg.data2 = offset;
        msg.data3 = whence as i32;
        msg.addr1 = file.offset as u64;
        msg.addr2 = file.reuse as u64;

        let (reply, _) = self.transact(msg, ClientMemory::new()).await?;
        self.files[slot].as_mut().expect("validated slot").offset = reply.data1;
        Ok(reply.data1)
    }

    /// Create a hard link `new` referring to the file `old`.
    pub async fn link(&mut self, old: &str, new: &str) -> Result<(), FsError> {
        let old = check_path(old)?;
        let new = check_path(new)?;

        let mut msg = self.path_request(RequestKind::Link);
        msg.addr1 = PATH_ADDR;
        msg.addr2 = PATH2_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, old.to_vec());
        mem.register(PATH2_ADDR, new.to_vec());

        self.transact(msg, mem).await.map(drop)
    }

    /// Remove the directory entry for `path`; the file itself is freed
    /// when its last link goes away.
    pub async fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let path = check_path(path)?;
        let mut msg = self.path_request(RequestKind::Unlink);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());
        self.transact(msg, mem).await.map(drop)
    }

    /// Create a symbolic link `link` whose target is the path `target`.
    /// The target need not exist.
    pub async fn symlink(&mut self, target: &str, link: &str) -> Result<(), FsError> {
        let target = check_path(target)?;
        let link = check_path(link)?;
        if target.is_empty() {
            return Err(FsError::ArgumentInvalid("empty link target"));
        }

        let mut msg = self.path_request(RequestKind::SymLink);
        msg.addr1 = PATH_ADDR;
        msg.addr2 = PATH2_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, target.to_vec());
        mem.register(PATH2_ADDR, link.to_vec());

        self.transact(msg, mem).await.map(drop)
    }

    /// Read the target of the symbolic link `path` into `buf`, without
    /// following the link. Returns the number of bytes stored.
    pub async fn read_link(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
        let path = check_path(path)?;
        if buf.is_empty() {
            return Err(FsError::ArgumentInvalid("empty buffer"));
        }

        let mut msg = self.path_request(RequestKind::ReadLink);
        msg.data3 = buf.len().min(i32::MAX as usize) as i32;
        msg.addr1 = PATH_ADDR;
        msg.addr2 = DATA_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());
        mem.register(DATA_ADDR, vec![0; buf.len()]);

        let (reply, mut mem) = self.transact(msg, mem).await?;
        let count = reply.data1 as usize;
        let data = mem.take(DATA_ADDR).ok_or(FsError::RequestFailed)?;
        buf[..count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    /// Create the directory named by `path`.
    pub async fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = check_path(path)?;
        let mut msg = self.path_request(RequestKind::MkDir);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());
        self.transact(msg, mem).await.map(drop)
    }

    /// Remove the empty directory named by `path`. Refuses `/`, `.`, and
    /// `..` before consulting the server, which enforces the same rules.
    pub async fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let raw = check_path(path)?;
        if raw == b"/" {
            return Err(FsError::ArgumentInvalid("cannot remove the root directory"));
        }
        let last = raw
            .split(|&b| b == b'/')
            .rfind(|part| !part.is_empty())
            .unwrap_or(b"");
        if last == b"." || last == b".." {
            return Err(FsError::ArgumentInvalid("cannot remove . or .."));
        }

        let mut msg = self.path_request(RequestKind::RmDir);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, raw.to_vec());
        self.transact(msg, mem).await.map(drop)
    }

    /// Change the working directory, atomically updating the cached inode
    /// and reuse stamp.
    pub async fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = check_path(path)?;
        let mut msg = self.path_request(RequestKind::ChDir);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());

        let (reply, _) = self.transact(msg, mem).await?;
        self.cwd = Inum(reply.data1 as i16);
        self.cwd_reuse = reply.data2;
        debug!(cwd = %self.cwd, reuse = self.cwd_reuse, "changed directory");
        Ok(())
    }

    /// Report the type, size, and link count of `path`, without following
    /// a final symbolic link.
    pub async fn stat(&mut self, path: &str) -> Result<Stat, FsError> {
        let path = check_path(path)?;
        let mut msg = self.path_request(RequestKind::Stat);
        msg.addr1 = PATH_ADDR;
        let mut mem = ClientMemory::new();
        mem.register(PATH_ADDR, path.to_vec());

        let (reply, _) = self.transact(msg, mem).await?;
        let kind =
            InodeType::from_code(reply.data2 as i16).ok_or(FsError::RequestFailed)?;
        Ok(Stat {
            inum: Inum(reply.data1 as i16),
            kind,
            size: reply.data3,
            nlink: reply.addr1 as i32,
        })
    }

    /// Flush all dirty server caches to disk.
    pub async fn sync(&self) -> Result<(), FsError> {
        let msg = Message::request(RequestKind::Sync);
        self.transact(msg, ClientMemory::new()).await.map(drop)
    }

    /// Flush and terminate the server.
    pub async fn shutdown(&self) -> Result<(), FsError> {
        let msg = Message::request(RequestKind::Shutdown);
        self.transact(msg, ClientMemory::new()).await.map(drop)
    }

    /// A request message carrying the working-directory handle, as every
    /// pathname operation does.
    fn path_request(&self, kind: RequestKind) -> Message {
        let mut msg = Message::request(kind);
        msg.data1 = self.cwd.as_i32();
        msg.data2 = self.cwd_reuse;
        msg
    }

    async fn transact(
        &self,
        msg: Message,
        mem: ClientMemory,
    ) -> Result<(Message, ClientMemory), FsError> {
        let (envelope, reply) = Envelope::new(msg, mem);
        self.requests
            .send(envelope)
            .await
            .map_err(|_| FsError::ServerUnavailable)?;
        let (reply, mem) = reply.await.map_err(|_| FsError::ServerUnavailable)?;
        if reply.is_error() {
            return Err(FsError::RequestFailed);
        }
        Ok((reply, mem))
    }

    fn free_slot(&self) -> Result<usize, FsError> {
        self.files
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(FsError::ResourceExhausted("file descriptors"))
    }

    fn install_fd(&mut self, inum: i32, reuse: i32) -> Result<Fd, FsError> {
        let slot = self.free_slot()?;
        self.files[slot] = Some(OpenFile {
            inum: Inum(inum as i16),
            reuse,
            offset: 0,
        });
        Ok(Fd(slot as i32))
    }

    fn slot_of(&self, fd: Fd) -> Result<usize, FsError> {
        let slot = fd.0;
        if slot < 0 || slot as usize >= MAX_OPEN_FILES || self.files[slot as usize].is_none() {
            return Err(FsError::ArgumentInvalid("bad file descriptor"));
        }
        Ok(slot as usize)
    }
}

fn check_path(path: &str) -> Result<&[u8], FsError> {
    if path.len() + 1 > MAXPATHNAMELEN {
        return Err(FsError::ArgumentInvalid("pathname too long"));
    }
    Ok(path.as_bytes())
}
