//! The file server: a single-threaded request-reply loop over the caches,
//! free lists, and path resolver.
//!
//! Every request is handled to completion before the next is received, so
//! handlers never observe each other's partial state. Every request gets a
//! reply; on failure the reply's type field carries the error status and
//! the remaining fields are unspecified.

use async_channel::Receiver;
use tern_core::ipc::{ClientMemory, Envelope};
use tern_core::proto::{Message, RequestKind, SeekWhence};
use tern_core::{Inum, MAXPATHNAMELEN};
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::dir::{add_entry, data_block_number, entry_count, find_entry, indirect_entry, read_entry, remove_entry};
use crate::disk::Disk;
use crate::free::FreeLists;
use crate::layout::{
    DirEntry, FsHeader, InodeType, BLOCKSIZE, DIRENTRY_SIZE, MAX_FILE_SIZE, NUM_DIRECT,
    PTRS_PER_BLOCK, ROOTINODE,
};
use crate::path::{
    find_create_parent, last_component, normalize, parent_of, read_symlink_target, resolve_path,
    verify_cwd_reuse,
};
use crate::FsError;

/// The file server engine: one disk, its caches, and its free maps.
pub struct FsServer<D: Disk> {
    cache: Cache<D>,
    free: FreeLists,
}

impl<D: Disk> FsServer<D> {
    /// Bring up a server on a formatted disk: read the header, then build
    /// the free maps by scanning every inode.
    pub fn new(mut disk: D) -> Result<Self, FsError> {
        let mut block = [0u8; BLOCKSIZE];
        disk.read_sector(1, &mut block)?;
        let header = FsHeader::decode(&mut &block[..]);
        if header.num_blocks <= 1 || header.num_inodes <= 0 {
            return Err(FsError::ArgumentInvalid("disk holds no file system"));
        }
        info!(
            num_blocks = header.num_blocks,
            num_inodes = header.num_inodes,
            "file system header read"
        );

        let mut cache = Cache::new(disk, header);
        let free = FreeLists::scan(&mut cache)?;
        Ok(FsServer { cache, free })
    }

    /// Serve requests until the channel closes or a Shutdown arrives.
    pub async fn serve(mut self, requests: Receiver<Envelope>) -> Result<(), FsError> {
        info!("file server ready");
        while let Ok(Envelope {
            mut msg,
            mut mem,
            reply,
        }) = requests.recv().await
        {
            let shutdown = self.dispatch(&mut msg, &mut mem);
            // A client that gave up on its reply is not our problem.
            let _ = reply.send((msg, mem));
            if shutdown {
                info!("file server shutting down");
                break;
            }
        }
        Ok(())
    }

    /// Handle one message in place. Returns true when the server should
    /// exit after replying.
    pub fn dispatch(&mut self, msg: &mut Message, mem: &mut ClientMemory) -> bool {
        let kind = RequestKind::from_code(msg.kind);
        debug!(?kind, "request");
        let result = match kind {
            Some(RequestKind::Open) => self.open(msg, mem),
            Some(RequestKind::Create) => self.create(msg, mem),
            Some(RequestKind::Read) => self.read(msg, mem),
            Some(RequestKind::Write) => self.write(msg, mem),
            Some(RequestKind::Seek) => self.seek(msg),
            Some(RequestKind::Link) => self.link(msg, mem),
            Some(RequestKind::Unlink) => self.unlink(msg, mem),
            Some(RequestKind::SymLink) => self.symlink(msg, mem),
            Some(RequestKind::ReadLink) => self.readlink(msg, mem),
            Some(RequestKind::MkDir) => self.mkdir(msg, mem),
            Some(RequestKind::RmDir) => self.rmdir(msg, mem),
            Some(RequestKind::ChDir) => self.chdir(msg, mem),
            Some(RequestKind::Stat) => self.stat(msg, mem),
            Some(RequestKind::Sync) => self.cache.sync(),
            Some(RequestKind::Shutdown) => self.cache.sync(),
            Some(RequestKind::Close) | None => {
                warn!(code = msg.kind, "unhandled request code");
                Err(FsError::ArgumentInvalid("unknown request code"))
            }
        };
        match result {
            Ok(()) => msg.kind = 0,
            Err(err) => {
                debug!(%err, "request failed");
                msg.set_error();
            }
        }
        matches!(kind, Some(RequestKind::Shutdown))
    }

    /// Copy a pathname out of the sender, normalize it, and verify the
    /// sender's working-directory reuse stamp for relative paths.
    fn read_path(
        &mut self,
        msg: &Message,
        mem: &ClientMemory,
        addr: u64,
    ) -> Result<Vec<u8>, FsError> {
        let raw = mem.copy_from(addr, MAXPATHNAMELEN)?;
        let path = normalize(&raw)?;
        verify_cwd_reuse(&mut self.cache, &path, cwd_of(msg), msg.data2)?;
        Ok(path)
    }

    fn open(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let path = self.read_path(msg, mem, msg.addr1)?;
        let inum = resolve_path(&mut self.cache, &path, cwd_of(msg), 0, true)?;
        let inode = self.cache.inode(inum)?;
        msg.data1 = inum.as_i32();
        msg.data2 = inode.reuse;
        Ok(())
    }

    fn create(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let mut path = self.read_path(msg, mem, msg.addr1)?;
        // The trailing-slash normalization appended "/."; strip it again so
        // the final component is the name being created.
        if path.ends_with(b"/.") {
            path.truncate(path.len() - 2);
        }
        if path.is_empty() {
            return Err(FsError::ArgumentInvalid("no file name"));
        }

        let (parent, name) = find_create_parent(&mut self.cache, &path, cwd, 0)?;
        if name.is_empty() || name == b"." || name == b".." {
            return Err(FsError::ArgumentInvalid("cannot create . or .."));
        }

        if let Some(existing) = find_entry(&mut self.cache, parent, &name)? {
            let inode = *self.cache.inode(existing)?;
            return match inode.kind {
                InodeType::Regular => {
                    debug!(inum = %existing, "create: truncating existing file");
                    self.truncate(existing)?;
                    msg.data1 = existing.as_i32();
                    msg.data2 = inode.reuse;
                    Ok(())
                }
                InodeType::Directory => Err(FsError::IsDirectory),
                _ => Err(FsError::AlreadyExists),
            };
        }

        let inum = self.free.allocate_inode()?;
        if let Err(err) = add_entry(&mut self.cache, &mut self.free, parent, &name, inum) {
            self.free.release_inode(inum);
            return Err(err);
        }
        let inode = self.cache.inode_mut(inum)?;
        inode.reallocate(InodeType::Regular, 1);
        msg.data1 = inum.as_i32();
        msg.data2 = inode.reuse;
        Ok(())
    }

    fn read(&mut self, msg: &mut Message, mem: &mut ClientMemory) -> Result<(), FsError> {
        let inum = file_of(msg)?;
        let offset = msg.data2;
        let size = msg.data3;
        if offset < 0 || size < 0 {
            return Err(FsError::ArgumentInvalid("negative offset or size"));
        }

        let inode = *self.cache.inode(inum)?;
        if inode.reuse != msg.addr2 as i32 {
            return Err(FsError::StaleHandle);
        }
        if inode.kind == InodeType::Free {
            return Err(FsError::NotFound);
        }

        // Reading at or past EOF yields zero bytes, not an error.
        if offset >= inode.size {
            msg.data1 = 0;
            return Ok(());
        }
        let size = size.min(inode.size - offset) as usize;

        let mut data = Vec::with_capacity(size);
        let mut pos = offset as usize;
        let end = pos + size;
        while pos < end {
            let in_block = pos % BLOCKSIZE;
            let take = (BLOCKSIZE - in_block).min(end - pos);
            let num = data_block_number(&mut self.cache, &inode, pos / BLOCKSIZE)?;
            let block = self.cache.block(num)?;
            data.extend_from_slice(&block[in_block..in_block + take]);
            pos += take;
        }

        mem.copy_to(msg.addr1, &data)?;
        msg.data1 = data.len() as i32;
        Ok(())
    }

    fn write(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let inum = file_of(msg)?;
        let offset = msg.data2;
        let size = msg.data3;
        if offset < 0 || size < 0 {
            return Err(FsError::ArgumentInvalid("negative offset or size"));
        }

        let inode = *self.cache.inode(inum)?;
        if inode.reuse != msg.addr2 as i32 {
            return Err(FsError::StaleHandle);
        }
        if inode.kind != InodeType::Regular {
            return Err(FsError::ArgumentInvalid("not a regular file"));
        }
        if offset as usize >= MAX_FILE_SIZE {
            return Err(FsError::ArgumentInvalid("offset beyond maximum file size"));
        }
        let size = (size as usize).min(MAX_FILE_SIZE - offset as usize);
        let payload = mem.copy_from(msg.addr1, size)?;
        let size = payload.len();

        // Grow the block map up to the end of the write before touching any
        // data, so a full disk fails the request without partial state. Any
        // gap between the old size and the write offset reads back as
        // zeros, because fresh blocks are zeroed at allocation.
        let offset = offset as usize;
        let have = (inode.size as usize + BLOCKSIZE - 1) / BLOCKSIZE;
        let want = (offset + size + BLOCKSIZE - 1) / BLOCKSIZE;
        let grow = want.saturating_sub(have);
        if grow > 0 {
            let indirect_needed = usize::from(want > NUM_DIRECT && inode.indirect == 0);
            if grow + indirect_needed > self.free.free_block_count() {
                return Err(FsError::ResourceExhausted("disk blocks"));
            }
            for _ in 0..grow {
                self.free.allocate_block_in_inode(&mut self.cache, inum)?;
            }
        }

        let inode = *self.cache.inode(inum)?;
        let mut pos = offset;
        let end = offset + size;
        while pos < end {
            let in_block = pos % BLOCKSIZE;
            let take = (BLOCKSIZE - in_block).min(end - pos);
            let num = data_block_number(&mut self.cache, &inode, pos / BLOCKSIZE)?;
            let block = self.cache.block_mut(num)?;
            block[in_block..in_block + take].copy_from_slice(&payload[pos - offset..pos - offset + take]);
            pos += take;
        }

        let written = size as i32;
        let new_size = (offset + size) as i32;
        let node = self.cache.inode_mut(inum)?;
        node.size = node.size.max(new_size);
        msg.data1 = written;
        Ok(())
    }

    fn seek(&mut self, msg: &mut Message) -> Result<(), FsError> {
        let inum = file_of(msg)?;
        let offset = msg.data2;
        let current = msg.addr1 as i32;
        let inode = *self.cache.inode(inum)?;
        if inode.reuse != msg.addr2 as i32 {
            return Err(FsError::StaleHandle);
        }

        let whence = SeekWhence::from_code(msg.data3)
            .ok_or(FsError::ArgumentInvalid("bad seek whence"))?;
        let target = match whence {
            SeekWhence::Set => offset,
            SeekWhence::Cur => current + offset,
            SeekWhence::End => inode.size + offset,
        };
        // Seeking past EOF is allowed; a later write fills the hole with
        // zeros. A negative position never is.
        if target < 0 {
            return Err(FsError::ArgumentInvalid("negative file position"));
        }
        msg.data1 = target;
        Ok(())
    }

    fn link(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let old = self.read_path(msg, mem, msg.addr1)?;
        let new = self.read_path(msg, mem, msg.addr2)?;

        let old_inum = resolve_path(&mut self.cache, &old, cwd, 0, false)?;
        if self.cache.inode(old_inum)?.kind == InodeType::Directory {
            return Err(FsError::IsDirectory);
        }

        let parent = parent_of(&mut self.cache, &new, cwd)?;
        let name = last_component(&new).to_vec();
        if find_entry(&mut self.cache, parent, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        add_entry(&mut self.cache, &mut self.free, parent, &name, old_inum)?;
        self.cache.inode_mut(old_inum)?.nlink += 1;
        Ok(())
    }

    fn unlink(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;

        let parent = parent_of(&mut self.cache, &path, cwd)?;
        let name = last_component(&path).to_vec();
        let inum = find_entry(&mut self.cache, parent, &name)?.ok_or(FsError::NotFound)?;
        if self.cache.inode(inum)?.kind == InodeType::Directory {
            return Err(FsError::IsDirectory);
        }

        remove_entry(&mut self.cache, parent, &name, inum)?;
        let node = self.cache.inode_mut(inum)?;
        node.nlink -= 1;
        if node.nlink == 0 {
            debug!(%inum, "unlink dropped last link, freeing inode");
            self.truncate(inum)?;
            self.cache.inode_mut(inum)?.kind = InodeType::Free;
            self.free.release_inode(inum);
        }
        Ok(())
    }

    fn symlink(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let target = mem.copy_from(msg.addr1, MAXPATHNAMELEN)?;
        let new = self.read_path(msg, mem, msg.addr2)?;
        // The target is stored verbatim; it need not resolve to anything
        // yet, but it must be non-empty and fit in a single block.
        if target.is_empty() {
            return Err(FsError::ArgumentInvalid("empty link target"));
        }
        if target.len() > MAXPATHNAMELEN || target.len() > BLOCKSIZE {
            return Err(FsError::ArgumentInvalid("link target too long"));
        }

        let parent = parent_of(&mut self.cache, &new, cwd)?;
        let name = last_component(&new).to_vec();
        if find_entry(&mut self.cache, parent, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let inum = self.free.allocate_inode()?;
        {
            let node = self.cache.inode_mut(inum)?;
            node.reallocate(InodeType::Symlink, 1);
            node.size = target.len() as i32;
        }
        let block = match self.free.allocate_block(&mut self.cache) {
            Ok(block) => block,
            Err(err) => {
                self.cache.inode_mut(inum)?.kind = InodeType::Free;
                self.free.release_inode(inum);
                return Err(err);
            }
        };
        self.cache.inode_mut(inum)?.direct[0] = block;
        self.cache.block_mut(block)?[..target.len()].copy_from_slice(&target);

        if let Err(err) = add_entry(&mut self.cache, &mut self.free, parent, &name, inum) {
            let node = self.cache.inode_mut(inum)?;
            node.kind = InodeType::Free;
            node.direct[0] = 0;
            self.free.release_inode(inum);
            self.free.release_block(block);
            return Err(err);
        }
        Ok(())
    }

    fn readlink(&mut self, msg: &mut Message, mem: &mut ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;
        let len = msg.data3;
        if len < 0 {
            return Err(FsError::ArgumentInvalid("negative length"));
        }

        let inum = resolve_path(&mut self.cache, &path, cwd, 0, false)?;
        let inode = *self.cache.inode(inum)?;
        let target = read_symlink_target(&mut self.cache, &inode)?;
        let take = target.len().min(len as usize);
        mem.copy_to(msg.addr2, &target[..take])?;
        msg.data1 = take as i32;
        Ok(())
    }

    fn mkdir(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;

        let parent = parent_of(&mut self.cache, &path, cwd)?;
        let name = last_component(&path).to_vec();
        if find_entry(&mut self.cache, parent, &name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let inum = self.free.allocate_inode()?;
        {
            let node = self.cache.inode_mut(inum)?;
            node.reallocate(InodeType::Directory, 2);
            node.size = 2 * DIRENTRY_SIZE as i32;
        }
        let block = match self.free.allocate_block(&mut self.cache) {
            Ok(block) => block,
            Err(err) => {
                self.cache.inode_mut(inum)?.kind = InodeType::Free;
                self.free.release_inode(inum);
                return Err(err);
            }
        };
        self.cache.inode_mut(inum)?.direct[0] = block;

        if let Err(err) = add_entry(&mut self.cache, &mut self.free, parent, &name, inum) {
            let node = self.cache.inode_mut(inum)?;
            node.kind = InodeType::Free;
            node.direct[0] = 0;
            self.free.release_inode(inum);
            self.free.release_block(block);
            return Err(err);
        }
        self.cache.inode_mut(parent)?.nlink += 1;

        // Seed the new directory with its "." and ".." entries.
        let data = self.cache.block_mut(block)?;
        let mut slice = &mut data[..2 * DIRENTRY_SIZE];
        DirEntry::new(inum, b".").encode(&mut slice);
        DirEntry::new(parent, b"..").encode(&mut slice);
        Ok(())
    }

    fn rmdir(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;

        let parent = parent_of(&mut self.cache, &path, cwd)?;
        let name = last_component(&path).to_vec();
        // "/" normalizes to "/." and so also lands in the first arm.
        if name == b"." || name == b".." {
            return Err(FsError::ArgumentInvalid("cannot remove . or .."));
        }

        let inum = find_entry(&mut self.cache, parent, &name)?.ok_or(FsError::NotFound)?;
        if inum == ROOTINODE {
            return Err(FsError::ArgumentInvalid("cannot remove the root directory"));
        }
        let dir = *self.cache.inode(inum)?;
        if dir.kind != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }

        // Only ".", "..", and free slots may remain.
        for index in 0..entry_count(&dir) {
            let entry = read_entry(&mut self.cache, &dir, index)?;
            if entry.inum != Inum::FREE
                && !entry.name_matches(b".")
                && !entry.name_matches(b"..")
            {
                return Err(FsError::NotEmpty);
            }
        }

        remove_entry(&mut self.cache, parent, &name, inum)?;
        self.cache.inode_mut(parent)?.nlink -= 1;
        self.truncate(inum)?;
        self.cache.inode_mut(inum)?.kind = InodeType::Free;
        self.free.release_inode(inum);
        Ok(())
    }

    fn chdir(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;
        let inum = resolve_path(&mut self.cache, &path, cwd, 0, true)?;
        let inode = self.cache.inode(inum)?;
        if inode.kind != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        msg.data1 = inum.as_i32();
        msg.data2 = inode.reuse;
        Ok(())
    }

    fn stat(&mut self, msg: &mut Message, mem: &ClientMemory) -> Result<(), FsError> {
        let cwd = cwd_of(msg);
        let path = self.read_path(msg, mem, msg.addr1)?;
        let inum = resolve_path(&mut self.cache, &path, cwd, 0, false)?;
        let inode = self.cache.inode(inum)?;
        msg.data1 = inum.as_i32();
        msg.data2 = inode.kind as i32;
        msg.data3 = inode.size;
        msg.addr1 = inode.nlink as u64;
        Ok(())
    }

    /// Release every data block of `inum` (and the indirect block itself)
    /// and reset its size to zero.
    fn truncate(&mut self, inum: Inum) -> Result<(), FsError> {
        let inode = *self.cache.inode(inum)?;
        for &block in &inode.direct {
            if block == 0 {
                break;
            }
            self.free.release_block(block);
        }
        if inode.indirect > 0 {
            for slot in 0..PTRS_PER_BLOCK {
                let block = indirect_entry(&mut self.cache, inode.indirect, slot)?;
                if block == 0 {
                    break;
                }
                self.free.release_block(block);
            }
            self.free.release_block(inode.indirect);
        }
        let node = self.cache.inode_mut(inum)?;
        node.size = 0;
        node.direct = [0; NUM_DIRECT];
        node.indirect = 0;
        Ok(())
    }
}

fn cwd_of(msg: &Message) -> Inum {
    Inum(msg.data1 as i16)
}

fn file_of(msg: &Message) -> Result<Inum, FsError> {
    let raw = msg.data1;
    if raw <= 0 || raw > i32::from(i16::MAX) {
        return Err(FsError::ArgumentInvalid("bad inode number"));
    }
    Ok(Inum(raw as i16))
}
