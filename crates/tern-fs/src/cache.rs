//! Write-back caches for disk blocks and inodes.
//!
//! Each cache is a fixed-capacity slab with two intrusive index structures
//! over the same slots: an LRU list (head = most recently used) and a
//! chained hash table with as many buckets as the cache has entries. The
//! slab owns every entry; eviction of the LRU tail is the only point where
//! an entry leaves the cache, writing it back first if dirty. Dirty inodes
//! write back into the cached copy of their enclosing block, which then
//! becomes dirty itself; dirty blocks write back to their sector.

use tern_core::Inum;
use tracing::trace;

use crate::disk::Disk;
use crate::layout::{
    inode_block, inode_offset, FsHeader, Inode, BLOCKSIZE, BLOCK_CACHESIZE, INODE_CACHESIZE,
};
use crate::FsError;

const NIL: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Links {
    lru_prev: usize,
    lru_next: usize,
    hash_prev: usize,
    hash_next: usize,
    bucket: usize,
}

/// LRU order and hash chains over the slots of one slab.
struct CacheIndex {
    links: Vec<Links>,
    lru_head: usize,
    lru_tail: usize,
    buckets: Vec<usize>,
    free: Vec<usize>,
}

impl CacheIndex {
    fn new(capacity: usize) -> Self {
        CacheIndex {
            links: vec![
                Links {
                    lru_prev: NIL,
                    lru_next: NIL,
                    hash_prev: NIL,
                    hash_next: NIL,
                    bucket: NIL,
                };
                capacity
            ],
            lru_head: NIL,
            lru_tail: NIL,
            buckets: vec![NIL; capacity],
            free: (0..capacity).rev().collect(),
        }
    }

    fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    fn tail(&self) -> usize {
        self.lru_tail
    }

    /// Walk the bucket chain for `bucket`, returning the slot for which
    /// `matches` is true.
    fn find(&self, bucket: usize, matches: impl Fn(usize) -> bool) -> Option<usize> {
        let mut slot = self.buckets[bucket];
        while slot != NIL {
            if matches(slot) {
                return Some(slot);
            }
            slot = self.links[slot].hash_next;
        }
        None
    }

    /// Claim a free slot and link it at the head of the LRU list and of its
    /// bucket chain.
    fn insert(&mut self, bucket: usize) -> usize {
        let slot = self.free.pop().expect("cache index full");
        let links = &mut self.links[slot];
        links.bucket = bucket;
        links.hash_prev = NIL;
        links.hash_next = self.buckets[bucket];
        links.lru_prev = NIL;
        links.lru_next = self.lru_head;
        if self.buckets[bucket] != NIL {
            self.links[self.buckets[bucket]].hash_prev = slot;
        }
        self.buckets[bucket] = slot;
        if self.lru_head != NIL {
            self.links[self.lru_head].lru_prev = slot;
        }
        self.lru_head = slot;
        if self.lru_tail == NIL {
            self.lru_tail = slot;
        }
        slot
    }

    /// Unlink `slot` from both structures and return it to the free list.
    fn remove(&mut self, slot: usize) {
        let links = self.links[slot];
        if links.lru_prev != NIL {
            self.links[links.lru_prev].lru_next = links.lru_next;
        } else {
            self.lru_head = links.lru_next;
        }
        if links.lru_next != NIL {
            self.links[links.lru_next].lru_prev = links.lru_prev;
        } else {
            self.lru_tail = links.lru_prev;
        }
        if links.hash_prev != NIL {
            self.links[links.hash_prev].hash_next = links.hash_next;
        } else {
            self.buckets[links.bucket] = links.hash_next;
        }
        if links.hash_next != NIL {
            self.links[links.hash_next].hash_prev = links.hash_prev;
        }
        self.links[slot] = Links {
            lru_prev: NIL,
            lru_next: NIL,
            hash_prev: NIL,
            hash_next: NIL,
            bucket: NIL,
        };
        self.free.push(slot);
    }

    /// Move `slot` to the head of the LRU list.
    fn touch(&mut self, slot: usize) {
        if self.lru_head == slot {
            return;
        }
        let links = self.links[slot];
        if links.lru_prev != NIL {
            self.links[links.lru_prev].lru_next = links.lru_next;
        }
        if links.lru_next != NIL {
            self.links[links.lru_next].lru_prev = links.lru_prev;
        } else {
            self.lru_tail = links.lru_prev;
        }
        self.links[slot].lru_prev = NIL;
        self.links[slot].lru_next = self.lru_head;
        if self.lru_head != NIL {
            self.links[self.lru_head].lru_prev = slot;
        }
        self.lru_head = slot;
    }

    /// Every occupied slot, in LRU order from most to least recent.
    fn occupied(&self) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut slot = self.lru_head;
        while slot != NIL {
            slots.push(slot);
            slot = self.links[slot].lru_next;
        }
        slots
    }
}

struct BlockEntry {
    num: i32,
    dirty: bool,
    data: Box<[u8; BLOCKSIZE]>,
}

struct InodeEntry {
    inum: Inum,
    dirty: bool,
    inode: Inode,
}

/// The block and inode caches over one disk.
pub struct Cache<D> {
    disk: D,
    header: FsHeader,
    blocks: Vec<Option<BlockEntry>>,
    block_index: CacheIndex,
    inodes: Vec<Option<InodeEntry>>,
    inode_index: CacheIndex,
}

impl<D: Disk> Cache<D> {
    /// Wrap a disk whose geometry is described by `header`.
    pub fn new(disk: D, header: FsHeader) -> Self {
        Cache {
            disk,
            header,
            blocks: (0..BLOCK_CACHESIZE).map(|_| None).collect(),
            block_index: CacheIndex::new(BLOCK_CACHESIZE),
            inodes: (0..INODE_CACHESIZE).map(|_| None).collect(),
            inode_index: CacheIndex::new(INODE_CACHESIZE),
        }
    }

    /// The file system geometry.
    pub fn header(&self) -> FsHeader {
        self.header
    }

    /// Read access to a cached block, faulting it in on a miss.
    pub fn block(&mut self, num: i32) -> Result<&[u8; BLOCKSIZE], FsError> {
        let slot = self.block_slot(num)?;
        Ok(&self.blocks[slot].as_ref().expect("occupied slot").data)
    }

    /// Write access to a cached block; the block becomes dirty.
    pub fn block_mut(&mut self, num: i32) -> Result<&mut [u8; BLOCKSIZE], FsError> {
        let slot = self.block_slot(num)?;
        let entry = self.blocks[slot].as_mut().expect("occupied slot");
        entry.dirty = true;
        Ok(&mut entry.data)
    }

    /// Read access to a cached inode, faulting it in on a miss.
    pub fn inode(&mut self, inum: Inum) -> Result<&Inode, FsError> {
        let slot = self.inode_slot(inum)?;
        Ok(&self.inodes[slot].as_ref().expect("occupied slot").inode)
    }

    /// Write access to a cached inode; the inode becomes dirty.
    pub fn inode_mut(&mut self, inum: Inum) -> Result<&mut Inode, FsError> {
        let slot = self.inode_slot(inum)?;
        let entry = self.inodes[slot].as_mut().expect("occupied slot");
        entry.dirty = true;
        Ok(&mut entry.inode)
    }

    /// Flush every dirty inode into the block cache, then every dirty block
    /// to its sector.
    pub fn sync(&mut self) -> Result<(), FsError> {
        for slot in self.inode_index.occupied() {
            let (inum, inode, dirty) = {
                let entry = self.inodes[slot].as_ref().expect("occupied slot");
                (entry.inum, entry.inode, entry.dirty)
            };
            if dirty {
                self.write_back_inode(inum, &inode)?;
                self.inodes[slot].as_mut().expect("occupied slot").dirty = false;
            }
        }
        for slot in self.block_index.occupied() {
            let entry = self.blocks[slot].as_mut().expect("occupied slot");
            if entry.dirty {
                trace!(block = entry.num, "sync: writing dirty block");
                self.disk.write_sector(entry.num, &entry.data)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    fn block_slot(&mut self, num: i32) -> Result<usize, FsError> {
        if num < 0 || num >= self.header.num_blocks {
            return Err(FsError::ArgumentInvalid("block number out of range"));
        }
        let bucket = num as usize % BLOCK_CACHESIZE;
        let blocks = &self.blocks;
        if let Some(slot) = self
            .block_index
            .find(bucket, |slot| blocks[slot].as_ref().is_some_and(|e| e.num == num))
        {
            self.block_index.touch(slot);
            return Ok(slot);
        }

        if self.block_index.is_full() {
            self.evict_block_tail()?;
        }
        let mut data = Box::new([0u8; BLOCKSIZE]);
        self.disk.read_sector(num, &mut data)?;
        let slot = self.block_index.insert(bucket);
        self.blocks[slot] = Some(BlockEntry {
            num,
            dirty: false,
            data,
        });
        Ok(slot)
    }

    fn evict_block_tail(&mut self) -> Result<(), FsError> {
        let slot = self.block_index.tail();
        let entry = self.blocks[slot].take().expect("occupied tail");
        if entry.dirty {
            trace!(block = entry.num, "evicting dirty block");
            self.disk.write_sector(entry.num, &entry.data)?;
        }
        self.block_index.remove(slot);
        Ok(())
    }

    fn inode_slot(&mut self, inum: Inum) -> Result<usize, FsError> {
        if inum.0 <= 0 || inum.as_i32() > self.header.num_inodes {
            return Err(FsError::ArgumentInvalid("inode number out of range"));
        }
        let bucket = inum.0 as usize % INODE_CACHESIZE;
        let inodes = &self.inodes;
        if let Some(slot) = self
            .inode_index
            .find(bucket, |slot| inodes[slot].as_ref().is_some_and(|e| e.inum == inum))
        {
            self.inode_index.touch(slot);
            return Ok(slot);
        }

        if self.inode_index.is_full() {
            self.evict_inode_tail()?;
        }
        let block = self.block(inode_block(inum))?;
        let offset = inode_offset(inum);
        let inode = Inode::decode(&mut &block[offset..]);
        let slot = self.inode_index.insert(bucket);
        self.inodes[slot] = Some(InodeEntry {
            inum,
            dirty: false,
            inode,
        });
        Ok(slot)
    }

    fn evict_inode_tail(&mut self) -> Result<(), FsError> {
        let slot = self.inode_index.tail();
        let entry = self.inodes[slot].take().expect("occupied tail");
        if entry.dirty {
            trace!(inum = %entry.inum, "evicting dirty inode");
            self.write_back_inode(entry.inum, &entry.inode)?;
        }
        self.inode_index.remove(slot);
        Ok(())
    }

    fn write_back_inode(&mut self, inum: Inum, inode: &Inode) -> Result<(), FsError> {
        let offset = inode_offset(inum);
        let block = self.block_mut(inode_block(inum))?;
        let mut slice = &mut block[offset..offset + crate::layout::INODESIZE];
        inode.encode(&mut slice);
        Ok(())
    }
}
