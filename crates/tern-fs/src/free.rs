//! Free-inode and free-block accounting.
//!
//! Both maps are rebuilt at server startup by scanning every inode: a block
//! is in use iff it is the boot sector, holds inodes, or is referenced by a
//! live inode's direct slots, indirect slot, or indirect block contents. An
//! inode is free iff its type is `Free`.

use tern_core::Inum;
use tracing::debug;

use crate::cache::Cache;
use crate::dir::indirect_entry;
use crate::disk::Disk;
use crate::layout::{inode_blocks, InodeType, BLOCKSIZE, NUM_DIRECT};
use crate::FsError;

/// Allocation state for every block and inode on the disk.
pub struct FreeLists {
    blocks: Vec<bool>,
    inodes: Vec<bool>,
}

impl FreeLists {
    /// Build the maps by scanning all inodes through the cache.
    pub fn scan<D: Disk>(cache: &mut Cache<D>) -> Result<Self, FsError> {
        let header = cache.header();
        let mut blocks = vec![true; header.num_blocks as usize];
        let mut inodes = vec![false; header.num_inodes as usize + 1];

        // Boot sector and the blocks holding the inode table.
        blocks[0] = false;
        for block in 1..=inode_blocks(header.num_inodes) {
            blocks[block as usize] = false;
        }

        for raw in 1..=header.num_inodes {
            let inum = Inum(raw as i16);
            let inode = *cache.inode(inum)?;
            if inode.kind == InodeType::Free {
                inodes[raw as usize] = true;
                continue;
            }

            let mut mark = |block: i32| {
                if block > 0 && (block as usize) < blocks.len() {
                    blocks[block as usize] = false;
                }
            };

            let mut index = 0;
            while index < NUM_DIRECT && index * BLOCKSIZE < inode.size as usize {
                mark(inode.direct[index]);
                index += 1;
            }

            if inode.indirect != 0 {
                mark(inode.indirect);
                let last = (inode.size as usize + BLOCKSIZE - 1) / BLOCKSIZE;
                while index < last {
                    let block = indirect_entry(cache, inode.indirect, index - NUM_DIRECT)?;
                    mark(block);
                    index += 1;
                }
            }
        }

        let lists = FreeLists { blocks, inodes };
        debug!(
            free_blocks = lists.free_block_count(),
            free_inodes = lists.free_inode_count(),
            "free lists built"
        );
        Ok(lists)
    }

    /// Free blocks remaining.
    pub fn free_block_count(&self) -> usize {
        self.blocks.iter().filter(|&&free| free).count()
    }

    /// Free inodes remaining.
    pub fn free_inode_count(&self) -> usize {
        self.inodes.iter().filter(|&&free| free).count()
    }

    /// Allocate the lowest-numbered free block and zero it through the
    /// cache.
    pub fn allocate_block<D: Disk>(&mut self, cache: &mut Cache<D>) -> Result<i32, FsError> {
        let num = self
            .blocks
            .iter()
            .skip(1)
            .position(|&free| free)
            .map(|i| (i + 1) as i32)
            .ok_or(FsError::ResourceExhausted("disk blocks"))?;
        self.blocks[num as usize] = false;
        cache.block_mut(num)?.fill(0);
        Ok(num)
    }

    /// Return a block to the free map.
    pub fn release_block(&mut self, num: i32) {
        if num > 0 && (num as usize) < self.blocks.len() {
            self.blocks[num as usize] = true;
        }
    }

    /// Allocate the lowest-numbered free inode. The caller reinitializes
    /// the inode itself (and bumps its reuse count) through the cache.
    pub fn allocate_inode(&mut self) -> Result<Inum, FsError> {
        let num = self
            .inodes
            .iter()
            .skip(1)
            .position(|&free| free)
            .map(|i| i + 1)
            .ok_or(FsError::ResourceExhausted("inodes"))?;
        self.inodes[num] = false;
        Ok(Inum(num as i16))
    }

    /// Return an inode to the free map.
    pub fn release_inode(&mut self, inum: Inum) {
        if inum.0 > 0 && (inum.0 as usize) < self.inodes.len() {
            self.inodes[inum.0 as usize] = true;
        }
    }

    /// Attach one more data block to `inum`: the first free direct slot,
    /// else a slot in the indirect block, allocating the indirect block
    /// itself on first use.
    pub fn allocate_block_in_inode<D: Disk>(
        &mut self,
        cache: &mut Cache<D>,
        inum: Inum,
    ) -> Result<(), FsError> {
        let inode = *cache.inode(inum)?;
        for (slot, &block) in inode.direct.iter().enumerate() {
            if block == 0 {
                let num = self.allocate_block(cache)?;
                cache.inode_mut(inum)?.direct[slot] = num;
                return Ok(());
            }
        }

        let indirect = if inode.indirect == 0 {
            let num = self.allocate_block(cache)?;
            cache.inode_mut(inum)?.indirect = num;
            num
        } else {
            inode.indirect
        };

        let slots = BLOCKSIZE / 4;
        for slot in 0..slots {
            if indirect_entry(cache, indirect, slot)? == 0 {
                let num = self.allocate_block(cache)?;
                let block = cache.block_mut(indirect)?;
                let offset = slot * 4;
                block[offset..offset + 4].copy_from_slice(&num.to_le_bytes());
                return Ok(());
            }
        }
        Err(FsError::ResourceExhausted("file block slots"))
    }
}
