//! Directory entry storage: walking, lookup, insertion, and removal.
//!
//! A directory is a file of fixed-size [`DirEntry`] records, addressed by
//! logical index; index [`NUM_DIRECT`] × entries-per-block onward crosses
//! from the direct blocks into the indirect block.

use tern_core::Inum;

use crate::cache::Cache;
use crate::disk::Disk;
use crate::free::FreeLists;
use crate::layout::{DirEntry, Inode, BLOCKSIZE, DIRENTRY_PER_BLOCK, DIRENTRY_SIZE, DIRNAMELEN, NUM_DIRECT};
use crate::FsError;

/// Read one block-number slot out of an indirect block.
pub fn indirect_entry<D: Disk>(
    cache: &mut Cache<D>,
    indirect_block: i32,
    index: usize,
) -> Result<i32, FsError> {
    if indirect_block == 0 {
        return Err(FsError::ArgumentInvalid("no indirect block"));
    }
    let block = cache.block(indirect_block)?;
    let offset = index * 4;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[offset..offset + 4]);
    Ok(i32::from_le_bytes(raw))
}

/// The data block holding logical block `index` of a file.
pub fn data_block_number<D: Disk>(
    cache: &mut Cache<D>,
    inode: &Inode,
    index: usize,
) -> Result<i32, FsError> {
    let num = if index < NUM_DIRECT {
        inode.direct[index]
    } else {
        indirect_entry(cache, inode.indirect, index - NUM_DIRECT)?
    };
    if num == 0 {
        return Err(FsError::ArgumentInvalid("unmapped file block"));
    }
    Ok(num)
}

/// Number of entry slots in a directory, free ones included.
pub fn entry_count(dir: &Inode) -> usize {
    dir.size as usize / DIRENTRY_SIZE
}

/// Read the directory entry at logical index `index`.
pub fn read_entry<D: Disk>(
    cache: &mut Cache<D>,
    dir: &Inode,
    index: usize,
) -> Result<DirEntry, FsError> {
    let block_num = data_block_number(cache, dir, index / DIRENTRY_PER_BLOCK)?;
    let block = cache.block(block_num)?;
    let offset = (index % DIRENTRY_PER_BLOCK) * DIRENTRY_SIZE;
    Ok(DirEntry::decode(&mut &block[offset..offset + DIRENTRY_SIZE]))
}

/// Overwrite the directory entry at logical index `index`.
pub fn write_entry<D: Disk>(
    cache: &mut Cache<D>,
    dir: &Inode,
    index: usize,
    entry: &DirEntry,
) -> Result<(), FsError> {
    let block_num = data_block_number(cache, dir, index / DIRENTRY_PER_BLOCK)?;
    let block = cache.block_mut(block_num)?;
    let offset = (index % DIRENTRY_PER_BLOCK) * DIRENTRY_SIZE;
    let mut slice = &mut block[offset..offset + DIRENTRY_SIZE];
    entry.encode(&mut slice);
    Ok(())
}

/// Look `name` up in the directory `dir_inum`. Returns the entry's inode
/// number, or `None` when absent.
pub fn find_entry<D: Disk>(
    cache: &mut Cache<D>,
    dir_inum: Inum,
    name: &[u8],
) -> Result<Option<Inum>, FsError> {
    let dir = *cache.inode(dir_inum)?;
    if dir.kind != crate::layout::InodeType::Directory {
        return Err(FsError::NotDirectory);
    }
    for index in 0..entry_count(&dir) {
        let entry = read_entry(cache, &dir, index)?;
        if entry.inum != Inum::FREE && entry.name_matches(name) {
            return Ok(Some(entry.inum));
        }
    }
    Ok(None)
}

/// Add an entry mapping `name` to `inum` in the directory `parent`,
/// reusing a free slot when one exists and extending the directory by one
/// entry otherwise.
pub fn add_entry<D: Disk>(
    cache: &mut Cache<D>,
    free: &mut FreeLists,
    parent: Inum,
    name: &[u8],
    inum: Inum,
) -> Result<(), FsError> {
    if name.len() > DIRNAMELEN {
        return Err(FsError::ArgumentInvalid("name exceeds DIRNAMELEN"));
    }

    let dir = *cache.inode(parent)?;
    let count = entry_count(&dir);
    for index in 0..count {
        let entry = read_entry(cache, &dir, index)?;
        if entry.inum == Inum::FREE {
            write_entry(cache, &dir, index, &DirEntry::new(inum, name))?;
            cache.inode_mut(parent)?;
            return Ok(());
        }
    }

    // No free slot: grow by one entry, allocating a block when the old size
    // sat on a block boundary.
    if dir.size as usize % BLOCKSIZE == 0 {
        free.allocate_block_in_inode(cache, parent)?;
    }
    cache.inode_mut(parent)?.size += DIRENTRY_SIZE as i32;
    let dir = *cache.inode(parent)?;
    write_entry(cache, &dir, count, &DirEntry::new(inum, name))
}

/// Remove the entry for `name` (which must reference `inum`) from the
/// directory `parent` by marking it free.
pub fn remove_entry<D: Disk>(
    cache: &mut Cache<D>,
    parent: Inum,
    name: &[u8],
    inum: Inum,
) -> Result<(), FsError> {
    let dir = *cache.inode(parent)?;
    if dir.kind != crate::layout::InodeType::Directory {
        return Err(FsError::NotDirectory);
    }
    for index in 0..entry_count(&dir) {
        let entry = read_entry(cache, &dir, index)?;
        if entry.inum == inum && entry.name_matches(name) {
            write_entry(cache, &dir, index, &DirEntry::empty())?;
            cache.inode_mut(parent)?;
            return Ok(());
        }
    }
    Err(FsError::NotFound)
}
