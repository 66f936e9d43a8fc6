//! Disk formatter: lay down an empty file system.

use tracing::info;

use crate::disk::Disk;
use crate::layout::{
    inode_blocks, DirEntry, FsHeader, Inode, InodeType, BLOCKSIZE, DIRENTRY_SIZE, INODESIZE,
    INODES_PER_BLOCK, NUM_DIRECT, ROOTINODE,
};
use crate::FsError;

/// Write an empty file system across `num_blocks` sectors with
/// `num_inodes` inodes: a zeroed boot sector, the header in the inode 0
/// slot, the root directory in inode 1 seeded with `.` and `..`, and every
/// other inode free.
pub fn format<D: Disk>(disk: &mut D, num_blocks: i32, num_inodes: i32) -> Result<(), FsError> {
    if num_inodes < 1 {
        return Err(FsError::ArgumentInvalid("need at least one inode"));
    }
    let table_blocks = inode_blocks(num_inodes);
    let root_block = table_blocks + 1;
    if num_blocks <= root_block {
        return Err(FsError::ArgumentInvalid("too few blocks for the inode table"));
    }

    disk.write_sector(0, &[0u8; BLOCKSIZE])?;

    let header = FsHeader {
        num_blocks,
        num_inodes,
    };
    let mut root = Inode {
        kind: InodeType::Directory,
        nlink: 2,
        reuse: 1,
        size: 2 * DIRENTRY_SIZE as i32,
        direct: [0; NUM_DIRECT],
        indirect: 0,
    };
    root.direct[0] = root_block;

    for table_block in 1..=table_blocks {
        let mut block = [0u8; BLOCKSIZE];
        for slot in 0..INODES_PER_BLOCK {
            let index = (table_block as usize - 1) * INODES_PER_BLOCK + slot;
            if index > num_inodes as usize {
                break;
            }
            let mut cursor = &mut block[slot * INODESIZE..(slot + 1) * INODESIZE];
            if index == 0 {
                header.encode(&mut cursor);
            } else if index == 1 {
                root.encode(&mut cursor);
            } else {
                Inode::free(0).encode(&mut cursor);
            }
        }
        disk.write_sector(table_block, &block)?;
    }

    let mut block = [0u8; BLOCKSIZE];
    let mut cursor = &mut block[..2 * DIRENTRY_SIZE];
    DirEntry::new(ROOTINODE, b".").encode(&mut cursor);
    DirEntry::new(ROOTINODE, b"..").encode(&mut cursor);
    disk.write_sector(root_block, &block)?;

    info!(num_blocks, num_inodes, "formatted file system");
    Ok(())
}
