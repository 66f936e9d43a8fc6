//! On-disk data layout: the file system header, inodes, and directory
//! entries, with their exact byte encodings.
//!
//! Block 0 is the boot sector. Inodes start in block 1, packed
//! [`INODES_PER_BLOCK`] to a block; inode 0 overlaps the header and inode 1
//! is the root directory. All remaining blocks hold file data, directory
//! entries, or indirect block-number arrays.

use bytes::{Buf, BufMut};
use tern_core::Inum;

/// Size in bytes of a disk block (and sector).
pub const BLOCKSIZE: usize = 512;

/// Size in bytes of an on-disk inode.
pub const INODESIZE: usize = 64;

/// Number of direct block pointers in an inode.
pub const NUM_DIRECT: usize = 12;

/// Maximum length of a directory entry name. Names shorter than this are
/// NUL-terminated on disk; names of exactly this length are not.
pub const DIRNAMELEN: usize = 30;

/// Inodes stored in one block.
pub const INODES_PER_BLOCK: usize = BLOCKSIZE / INODESIZE;

/// Size in bytes of an on-disk directory entry.
pub const DIRENTRY_SIZE: usize = 32;

/// Directory entries stored in one block.
pub const DIRENTRY_PER_BLOCK: usize = BLOCKSIZE / DIRENTRY_SIZE;

/// Block numbers stored in an indirect block.
pub const PTRS_PER_BLOCK: usize = BLOCKSIZE / 4;

/// Inode number of the root directory.
pub const ROOTINODE: Inum = Inum(1);

/// Largest file representable with the direct and indirect maps.
pub const MAX_FILE_SIZE: usize = NUM_DIRECT * BLOCKSIZE + PTRS_PER_BLOCK * BLOCKSIZE;

/// Entries in the block cache (and buckets in its hash table).
pub const BLOCK_CACHESIZE: usize = 64;

/// Entries in the inode cache (and buckets in its hash table).
pub const INODE_CACHESIZE: usize = 64;

/// The block holding inode `inum`.
pub fn inode_block(inum: Inum) -> i32 {
    inum.as_i32() / INODES_PER_BLOCK as i32 + 1
}

/// Byte offset of inode `inum` within its block.
pub fn inode_offset(inum: Inum) -> usize {
    (inum.0 as usize % INODES_PER_BLOCK) * INODESIZE
}

/// Number of blocks holding inodes, including the header inode.
pub fn inode_blocks(num_inodes: i32) -> i32 {
    let slots = num_inodes + 1;
    (slots + INODES_PER_BLOCK as i32 - 1) / INODES_PER_BLOCK as i32
}

/// What an inode describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i16)]
pub enum InodeType {
    /// Unallocated.
    Free = 0,
    /// A directory of [`DirEntry`] records.
    Directory = 1,
    /// A regular file.
    Regular = 2,
    /// A symbolic link; the target path lives in `direct[0]`.
    Symlink = 3,
}

impl InodeType {
    /// Decode the on-disk (and wire) type code.
    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => InodeType::Free,
            1 => InodeType::Directory,
            2 => InodeType::Regular,
            3 => InodeType::Symlink,
            _ => return None,
        })
    }
}

/// An on-disk inode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inode {
    /// What this inode describes; `Free` inodes are available for
    /// allocation.
    pub kind: InodeType,
    /// Number of directory entries referring to this inode.
    pub nlink: i16,
    /// Incremented on every (re)allocation so stale handles can be
    /// detected.
    pub reuse: i32,
    /// File size in bytes.
    pub size: i32,
    /// First-tier data block numbers; 0 marks an unused slot.
    pub direct: [i32; NUM_DIRECT],
    /// Second-tier block holding an array of data block numbers, or 0.
    pub indirect: i32,
}

impl Inode {
    /// A free inode carrying forward the given reuse count.
    pub fn free(reuse: i32) -> Self {
        Inode {
            kind: InodeType::Free,
            nlink: 0,
            reuse,
            size: 0,
            direct: [0; NUM_DIRECT],
            indirect: 0,
        }
    }

    /// Reset this inode for a fresh allocation of the given type,
    /// incrementing its reuse count.
    pub fn reallocate(&mut self, kind: InodeType, nlink: i16) {
        self.kind = kind;
        self.nlink = nlink;
        self.size = 0;
        self.reuse += 1;
        self.direct = [0; NUM_DIRECT];
        self.indirect = 0;
    }

    /// Serialize into exactly [`INODESIZE`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i16_le(self.kind as i16);
        buf.put_i16_le(self.nlink);
        buf.put_i32_le(self.reuse);
        buf.put_i32_le(self.size);
        for block in self.direct {
            buf.put_i32_le(block);
        }
        buf.put_i32_le(self.indirect);
    }

    /// Deserialize from exactly [`INODESIZE`] bytes. Unknown type codes
    /// decode as free inodes, which a consistency scan then ignores.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let kind = InodeType::from_code(buf.get_i16_le()).unwrap_or(InodeType::Free);
        let nlink = buf.get_i16_le();
        let reuse = buf.get_i32_le();
        let size = buf.get_i32_le();
        let mut direct = [0; NUM_DIRECT];
        for slot in direct.iter_mut() {
            *slot = buf.get_i32_le();
        }
        let indirect = buf.get_i32_le();
        Inode {
            kind,
            nlink,
            reuse,
            size,
            direct,
            indirect,
        }
    }
}

/// The file system header, stored in the inode 0 slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FsHeader {
    /// Total blocks on the disk, including the boot sector.
    pub num_blocks: i32,
    /// Total allocatable inodes, not counting the header slot.
    pub num_inodes: i32,
}

impl FsHeader {
    /// Serialize into the inode 0 slot, padding to [`INODESIZE`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.num_blocks);
        buf.put_i32_le(self.num_inodes);
        buf.put_bytes(0, INODESIZE - 8);
    }

    /// Deserialize from the inode 0 slot.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let num_blocks = buf.get_i32_le();
        let num_inodes = buf.get_i32_le();
        FsHeader {
            num_blocks,
            num_inodes,
        }
    }
}

/// One directory entry: an inode number and a name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Referenced inode; [`Inum::FREE`] marks a free entry.
    pub inum: Inum,
    /// Entry name, zero-padded but not necessarily NUL-terminated.
    pub name: [u8; DIRNAMELEN],
}

impl DirEntry {
    /// Build an entry for `name`, which must fit in [`DIRNAMELEN`] bytes.
    pub fn new(inum: Inum, name: &[u8]) -> Self {
        debug_assert!(name.len() <= DIRNAMELEN);
        let mut padded = [0u8; DIRNAMELEN];
        padded[..name.len()].copy_from_slice(name);
        DirEntry { inum, name: padded }
    }

    /// A free entry.
    pub fn empty() -> Self {
        DirEntry {
            inum: Inum::FREE,
            name: [0; DIRNAMELEN],
        }
    }

    /// The stored name, up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIRNAMELEN);
        &self.name[..len]
    }

    /// Strict comparison against a path component: lengths must match
    /// exactly, then bytes.
    pub fn name_matches(&self, component: &[u8]) -> bool {
        self.name_bytes() == component
    }

    /// Serialize into exactly [`DIRENTRY_SIZE`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i16_le(self.inum.0);
        buf.put_slice(&self.name);
    }

    /// Deserialize from exactly [`DIRENTRY_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Self {
        let inum = Inum(buf.get_i16_le());
        let mut name = [0u8; DIRNAMELEN];
        buf.copy_to_slice(&mut name);
        DirEntry { inum, name }
    }
}
