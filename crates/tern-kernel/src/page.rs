//! Region page tables and the packed arena that stores them.
//!
//! A page table is half a page long, so two tables share one physical
//! frame. The arena keeps a list of records, each owning one frame mapped
//! at the top of region 1, with its two half-page slots handed out to
//! processes. The list grows by a frame when every slot is taken; a record
//! whose slots both empty out is freed again if it is the last one, giving
//! the frame and its region-1 page back.

use std::ops::{BitOr, BitOrAssign};

use tracing::{debug, trace};

use crate::machine::Machine;
use crate::phys::FrameMap;
use crate::{KernelError, PAGESHIFT, PAGESIZE, PAGE_TABLE_LEN, VMEM_1_BASE, VMEM_1_LIMIT};

/// Bytes of one page table: half a page.
pub const PAGE_TABLE_SIZE: usize = PAGESIZE / 2;

/// Page protection bits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Prot(u8);

impl Prot {
    /// No access.
    pub const NONE: Prot = Prot(0);
    /// Readable.
    pub const READ: Prot = Prot(1);
    /// Writable.
    pub const WRITE: Prot = Prot(2);
    /// Executable.
    pub const EXEC: Prot = Prot(4);

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        Prot(self.0 | rhs.0)
    }
}

impl BitOrAssign for Prot {
    fn bitor_assign(&mut self, rhs: Prot) {
        self.0 |= rhs.0;
    }
}

/// One page-table entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Pte {
    /// Whether this mapping is live.
    pub valid: bool,
    /// Physical frame backing the page.
    pub pfn: u32,
    /// Kernel-mode protection.
    pub kprot: Prot,
    /// User-mode protection.
    pub uprot: Prot,
}

/// A full region page table.
pub type PageTable = [Pte; PAGE_TABLE_LEN];

/// Handle to one allocated page table inside the arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PtSlot {
    record: usize,
    half: usize,
}

struct PtRecord {
    pfn: u32,
    halves: [Option<Box<PageTable>>; 2],
}

impl PtRecord {
    fn is_empty(&self) -> bool {
        self.halves.iter().all(|half| half.is_none())
    }
}

/// The page-table arena. Record `i` occupies the region-1 virtual page
/// `VMEM_1_LIMIT - (i + 1) * PAGESIZE`; half 0 is the upper half of the
/// page.
pub(crate) struct PtArena {
    records: Vec<PtRecord>,
}

impl PtArena {
    /// Set up the arena with its first record, which lives for the whole
    /// run. The caller maps the record's page in the kernel page table.
    pub(crate) fn new(frames: &mut FrameMap) -> Result<(Self, MappedRecord), KernelError> {
        let pfn = frames.allocate()?;
        let arena = PtArena {
            records: vec![PtRecord {
                pfn,
                halves: [None, None],
            }],
        };
        debug!(pfn, "page table arena initialized");
        Ok((arena, MappedRecord { index: 0, pfn }))
    }

    /// Region-1 virtual address of record `index`'s page.
    pub(crate) fn record_vaddr(index: usize) -> usize {
        VMEM_1_LIMIT - (index + 1) * PAGESIZE
    }

    /// Physical address of the table in `slot`, for the MMU base register.
    pub(crate) fn table_addr(&self, slot: PtSlot) -> usize {
        let base = self.records[slot.record].pfn as usize * PAGESIZE;
        if slot.half == 0 {
            base + PAGE_TABLE_SIZE
        } else {
            base
        }
    }

    pub(crate) fn table(&self, slot: PtSlot) -> &PageTable {
        self.records[slot.record].halves[slot.half]
            .as_deref()
            .expect("page table slot is allocated")
    }

    pub(crate) fn table_mut(&mut self, slot: PtSlot) -> &mut PageTable {
        self.records[slot.record].halves[slot.half]
            .as_deref_mut()
            .expect("page table slot is allocated")
    }

    /// Allocate a page table in the first free half-page slot, growing the
    /// record list by one frame when none is free. Returns the slot and,
    /// when a record was added, its mapping for the kernel page table.
    pub(crate) fn create(
        &mut self,
        frames: &mut FrameMap,
    ) -> Result<(PtSlot, Option<MappedRecord>), KernelError> {
        for (index, record) in self.records.iter_mut().enumerate() {
            for half in 0..2 {
                if record.halves[half].is_none() {
                    record.halves[half] = Some(Box::new([Pte::default(); PAGE_TABLE_LEN]));
                    trace!(record = index, half, "page table created in existing record");
                    return Ok((PtSlot { record: index, half }, None));
                }
            }
        }

        let pfn = frames.allocate()?;
        let index = self.records.len();
        let mut record = PtRecord {
            pfn,
            halves: [None, None],
        };
        record.halves[0] = Some(Box::new([Pte::default(); PAGE_TABLE_LEN]));
        self.records.push(record);
        debug!(record = index, pfn, "page table arena grew by a record");
        Ok((
            PtSlot { record: index, half: 0 },
            Some(MappedRecord { index, pfn }),
        ))
    }

    /// Release a page table. When this empties the final record (and it is
    /// not the permanent first one), the record's frame is freed and its
    /// region-1 page must be unmapped by the caller.
    pub(crate) fn destroy(
        &mut self,
        frames: &mut FrameMap,
        slot: PtSlot,
    ) -> Option<UnmappedRecord> {
        self.records[slot.record].halves[slot.half] = None;

        let last = self.records.len() - 1;
        if last > 0 && slot.record == last && self.records[last].is_empty() {
            let record = self.records.pop().expect("non-empty record list");
            frames.free(record.pfn);
            trace!(record = last, "page table arena shrank by a record");
            return Some(UnmappedRecord { index: last });
        }
        None
    }
}

/// A freshly mapped arena record: the caller installs `vaddr() -> pfn` in
/// the kernel page table.
pub(crate) struct MappedRecord {
    pub(crate) index: usize,
    pub(crate) pfn: u32,
}

impl MappedRecord {
    pub(crate) fn vaddr(&self) -> usize {
        PtArena::record_vaddr(self.index)
    }

    pub(crate) fn vpn(&self) -> usize {
        (self.vaddr() - VMEM_1_BASE) >> PAGESHIFT
    }
}

/// A released arena record: the caller invalidates its kernel page-table
/// entry and flushes the TLB for the page.
pub(crate) struct UnmappedRecord {
    pub(crate) index: usize,
}

impl UnmappedRecord {
    pub(crate) fn vaddr(&self) -> usize {
        PtArena::record_vaddr(self.index)
    }

    pub(crate) fn vpn(&self) -> usize {
        (self.vaddr() - VMEM_1_BASE) >> PAGESHIFT
    }
}

/// Flush hook shared by arena callers: unmap a released record page.
pub(crate) fn unmap_record<M: Machine>(
    machine: &mut M,
    kernel_pt: &mut PageTable,
    unmapped: UnmappedRecord,
) {
    kernel_pt[unmapped.vpn()].valid = false;
    machine.flush_page(unmapped.vaddr());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_pack_two_tables_per_frame() {
        let mut frames = FrameMap::new(16);
        let (mut arena, first) = PtArena::new(&mut frames).unwrap();
        assert_eq!(first.index, 0);

        let (a, grew) = arena.create(&mut frames).unwrap();
        assert!(grew.is_none());
        let (b, grew) = arena.create(&mut frames).unwrap();
        assert!(grew.is_none());
        // Third table needs a second record and a second frame.
        let (c, grew) = arena.create(&mut frames).unwrap();
        assert!(grew.is_some());

        assert_ne!(arena.table_addr(a), arena.table_addr(b));
        assert_eq!(arena.table_addr(a) / PAGESIZE, arena.table_addr(b) / PAGESIZE);
        assert_ne!(arena.table_addr(a) / PAGESIZE, arena.table_addr(c) / PAGESIZE);
    }

    #[test]
    fn tail_record_is_freed_when_empty() {
        let mut frames = FrameMap::new(16);
        let (mut arena, _) = PtArena::new(&mut frames).unwrap();
        let (_a, _) = arena.create(&mut frames).unwrap();
        let (_b, _) = arena.create(&mut frames).unwrap();
        let (c, grew) = arena.create(&mut frames).unwrap();
        let grew = grew.unwrap();
        let free_before = frames.free_count();

        let unmapped = arena.destroy(&mut frames, c).unwrap();
        assert_eq!(unmapped.index, grew.index);
        assert_eq!(frames.free_count(), free_before + 1);

        // The permanent first record is never released, and its freed
        // slots are reused before the arena grows again.
        assert!(arena.destroy(&mut frames, _a).is_none());
        assert!(arena.destroy(&mut frames, _b).is_none());
        let (reused, grew) = arena.create(&mut frames).unwrap();
        assert_eq!(reused.record, 0);
        assert!(grew.is_none());
    }

    #[test]
    fn prot_bit_operations() {
        let rw = Prot::READ | Prot::WRITE;
        assert!(rw.contains(Prot::READ));
        assert!(rw.contains(Prot::WRITE));
        assert!(!rw.contains(Prot::EXEC));
        assert!(rw.contains(Prot::NONE));
    }
}
