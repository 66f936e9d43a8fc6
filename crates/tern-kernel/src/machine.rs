//! The host platform surface the kernel runs against.

use crate::page::PageTable;
use crate::KernelError;

/// An executable image as produced by the host's program loader.
///
/// The on-disk format and its parsing are the host's concern; the kernel
/// only sizes and populates the address space from the pieces.
#[derive(Clone, Debug, Default)]
pub struct ProgramImage {
    /// Machine code, loaded read-execute at the bottom of user memory.
    pub text: Vec<u8>,
    /// Initialized data, loaded read-write directly above the text.
    pub data: Vec<u8>,
    /// Bytes of zero-initialized data following the initialized data.
    pub bss_size: usize,
    /// Entry point address.
    pub entry: usize,
}

/// Hardware and loader services supplied by the host.
///
/// The kernel is generic over this trait so that a deterministic simulated
/// machine can stand in for real hardware under test. Methods mirror the
/// privileged register and memory operations of the platform: page-table
/// base installation with TLB flushes, context save/restore, raw frame
/// access for the scratch-page copy, and copies in and out of a process's
/// address space through an explicit page table.
pub trait Machine {
    /// Opaque processor execution state, captured and resumed by
    /// [`Machine::switch_context`]. Only the host interprets it.
    type Context: Clone + Default;

    /// Capture the running context into `save` and resume `restore`.
    fn switch_context(&mut self, save: &mut Self::Context, restore: &Self::Context);

    /// Point the MMU's region-0 base register at the page table stored at
    /// physical address `table_addr` and flush region 0 of the TLB.
    fn install_region0(&mut self, table_addr: usize);

    /// Invalidate the TLB entry for one virtual address.
    fn flush_page(&mut self, vaddr: usize);

    /// Read physical frame `pfn` into `buf`.
    fn read_frame(&self, pfn: u32, buf: &mut [u8]);

    /// Overwrite physical frame `pfn` with `buf`.
    fn write_frame(&mut self, pfn: u32, buf: &[u8]);

    /// Copy bytes out of a process's region-0 memory through `table`.
    fn read_user(
        &self,
        table: &PageTable,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<(), KernelError>;

    /// Copy bytes into a process's region-0 memory through `table`.
    fn write_user(
        &mut self,
        table: &PageTable,
        vaddr: usize,
        buf: &[u8],
    ) -> Result<(), KernelError>;

    /// Fetch the executable image for `name` from the program store.
    fn load_program(&mut self, name: &[u8]) -> Result<ProgramImage, KernelError>;

    /// Start transmitting `data` on a terminal. The hardware raises a
    /// tty-transmit trap when the write completes.
    fn tty_transmit(&mut self, terminal: usize, data: &[u8]);

    /// Collect the line the terminal hardware has buffered, up to
    /// [`TERMINAL_MAX_LINE`](crate::TERMINAL_MAX_LINE) bytes. Called from
    /// the tty-receive trap.
    fn tty_receive(&mut self, terminal: usize, buf: &mut [u8]) -> usize;
}
