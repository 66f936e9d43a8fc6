//! A preemptively scheduled, Unix-like micro-kernel core.
//!
//! The kernel owns physical-frame allocation, per-process region-0 page
//! tables packed two to a frame, the process table with ready and blocked
//! queues, round-robin scheduling driven by clock traps, and a trap
//! dispatcher implementing fork, exec, exit, wait, getpid, brk, delay, and
//! blocking terminal I/O. It runs against a [`Machine`]: the host-supplied
//! surface for MMU registers, context save/restore, raw frame memory, user
//! address-space copies, and program images. The bootstrap that wires a
//! concrete machine to the kernel lives with the host.
//!
//! The processor model is a single CPU: exactly one process is running at
//! any instant, and all kernel state is mutated from trap context only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

mod kernel;
pub mod machine;
mod page;
mod pcb;
mod phys;
mod switch;
mod syscall;
mod trap;
mod tty;

pub use kernel::{BootConfig, Kernel};
pub use machine::{Machine, ProgramImage};
pub use page::{PageTable, Prot, Pte};
pub use pcb::ProcStatus;
pub use trap::{
    ExceptionInfo, SyscallCode, Trap, MEMORY_FAULT_PROTECTION, MEMORY_FAULT_UNMAPPED, NUM_REGS,
};

/// Bytes per page and per physical frame.
pub const PAGESIZE: usize = 0x2000;

/// log2 of [`PAGESIZE`].
pub const PAGESHIFT: usize = 13;

/// Entries in a region page table.
pub const PAGE_TABLE_LEN: usize = 1024;

/// Bytes covered by one region.
pub const VMEM_REGION_SIZE: usize = PAGESIZE * PAGE_TABLE_LEN;

/// Bottom of region 0 (user space).
pub const VMEM_0_BASE: usize = 0;

/// Top of region 0.
pub const VMEM_0_LIMIT: usize = VMEM_0_BASE + VMEM_REGION_SIZE;

/// Bottom of region 1 (kernel space).
pub const VMEM_1_BASE: usize = VMEM_0_LIMIT;

/// Top of region 1.
pub const VMEM_1_LIMIT: usize = VMEM_1_BASE + VMEM_REGION_SIZE;

/// Unmapped pages at the bottom of the user address space.
pub const MEM_INVALID_PAGES: usize = 16;

/// Bytes of the unmapped low region.
pub const MEM_INVALID_SIZE: usize = MEM_INVALID_PAGES * PAGESIZE;

/// Pages of per-process kernel stack at the top of region 0.
pub const KERNEL_STACK_PAGES: usize = 4;

/// Top of the kernel stack region.
pub const KERNEL_STACK_LIMIT: usize = VMEM_0_LIMIT;

/// Bottom of the kernel stack region.
pub const KERNEL_STACK_BASE: usize = KERNEL_STACK_LIMIT - KERNEL_STACK_PAGES * PAGESIZE;

/// Highest address usable by the user stack.
pub const USER_STACK_LIMIT: usize = KERNEL_STACK_BASE;

/// Clock ticks a process runs before being preempted.
pub const TIME_SLICE: u32 = 2;

/// Number of terminals served by the kernel's tty subsystem.
pub const NUM_TERMINALS: usize = 4;

/// Longest line the terminal hardware delivers or accepts at once.
pub const TERMINAL_MAX_LINE: usize = 1024;

/// Sentinel returned to user code by failed syscalls.
pub const ERROR: i64 = -1;

/// Round `addr` up to the next page boundary.
pub const fn up_to_page(addr: usize) -> usize {
    (addr + PAGESIZE - 1) & !(PAGESIZE - 1)
}

/// Round `addr` down to its page boundary.
pub const fn down_to_page(addr: usize) -> usize {
    addr & !(PAGESIZE - 1)
}

/// Failures inside kernel operations.
///
/// Everything except [`KernelError::Halt`] is recoverable: syscall paths
/// convert it to the [`ERROR`] sentinel in the caller's result register.
/// `Halt` means the kernel itself cannot continue and must be propagated to
/// the host bootstrap.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum KernelError {
    /// A malformed argument from user space.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),
    /// An allocation failed.
    #[error("out of {0}")]
    ResourceExhausted(&'static str),
    /// An address was unmapped or outside the addressable range.
    #[error("bad address {0:#x}")]
    BadAddress(usize),
    /// The named program does not exist in the program store.
    #[error("no such program")]
    NoSuchProgram,
    /// Non-recoverable kernel failure; the host must halt the machine.
    #[error("kernel halt: {0}")]
    Halt(&'static str),
}
