//! Process control blocks.

use std::collections::VecDeque;

use tern_core::Pid;

use crate::page::PtSlot;
use crate::trap::ExceptionInfo;
use crate::{MEM_INVALID_SIZE, TIME_SLICE, USER_STACK_LIMIT};

/// The idle process, which runs only when the ready queue is empty and
/// never sits on it.
pub(crate) const IDLE: Pid = Pid(0);

/// Scheduling state of a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcStatus {
    /// Runnable, waiting on the ready queue.
    Ready,
    /// The one process currently executing.
    Running,
    /// Waiting for an event.
    Blocked,
    /// Exited, awaiting harvest by the parent.
    Terminated,
}

/// Why a blocked process is blocked, with what it needs at wakeup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BlockedReason {
    /// Sleeping until the delay tick count runs out.
    Delay,
    /// Waiting for a child to exit; the status goes to `status_ptr`.
    Wait {
        status_ptr: usize,
    },
    /// Waiting for a line on a terminal.
    TtyRead {
        terminal: usize,
        buf: usize,
        len: usize,
    },
    /// Waiting for a terminal transmitter to go idle.
    TtyWrite {
        terminal: usize,
        buf: usize,
        len: usize,
    },
}

/// Exit notification queued on the parent until it calls wait.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExitRecord {
    pub(crate) pid: Pid,
    pub(crate) status: i64,
}

/// Per-process kernel state. `C` is the host's opaque execution context.
pub(crate) struct Pcb<C> {
    pub(crate) pid: Pid,
    pub(crate) parent: Option<Pid>,
    /// Live (unexited) children.
    pub(crate) children: Vec<Pid>,
    /// Exited children not yet harvested, oldest first.
    pub(crate) exit_queue: VecDeque<ExitRecord>,
    pub(crate) status: ProcStatus,
    pub(crate) blocked_on: Option<BlockedReason>,
    /// Host execution context, captured at the last switch away.
    pub(crate) ctx: C,
    /// User exception frame, captured at the last switch away. Results of
    /// a blocking syscall are posted here before the process is readied.
    pub(crate) frame: ExceptionInfo,
    pub(crate) page_table: PtSlot,
    pub(crate) heap_brk: usize,
    pub(crate) stack_brk: usize,
    pub(crate) time_slice: u32,
    pub(crate) delay_ticks: i64,
}

impl<C: Default> Pcb<C> {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>, page_table: PtSlot) -> Self {
        Pcb {
            pid,
            parent,
            children: Vec::new(),
            exit_queue: VecDeque::new(),
            status: ProcStatus::Ready,
            blocked_on: None,
            ctx: C::default(),
            frame: ExceptionInfo::default(),
            page_table,
            heap_brk: MEM_INVALID_SIZE,
            stack_brk: USER_STACK_LIMIT,
            time_slice: TIME_SLICE,
            delay_ticks: 0,
        }
    }
}
