//! Trap dispatch: the kernel's single entry point from the hardware.

use tracing::{debug, warn};

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::pcb::{BlockedReason, IDLE};
use crate::switch::SwitchKind;
use crate::{
    down_to_page, KernelError, ERROR, PAGESIZE, TIME_SLICE, USER_STACK_LIMIT,
};

/// General-purpose registers carried in the exception frame.
pub const NUM_REGS: usize = 8;

/// Memory-fault code: the address has no mapping. Only this kind is a
/// candidate for automatic stack growth.
pub const MEMORY_FAULT_UNMAPPED: i32 = 0;

/// Memory-fault code: the access violated page protection.
pub const MEMORY_FAULT_PROTECTION: i32 = 1;

/// The exception frame passed to every trap: the faulting state of the
/// interrupted process, mutated in place to resume it. Syscall arguments
/// arrive in `regs[1..]` and the result is returned in `regs[0]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExceptionInfo {
    /// Trap-specific code: the syscall number, the fault kind, or the
    /// interrupting terminal.
    pub code: i32,
    /// Faulting address for memory traps.
    pub addr: usize,
    /// Program counter to resume at.
    pub pc: usize,
    /// Stack pointer to resume with.
    pub sp: usize,
    /// Processor status word.
    pub psr: u32,
    /// General-purpose registers.
    pub regs: [i64; NUM_REGS],
}

/// The seven trap kinds delivered through the vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trap {
    /// Syscall, decoded further by the frame's code field.
    Kernel,
    /// Periodic clock interrupt.
    Clock,
    /// Illegal instruction.
    Illegal,
    /// Memory access fault.
    Memory,
    /// Arithmetic fault.
    Math,
    /// A terminal has a complete input line.
    TtyReceive,
    /// A terminal finished transmitting.
    TtyTransmit,
}

/// Syscall numbers carried in the exception frame's code field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyscallCode {
    /// Duplicate the calling process.
    Fork = 1,
    /// Replace the calling process's program.
    Exec = 2,
    /// Terminate the calling process.
    Exit = 3,
    /// Harvest an exited child.
    Wait = 4,
    /// The caller's process id.
    GetPid = 5,
    /// Move the heap break.
    Brk = 6,
    /// Sleep for a number of clock ticks.
    Delay = 7,
    /// Read a line from a terminal.
    TtyRead = 8,
    /// Write bytes to a terminal.
    TtyWrite = 9,
}

impl SyscallCode {
    /// Decode the sub-code from the exception frame.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => SyscallCode::Fork,
            2 => SyscallCode::Exec,
            3 => SyscallCode::Exit,
            4 => SyscallCode::Wait,
            5 => SyscallCode::GetPid,
            6 => SyscallCode::Brk,
            7 => SyscallCode::Delay,
            8 => SyscallCode::TtyRead,
            9 => SyscallCode::TtyWrite,
            _ => return None,
        })
    }
}

impl<M: Machine> Kernel<M> {
    /// Dispatch one trap. Returns an error only for non-recoverable
    /// conditions ([`KernelError::Halt`]); everything else is reported to
    /// the interrupted process through its result register or by
    /// terminating it.
    pub fn handle_trap(&mut self, trap: Trap, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        match trap {
            Trap::Kernel => self.trap_kernel(info),
            Trap::Clock => self.trap_clock(info),
            Trap::Illegal => {
                warn!(pid = %self.active(), code = info.code, "illegal instruction, terminating");
                self.exit_process(ERROR, info)
            }
            Trap::Math => {
                warn!(pid = %self.active(), code = info.code, "arithmetic fault, terminating");
                self.exit_process(ERROR, info)
            }
            Trap::Memory => self.trap_memory(info),
            Trap::TtyReceive => self.trap_tty_receive(info),
            Trap::TtyTransmit => self.trap_tty_transmit(info),
        }
    }

    fn trap_kernel(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let code = SyscallCode::from_code(info.code);
        debug!(pid = %self.active(), ?code, "syscall");
        let result = match code {
            Some(SyscallCode::Fork) => self.sys_fork(info),
            Some(SyscallCode::Exec) => self.sys_exec(info),
            Some(SyscallCode::Exit) => return self.exit_process(info.regs[1], info),
            Some(SyscallCode::Wait) => self.sys_wait(info),
            Some(SyscallCode::GetPid) => {
                info.regs[0] = i64::from(self.active().0);
                Ok(())
            }
            Some(SyscallCode::Brk) => self.sys_brk(info),
            Some(SyscallCode::Delay) => self.sys_delay(info),
            Some(SyscallCode::TtyRead) => self.sys_tty_read(info),
            Some(SyscallCode::TtyWrite) => self.sys_tty_write(info),
            None => {
                warn!(code = info.code, "unknown syscall");
                info.regs[0] = ERROR;
                Ok(())
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(err @ KernelError::Halt(_)) => Err(err),
            Err(err) => {
                debug!(%err, "syscall failed");
                info.regs[0] = ERROR;
                Ok(())
            }
        }
    }

    /// Clock tick: run down delays, then round-robin the CPU.
    fn trap_clock(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        self.clock_ticks += 1;

        // Walk a snapshot: waking a sleeper edits the blocked queue.
        let blocked: Vec<_> = self.blocked.iter().copied().collect();
        for pid in blocked {
            let pcb = self.pcb_mut(pid);
            if pcb.blocked_on != Some(BlockedReason::Delay) {
                continue;
            }
            pcb.delay_ticks -= 1;
            if pcb.delay_ticks == 0 {
                debug!(%pid, "delay complete");
                pcb.blocked_on = None;
                self.blocked.retain(|&p| p != pid);
                self.add_to_ready(pid);
            }
        }

        if self.active() == IDLE {
            if let Some(&next) = self.ready.front() {
                return self.context_switch(SwitchKind::General, next, info);
            }
            return Ok(());
        }

        let active = self.active();
        let pcb = self.pcb_mut(active);
        pcb.time_slice -= 1;
        if pcb.time_slice == 0 {
            let next = self.next_ready();
            if next == IDLE {
                // Nothing else is runnable; keep going on a fresh slice.
                self.pcb_mut(active).time_slice = TIME_SLICE;
                return Ok(());
            }
            debug!(from = %active, to = %next, "time slice expired");
            return self.context_switch(SwitchKind::General, next, info);
        }
        Ok(())
    }

    /// Memory fault: grow the stack when the fault lands in the growth
    /// window, terminate the process otherwise.
    fn trap_memory(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let addr = info.addr;
        let pid = self.active();

        if info.code != MEMORY_FAULT_UNMAPPED {
            warn!(%pid, addr, code = info.code, "protection fault, terminating");
            return self.exit_process(ERROR, info);
        }

        let (stack_brk, heap_brk) = {
            let pcb = self.pcb(pid);
            (pcb.stack_brk, pcb.heap_brk)
        };

        // The growth window: below the stack limit, below the current
        // stack break, and leaving a one-page red zone above the heap.
        if addr >= USER_STACK_LIMIT
            || addr >= stack_brk
            || down_to_page(addr) < heap_brk + PAGESIZE
        {
            warn!(%pid, addr, "memory fault outside stack growth window, terminating");
            return self.exit_process(ERROR, info);
        }

        match self.expand_stack(addr) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%pid, addr, %err, "stack expansion failed, terminating");
                self.exit_process(ERROR, info)
            }
        }
    }

    /// Map every page from the faulting address up to the current stack
    /// break.
    fn expand_stack(&mut self, addr: usize) -> Result<(), KernelError> {
        let pid = self.active();
        let page_addr = down_to_page(addr);
        let stack_brk = self.pcb(pid).stack_brk;

        let needed = (stack_brk - page_addr) / PAGESIZE;
        if needed > self.frames.free_count() {
            return Err(KernelError::ResourceExhausted("physical frames"));
        }

        for vaddr in (page_addr..stack_brk).step_by(PAGESIZE) {
            let pfn = self.frames.allocate()?;
            self.map_user_page(pid, vaddr, pfn);
            self.machine.flush_page(vaddr);
        }
        self.pcb_mut(pid).stack_brk = page_addr;
        debug!(%pid, stack_brk = page_addr, "stack expanded");
        Ok(())
    }
}
