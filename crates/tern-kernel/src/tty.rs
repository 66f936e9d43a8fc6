//! The kernel's terminal subsystem.
//!
//! Each terminal owns a FIFO of received lines, queues of processes
//! blocked reading and writing, and a transmit-busy flag. Reads block
//! until a line arrives; writes block while the transmitter is busy. The
//! tty-receive trap hands the new line to the first blocked reader, and
//! the tty-transmit trap starts the first blocked writer's transfer.

use std::collections::VecDeque;

use tern_core::Pid;
use tracing::{debug, warn};

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::pcb::{BlockedReason, ProcStatus, IDLE};
use crate::switch::SwitchKind;
use crate::trap::ExceptionInfo;
use crate::{KernelError, ERROR, NUM_TERMINALS, TERMINAL_MAX_LINE};

/// Kernel-side state of one terminal.
#[derive(Debug, Default)]
pub(crate) struct Terminal {
    /// Complete input lines not yet consumed, oldest first.
    pub(crate) lines: VecDeque<Vec<u8>>,
    /// Processes blocked waiting for input.
    pub(crate) read_queue: VecDeque<Pid>,
    /// Processes blocked waiting for the transmitter.
    pub(crate) write_queue: VecDeque<Pid>,
    /// Whether a transmit is in flight.
    pub(crate) transmit_busy: bool,
}

impl<M: Machine> Kernel<M> {
    /// Read up to `len` bytes of the next input line. Blocks when no line
    /// is pending.
    pub(crate) fn sys_tty_read(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let terminal = check_terminal(info.regs[1])?;
        let buf = info.regs[2] as usize;
        let len = info.regs[3];
        if len < 0 || buf == 0 {
            return Err(KernelError::ArgumentInvalid("bad buffer"));
        }
        if len == 0 {
            info.regs[0] = 0;
            return Ok(());
        }
        let len = len as usize;
        let pid = self.active;

        if let Some(line) = self.terminals[terminal].lines.pop_front() {
            let count = self.copy_line_to(pid, buf, len, line, terminal)?;
            info.regs[0] = count as i64;
            return Ok(());
        }

        debug!(%pid, terminal, "tty read blocks: no line pending");
        {
            let pcb = self.pcb_mut(pid);
            pcb.status = ProcStatus::Blocked;
            pcb.blocked_on = Some(BlockedReason::TtyRead { terminal, buf, len });
        }
        self.terminals[terminal].read_queue.push_back(pid);
        let next = self.next_ready();
        self.context_switch(SwitchKind::Tty, next, info)
    }

    /// Write `len` bytes to a terminal. Blocks while the transmitter is
    /// busy with another write.
    pub(crate) fn sys_tty_write(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let terminal = check_terminal(info.regs[1])?;
        let buf = info.regs[2] as usize;
        let len = info.regs[3];
        if len <= 0 || buf == 0 {
            return Err(KernelError::ArgumentInvalid("bad buffer"));
        }
        if len as usize > TERMINAL_MAX_LINE {
            return Err(KernelError::ArgumentInvalid("write exceeds line limit"));
        }
        let len = len as usize;
        let pid = self.active;

        if self.terminals[terminal].transmit_busy {
            debug!(%pid, terminal, "tty write blocks: transmitter busy");
            {
                let pcb = self.pcb_mut(pid);
                pcb.status = ProcStatus::Blocked;
                pcb.blocked_on = Some(BlockedReason::TtyWrite { terminal, buf, len });
            }
            self.terminals[terminal].write_queue.push_back(pid);
            let next = self.next_ready();
            return self.context_switch(SwitchKind::Tty, next, info);
        }

        self.start_transmit(pid, terminal, buf, len)?;
        info.regs[0] = len as i64;
        Ok(())
    }

    /// Tty-receive trap: collect the hardware's line, then satisfy the
    /// first blocked reader if there is one.
    pub(crate) fn trap_tty_receive(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let terminal = match check_terminal(i64::from(info.code)) {
            Ok(terminal) => terminal,
            Err(_) => {
                warn!(code = info.code, "tty receive for bad terminal");
                return Ok(());
            }
        };

        let mut buf = vec![0u8; TERMINAL_MAX_LINE];
        let count = self.machine.tty_receive(terminal, &mut buf);
        buf.truncate(count);
        debug!(terminal, count, "line received");
        self.terminals[terminal].lines.push_back(buf);

        let waiter = match self.terminals[terminal].read_queue.pop_front() {
            Some(waiter) => waiter,
            None => return Ok(()),
        };
        let (wbuf, wlen) = match self.pcb(waiter).blocked_on {
            Some(BlockedReason::TtyRead { buf, len, .. }) => (buf, len),
            _ => (0, 0),
        };
        let line = self.terminals[terminal]
            .lines
            .pop_front()
            .expect("line just queued");
        let count = match self.copy_line_to(waiter, wbuf, wlen, line, terminal) {
            Ok(count) => count as i64,
            Err(_) => ERROR,
        };
        {
            let pcb = self.pcb_mut(waiter);
            pcb.frame.regs[0] = count;
            pcb.blocked_on = None;
        }

        // The interrupted process goes back on the ready queue; the reader
        // takes the CPU.
        let cur = self.active;
        if cur != IDLE {
            self.add_to_ready(cur);
        } else {
            self.pcb_mut(cur).status = ProcStatus::Ready;
        }
        self.context_switch(SwitchKind::Tty, waiter, info)
    }

    /// Tty-transmit trap: the transmitter is idle again; start the first
    /// blocked writer and reschedule.
    pub(crate) fn trap_tty_transmit(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let terminal = match check_terminal(i64::from(info.code)) {
            Ok(terminal) => terminal,
            Err(_) => {
                warn!(code = info.code, "tty transmit for bad terminal");
                return Ok(());
            }
        };
        self.terminals[terminal].transmit_busy = false;
        debug!(terminal, "transmit complete");

        if let Some(waiter) = self.terminals[terminal].write_queue.pop_front() {
            let (wbuf, wlen) = match self.pcb(waiter).blocked_on {
                Some(BlockedReason::TtyWrite { buf, len, .. }) => (buf, len),
                _ => (0, 0),
            };
            let result = match self.start_transmit(waiter, terminal, wbuf, wlen) {
                Ok(()) => wlen as i64,
                Err(_) => ERROR,
            };
            let pcb = self.pcb_mut(waiter);
            pcb.frame.regs[0] = result;
            pcb.blocked_on = None;
            self.add_to_ready(waiter);
        }

        let next = self.next_ready();
        if next != self.active {
            return self.context_switch(SwitchKind::General, next, info);
        }
        Ok(())
    }

    /// Copy a line into a process's buffer. A line longer than the buffer
    /// is split, with the tail requeued at the front for the next read.
    fn copy_line_to(
        &mut self,
        pid: Pid,
        buf: usize,
        len: usize,
        line: Vec<u8>,
        terminal: usize,
    ) -> Result<usize, KernelError> {
        let count = len.min(line.len());
        let slot = self.pcb(pid).page_table;
        self.machine
            .write_user(self.arena.table(slot), buf, &line[..count])?;
        if count < line.len() {
            self.terminals[terminal]
                .lines
                .push_front(line[count..].to_vec());
        }
        Ok(count)
    }

    /// Read the writer's bytes and hand them to the hardware, marking the
    /// transmitter busy until the completion trap.
    fn start_transmit(
        &mut self,
        pid: Pid,
        terminal: usize,
        buf: usize,
        len: usize,
    ) -> Result<(), KernelError> {
        let mut data = vec![0u8; len];
        let slot = self.pcb(pid).page_table;
        self.machine
            .read_user(self.arena.table(slot), buf, &mut data)?;
        self.terminals[terminal].transmit_busy = true;
        self.machine.tty_transmit(terminal, &data);
        Ok(())
    }
}

fn check_terminal(raw: i64) -> Result<usize, KernelError> {
    if raw < 0 || raw as usize >= NUM_TERMINALS {
        return Err(KernelError::ArgumentInvalid("terminal out of range"));
    }
    Ok(raw as usize)
}
