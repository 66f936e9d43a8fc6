//! Context switching between processes.
//!
//! Five variants cover every way the CPU changes hands. Each installs the
//! next process's region-0 page table (flushing region 0 of the TLB),
//! saves the outgoing process's exception frame and execution context, and
//! restores the incoming ones. They differ only in what happens to the
//! outgoing process:
//!
//! * general: preempted, back on the ready queue
//! * fork:    region 0 copied into the child, parent back on ready
//! * exit:    page table and PCB freed
//! * wait:    parked on the blocked queue
//! * tty:     already parked on a terminal queue by the caller

use tern_core::Pid;
use tracing::trace;

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::page::PtSlot;
use crate::pcb::{ProcStatus, IDLE};
use crate::trap::ExceptionInfo;
use crate::{KernelError, PAGESIZE, PAGESHIFT, VMEM_0_LIMIT};

/// Which switch variant to perform.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SwitchKind {
    General,
    Fork,
    Exit,
    Wait,
    Tty,
}

impl<M: Machine> Kernel<M> {
    /// Switch from the active process to `next`.
    pub(crate) fn context_switch(
        &mut self,
        kind: SwitchKind,
        next: Pid,
        info: &mut ExceptionInfo,
    ) -> Result<(), KernelError> {
        let cur = self.active;
        trace!(?kind, from = %cur, to = %next, "context switch");

        if kind == SwitchKind::Fork {
            let src = self.pcb(cur).page_table;
            let dst = self.pcb(next).page_table;
            self.copy_region0(src, dst)?;
        }

        match kind {
            SwitchKind::General | SwitchKind::Fork => {
                self.pcb_mut(cur).status = ProcStatus::Ready;
                self.add_to_ready(cur);
            }
            SwitchKind::Wait => {
                self.pcb_mut(cur).status = ProcStatus::Blocked;
                if cur != IDLE {
                    self.blocked.push_back(cur);
                }
            }
            // The caller queued the current process on a terminal queue
            // (or readied it) before asking for the switch.
            SwitchKind::Tty => {}
            SwitchKind::Exit => {
                self.pcb_mut(cur).status = ProcStatus::Terminated;
            }
        }

        // Save the outgoing frame and execution context; a process being
        // destroyed has nothing left to save.
        if kind != SwitchKind::Exit {
            self.pcb_mut(cur).frame = info.clone();
            let mut saved = std::mem::take(&mut self.pcb_mut(cur).ctx);
            let next_ctx = self.pcb(next).ctx.clone();
            self.machine.switch_context(&mut saved, &next_ctx);
            self.pcb_mut(cur).ctx = saved;
            if kind == SwitchKind::Fork {
                // The child resumes from the parent's just-saved context.
                let parent_ctx = self.pcb(cur).ctx.clone();
                self.pcb_mut(next).ctx = parent_ctx;
            }
        } else {
            let mut discarded = std::mem::take(&mut self.pcb_mut(cur).ctx);
            let next_ctx = self.pcb(next).ctx.clone();
            self.machine.switch_context(&mut discarded, &next_ctx);
        }

        self.install_active_table(next);
        self.active = next;
        {
            let pcb = self.pcb_mut(next);
            pcb.status = ProcStatus::Running;
            *info = pcb.frame.clone();
        }
        self.ready.retain(|&p| p != next);

        if kind == SwitchKind::Exit {
            self.destroy_process(cur);
        }
        Ok(())
    }

    /// Copy every valid region-0 page of `src` into `dst`, one page at a
    /// time through a kernel scratch buffer, allocating destination frames
    /// for pages the destination has not already mapped (its kernel stack
    /// frames are pre-allocated and only their contents are copied).
    fn copy_region0(&mut self, src: PtSlot, dst: PtSlot) -> Result<(), KernelError> {
        let mut scratch = vec![0u8; PAGESIZE];
        for vpn in 0..(VMEM_0_LIMIT >> PAGESHIFT) {
            let src_pte = self.arena.table(src)[vpn];
            if !src_pte.valid {
                continue;
            }
            self.machine.read_frame(src_pte.pfn, &mut scratch);

            let dst_pte = self.arena.table(dst)[vpn];
            let pfn = if dst_pte.valid {
                dst_pte.pfn
            } else {
                self.frames.allocate()?
            };
            self.machine.write_frame(pfn, &scratch);
            self.arena.table_mut(dst)[vpn] = crate::page::Pte {
                valid: true,
                pfn,
                kprot: src_pte.kprot,
                uprot: src_pte.uprot,
            };
        }
        trace!("region 0 copied");
        Ok(())
    }
}
