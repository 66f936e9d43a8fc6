//! The kernel engine: all mutable kernel state, threaded through every
//! trap entry point.

use std::collections::{HashMap, VecDeque};

use tern_core::Pid;
use tracing::{debug, info, trace};

use crate::machine::Machine;
use crate::page::{unmap_record, PtArena, Prot, Pte};
use crate::pcb::{Pcb, ProcStatus, IDLE};
use crate::phys::FrameMap;
use crate::trap::ExceptionInfo;
use crate::tty::Terminal;
use crate::{
    up_to_page, KernelError, KERNEL_STACK_BASE, KERNEL_STACK_LIMIT, MEM_INVALID_PAGES,
    MEM_INVALID_SIZE, NUM_TERMINALS, PAGESHIFT, PAGESIZE, PAGE_TABLE_LEN, TIME_SLICE, VMEM_1_BASE,
    VMEM_1_LIMIT,
};

/// Boot-time facts about the loaded kernel, provided by the bootstrap.
#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
    /// Bytes of physical memory.
    pub pmem_size: usize,
    /// First address past the kernel's text, for page protections.
    pub kernel_text_end: usize,
    /// Initial kernel break (end of loaded data + bss).
    pub orig_brk: usize,
}

/// The kernel. One instance owns every piece of kernel state; the host
/// bootstrap constructs it, boots it, and then feeds it traps.
pub struct Kernel<M: Machine> {
    pub(crate) machine: M,
    pub(crate) frames: FrameMap,
    pub(crate) kernel_pt: Box<crate::page::PageTable>,
    pub(crate) kernel_brk: usize,
    pub(crate) vm_enabled: bool,
    pub(crate) arena: PtArena,
    pub(crate) procs: HashMap<Pid, Pcb<M::Context>>,
    pub(crate) active: Pid,
    pub(crate) next_pid: i32,
    pub(crate) ready: VecDeque<Pid>,
    pub(crate) blocked: VecDeque<Pid>,
    pub(crate) clock_ticks: u64,
    pub(crate) terminals: [Terminal; NUM_TERMINALS],
}

impl<M: Machine> Kernel<M> {
    /// Set up kernel memory: the frame map with the kernel's own frames
    /// reserved, the kernel page table, and the page-table arena.
    pub fn new(machine: M, boot: BootConfig) -> Result<Self, KernelError> {
        let num_frames = boot.pmem_size / PAGESIZE;
        info!(num_frames, "initializing physical memory");
        let mut frames = FrameMap::new(num_frames);

        // Memory already in use by the loaded kernel: text, data, heap up
        // to the break, and the boot kernel stack.
        let kernel_brk = up_to_page(boot.orig_brk);
        for pfn in (VMEM_1_BASE >> PAGESHIFT)..(kernel_brk >> PAGESHIFT) {
            frames.reserve(pfn as u32);
        }
        for pfn in (KERNEL_STACK_BASE >> PAGESHIFT)..(KERNEL_STACK_LIMIT >> PAGESHIFT) {
            frames.reserve(pfn as u32);
        }

        // Region 1 is direct-mapped: text read-execute, data and heap
        // read-write.
        let mut kernel_pt = Box::new([Pte::default(); PAGE_TABLE_LEN]);
        let text_pages = (up_to_page(boot.kernel_text_end) - VMEM_1_BASE) >> PAGESHIFT;
        let mapped_pages = (kernel_brk - VMEM_1_BASE) >> PAGESHIFT;
        for vpn in 0..mapped_pages {
            kernel_pt[vpn] = Pte {
                valid: true,
                pfn: ((VMEM_1_BASE >> PAGESHIFT) + vpn) as u32,
                kprot: if vpn < text_pages {
                    Prot::READ | Prot::EXEC
                } else {
                    Prot::READ | Prot::WRITE
                },
                uprot: Prot::NONE,
            };
        }

        let (arena, first_record) = PtArena::new(&mut frames)?;
        kernel_pt[first_record.vpn()] = Pte {
            valid: true,
            pfn: first_record.pfn,
            kprot: Prot::READ | Prot::WRITE,
            uprot: Prot::NONE,
        };

        Ok(Kernel {
            machine,
            frames,
            kernel_pt,
            kernel_brk,
            vm_enabled: false,
            arena,
            procs: HashMap::new(),
            active: IDLE,
            next_pid: 0,
            ready: VecDeque::new(),
            blocked: VecDeque::new(),
            clock_ticks: 0,
            terminals: std::array::from_fn(|_| Terminal::default()),
        })
    }

    /// Bring the system up: create and load the idle process, enable
    /// virtual memory, then fork the init process and load its program.
    /// On return, init is running and `info` carries its entry state.
    pub fn boot(&mut self, init_args: &[&[u8]], info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let idle = self.create_process(None)?;
        debug_assert_eq!(idle, IDLE);
        self.install_active_table(idle);
        self.vm_enabled = true;
        self.active = idle;
        self.pcb_mut(idle).status = ProcStatus::Running;

        self.exec_into(idle, b"idle", &[b"idle".to_vec()], info)
            .map_err(|_| KernelError::Halt("cannot load the idle program"))?;
        info!("idle process loaded");

        let init = self.create_process(Some(idle))?;
        self.pcb_mut(idle).children.push(init);
        self.pcb_mut(init).frame = info.clone();
        self.context_switch(crate::switch::SwitchKind::Fork, init, info)?;

        let (name, args) = match init_args {
            [] => (b"init".to_vec(), vec![b"init".to_vec()]),
            [name, ..] => (name.to_vec(), init_args.iter().map(|a| a.to_vec()).collect()),
        };
        self.exec_into(init, &name, &args, info)
            .map_err(|_| KernelError::Halt("cannot load the init program"))?;
        info!(pid = %init, "init process loaded");
        Ok(())
    }

    /// The running process.
    pub fn active(&self) -> Pid {
        self.active
    }

    /// Clock ticks since boot.
    pub fn clock_ticks(&self) -> u64 {
        self.clock_ticks
    }

    /// Scheduling status of a process, if it still exists.
    pub fn status_of(&self, pid: Pid) -> Option<ProcStatus> {
        self.procs.get(&pid).map(|pcb| pcb.status)
    }

    /// Free physical frames remaining.
    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    /// The host machine.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Copy bytes out of a process's memory, for host-side services that
    /// act on behalf of a process.
    pub fn copy_from_user(
        &self,
        pid: Pid,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let pcb = self
            .procs
            .get(&pid)
            .ok_or(KernelError::ArgumentInvalid("no such process"))?;
        self.machine
            .read_user(self.arena.table(pcb.page_table), addr, buf)
    }

    /// Copy bytes into a process's memory.
    pub fn copy_to_user(&mut self, pid: Pid, addr: usize, buf: &[u8]) -> Result<(), KernelError> {
        let slot = self
            .procs
            .get(&pid)
            .ok_or(KernelError::ArgumentInvalid("no such process"))?
            .page_table;
        self.machine.write_user(self.arena.table(slot), addr, buf)
    }

    /// Mutable access to the host machine, for delivering simulated
    /// hardware events.
    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    /// Move the kernel break, allocating or releasing frames and editing
    /// the kernel page table when virtual memory is on; before that, only
    /// the break pointer moves.
    pub fn set_kernel_brk(&mut self, addr: usize) -> Result<(), KernelError> {
        let new_brk = up_to_page(addr);
        if new_brk >= VMEM_1_LIMIT {
            return Err(KernelError::ArgumentInvalid("kernel break beyond region 1"));
        }
        if !self.vm_enabled {
            self.kernel_brk = new_brk;
            return Ok(());
        }

        if new_brk > self.kernel_brk {
            let needed = (new_brk - self.kernel_brk) / PAGESIZE;
            if needed > self.frames.free_count() {
                return Err(KernelError::ResourceExhausted("physical frames"));
            }
            for vaddr in (self.kernel_brk..new_brk).step_by(PAGESIZE) {
                let pfn = self.frames.allocate()?;
                let vpn = (vaddr - VMEM_1_BASE) >> PAGESHIFT;
                self.kernel_pt[vpn] = Pte {
                    valid: true,
                    pfn,
                    kprot: Prot::READ | Prot::WRITE,
                    uprot: Prot::NONE,
                };
                self.machine.write_frame(pfn, &[0u8; PAGESIZE]);
            }
        } else {
            for vaddr in (new_brk..self.kernel_brk).step_by(PAGESIZE) {
                let vpn = (vaddr - VMEM_1_BASE) >> PAGESHIFT;
                if self.kernel_pt[vpn].valid {
                    self.frames.free(self.kernel_pt[vpn].pfn);
                    self.kernel_pt[vpn].valid = false;
                    self.machine.flush_page(vaddr);
                }
            }
        }
        self.kernel_brk = new_brk;
        trace!(kernel_brk = self.kernel_brk, "kernel break moved");
        Ok(())
    }

    pub(crate) fn pcb(&self, pid: Pid) -> &Pcb<M::Context> {
        self.procs.get(&pid).expect("process exists")
    }

    pub(crate) fn pcb_mut(&mut self, pid: Pid) -> &mut Pcb<M::Context> {
        self.procs.get_mut(&pid).expect("process exists")
    }

    /// Allocate a PCB and its page table. The idle process's kernel stack
    /// keeps the boot frames it already occupies; every other process gets
    /// fresh frames for its kernel stack.
    pub(crate) fn create_process(&mut self, parent: Option<Pid>) -> Result<Pid, KernelError> {
        let pid = Pid(self.next_pid);
        let (slot, grew) = self.arena.create(&mut self.frames)?;
        if let Some(record) = grew {
            self.kernel_pt[record.vpn()] = Pte {
                valid: true,
                pfn: record.pfn,
                kprot: Prot::READ | Prot::WRITE,
                uprot: Prot::NONE,
            };
        }

        let stack_vpns = (KERNEL_STACK_BASE >> PAGESHIFT)..(KERNEL_STACK_LIMIT >> PAGESHIFT);
        for vpn in stack_vpns {
            let pfn = if pid == IDLE {
                vpn as u32
            } else {
                self.frames.allocate()?
            };
            self.arena.table_mut(slot)[vpn] = Pte {
                valid: true,
                pfn,
                kprot: Prot::READ | Prot::WRITE,
                uprot: Prot::NONE,
            };
        }

        let mut pcb = Pcb::new(pid, parent, slot);
        if let Some(parent) = parent {
            pcb.heap_brk = self.pcb(parent).heap_brk;
            pcb.stack_brk = self.pcb(parent).stack_brk;
        }
        self.procs.insert(pid, pcb);
        self.next_pid += 1;
        debug!(%pid, "process created");
        Ok(pid)
    }

    /// Free a process's frames, page table, and PCB.
    pub(crate) fn destroy_process(&mut self, pid: Pid) {
        let pcb = self.procs.remove(&pid).expect("process exists");
        let boot_stack_base = (KERNEL_STACK_BASE >> PAGESHIFT) as u32;
        for pte in self.arena.table(pcb.page_table).iter() {
            // The identity-mapped boot kernel stack frames stay reserved.
            if pte.valid && pte.pfn < boot_stack_base {
                self.frames.free(pte.pfn);
            }
        }
        if let Some(unmapped) = self.arena.destroy(&mut self.frames, pcb.page_table) {
            unmap_record(&mut self.machine, &mut self.kernel_pt, unmapped);
        }
        self.ready.retain(|&p| p != pid);
        self.blocked.retain(|&p| p != pid);
        debug!(%pid, "process destroyed");
    }

    /// Append a process to the ready queue with a fresh time slice. The
    /// idle process never queues.
    pub(crate) fn add_to_ready(&mut self, pid: Pid) {
        if pid == IDLE || self.ready.contains(&pid) {
            return;
        }
        let pcb = self.pcb_mut(pid);
        pcb.status = ProcStatus::Ready;
        pcb.time_slice = TIME_SLICE;
        pcb.delay_ticks = 0;
        self.ready.push_back(pid);
    }

    /// The process to run next: the head of the ready queue, or idle.
    pub(crate) fn next_ready(&self) -> Pid {
        self.ready.front().copied().unwrap_or(IDLE)
    }

    /// Point the MMU at a process's page table (and flush region 0).
    pub(crate) fn install_active_table(&mut self, pid: Pid) {
        let addr = self.arena.table_addr(self.pcb(pid).page_table);
        self.machine.install_region0(addr);
    }

    /// Valid user pages of a process, kernel stack excluded.
    pub(crate) fn user_page_count(&self, pid: Pid) -> usize {
        let table = self.arena.table(self.pcb(pid).page_table);
        table[MEM_INVALID_PAGES..KERNEL_STACK_BASE >> PAGESHIFT]
            .iter()
            .filter(|pte| pte.valid)
            .count()
    }

    /// Install one user page mapping with read-write protections.
    pub(crate) fn map_user_page(&mut self, pid: Pid, vaddr: usize, pfn: u32) {
        let slot = self.pcb(pid).page_table;
        self.arena.table_mut(slot)[vaddr >> PAGESHIFT] = Pte {
            valid: true,
            pfn,
            kprot: Prot::READ | Prot::WRITE,
            uprot: Prot::READ | Prot::WRITE,
        };
    }

    /// Release every user page of a process, leaving the kernel stack.
    pub(crate) fn free_user_pages(&mut self, pid: Pid) {
        let slot = self.pcb(pid).page_table;
        for vpn in MEM_INVALID_PAGES..(KERNEL_STACK_BASE >> PAGESHIFT) {
            let pte = self.arena.table(slot)[vpn];
            if pte.valid {
                self.frames.free(pte.pfn);
                self.arena.table_mut(slot)[vpn].valid = false;
            }
        }
    }

    /// Move the user heap break with a one-page red zone below the stack.
    pub(crate) fn set_user_brk(&mut self, pid: Pid, addr: usize) -> Result<(), KernelError> {
        if addr < MEM_INVALID_SIZE {
            return Err(KernelError::ArgumentInvalid("break below the invalid region"));
        }
        let new_brk = up_to_page(addr);
        let (old_brk, stack_brk) = {
            let pcb = self.pcb(pid);
            (pcb.heap_brk, pcb.stack_brk)
        };
        if new_brk + PAGESIZE > stack_brk {
            return Err(KernelError::ArgumentInvalid("break would cross the red zone"));
        }

        if new_brk > old_brk {
            let needed = (new_brk - old_brk) / PAGESIZE;
            if needed > self.frames.free_count() {
                return Err(KernelError::ResourceExhausted("physical frames"));
            }
            for vaddr in (old_brk..new_brk).step_by(PAGESIZE) {
                let pfn = self.frames.allocate()?;
                self.map_user_page(pid, vaddr, pfn);
                self.machine.flush_page(vaddr);
            }
        } else {
            let slot = self.pcb(pid).page_table;
            for vaddr in (new_brk..old_brk).step_by(PAGESIZE) {
                let vpn = vaddr >> PAGESHIFT;
                if self.arena.table(slot)[vpn].valid {
                    self.frames.free(self.arena.table(slot)[vpn].pfn);
                    self.arena.table_mut(slot)[vpn].valid = false;
                    self.machine.flush_page(vaddr);
                }
            }
        }
        self.pcb_mut(pid).heap_brk = new_brk;
        trace!(%pid, heap_brk = new_brk, "user break moved");
        Ok(())
    }
}
