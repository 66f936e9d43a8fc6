//! Syscall implementations: fork, exec, exit, wait, brk, delay, getpid.
//!
//! Calls that cannot complete immediately record a blocked reason, switch
//! away, and are finished later by the event that wakes them, which posts
//! the result into their saved exception frame before readying them.

use tern_core::Pid;
use tracing::{debug, info, warn};

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::pcb::{BlockedReason, IDLE};
use crate::switch::SwitchKind;
use crate::trap::ExceptionInfo;
use crate::{
    down_to_page, up_to_page, KernelError, ERROR, KERNEL_STACK_PAGES, MEM_INVALID_PAGES,
    MEM_INVALID_SIZE, PAGESHIFT, PAGESIZE, PAGE_TABLE_LEN, USER_STACK_LIMIT,
};

/// Longest string exec will read out of user memory.
const MAX_ARG_LEN: usize = PAGESIZE;

/// Most argv entries exec will accept.
const MAX_ARGS: usize = 1024;

/// How an exec attempt failed.
pub(crate) enum ExecError {
    /// The caller's address space is untouched; exec just returns an
    /// error.
    Recoverable(KernelError),
    /// Region 0 was already torn down; the process cannot continue.
    Fatal(KernelError),
}

impl<M: Machine> Kernel<M> {
    /// Duplicate the calling process. The parent's result register gets
    /// the child pid; the child resumes from the same frame with 0.
    pub(crate) fn sys_fork(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let parent = self.active;
        // One extra frame in case the child's page table needs a fresh
        // arena record; checking up front keeps a failed fork from
        // mutating anything.
        let needed = self.user_page_count(parent) + KERNEL_STACK_PAGES + 1;
        if needed > self.frames.free_count() {
            warn!(%parent, needed, "fork: not enough physical frames");
            return Err(KernelError::ResourceExhausted("physical frames"));
        }

        let child = self.create_process(Some(parent))?;
        self.pcb_mut(parent).children.push(child);

        let mut child_frame = info.clone();
        child_frame.regs[0] = 0;
        self.pcb_mut(child).frame = child_frame;
        info.regs[0] = i64::from(child.0);

        debug!(%parent, %child, "fork");
        self.context_switch(SwitchKind::Fork, child, info)
    }

    /// Replace the calling process's address space with a fresh program.
    pub(crate) fn sys_exec(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let pid = self.active;
        let name = self.read_user_string(pid, info.regs[1] as usize)?;
        let args = self.read_user_argv(pid, info.regs[2] as usize)?;

        match self.exec_into(pid, &name, &args, info) {
            Ok(()) => {
                info.regs[0] = 0;
                Ok(())
            }
            Err(ExecError::Recoverable(err)) => Err(err),
            Err(ExecError::Fatal(err)) => {
                // The old address space is gone and no new one could be
                // built; the process cannot be resumed.
                warn!(%pid, %err, "exec failed after teardown, terminating process");
                self.exit_process(ERROR, info)
            }
        }
    }

    /// Load `name` into `pid`'s region 0 and point the frame at its entry.
    pub(crate) fn exec_into(
        &mut self,
        pid: Pid,
        name: &[u8],
        args: &[Vec<u8>],
        info: &mut ExceptionInfo,
    ) -> Result<(), ExecError> {
        let image = self
            .machine
            .load_program(name)
            .map_err(ExecError::Recoverable)?;

        let text_npg = up_to_page(image.text.len()) >> PAGESHIFT;
        let data_bss_npg = up_to_page(image.data.len() + image.bss_size) >> PAGESHIFT;

        // Lay the argument vector out at the top of the stack: the strings
        // first, then a 16-byte-aligned array of {argc, argv..., NULL,
        // NULL} that the stack pointer lands on.
        let strings_len: usize = args.iter().map(|arg| arg.len() + 1).sum();
        if strings_len > 4 * PAGESIZE {
            return Err(ExecError::Recoverable(KernelError::ArgumentInvalid(
                "argument list too long",
            )));
        }
        let strings_base = USER_STACK_LIMIT - strings_len;
        let sp = (strings_base & !0xf) - (args.len() + 4) * 8;
        let stack_npg = (USER_STACK_LIMIT - down_to_page(sp)) >> PAGESHIFT;

        let total = MEM_INVALID_PAGES + text_npg + data_bss_npg + stack_npg + 1 + KERNEL_STACK_PAGES;
        if total >= PAGE_TABLE_LEN {
            return Err(ExecError::Recoverable(KernelError::ArgumentInvalid(
                "program too large for the address space",
            )));
        }
        // Counted before the old pages are freed, so a failure here leaves
        // the caller runnable.
        if text_npg + data_bss_npg + stack_npg > self.frames.free_count() {
            return Err(ExecError::Recoverable(KernelError::ResourceExhausted(
                "physical frames",
            )));
        }

        self.free_user_pages(pid);

        let text_base = MEM_INVALID_SIZE;
        let data_base = text_base + text_npg * PAGESIZE;
        let stack_base = down_to_page(sp);
        let map = |kernel: &mut Self, base: usize, pages: usize| -> Result<(), ExecError> {
            for page in 0..pages {
                let pfn = kernel.frames.allocate().map_err(ExecError::Fatal)?;
                kernel.machine.write_frame(pfn, &[0u8; PAGESIZE]);
                kernel.map_user_page(pid, base + page * PAGESIZE, pfn);
            }
            Ok(())
        };
        map(self, text_base, text_npg)?;
        map(self, data_base, data_bss_npg)?;
        map(self, stack_base, stack_npg)?;

        self.write_user_bytes(pid, text_base, &image.text)
            .map_err(ExecError::Fatal)?;
        self.write_user_bytes(pid, data_base, &image.data)
            .map_err(ExecError::Fatal)?;

        // Argument strings, then the argv array.
        let mut cursor = strings_base;
        let mut arg_addrs = Vec::with_capacity(args.len());
        for arg in args {
            arg_addrs.push(cursor);
            self.write_user_bytes(pid, cursor, arg)
                .map_err(ExecError::Fatal)?;
            self.write_user_bytes(pid, cursor + arg.len(), &[0])
                .map_err(ExecError::Fatal)?;
            cursor += arg.len() + 1;
        }
        let mut words = Vec::with_capacity(args.len() + 4);
        words.push(args.len() as u64);
        words.extend(arg_addrs.iter().map(|&addr| addr as u64));
        words.push(0);
        words.push(0);
        let mut word_bytes = Vec::with_capacity(words.len() * 8);
        for word in words {
            word_bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.write_user_bytes(pid, sp, &word_bytes)
            .map_err(ExecError::Fatal)?;

        // Final protections: text is read-execute, the rest read-write.
        {
            let slot = self.pcb(pid).page_table;
            let table = self.arena.table_mut(slot);
            for page in 0..text_npg {
                let vpn = (text_base >> PAGESHIFT) + page;
                table[vpn].kprot = crate::page::Prot::READ | crate::page::Prot::EXEC;
                table[vpn].uprot = crate::page::Prot::READ | crate::page::Prot::EXEC;
            }
        }

        {
            let pcb = self.pcb_mut(pid);
            pcb.heap_brk = data_base + data_bss_npg * PAGESIZE;
            pcb.stack_brk = stack_base;
        }
        info.pc = image.entry;
        info.sp = sp;
        info.psr = 0;
        info.regs = [0; crate::NUM_REGS];

        info!(%pid, name = %String::from_utf8_lossy(name), "program loaded");
        Ok(())
    }

    /// Terminate the active process: orphan its children, notify the
    /// parent, and switch to the next runnable process.
    pub(crate) fn exit_process(
        &mut self,
        status: i64,
        info: &mut ExceptionInfo,
    ) -> Result<(), KernelError> {
        let pid = self.active;
        if pid == IDLE {
            return Err(KernelError::Halt("idle process exited"));
        }
        debug!(%pid, status, "exit");

        let children = std::mem::take(&mut self.pcb_mut(pid).children);
        for child in children {
            if let Some(pcb) = self.procs.get_mut(&child) {
                pcb.parent = None;
            }
        }

        let parent = self.pcb(pid).parent;
        if let Some(parent) = parent.filter(|&p| p != IDLE && self.procs.contains_key(&p)) {
            self.pcb_mut(parent).children.retain(|&c| c != pid);
            self.pcb_mut(parent)
                .exit_queue
                .push_back(crate::pcb::ExitRecord { pid, status });
            self.deliver_exit(parent)?;
        }

        let next = self.next_ready();
        self.context_switch(SwitchKind::Exit, next, info)
    }

    /// If `parent` is blocked in wait, harvest the head of its exit queue
    /// into its saved frame and ready it.
    fn deliver_exit(&mut self, parent: Pid) -> Result<(), KernelError> {
        let status_ptr = match self.pcb(parent).blocked_on {
            Some(BlockedReason::Wait { status_ptr }) => status_ptr,
            _ => return Ok(()),
        };
        let record = match self.pcb_mut(parent).exit_queue.pop_front() {
            Some(record) => record,
            None => return Ok(()),
        };

        let table_slot = self.pcb(parent).page_table;
        let status_bytes = (record.status as i32).to_le_bytes();
        self.machine
            .write_user(self.arena.table(table_slot), status_ptr, &status_bytes)?;
        let pcb = self.pcb_mut(parent);
        pcb.frame.regs[0] = i64::from(record.pid.0);
        pcb.blocked_on = None;
        self.blocked.retain(|&p| p != parent);
        self.add_to_ready(parent);
        debug!(%parent, child = %record.pid, "wait satisfied");
        Ok(())
    }

    /// Harvest an exited child, blocking until one exists. Fails if the
    /// caller has no children at all.
    pub(crate) fn sys_wait(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let pid = self.active;
        let status_ptr = info.regs[1] as usize;

        let (has_children, ready_record) = {
            let pcb = self.pcb(pid);
            (
                !pcb.children.is_empty() || !pcb.exit_queue.is_empty(),
                pcb.exit_queue.front().copied(),
            )
        };
        if !has_children {
            return Err(KernelError::ArgumentInvalid("no children to wait for"));
        }

        if let Some(record) = ready_record {
            let table_slot = self.pcb(pid).page_table;
            self.machine.write_user(
                self.arena.table(table_slot),
                status_ptr,
                &(record.status as i32).to_le_bytes(),
            )?;
            self.pcb_mut(pid).exit_queue.pop_front();
            info.regs[0] = i64::from(record.pid.0);
            return Ok(());
        }

        self.pcb_mut(pid).blocked_on = Some(BlockedReason::Wait { status_ptr });
        let next = self.next_ready();
        self.context_switch(SwitchKind::Wait, next, info)
    }

    /// Move the caller's heap break.
    pub(crate) fn sys_brk(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let pid = self.active;
        self.set_user_brk(pid, info.regs[1] as usize)?;
        info.regs[0] = 0;
        Ok(())
    }

    /// Sleep for the given number of clock ticks.
    pub(crate) fn sys_delay(&mut self, info: &mut ExceptionInfo) -> Result<(), KernelError> {
        let ticks = info.regs[1];
        if ticks < 0 {
            return Err(KernelError::ArgumentInvalid("negative delay"));
        }
        if ticks == 0 {
            info.regs[0] = 0;
            return Ok(());
        }

        let pid = self.active;
        debug!(%pid, ticks, "delay");
        // The result is posted now; the clock readies the sleeper later.
        info.regs[0] = 0;
        {
            let pcb = self.pcb_mut(pid);
            pcb.delay_ticks = ticks;
            pcb.blocked_on = Some(BlockedReason::Delay);
        }
        let next = self.next_ready();
        self.context_switch(SwitchKind::Wait, next, info)
    }

    /// Read a NUL-terminated string out of `pid`'s memory.
    pub(crate) fn read_user_string(
        &self,
        pid: Pid,
        addr: usize,
    ) -> Result<Vec<u8>, KernelError> {
        let table = self.arena.table(self.pcb(pid).page_table);
        let mut out = Vec::new();
        let mut byte = [0u8];
        for offset in 0..MAX_ARG_LEN {
            self.machine.read_user(table, addr + offset, &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            out.push(byte[0]);
        }
        Err(KernelError::ArgumentInvalid("unterminated string"))
    }

    /// Read a NULL-terminated argv array of string pointers.
    fn read_user_argv(&self, pid: Pid, addr: usize) -> Result<Vec<Vec<u8>>, KernelError> {
        if addr == 0 {
            return Err(KernelError::ArgumentInvalid("argv is null"));
        }
        let mut args = Vec::new();
        for index in 0..MAX_ARGS {
            let mut word = [0u8; 8];
            {
                let table = self.arena.table(self.pcb(pid).page_table);
                self.machine.read_user(table, addr + index * 8, &mut word)?;
            }
            let ptr = u64::from_le_bytes(word) as usize;
            if ptr == 0 {
                return Ok(args);
            }
            args.push(self.read_user_string(pid, ptr)?);
        }
        Err(KernelError::ArgumentInvalid("argv too long"))
    }

    fn write_user_bytes(&mut self, pid: Pid, addr: usize, bytes: &[u8]) -> Result<(), KernelError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let slot = self.pcb(pid).page_table;
        self.machine
            .write_user(self.arena.table(slot), addr, bytes)
    }
}
