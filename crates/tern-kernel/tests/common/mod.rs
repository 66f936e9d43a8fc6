//! A deterministic simulated machine for driving the kernel under test.

use std::collections::{HashMap, VecDeque};

use tern_kernel::machine::{Machine, ProgramImage};
use tern_kernel::{
    BootConfig, ExceptionInfo, Kernel, KernelError, PageTable, SyscallCode, Trap, NUM_TERMINALS,
    PAGESHIFT, PAGESIZE, VMEM_1_BASE,
};

/// Physical memory given to test kernels: 32 MiB, enough for the
/// direct-mapped kernel image plus plenty of user frames.
pub const PMEM_SIZE: usize = 32 * 1024 * 1024;

/// Opaque execution context; the simulation only counts switches.
#[derive(Clone, Debug, Default)]
pub struct SimContext;

/// Simulated hardware: physical frames as byte arrays, recorded register
/// writes, a program store, and scripted terminal I/O.
pub struct SimMachine {
    frames: Vec<Vec<u8>>,
    pub region0_base: usize,
    pub flushes: Vec<usize>,
    pub switches: u64,
    programs: HashMap<Vec<u8>, ProgramImage>,
    pub transmitted: Vec<(usize, Vec<u8>)>,
    pending_input: [VecDeque<Vec<u8>>; NUM_TERMINALS],
}

impl SimMachine {
    pub fn new() -> Self {
        let mut machine = SimMachine {
            frames: vec![vec![0u8; PAGESIZE]; PMEM_SIZE / PAGESIZE],
            region0_base: 0,
            flushes: Vec::new(),
            switches: 0,
            programs: HashMap::new(),
            transmitted: Vec::new(),
            pending_input: std::array::from_fn(|_| VecDeque::new()),
        };
        // Every test kernel needs an idle program and a default init.
        machine.add_program("idle", ProgramImage::default());
        machine.add_program(
            "init",
            ProgramImage {
                text: vec![0x90; 64],
                data: vec![1, 2, 3, 4],
                bss_size: 32,
                entry: tern_kernel::MEM_INVALID_SIZE,
            },
        );
        machine
    }

    pub fn add_program(&mut self, name: &str, image: ProgramImage) {
        self.programs.insert(name.as_bytes().to_vec(), image);
    }

    /// Queue a line for the terminal hardware to deliver with the next
    /// tty-receive trap.
    pub fn queue_input(&mut self, terminal: usize, line: &[u8]) {
        self.pending_input[terminal].push_back(line.to_vec());
    }

    fn translate(&self, table: &PageTable, vaddr: usize) -> Result<(usize, usize), KernelError> {
        let vpn = vaddr >> PAGESHIFT;
        if vpn >= table.len() {
            return Err(KernelError::BadAddress(vaddr));
        }
        let pte = table[vpn];
        if !pte.valid {
            return Err(KernelError::BadAddress(vaddr));
        }
        Ok((pte.pfn as usize, vaddr % PAGESIZE))
    }
}

impl Machine for SimMachine {
    type Context = SimContext;

    fn switch_context(&mut self, _save: &mut SimContext, _restore: &SimContext) {
        self.switches += 1;
    }

    fn install_region0(&mut self, table_addr: usize) {
        self.region0_base = table_addr;
    }

    fn flush_page(&mut self, vaddr: usize) {
        self.flushes.push(vaddr);
    }

    fn read_frame(&self, pfn: u32, buf: &mut [u8]) {
        buf.copy_from_slice(&self.frames[pfn as usize][..buf.len()]);
    }

    fn write_frame(&mut self, pfn: u32, buf: &[u8]) {
        self.frames[pfn as usize][..buf.len()].copy_from_slice(buf);
    }

    fn read_user(
        &self,
        table: &PageTable,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        let mut pos = 0;
        while pos < buf.len() {
            let (pfn, offset) = self.translate(table, vaddr + pos)?;
            let take = (PAGESIZE - offset).min(buf.len() - pos);
            buf[pos..pos + take].copy_from_slice(&self.frames[pfn][offset..offset + take]);
            pos += take;
        }
        Ok(())
    }

    fn write_user(
        &mut self,
        table: &PageTable,
        vaddr: usize,
        buf: &[u8],
    ) -> Result<(), KernelError> {
        let mut pos = 0;
        while pos < buf.len() {
            let (pfn, offset) = self.translate(table, vaddr + pos)?;
            let take = (PAGESIZE - offset).min(buf.len() - pos);
            self.frames[pfn][offset..offset + take].copy_from_slice(&buf[pos..pos + take]);
            pos += take;
        }
        Ok(())
    }

    fn load_program(&mut self, name: &[u8]) -> Result<ProgramImage, KernelError> {
        self.programs
            .get(name)
            .cloned()
            .ok_or(KernelError::NoSuchProgram)
    }

    fn tty_transmit(&mut self, terminal: usize, data: &[u8]) {
        self.transmitted.push((terminal, data.to_vec()));
    }

    fn tty_receive(&mut self, terminal: usize, buf: &mut [u8]) -> usize {
        let line = self.pending_input[terminal]
            .pop_front()
            .expect("no input queued");
        let count = line.len().min(buf.len());
        buf[..count].copy_from_slice(&line[..count]);
        count
    }
}

/// Boot a kernel with the default programs and return it with the live
/// exception frame (which, on return, belongs to the running init).
pub fn boot_kernel() -> (Kernel<SimMachine>, ExceptionInfo) {
    boot_kernel_with(SimMachine::new())
}

pub fn boot_kernel_with(machine: SimMachine) -> (Kernel<SimMachine>, ExceptionInfo) {
    let mut kernel = Kernel::new(machine, boot_config()).unwrap();
    let mut info = ExceptionInfo::default();
    kernel.boot(&[b"init"], &mut info).unwrap();
    (kernel, info)
}

/// The boot facts every test kernel uses: a small kernel image
/// direct-mapped at the bottom of region 1.
pub fn boot_config() -> BootConfig {
    BootConfig {
        pmem_size: PMEM_SIZE,
        kernel_text_end: VMEM_1_BASE + 4 * PAGESIZE,
        orig_brk: VMEM_1_BASE + 8 * PAGESIZE,
    }
}

/// Issue a syscall from the running process by filling the live frame and
/// dispatching a kernel trap.
pub fn syscall(
    kernel: &mut Kernel<SimMachine>,
    info: &mut ExceptionInfo,
    code: SyscallCode,
    args: &[i64],
) {
    info.code = code as i32;
    for (slot, &arg) in args.iter().enumerate() {
        info.regs[slot + 1] = arg;
    }
    kernel.handle_trap(Trap::Kernel, info).unwrap();
}

/// Advance the clock by one tick.
pub fn tick(kernel: &mut Kernel<SimMachine>, info: &mut ExceptionInfo) {
    info.code = 0;
    kernel.handle_trap(Trap::Clock, info).unwrap();
}

/// A scratch address on the running process's stack, safely below the
/// argument area.
pub fn stack_scratch(info: &ExceptionInfo) -> usize {
    info.sp - 256
}
