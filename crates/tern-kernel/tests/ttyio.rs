//! The kernel terminal subsystem: blocking reads and writes, line
//! splitting, and the interrupt paths.

use tern_core::Pid;
use tern_kernel::{ProcStatus, SyscallCode, Trap, ERROR, TERMINAL_MAX_LINE};

use crate::common::{boot_kernel, stack_scratch, syscall, tick};

pub mod common;

fn deliver_receive(kernel: &mut tern_kernel::Kernel<common::SimMachine>, info: &mut tern_kernel::ExceptionInfo, terminal: usize, line: &[u8]) {
    kernel.machine_mut().queue_input(terminal, line);
    info.code = terminal as i32;
    kernel.handle_trap(Trap::TtyReceive, info).unwrap();
}

fn deliver_transmit(kernel: &mut tern_kernel::Kernel<common::SimMachine>, info: &mut tern_kernel::ExceptionInfo, terminal: usize) {
    info.code = terminal as i32;
    kernel.handle_trap(Trap::TtyTransmit, info).unwrap();
}

#[test]
fn write_hands_bytes_to_the_hardware() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();

    let buf = stack_scratch(&info);
    kernel.copy_to_user(init, buf, b"hello\n").unwrap();
    syscall(&mut kernel, &mut info, SyscallCode::TtyWrite, &[1, buf as i64, 6]);

    assert_eq!(info.regs[0], 6);
    assert_eq!(
        kernel.machine().transmitted,
        vec![(1, b"hello\n".to_vec())]
    );
}

#[test]
fn second_writer_blocks_until_transmit_completes() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();

    let buf = stack_scratch(&info);
    kernel.copy_to_user(init, buf, b"first").unwrap();
    syscall(&mut kernel, &mut info, SyscallCode::TtyWrite, &[0, buf as i64, 5]);

    // The transmitter is still busy; the next write parks the process.
    kernel.copy_to_user(init, buf, b"again").unwrap();
    syscall(&mut kernel, &mut info, SyscallCode::TtyWrite, &[0, buf as i64, 5]);
    assert_eq!(kernel.active(), Pid(0));
    assert_eq!(kernel.status_of(init), Some(ProcStatus::Blocked));

    // Completion starts the parked write and readies the writer.
    deliver_transmit(&mut kernel, &mut info, 0);
    assert_eq!(kernel.active(), init);
    assert_eq!(info.regs[0], 5);
    assert_eq!(kernel.machine().transmitted.len(), 2);
    assert_eq!(kernel.machine().transmitted[1], (0, b"again".to_vec()));
}

#[test]
fn read_returns_a_pending_line_immediately() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();

    deliver_receive(&mut kernel, &mut info, 2, b"line\n");
    assert_eq!(kernel.active(), init);

    let buf = stack_scratch(&info);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[2, buf as i64, 16]);
    assert_eq!(info.regs[0], 5);
    let mut out = [0u8; 5];
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"line\n");
}

#[test]
fn read_blocks_until_a_line_arrives() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();

    let buf = stack_scratch(&info);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[1, buf as i64, 32]);
    assert_eq!(kernel.active(), Pid(0));
    assert_eq!(kernel.status_of(init), Some(ProcStatus::Blocked));

    deliver_receive(&mut kernel, &mut info, 1, b"abc\n");
    assert_eq!(kernel.active(), init);
    assert_eq!(info.regs[0], 4);
    let mut out = [0u8; 4];
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"abc\n");
}

#[test]
fn short_reads_split_a_line() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();
    deliver_receive(&mut kernel, &mut info, 0, b"abcdef\n");

    let buf = stack_scratch(&info);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[0, buf as i64, 3]);
    assert_eq!(info.regs[0], 3);
    let mut out = [0u8; 3];
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"abc");

    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[0, buf as i64, 16]);
    assert_eq!(info.regs[0], 4);
    let mut out = [0u8; 4];
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"def\n");
}

#[test]
fn lines_queue_in_arrival_order() {
    let (mut kernel, mut info) = boot_kernel();
    let init = kernel.active();
    deliver_receive(&mut kernel, &mut info, 3, b"one\n");
    deliver_receive(&mut kernel, &mut info, 3, b"two\n");

    let buf = stack_scratch(&info);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[3, buf as i64, 16]);
    let mut out = [0u8; 4];
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"one\n");

    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[3, buf as i64, 16]);
    kernel.copy_from_user(init, buf, &mut out).unwrap();
    assert_eq!(&out, b"two\n");
}

#[test]
fn tty_argument_validation() {
    let (mut kernel, mut info) = boot_kernel();
    let buf = stack_scratch(&info) as i64;

    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[9, buf, 8]);
    assert_eq!(info.regs[0], ERROR);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[0, buf, -1]);
    assert_eq!(info.regs[0], ERROR);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[0, buf, 0]);
    assert_eq!(info.regs[0], 0);

    syscall(&mut kernel, &mut info, SyscallCode::TtyWrite, &[0, buf, 0]);
    assert_eq!(info.regs[0], ERROR);
    syscall(
        &mut kernel,
        &mut info,
        SyscallCode::TtyWrite,
        &[0, buf, (TERMINAL_MAX_LINE + 1) as i64],
    );
    assert_eq!(info.regs[0], ERROR);
}

#[test]
fn reader_and_writer_coexist_across_scheduling() {
    let (mut kernel, mut info) = boot_kernel();

    // Split into a reader (parent) and a writer (child).
    syscall(&mut kernel, &mut info, SyscallCode::Fork, &[]);
    let writer = kernel.active();

    let wbuf = stack_scratch(&info);
    kernel.copy_to_user(writer, wbuf, b"pong\n").unwrap();
    syscall(&mut kernel, &mut info, SyscallCode::TtyWrite, &[0, wbuf as i64, 5]);
    assert_eq!(info.regs[0], 5);

    // Run until the parent gets the CPU and blocks reading.
    tick(&mut kernel, &mut info);
    tick(&mut kernel, &mut info);
    let reader = kernel.active();
    assert_ne!(reader, writer);
    let rbuf = stack_scratch(&info);
    syscall(&mut kernel, &mut info, SyscallCode::TtyRead, &[0, rbuf as i64, 16]);
    assert_eq!(kernel.active(), writer);

    // Input arrives; the reader is resumed with the line.
    deliver_receive(&mut kernel, &mut info, 0, b"ping\n");
    assert_eq!(kernel.active(), reader);
    assert_eq!(info.regs[0], 5);
    let mut out = [0u8; 5];
    kernel.copy_from_user(reader, rbuf, &mut out).unwrap();
    assert_eq!(&out, b"ping\n");
}
