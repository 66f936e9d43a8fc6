//! The driver monitor: per-terminal state, the editing rules, and the two
//! interrupt handlers.

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::ring::Ring;
use crate::{Hardware, TtyError, BUFFER_SIZE, NUM_TERMINALS};

const BS: u8 = 0x08;
const DEL: u8 = 0x7f;

/// Per-terminal traffic counters.
///
/// `user_in` counts bytes *requested* by writers, `user_out` counts bytes
/// actually delivered to readers; `tty_in` counts receive interrupts taken
/// for an initialized terminal and `tty_out` counts bytes handed to the
/// output data register.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TermStats {
    /// Characters arriving from the keyboard.
    pub tty_in: u64,
    /// Characters written to the screen.
    pub tty_out: u64,
    /// Bytes submitted by `write_terminal` callers.
    pub user_in: u64,
    /// Bytes returned to `read_terminal` callers.
    pub user_out: u64,
}

#[derive(Debug)]
struct Terminal {
    initialized: bool,
    wdr_busy: bool,
    input: Ring,
    output: Ring,
    echo: Ring,
    reader_count: u32,
    writer_count: u32,
    newline_count: u32,
    stats: TermStats,
}

impl Terminal {
    fn new() -> Self {
        Terminal {
            initialized: false,
            wdr_busy: false,
            input: Ring::new(),
            output: Ring::new(),
            echo: Ring::new(),
            reader_count: 0,
            writer_count: 0,
            newline_count: 0,
            stats: TermStats::default(),
        }
    }
}

#[derive(Debug)]
struct DriverState {
    initialized: bool,
    terms: [Terminal; NUM_TERMINALS],
}

#[derive(Default)]
struct TermConds {
    reader_gate: Condvar,
    writer_gate: Condvar,
    output_full: Condvar,
    newline: Condvar,
}

/// Line-buffered, echoed, bounded, thread-safe terminal I/O over a
/// half-duplex data register.
///
/// All state sits behind one mutex; the interrupt handlers and the blocking
/// client calls are all monitor entries on that lock.
pub struct TtyDriver<H> {
    hw: H,
    state: Mutex<DriverState>,
    conds: [TermConds; NUM_TERMINALS],
}

impl<H: Hardware> TtyDriver<H> {
    /// Wrap the hardware in an uninitialized driver.
    pub fn new(hw: H) -> Self {
        TtyDriver {
            hw,
            state: Mutex::new(DriverState {
                initialized: false,
                terms: std::array::from_fn(|_| Terminal::new()),
            }),
            conds: std::array::from_fn(|_| TermConds::default()),
        }
    }

    /// Initialize the driver. Fails if called more than once.
    pub fn init_driver(&self) -> Result<(), TtyError> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(TtyError::AlreadyInitialized);
        }
        state.initialized = true;
        for term in state.terms.iter_mut() {
            *term = Terminal::new();
        }
        debug!("terminal driver initialized");
        Ok(())
    }

    /// Initialize the hardware for one terminal. Fails if the driver is
    /// uninitialized, the index is out of range, or the terminal was already
    /// initialized.
    pub fn init_terminal(&self, term: usize) -> Result<(), TtyError> {
        let mut state = self.state.lock();
        let t = Self::term_slot(&mut state, term)?;
        if t.initialized {
            return Err(TtyError::TerminalAlreadyInitialized(term));
        }
        if !self.hw.init(term) {
            return Err(TtyError::Hardware(term));
        }
        Self::term_slot(&mut state, term)?.initialized = true;
        debug!(term, "terminal initialized");
        Ok(())
    }

    /// Snapshot the per-terminal statistics.
    pub fn driver_statistics(&self) -> Result<[TermStats; NUM_TERMINALS], TtyError> {
        let state = self.state.lock();
        if !state.initialized {
            return Err(TtyError::NotInitialized);
        }
        Ok(std::array::from_fn(|i| state.terms[i].stats))
    }

    /// Read one newline-terminated line (or the prefix that fits in `buf`),
    /// blocking until a complete line is available.
    ///
    /// At most one reader proceeds per terminal; later readers queue on the
    /// reader gate and are released in turn.
    pub fn read_terminal(&self, term: usize, buf: &mut [u8]) -> Result<usize, TtyError> {
        let mut state = self.state.lock();
        Self::check_ready(&mut state, term)?;

        while state.terms[term].reader_count > 0 {
            self.conds[term].reader_gate.wait(&mut state);
            Self::check_ready(&mut state, term)?;
        }
        while state.terms[term].newline_count == 0 {
            self.conds[term].newline.wait(&mut state);
            Self::check_ready(&mut state, term)?;
        }
        state.terms[term].reader_count += 1;

        let mut count = 0;
        {
            let t = &mut state.terms[term];
            while count < buf.len() {
                let byte = t.input.pop();
                buf[count] = byte;
                count += 1;
                if byte == b'\n' {
                    t.newline_count -= 1;
                    break;
                }
            }
            t.stats.user_out += count as u64;
            t.reader_count -= 1;
        }
        self.conds[term].reader_gate.notify_one();
        Ok(count)
    }

    /// Queue `buf` for output, translating `\n` to `\r\n`, blocking whenever
    /// the output ring is full. Returns the number of bytes accepted.
    ///
    /// At most one writer proceeds per terminal; later writers queue on the
    /// writer gate.
    pub fn write_terminal(&self, term: usize, buf: &[u8]) -> Result<usize, TtyError> {
        let mut state = self.state.lock();
        Self::check_ready(&mut state, term)?;

        while state.terms[term].writer_count > 0 {
            self.conds[term].writer_gate.wait(&mut state);
            Self::check_ready(&mut state, term)?;
        }
        state.terms[term].writer_count += 1;
        state.terms[term].stats.user_in += buf.len() as u64;

        for &byte in buf {
            // Reserve two slots so a newline can always expand to \r\n.
            while state.terms[term].output.len() >= BUFFER_SIZE - 2 {
                if !state.terms[term].wdr_busy {
                    self.start_output(&mut state, term);
                }
                self.conds[term].output_full.wait(&mut state);
            }

            if byte == b'\n' {
                state.terms[term].output.push(b'\r');
                if state.terms[term].output.len() >= BUFFER_SIZE - 1 {
                    self.conds[term].output_full.wait(&mut state);
                }
            }
            state.terms[term].output.push(byte);
        }

        if !state.terms[term].wdr_busy && !state.terms[term].output.is_empty() {
            self.start_output(&mut state, term);
        }

        state.terms[term].writer_count -= 1;
        self.conds[term].writer_gate.notify_one();
        Ok(buf.len())
    }

    /// Hardware callback: a character arrived in the input data register.
    ///
    /// Applies the editing rules: `\r` becomes `\n` and echoes as `\r\n`, a
    /// backspace cancels the newest unread byte of the current line and
    /// echoes `\b \b`, everything else is appended and echoed. When the
    /// input ring is full only backspace still edits; other bytes are
    /// dropped.
    pub fn receive_interrupt(&self, term: usize) {
        let mut state = self.state.lock();
        if term >= NUM_TERMINALS || !state.terms[term].initialized {
            return;
        }

        let byte = self.hw.read_data_register(term);
        let t = &mut state.terms[term];

        if t.input.is_full() {
            t.stats.tty_in += 1;
            if byte == BS || byte == DEL {
                if t.input.last() == Some(b'\n') {
                    return;
                }
                t.input.pop_back();
                t.echo.push(BS);
                t.echo.push(b' ');
                t.echo.push(BS);
            } else {
                trace!(term, byte, "input ring full, dropping byte");
            }
        } else {
            t.stats.tty_in += 1;
            if byte == b'\r' || byte == b'\n' {
                t.input.push(b'\n');
                t.echo.push(b'\r');
                t.echo.push(b'\n');
                t.newline_count += 1;
                self.conds[term].newline.notify_one();
            } else if byte == BS || byte == DEL {
                if !t.input.is_empty() {
                    if t.input.last() == Some(b'\n') {
                        return;
                    }
                    t.input.pop_back();
                    t.echo.push(BS);
                    t.echo.push(b' ');
                    t.echo.push(BS);
                }
            } else {
                t.input.push(byte);
                t.echo.push(byte);
            }
        }

        // First transmission must be kicked off here; after that the
        // transmit interrupt keeps the register fed.
        if !state.terms[term].wdr_busy && !state.terms[term].echo.is_empty() {
            self.start_echo(&mut state, term);
        }
    }

    /// Hardware callback: the last byte written to the output data register
    /// has reached the screen. Feeds the next byte, echo before output, or
    /// marks the register idle.
    pub fn transmit_interrupt(&self, term: usize) {
        let mut state = self.state.lock();
        if term >= NUM_TERMINALS || !state.terms[term].initialized {
            return;
        }

        if !state.terms[term].echo.is_empty() {
            self.start_echo(&mut state, term);
        } else if !state.terms[term].output.is_empty() {
            self.start_output(&mut state, term);
            // A writer may be waiting for this slot.
            self.conds[term].output_full.notify_one();
        } else {
            state.terms[term].wdr_busy = false;
        }
    }

    fn start_echo(&self, state: &mut MutexGuard<'_, DriverState>, term: usize) {
        let t = &mut state.terms[term];
        t.wdr_busy = true;
        let byte = t.echo.pop();
        t.stats.tty_out += 1;
        self.hw.write_data_register(term, byte);
    }

    fn start_output(&self, state: &mut MutexGuard<'_, DriverState>, term: usize) {
        let t = &mut state.terms[term];
        t.wdr_busy = true;
        let byte = t.output.pop();
        t.stats.tty_out += 1;
        self.hw.write_data_register(term, byte);
    }

    fn term_slot<'a>(
        state: &'a mut MutexGuard<'_, DriverState>,
        term: usize,
    ) -> Result<&'a mut Terminal, TtyError> {
        if term >= NUM_TERMINALS {
            return Err(TtyError::BadTerminal(term));
        }
        if !state.initialized {
            return Err(TtyError::NotInitialized);
        }
        Ok(&mut state.terms[term])
    }

    fn check_ready(state: &mut MutexGuard<'_, DriverState>, term: usize) -> Result<(), TtyError> {
        let t = Self::term_slot(state, term)?;
        if !t.initialized {
            return Err(TtyError::TerminalNotInitialized(term));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Recording hardware: typed bytes are queued by tests, transmitted
    /// bytes are captured for inspection.
    #[derive(Clone, Default)]
    struct FakeHw {
        inner: Arc<Mutex<FakeHwInner>>,
    }

    #[derive(Default)]
    struct FakeHwInner {
        pending: [VecDeque<u8>; NUM_TERMINALS],
        written: [Vec<u8>; NUM_TERMINALS],
        acked: [usize; NUM_TERMINALS],
    }

    impl FakeHw {
        fn written(&self, term: usize) -> Vec<u8> {
            self.inner.lock().written[term].clone()
        }
    }

    impl Hardware for FakeHw {
        fn init(&self, _term: usize) -> bool {
            true
        }

        fn read_data_register(&self, term: usize) -> u8 {
            self.inner.lock().pending[term].pop_front().expect("no byte")
        }

        fn write_data_register(&self, term: usize, byte: u8) {
            self.inner.lock().written[term].push(byte);
        }
    }

    fn ready_driver() -> (TtyDriver<FakeHw>, FakeHw) {
        let hw = FakeHw::default();
        let driver = TtyDriver::new(hw.clone());
        driver.init_driver().unwrap();
        for term in 0..NUM_TERMINALS {
            driver.init_terminal(term).unwrap();
        }
        (driver, hw)
    }

    fn type_byte(driver: &TtyDriver<FakeHw>, hw: &FakeHw, term: usize, byte: u8) {
        hw.inner.lock().pending[term].push_back(byte);
        driver.receive_interrupt(term);
    }

    /// Acknowledge every outstanding data-register write until the
    /// transmitter goes idle. Each written byte gets exactly one transmit
    /// interrupt, across all calls.
    fn drain(driver: &TtyDriver<FakeHw>, hw: &FakeHw, term: usize) {
        loop {
            {
                let mut inner = hw.inner.lock();
                if inner.acked[term] >= inner.written[term].len() {
                    break;
                }
                inner.acked[term] += 1;
            }
            driver.transmit_interrupt(term);
        }
    }

    #[test]
    fn init_is_guarded() {
        let hw = FakeHw::default();
        let driver = TtyDriver::new(hw.clone());
        assert_eq!(driver.init_terminal(0), Err(TtyError::NotInitialized));
        driver.init_driver().unwrap();
        assert_eq!(driver.init_driver(), Err(TtyError::AlreadyInitialized));
        driver.init_terminal(1).unwrap();
        assert_eq!(
            driver.init_terminal(1),
            Err(TtyError::TerminalAlreadyInitialized(1))
        );
        assert_eq!(
            driver.init_terminal(NUM_TERMINALS),
            Err(TtyError::BadTerminal(NUM_TERMINALS))
        );
        let mut buf = [0u8; 8];
        assert_eq!(
            driver.read_terminal(0, &mut buf),
            Err(TtyError::TerminalNotInitialized(0))
        );
    }

    #[test]
    fn echoed_line_read() {
        let (driver, hw) = ready_driver();
        for byte in *b"abc\r" {
            type_byte(&driver, &hw, 1, byte);
        }
        drain(&driver, &hw, 1);
        assert_eq!(hw.written(1), b"abc\r\n");

        let mut buf = [0u8; 10];
        let n = driver.read_terminal(1, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"abc\n");
    }

    #[test]
    fn backspace_edits_line_and_echo() {
        let (driver, hw) = ready_driver();
        for byte in [b'x', b'y', BS] {
            type_byte(&driver, &hw, 0, byte);
        }
        drain(&driver, &hw, 0);
        assert_eq!(hw.written(0), [b'x', b'y', BS, b' ', BS]);

        type_byte(&driver, &hw, 0, b'\r');
        let mut buf = [0u8; 10];
        let n = driver.read_terminal(0, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"x\n");
    }

    #[test]
    fn backspace_never_crosses_a_newline() {
        let (driver, hw) = ready_driver();
        for byte in *b"ab\r" {
            type_byte(&driver, &hw, 0, byte);
        }
        type_byte(&driver, &hw, 0, BS);
        let mut buf = [0u8; 10];
        assert_eq!(driver.read_terminal(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ab\n");
    }

    #[test]
    fn backspace_on_empty_line_is_ignored() {
        let (driver, hw) = ready_driver();
        type_byte(&driver, &hw, 2, BS);
        drain(&driver, &hw, 2);
        assert_eq!(hw.written(2), b"");
        let stats = driver.driver_statistics().unwrap();
        assert_eq!(stats[2].tty_in, 1);
    }

    #[test]
    fn short_read_splits_line_and_keeps_newline_pending() {
        let (driver, hw) = ready_driver();
        for byte in *b"hello\r" {
            type_byte(&driver, &hw, 0, byte);
        }
        let mut buf = [0u8; 3];
        assert_eq!(driver.read_terminal(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        // The newline is still pending, so the rest reads without blocking.
        let mut rest = [0u8; 8];
        assert_eq!(driver.read_terminal(0, &mut rest).unwrap(), 3);
        assert_eq!(&rest[..3], b"lo\n");
    }

    #[test]
    fn write_translates_newlines() {
        let (driver, hw) = ready_driver();
        assert_eq!(driver.write_terminal(3, b"hi\nthere\n").unwrap(), 9);
        drain(&driver, &hw, 3);
        assert_eq!(hw.written(3), b"hi\r\nthere\r\n");
    }

    #[test]
    fn echo_takes_priority_over_output() {
        let (driver, hw) = ready_driver();
        driver.write_terminal(0, b"zz").unwrap();
        // One output byte is now in flight. Type a key before acking it.
        type_byte(&driver, &hw, 0, b'k');
        drain(&driver, &hw, 0);
        // The echo of 'k' preempts the second output byte.
        assert_eq!(hw.written(0), [b'z', b'k', b'z']);
    }

    #[test]
    fn full_input_ring_drops_bytes_but_accepts_backspace() {
        let (driver, hw) = ready_driver();
        for _ in 0..BUFFER_SIZE {
            type_byte(&driver, &hw, 0, b'a');
            drain(&driver, &hw, 0);
        }
        type_byte(&driver, &hw, 0, b'b'); // dropped
        type_byte(&driver, &hw, 0, BS); // still edits
        drain(&driver, &hw, 0);
        let stats = driver.driver_statistics().unwrap();
        assert_eq!(stats[0].tty_in, (BUFFER_SIZE + 2) as u64);

        type_byte(&driver, &hw, 0, b'\r');
        let mut buf = vec![0u8; BUFFER_SIZE + 8];
        let n = driver.read_terminal(0, &mut buf).unwrap();
        assert_eq!(n, BUFFER_SIZE); // 4095 'a's and the newline
        assert_eq!(buf[n - 2], b'a');
        assert_eq!(buf[n - 1], b'\n');
    }

    #[test]
    fn counters_use_requested_and_delivered_lengths() {
        let (driver, hw) = ready_driver();
        driver.write_terminal(0, b"ab\n").unwrap();
        drain(&driver, &hw, 0);
        for byte in *b"q\r" {
            type_byte(&driver, &hw, 0, byte);
        }
        drain(&driver, &hw, 0);
        let mut buf = [0u8; 1];
        driver.read_terminal(0, &mut buf).unwrap();

        let stats = driver.driver_statistics().unwrap();
        assert_eq!(stats[0].user_in, 3);
        assert_eq!(stats[0].user_out, 1);
        assert_eq!(stats[0].tty_in, 2);
        // 4 output bytes (ab\r\n) plus 3 echo bytes (q\r\n).
        assert_eq!(stats[0].tty_out, 7);
    }
}
