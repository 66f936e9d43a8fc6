//! Hardware register surface supplied by the host platform.

/// The half-duplex data register interface of a terminal controller.
///
/// The host calls back into [`TtyDriver`](crate::TtyDriver) with
/// `receive_interrupt` after placing a typed character in the input data
/// register, and with `transmit_interrupt` after a character written to the
/// output data register has reached the screen. The driver only ever touches
/// the hardware through this trait, so tests can substitute a recording
/// fake.
pub trait Hardware {
    /// Prepare the hardware for terminal `term`. Must be called once per
    /// terminal before any register access. Returns `false` on failure.
    fn init(&self, term: usize) -> bool;

    /// Read the input data register for terminal `term`.
    fn read_data_register(&self, term: usize) -> u8;

    /// Place `byte` in the output data register for terminal `term` and
    /// start the hardware writing it to the screen.
    fn write_data_register(&self, term: usize, byte: u8);
}
