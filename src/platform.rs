//! Host platform interface.
//!
//! The interpreter core makes no direct system calls. Everything it needs
//! from the outside world comes through a [`Platform`] object supplied by
//! the host at startup: a fatal-abort channel, a tick-based sleep, scratch
//! buffer allocation, and a remote-console line printer used by the
//! disassembler.
//!
//! Scratch buffers are the only dynamically allocated memory the core
//! touches. A buffer handle is reference counted; a `data-buffer` cell in
//! the value pool owns one handle and releases it when the cell is swept
//! by the garbage collector.

use std::cell::RefCell;
use std::rc::Rc;

/// Size in bytes of one host scratch buffer.
pub const SCRATCH_BUFFER_SIZE: usize = 2048;

/// A host-allocated scratch region. Bytecode, packed short strings, and
/// loaded module images all live in these.
pub struct ScratchBuffer {
    pub data: RefCell<[u8; SCRATCH_BUFFER_SIZE]>,
}

impl ScratchBuffer {
    pub fn new() -> ScratchBuffer {
        ScratchBuffer {
            data: RefCell::new([0u8; SCRATCH_BUFFER_SIZE]),
        }
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared ownership handle for a scratch buffer.
pub type ScratchBufferRef = Rc<ScratchBuffer>;

/// Host services required by the interpreter.
pub trait Platform {
    /// Unrecoverable condition. Must not return.
    fn fatal(&self, msg: &str) -> !;

    /// Pause for roughly `ticks` host ticks. Used by the disassembler to
    /// pace remote-console output.
    fn sleep(&self, ticks: u32);

    /// Allocate a fresh zero-filled scratch buffer.
    fn make_scratch_buffer(&self) -> ScratchBufferRef;

    /// How many scratch buffers the host can still hand out. The
    /// interpreter runs a collection cycle before asking for a new buffer
    /// when this reaches zero.
    fn scratch_buffers_remaining(&self) -> usize;

    /// Print one line on the host's remote console.
    fn console_print_line(&self, line: &str);
}

/// A plain standard-library host, suitable for the REPL binary, tests and
/// benchmarks. `fatal` panics with the supplied message so test harnesses
/// can observe it.
#[derive(Default)]
pub struct StdPlatform;

impl Platform for StdPlatform {
    fn fatal(&self, msg: &str) -> ! {
        panic!("fatal: {msg}");
    }

    fn sleep(&self, ticks: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ticks)));
    }

    fn make_scratch_buffer(&self) -> ScratchBufferRef {
        Rc::new(ScratchBuffer::new())
    }

    fn scratch_buffers_remaining(&self) -> usize {
        // A desktop host is not meaningfully constrained.
        usize::MAX
    }

    fn console_print_line(&self, line: &str) {
        println!("{line}");
    }
}
