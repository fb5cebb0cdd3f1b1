//! emberlisp - A pool-allocated Lisp for embedded game hosts
//!
//! This crate implements a small, self-contained Lisp interpreter and
//! bytecode virtual machine designed to run inside a memory-constrained
//! game environment. Everything the language touches lives in a fixed
//! pool of uniform cells addressed by 16-bit compressed references, so
//! the whole runtime has a known, bounded footprint.
//!
//! ```scheme
//! (set 'squares (map (lambda (* $0 $0)) (range 1 5)))
//! (macro inc (x) (+ x 1))          ; expands at read time
//! (set 'f (compile (lambda (if (equal $0 0) 'done (f (- $0 1))))))
//! (f 1000000)                      ; tail calls run in constant stack
//! ```
//!
//! ## Architecture
//!
//! Source text flows through the reader into pool cells, macros expand
//! as lists are read, and the result either walks through the
//! tree-walking evaluator or compiles to bytecode for the stack VM.
//! Both execution paths share one operand stack, one globals tree, and
//! one mark-and-sweep collector.
//!
//! - `pool`: fixed cell arena, free list, pointer compression
//! - `interns`: append-only symbol name region
//! - `value`: cell and payload representation
//! - `interp`: the interpreter context and value construction API
//! - `gc`: mark-and-sweep collection over the pool
//! - `reader`: text to values, with macro expansion
//! - `macros`: the read-time macro expander
//! - `eval`: the tree-walking evaluator
//! - `compiler`: value trees to bytecode
//! - `vm`: the stack bytecode interpreter with tail-call elimination
//! - `bytecode`: opcodes, precompiled module loading, disassembly
//! - `builtins`: the native primitive registry
//! - `platform`: the host interface
//!
//! ## Errors
//!
//! Errors are values, not exceptions: any operation can hand back an
//! error cell carrying one of seven kinds plus a context value. The
//! only panics originate in [`Platform::fatal`], which the host
//! controls.
//!
//! ## Example
//!
//! ```
//! use emberlisp::{Interp, StdPlatform};
//!
//! let mut interp = Interp::new(Box::new(StdPlatform));
//! let result = interp.dostring("(+ 1 2 3)", &mut |_, _| {});
//! assert_eq!(interp.format(result), "6");
//! ```

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod eval;
pub mod gc;
pub mod interns;
pub mod interp;
pub mod macros;
pub mod platform;
pub mod pool;
pub mod reader;
pub mod value;
pub mod vm;

pub use bytecode::{ModuleError, Opcode};
pub use interp::{Interp, OPERAND_STACK_SIZE};
pub use platform::{Platform, ScratchBuffer, ScratchBufferRef, StdPlatform, SCRATCH_BUFFER_SIZE};
pub use pool::{compress, decompress, POOL_SIZE};
pub use value::{ErrorCode, NativeFn, TypeTag, ValueRef};
