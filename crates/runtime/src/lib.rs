//! Lox Runtime
//!
//! The stack-based virtual machine that executes compiled chunks: a
//! value stack, a call-frame stack, a globals table, open-upvalue
//! bookkeeping, native functions, and the garbage collector.
//!
//! One [`Vm`] is one interpretation context; dropping it releases every
//! object still on the heap. Execution tracing and GC events are logged
//! through `tracing` at TRACE and DEBUG level (enable with `RUST_LOG`).
//!
//! ```rust
//! use lox_runtime::{Value, Vm};
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.interpret("return 1 + 2;"), Value::Number(3.0));
//! ```

pub mod gc;
pub mod natives;
pub mod vm;

pub use lox_core::value::{ErrorKind, Value};
pub use vm::Vm;
