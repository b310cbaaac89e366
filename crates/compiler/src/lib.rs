//! Lox Compiler Library
//!
//! Single-pass compilation from Lox source to bytecode chunks: a lazy
//! scanner feeds a Pratt parser that emits instructions as it goes,
//! with no AST in between. The compiler borrows the interpreter's [`Heap`] to
//! intern string constants and allocate function objects; the VM then
//! executes the returned top-level function.
//!
//! ```rust
//! use lox_core::Heap;
//! use lox_compiler::compile;
//!
//! let mut heap = Heap::new();
//! let script = compile(&mut heap, "print 1 + 2;").expect("compiles");
//! assert!(heap.function(script).name.is_none()); // prints as <script>
//! ```
//!
//! [`Heap`]: lox_core::Heap

pub mod compiler;
pub mod scanner;

pub use compiler::{CompileDiag, compile};
pub use scanner::{Scanner, Token, TokenKind};
