//! Lox Core: the shared data model of the Lox interpreter
//!
//! This crate holds everything the compiler and the virtual machine agree
//! on: the tagged `Value`, the object heap with its string intern table,
//! the open-addressed `Table`, and the bytecode `Chunk` format.
//!
//! # Modules
//!
//! - `value`: tagged runtime values (nil, bool, number, object, error)
//! - `object`: heap objects, the object store, and string interning
//! - `table`: open-addressed hash table keyed by interned strings
//! - `chunk`: bytecode chunks and the opcode set
//! - `debug`: chunk disassembly for tests and trace logging

pub mod chunk;
pub mod debug;
pub mod object;
pub mod table;
pub mod value;

// Re-export key types
pub use chunk::{Chunk, OpCode};
pub use object::{Function, Heap, NativeContext, NativeFn, ObjKind, ObjRef, UpvalueState};
pub use table::Table;
pub use value::{ErrorKind, Value, format_value};
