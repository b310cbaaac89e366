//! The virtual machine.
//!
//! A straight dispatch loop over one-byte opcodes. Every instruction
//! runs to completion; the only state is the value stack, the frame
//! stack, the globals table, and the heap. Runtime errors unwind
//! everything: the message and a frame-by-frame trace go to stderr and
//! the caller gets `Value::Error(Runtime)` back.

use std::time::Instant;

use tracing::trace;

use lox_core::chunk::{Chunk, OpCode};
use lox_core::debug;
use lox_core::object::{Function, Heap, NativeContext, NativeFn, ObjKind, ObjRef, UpvalueState};
use lox_core::table::Table;
use lox_core::value::{ErrorKind, Value, format_value};

/// Value-stack depth limit.
pub const STACK_MAX: usize = 16_384;
/// Call-frame depth limit; exceeding it is a "Stack overflow." error.
pub const FRAMES_MAX: usize = 64;

/// One call: the closure being run, its instruction pointer, and where
/// its locals window starts on the value stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    pub(crate) closure: ObjRef,
    pub(crate) ip: usize,
    pub(crate) slots_base: usize,
}

/// A Lox interpretation context.
///
/// Construction installs the native functions; dropping the VM frees
/// every heap object still linked on the all-objects list.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) globals: Table,
    /// Open upvalues, sorted by decreasing stack slot.
    pub(crate) open_upvalues: Option<ObjRef>,
    pub(crate) started: Instant,
    pub(crate) gc_stress: bool,
    pub(crate) next_gc: usize,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: None,
            started: Instant::now(),
            gc_stress: false,
            next_gc: crate::gc::INITIAL_THRESHOLD,
        };
        vm.register_native("clock", 0, crate::natives::clock);
        vm
    }

    /// Compile and run a whole program; the result is the program's
    /// top-level `return` value, `nil`, or an error value.
    pub fn interpret(&mut self, source: &str) -> Value {
        let function = match lox_compiler::compile(&mut self.heap, source) {
            Ok(function) => function,
            Err(diags) => {
                for diag in &diags {
                    eprintln!("{diag}");
                }
                return Value::Error(ErrorKind::Compile);
            }
        };
        let closure = self.heap.alloc(ObjKind::Closure {
            function,
            upvalues: Vec::new(),
        });
        match self.run_entry(closure) {
            Ok(value) => value,
            Err(message) => self.report_runtime_error(&message),
        }
    }

    /// Run a hand-built chunk as a zero-arity script. Test hook.
    pub fn interpret_chunk(&mut self, chunk: Chunk) -> Value {
        let function = self.heap.alloc(ObjKind::Function(Function {
            arity: 0,
            upvalue_count: 0,
            chunk,
            name: None,
        }));
        let closure = self.heap.alloc(ObjKind::Closure {
            function,
            upvalues: Vec::new(),
        });
        match self.run_entry(closure) {
            Ok(value) => value,
            Err(message) => self.report_runtime_error(&message),
        }
    }

    /// Install a host function under `name` in the globals table.
    pub fn register_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.heap.intern(name);
        let hash = self.heap.string_hash(name);
        let native = self.heap.alloc(ObjKind::Native {
            function,
            arity,
            name,
        });
        self.globals.set(name, hash, Value::Obj(native));
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Collect before every VM allocation. Testing aid.
    pub fn set_gc_stress(&mut self, on: bool) {
        self.gc_stress = on;
    }

    fn run_entry(&mut self, closure: ObjRef) -> Result<Value, String> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;
        self.run()
    }

    // ---- dispatch ----

    fn run(&mut self) -> Result<Value, String> {
        loop {
            if tracing::enabled!(tracing::Level::TRACE) {
                self.trace_instruction();
            }
            let op = OpCode::try_from(self.read_byte())
                .map_err(|err| format!("Unknown opcode {}.", err.number))?;
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots_base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    // assignment is an expression: the value stays put
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(format!(
                                "Undefined variable '{}'.",
                                self.heap.string_text(name)
                            ));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // assignment never defines; undo and report
                        self.globals.delete(name, hash);
                        return Err(format!(
                            "Undefined variable '{}'.",
                            self.heap.string_text(name)
                        ));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure_upvalue(self.frame().closure, index);
                    let value = match self.heap.upvalue_state(upvalue) {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure_upvalue(self.frame().closure, index);
                    let value = self.peek(0);
                    match self.heap.upvalue_state(upvalue) {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => self
                            .heap
                            .set_upvalue_state(upvalue, UpvalueState::Closed(value)),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b))?;
                        }
                        (Value::Obj(a), Value::Obj(b))
                            if self.heap.is_string(a) && self.heap.is_string(b) =>
                        {
                            // collect while both operands are still rooted
                            self.maybe_collect();
                            self.pop();
                            self.pop();
                            let result = self.heap.concat(a, b);
                            self.push(Value::Obj(result))?;
                        }
                        _ => {
                            return Err("Operands must be two numbers or two strings.".to_string());
                        }
                    }
                }
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    let Some(value) = self.peek(0).as_number() else {
                        return Err("Operand must be a number.".to_string());
                    };
                    self.pop();
                    self.push(Value::Number(-value))?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", format_value(&self.heap, value));
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self
                        .read_constant()
                        .as_obj()
                        .expect("closure operand is a function constant");
                    self.maybe_collect();
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.heap.alloc(ObjKind::Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    });
                    // on the stack before capturing, so a collection
                    // mid-capture still sees it as a root
                    self.push(Value::Obj(closure))?;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots_base + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure_upvalue(self.frame().closure, index)
                        };
                        self.heap.push_closure_upvalue(closure, upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.slots_base);
                    self.stack.truncate(frame.slots_base);
                    if self.frames.is_empty() {
                        // the script closure is gone too; the stack is empty
                        return Ok(result);
                    }
                    self.push(result)?;
                }
            }
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), String> {
        if let Value::Obj(handle) = callee {
            match &self.heap.get(handle).kind {
                ObjKind::Closure { .. } => return self.call_closure(handle, arg_count),
                ObjKind::Native {
                    function, arity, ..
                } => {
                    let (function, arity) = (*function, *arity);
                    if arg_count != arity {
                        return Err(format!(
                            "Expected {arity} arguments but got {arg_count}."
                        ));
                    }
                    let args_start = self.stack.len() - arg_count as usize;
                    let args: Vec<Value> = self.stack[args_start..].to_vec();
                    let mut context = NativeContext {
                        heap: &mut self.heap,
                        started: self.started,
                    };
                    let result = function(&mut context, &args);
                    // drop the arguments and the callee
                    self.stack.truncate(args_start - 1);
                    return self.push(result);
                }
                _ => {}
            }
        }
        Err("Can only call functions.".to_string())
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> Result<(), String> {
        let function = self.heap.closure_function(closure);
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(format!("Expected {arity} arguments but got {arg_count}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    // ---- upvalues ----

    /// Find or create the open upvalue for a stack slot, keeping the
    /// open list sorted by decreasing slot. At most one open upvalue
    /// exists per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(handle) = current {
            let UpvalueState::Open(current_slot) = self.heap.upvalue_state(handle) else {
                unreachable!("closed upvalue on the open list");
            };
            if current_slot <= slot {
                break;
            }
            previous = Some(handle);
            current = self.heap.upvalue_next_open(handle);
        }
        if let Some(handle) = current
            && self.heap.upvalue_state(handle) == UpvalueState::Open(slot)
        {
            return handle;
        }

        self.maybe_collect();
        let created = self.heap.alloc(ObjKind::Upvalue {
            state: UpvalueState::Open(slot),
            next_open: current,
        });
        match previous {
            Some(handle) => self.heap.set_upvalue_next_open(handle, Some(created)),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Hoist every open upvalue at or above `from_slot` off the stack.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(handle) = self.open_upvalues {
            let UpvalueState::Open(slot) = self.heap.upvalue_state(handle) else {
                unreachable!("closed upvalue on the open list");
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            self.heap
                .set_upvalue_state(handle, UpvalueState::Closed(value));
            let next = self.heap.upvalue_next_open(handle);
            self.heap.set_upvalue_next_open(handle, None);
            self.open_upvalues = next;
        }
    }

    // ---- stack and frame plumbing ----

    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() == STACK_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn current_chunk(&self) -> &Chunk {
        let function = self.heap.closure_function(self.frame().closure);
        &self.heap.function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_chunk().code[ip];
        self.frame_mut().ip = ip + 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    fn read_string_constant(&mut self) -> ObjRef {
        self.read_constant()
            .as_obj()
            .expect("name operand is a string constant")
    }

    fn binary_number_op(&mut self, op: impl FnOnce(f64, f64) -> Value) -> Result<(), String> {
        let (Some(a), Some(b)) = (self.peek(1).as_number(), self.peek(0).as_number()) else {
            return Err("Operands must be numbers.".to_string());
        };
        self.pop();
        self.pop();
        self.push(op(a, b))
    }

    // ---- errors and tracing ----

    /// Print the message and a frame-by-frame trace, unwind everything,
    /// and produce the error value `interpret` returns.
    fn report_runtime_error(&mut self, message: &str) -> Value {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure_function(frame.closure);
            let function = self.heap.function(function);
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            match function.name {
                Some(name) => {
                    eprintln!("[line {line}] in {}()", self.heap.string_text(name));
                }
                None => eprintln!("[line {line}] in script"),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        Value::Error(ErrorKind::Runtime)
    }

    fn trace_instruction(&self) {
        let mut text = String::new();
        debug::disassemble_instruction(&self.heap, self.current_chunk(), self.frame().ip, &mut text);
        let stack: Vec<String> = self
            .stack
            .iter()
            .map(|value| format_value(&self.heap, *value))
            .collect();
        trace!(stack = ?stack, "{}", text.trim_end());
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.heap.free_objects();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_type_errors_unwind() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("return 1 + nil;"),
            Value::Error(ErrorKind::Runtime)
        );
        // the VM is reusable after an error
        assert_eq!(vm.interpret("return 1 + 2;"), Value::Number(3.0));
    }

    #[test]
    fn test_negate_requires_number() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("return -\"no\";"),
            Value::Error(ErrorKind::Runtime)
        );
    }

    #[test]
    fn test_undefined_global_read_and_write() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("return missing;"),
            Value::Error(ErrorKind::Runtime)
        );
        assert_eq!(
            vm.interpret("missing = 1;"),
            Value::Error(ErrorKind::Runtime)
        );
    }

    #[test]
    fn test_call_non_callable() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var x = 3; x();"),
            Value::Error(ErrorKind::Runtime)
        );
    }

    #[test]
    fn test_deep_recursion_overflows_frames() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("fun f() { f(); } f();"),
            Value::Error(ErrorKind::Runtime)
        );
    }

    #[test]
    fn test_register_native_is_callable() {
        fn add_one(_context: &mut NativeContext<'_>, args: &[Value]) -> Value {
            match args[0] {
                Value::Number(n) => Value::Number(n + 1.0),
                _ => Value::Nil,
            }
        }
        let mut vm = Vm::new();
        vm.register_native("addOne", 1, add_one);
        assert_eq!(vm.interpret("return addOne(41);"), Value::Number(42.0));
    }

    #[test]
    fn test_native_arity_mismatch() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("return clock(1);"),
            Value::Error(ErrorKind::Runtime)
        );
    }

    #[test]
    fn test_stack_is_unwound_after_error() {
        let mut vm = Vm::new();
        vm.interpret("fun f(x) { return x + nil; } f(1);");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_none());
    }
}
