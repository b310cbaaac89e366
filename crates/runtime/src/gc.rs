//! Mark/sweep garbage collection.
//!
//! Roots are the value stack, the frame stack's closures, the open
//! upvalue list, and the globals table. The string intern table is NOT
//! a root: it is weak, so interned strings nothing else references are
//! deleted from it just before the sweep frees them.
//!
//! Collection only ever runs from the VM's allocation sites inside the
//! dispatch loop. The compiler allocates into the same heap, but
//! nothing collects while it runs, so in-progress functions never need
//! root treatment.

use tracing::debug;

use lox_core::object::{ObjKind, ObjRef, UpvalueState};
use lox_core::value::Value;

use crate::vm::Vm;

/// Heap size (in live objects) that triggers the first collection.
pub const INITIAL_THRESHOLD: usize = 1024;
/// The next collection fires when the heap grows by this factor.
pub const GROWTH_FACTOR: usize = 2;

impl Vm {
    /// Collect if stressed or past the growth threshold. Called before
    /// each allocation the dispatch loop performs.
    pub(crate) fn maybe_collect(&mut self) {
        if self.gc_stress || self.heap.live_objects() >= self.next_gc {
            self.collect_garbage();
            self.next_gc = (self.heap.live_objects() * GROWTH_FACTOR).max(INITIAL_THRESHOLD);
        }
    }

    /// One full mark/sweep cycle over the VM's roots.
    pub fn collect_garbage(&mut self) {
        let before = self.heap.live_objects();
        debug!(live = before, "gc begin");

        let mut gray: Vec<ObjRef> = Vec::new();

        // roots: the value stack
        for index in 0..self.stack.len() {
            mark_value(&mut self.heap, self.stack[index], &mut gray);
        }
        // roots: every frame's closure
        for index in 0..self.frames.len() {
            mark_object(&mut self.heap, self.frames[index].closure, &mut gray);
        }
        // roots: the open upvalue list
        let mut open = self.open_upvalues;
        while let Some(handle) = open {
            mark_object(&mut self.heap, handle, &mut gray);
            open = self.heap.upvalue_next_open(handle);
        }
        // roots: globals, keys and values both
        let globals: Vec<(ObjRef, Value)> = self.globals.iter().collect();
        for (key, value) in globals {
            mark_object(&mut self.heap, key, &mut gray);
            mark_value(&mut self.heap, value, &mut gray);
        }

        while let Some(handle) = gray.pop() {
            blacken(&mut self.heap, handle, &mut gray);
        }

        // weak intern table: forget strings the sweep is about to free
        let dead: Vec<(ObjRef, u32)> = self
            .heap
            .strings
            .keys()
            .filter(|(key, _)| !self.heap.get(*key).marked)
            .collect();
        for (key, hash) in dead {
            self.heap.strings.delete(key, hash);
        }

        let freed = self.heap.sweep();
        debug!(freed, live = before - freed, "gc end");
    }
}

fn mark_value(heap: &mut lox_core::Heap, value: Value, gray: &mut Vec<ObjRef>) {
    if let Value::Obj(handle) = value {
        mark_object(heap, handle, gray);
    }
}

fn mark_object(heap: &mut lox_core::Heap, handle: ObjRef, gray: &mut Vec<ObjRef>) {
    let obj = heap.get_mut(handle);
    if obj.marked {
        return;
    }
    obj.marked = true;
    gray.push(handle);
}

/// Mark everything one gray object references.
fn blacken(heap: &mut lox_core::Heap, handle: ObjRef, gray: &mut Vec<ObjRef>) {
    match &heap.get(handle).kind {
        ObjKind::String { .. } => {}
        ObjKind::Function(function) => {
            let name = function.name;
            let constants: Vec<Value> = function.chunk.constants.clone();
            if let Some(name) = name {
                mark_object(heap, name, gray);
            }
            for constant in constants {
                mark_value(heap, constant, gray);
            }
        }
        ObjKind::Native { name, .. } => {
            let name = *name;
            mark_object(heap, name, gray);
        }
        ObjKind::Closure { function, upvalues } => {
            let function = *function;
            let upvalues = upvalues.clone();
            mark_object(heap, function, gray);
            for upvalue in upvalues {
                mark_object(heap, upvalue, gray);
            }
        }
        ObjKind::Upvalue { state, .. } => {
            let state = *state;
            if let UpvalueState::Closed(value) = state {
                mark_value(heap, value, gray);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_core::value::ErrorKind;

    #[test]
    fn test_unreachable_strings_are_collected() {
        let mut vm = Vm::new();
        let before = vm.heap().live_objects();
        // the concatenation result is referenced by nothing afterwards
        vm.interpret("\"aaa\" + \"bbb\";");
        vm.collect_garbage();
        // "aaa", "bbb", "aaabbb", the script function, and its closure
        // are all garbage now; only the prelude survives
        assert_eq!(vm.heap().live_objects(), before);
    }

    #[test]
    fn test_globals_and_their_values_survive() {
        let mut vm = Vm::new();
        vm.interpret("var kept = \"payload\";");
        vm.collect_garbage();
        assert_eq!(vm.interpret("return kept;"), {
            let handle = vm.heap_mut().intern("payload");
            Value::Obj(handle)
        });
    }

    #[test]
    fn test_closed_upvalues_keep_their_values_alive() {
        let mut vm = Vm::new();
        vm.set_gc_stress(true);
        let result = vm.interpret(
            "fun box() { var s = \"inside\" + \"!\"; fun get() { return s; } return get; }\n\
             var get = box();\n\
             return get();",
        );
        let expected = vm.heap_mut().intern("inside!");
        assert_eq!(result, Value::Obj(expected));
    }

    #[test]
    fn test_stress_mode_does_not_break_execution() {
        let mut vm = Vm::new();
        vm.set_gc_stress(true);
        let result = vm.interpret(
            "var total = \"\";\n\
             for (var i = 0; i < 5; i = i + 1) { total = total + \"x\"; }\n\
             fun wrap(t) { fun read() { return t; } return read; }\n\
             return wrap(total)();",
        );
        let expected = vm.heap_mut().intern("xxxxx");
        assert_eq!(result, Value::Obj(expected));
        assert_ne!(result, Value::Error(ErrorKind::Runtime));
    }
}
