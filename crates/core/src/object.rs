//! Heap objects and the object store.
//!
//! All reference values live in a single [`Heap`]: a slab of object slots
//! addressed by [`ObjRef`] handles. Handles are plain indices, so handle
//! equality is object identity, and intra-object edges (a closure's
//! function, an upvalue chain) are handles rather than owned pointers.
//! Every live object is also threaded onto an intrusive all-objects list
//! so shutdown and the collector's sweep can walk the whole heap.
//!
//! The heap owns the string intern table: equal-content strings are
//! stored exactly once, which is what makes identity equality correct
//! for strings.

use std::time::Instant;

use crate::chunk::Chunk;
use crate::table::{Table, hash_str};
use crate::value::Value;

/// Handle to a heap object. Equality is object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Context handed to native functions: heap access for allocating result
/// objects, plus the instant the VM started (for `clock`).
pub struct NativeContext<'a> {
    pub heap: &'a mut Heap,
    pub started: Instant,
}

/// A host function callable from Lox code.
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Value;

/// Where an upvalue's variable currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    /// Still on the value stack, at this slot.
    Open(usize),
    /// Hoisted off the stack; the upvalue owns the value now.
    Closed(Value),
}

/// A compiled function: immutable once the compiler finishes it.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script.
    pub name: Option<ObjRef>,
}

#[derive(Debug)]
pub enum ObjKind {
    String {
        text: Box<str>,
        hash: u32,
    },
    Function(Function),
    Native {
        function: NativeFn,
        arity: u8,
        name: ObjRef,
    },
    Closure {
        function: ObjRef,
        upvalues: Vec<ObjRef>,
    },
    Upvalue {
        state: UpvalueState,
        next_open: Option<ObjRef>,
    },
}

/// Object header plus payload. `next` threads the all-objects list;
/// `marked` belongs to the collector.
#[derive(Debug)]
pub struct Obj {
    pub kind: ObjKind,
    pub next: Option<ObjRef>,
    pub marked: bool,
}

/// The object store.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    head: Option<ObjRef>,
    /// Intern set: every live string, keyed by itself (value unused).
    pub strings: Table,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    /// Allocate an object, thread it onto the all-objects list, and
    /// return its handle.
    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        let obj = Obj {
            kind,
            next: self.head,
            marked: false,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                index
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };
        let handle = ObjRef(index);
        self.head = Some(handle);
        handle
    }

    pub fn get(&self, handle: ObjRef) -> &Obj {
        self.slots[handle.index()]
            .as_ref()
            .expect("stale object handle")
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        self.slots[handle.index()]
            .as_mut()
            .expect("stale object handle")
    }

    /// Objects currently linked on the all-objects list.
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn string_text(&self, handle: ObjRef) -> &str {
        match &self.get(handle).kind {
            ObjKind::String { text, .. } => text,
            _ => panic!("handle is not a string"),
        }
    }

    pub fn string_hash(&self, handle: ObjRef) -> u32 {
        match &self.get(handle).kind {
            ObjKind::String { hash, .. } => *hash,
            _ => panic!("handle is not a string"),
        }
    }

    pub fn function(&self, handle: ObjRef) -> &Function {
        match &self.get(handle).kind {
            ObjKind::Function(function) => function,
            _ => panic!("handle is not a function"),
        }
    }

    /// The function a closure wraps.
    pub fn closure_function(&self, closure: ObjRef) -> ObjRef {
        match &self.get(closure).kind {
            ObjKind::Closure { function, .. } => *function,
            _ => panic!("handle is not a closure"),
        }
    }

    pub fn closure_upvalue(&self, closure: ObjRef, index: usize) -> ObjRef {
        match &self.get(closure).kind {
            ObjKind::Closure { upvalues, .. } => upvalues[index],
            _ => panic!("handle is not a closure"),
        }
    }

    pub fn push_closure_upvalue(&mut self, closure: ObjRef, upvalue: ObjRef) {
        match &mut self.get_mut(closure).kind {
            ObjKind::Closure { upvalues, .. } => upvalues.push(upvalue),
            _ => panic!("handle is not a closure"),
        }
    }

    pub fn is_string(&self, handle: ObjRef) -> bool {
        matches!(self.get(handle).kind, ObjKind::String { .. })
    }

    pub fn upvalue_state(&self, handle: ObjRef) -> UpvalueState {
        match &self.get(handle).kind {
            ObjKind::Upvalue { state, .. } => *state,
            _ => panic!("handle is not an upvalue"),
        }
    }

    pub fn set_upvalue_state(&mut self, handle: ObjRef, new_state: UpvalueState) {
        match &mut self.get_mut(handle).kind {
            ObjKind::Upvalue { state, .. } => *state = new_state,
            _ => panic!("handle is not an upvalue"),
        }
    }

    pub fn upvalue_next_open(&self, handle: ObjRef) -> Option<ObjRef> {
        match &self.get(handle).kind {
            ObjKind::Upvalue { next_open, .. } => *next_open,
            _ => panic!("handle is not an upvalue"),
        }
    }

    pub fn set_upvalue_next_open(&mut self, handle: ObjRef, next: Option<ObjRef>) {
        match &mut self.get_mut(handle).kind {
            ObjKind::Upvalue { next_open, .. } => *next_open = next,
            _ => panic!("handle is not an upvalue"),
        }
    }

    /// Intern-first string creation: return the existing object for this
    /// content if one lives in the intern table, otherwise allocate,
    /// register, and return a new one.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_str(text);
        let Heap { slots, strings, .. } = self;
        let existing = strings.find_string(hash, |candidate| {
            match slots[candidate.index()].as_ref().map(|obj| &obj.kind) {
                Some(ObjKind::String {
                    text: candidate_text,
                    hash: candidate_hash,
                }) => {
                    *candidate_hash == hash
                        && candidate_text.len() == text.len()
                        && &**candidate_text == text
                }
                _ => false,
            }
        });
        if let Some(found) = existing {
            return found;
        }
        let handle = self.alloc(ObjKind::String {
            text: text.into(),
            hash,
        });
        self.strings.set(handle, hash, Value::Bool(true));
        handle
    }

    /// Concatenate two interned strings, interning the result.
    pub fn concat(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let mut text = String::with_capacity(self.string_text(a).len() + self.string_text(b).len());
        text.push_str(self.string_text(a));
        text.push_str(self.string_text(b));
        self.intern(&text)
    }

    /// Intern-first concatenation of raw parts; same protocol as
    /// [`Heap::concat`] without requiring the parts to be interned.
    pub fn concat_parts(&mut self, a: &str, b: &str) -> ObjRef {
        let mut text = String::with_capacity(a.len() + b.len());
        text.push_str(a);
        text.push_str(b);
        self.intern(&text)
    }

    /// Release one object's slot. Strings leave the intern table first;
    /// per-kind payloads (chunk, upvalue array, text) drop with the slot.
    pub fn free_object(&mut self, handle: ObjRef) {
        if let Some(Obj {
            kind: ObjKind::String { hash, .. },
            ..
        }) = &self.slots[handle.index()]
        {
            let hash = *hash;
            self.strings.delete(handle, hash);
        }
        self.slots[handle.index()] = None;
        self.free.push(handle.0);
    }

    /// Walk the all-objects list and release everything. Shutdown path.
    pub fn free_objects(&mut self) {
        let mut current = self.head;
        while let Some(handle) = current {
            current = self.get(handle).next;
            self.free_object(handle);
        }
        self.head = None;
        self.strings = Table::new();
    }

    /// Release every unmarked object, clear the marks of the survivors,
    /// and return how many were freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: Option<ObjRef> = None;
        let mut current = self.head;
        while let Some(handle) = current {
            let obj = self.get(handle);
            let next = obj.next;
            if obj.marked {
                self.get_mut(handle).marked = false;
                previous = Some(handle);
            } else {
                match previous {
                    Some(prev) => self.get_mut(prev).next = next,
                    None => self.head = next,
                }
                self.free_object(handle);
                freed += 1;
            }
            current = next;
        }
        freed
    }
}
