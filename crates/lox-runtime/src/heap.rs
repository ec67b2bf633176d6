//! The object heap and its mark-and-sweep collector.
//!
//! All heap objects live in a slot arena and point at each other through
//! [`ObjRef`] indices. Collection never runs inside an allocation: callers
//! poll [`Heap::should_collect`] at their safepoints and invoke
//! [`Heap::collect`] with a closure that marks their roots. Between
//! safepoints nothing is freed, so freshly allocated objects cannot be swept
//! before the caller has anchored them.
//!
//! The intern table is weak: its keys are purged before the sweep when the
//! string was not otherwise reachable.

use std::mem;

use tracing::debug;

use crate::object::{Array, Class, Closure, Function, Instance, LoxStr, ObjRef, Object, StrRef, Upvalue};
use crate::table::Table;
use crate::value::{format_number, Value};
use lox_util::fnv1a;

/// Collect once allocations pass this many bytes, before any collection has
/// tuned the threshold.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// After a collection the threshold is the surviving byte count times this.
const HEAP_GROW_FACTOR: usize = 2;

/// Snapshot of heap counters.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub live_objects: usize,
    pub collections: u64,
}

/// The arena of heap objects plus collector state.
pub struct Heap {
    slots: Vec<Option<Object>>,
    free: Vec<u32>,
    marks: Vec<bool>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    collections: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            marks: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress: false,
            collections: 0,
        }
    }

    /// Forces a collection at every safepoint. Test-only knob for shaking
    /// out missing roots.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            live_objects: self.slots.iter().flatten().count(),
            collections: self.collections,
        }
    }

    /// Records storage growth that happened inside an already-allocated
    /// object (table resizes in particular), keeping the byte counter
    /// honest.
    pub fn add_bytes(&mut self, delta: usize) {
        self.bytes_allocated += delta;
    }

    // ------------------------------------------------------------------
    // Allocation and interning
    // ------------------------------------------------------------------

    /// Moves an object into the arena and returns its reference.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.bytes_allocated += object_size(&object);
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(object);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(object));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Interns a string: returns the existing object for this content, or
    /// allocates one and registers it in the intern table.
    pub fn intern(&mut self, text: &str) -> StrRef {
        let hash = fnv1a(text.as_bytes());
        let slots = &self.slots;
        let existing = self.strings.find_string(text, hash, |key| {
            match &slots[key.as_obj().0 as usize] {
                Some(Object::String(s)) => &s.chars,
                _ => "",
            }
        });
        if let Some(found) = existing {
            return found;
        }

        let reference = StrRef(self.alloc(Object::String(LoxStr {
            chars: text.into(),
            hash,
        })));
        let before = self.strings.capacity_bytes();
        self.strings.set(reference, hash, Value::Nil);
        self.bytes_allocated += self.strings.capacity_bytes() - before;
        reference
    }

    /// Interns a string and wraps it as a value.
    pub fn intern_value(&mut self, text: &str) -> Value {
        self.intern(text).into()
    }

    // ------------------------------------------------------------------
    // Object access
    // ------------------------------------------------------------------

    pub fn get(&self, reference: ObjRef) -> &Object {
        match &self.slots[reference.0 as usize] {
            Some(object) => object,
            None => unreachable!("use of collected object {}", reference.0),
        }
    }

    pub fn get_mut(&mut self, reference: ObjRef) -> &mut Object {
        match &mut self.slots[reference.0 as usize] {
            Some(object) => object,
            None => unreachable!("use of collected object {}", reference.0),
        }
    }

    pub fn string(&self, reference: StrRef) -> &LoxStr {
        match self.get(reference.0) {
            Object::String(s) => s,
            _ => unreachable!("string reference to non-string"),
        }
    }

    pub fn str_chars(&self, reference: StrRef) -> &str {
        &self.string(reference).chars
    }

    pub fn str_hash(&self, reference: StrRef) -> u32 {
        self.string(reference).hash
    }

    pub fn function(&self, reference: ObjRef) -> &Function {
        match self.get(reference) {
            Object::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, reference: ObjRef) -> &Closure {
        match self.get(reference) {
            Object::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn class(&self, reference: ObjRef) -> &Class {
        match self.get(reference) {
            Object::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn array(&self, reference: ObjRef) -> &Array {
        match self.get(reference) {
            Object::Array(a) => a,
            _ => unreachable!("expected array object"),
        }
    }

    pub fn array_mut(&mut self, reference: ObjRef) -> &mut Array {
        match self.get_mut(reference) {
            Object::Array(a) => a,
            _ => unreachable!("expected array object"),
        }
    }

    pub fn upvalue(&self, reference: ObjRef) -> &Upvalue {
        match self.get(reference) {
            Object::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, reference: ObjRef) -> &mut Upvalue {
        match self.get_mut(reference) {
            Object::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    /// The string behind a value, if it is one.
    pub fn as_string(&self, value: Value) -> Option<StrRef> {
        match value {
            Value::Obj(r) => match self.get(r) {
                Object::String(_) => Some(StrRef(r)),
                _ => None,
            },
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Mutation helpers with byte accounting
    // ------------------------------------------------------------------

    /// Sets a field on an instance, charging any table growth to the heap.
    pub fn set_instance_field(&mut self, instance: ObjRef, name: StrRef, value: Value) {
        let hash = self.str_hash(name);
        let Heap {
            slots,
            bytes_allocated,
            ..
        } = self;
        let fields = match &mut slots[instance.0 as usize] {
            Some(Object::Instance(inst)) => &mut inst.fields,
            _ => unreachable!("expected instance object"),
        };
        let before = fields.capacity_bytes();
        fields.set(name, hash, value);
        *bytes_allocated += fields.capacity_bytes() - before;
    }

    /// Reads a field off an instance.
    pub fn instance_field(&self, instance: ObjRef, name: StrRef) -> Option<Value> {
        let hash = self.str_hash(name);
        match self.get(instance) {
            Object::Instance(inst) => inst.fields.get(name, hash),
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance(&self, reference: ObjRef) -> &Instance {
        match self.get(reference) {
            Object::Instance(inst) => inst,
            _ => unreachable!("expected instance object"),
        }
    }

    /// Binds `name` to `method` in a class's method table.
    pub fn define_method(&mut self, class: ObjRef, name: StrRef, method: Value) {
        let hash = self.str_hash(name);
        let Heap {
            slots,
            bytes_allocated,
            ..
        } = self;
        let methods = match &mut slots[class.0 as usize] {
            Some(Object::Class(c)) => &mut c.methods,
            _ => unreachable!("expected class object"),
        };
        let before = methods.capacity_bytes();
        methods.set(name, hash, method);
        *bytes_allocated += methods.capacity_bytes() - before;
    }

    /// Looks a method up on a class.
    pub fn class_method(&self, class: ObjRef, name: StrRef) -> Option<Value> {
        let hash = self.str_hash(name);
        match self.get(class) {
            Object::Class(c) => c.methods.get(name, hash),
            _ => unreachable!("expected class object"),
        }
    }

    /// Copies every method of `superclass` into `subclass`. Overrides happen
    /// later, by redefinition.
    pub fn inherit_methods(&mut self, superclass: ObjRef, subclass: ObjRef) {
        let inherited: Vec<_> = match self.get(superclass) {
            Object::Class(c) => c.methods.iter_with_hash().collect(),
            _ => unreachable!("expected class object"),
        };
        let Heap {
            slots,
            bytes_allocated,
            ..
        } = self;
        let methods = match &mut slots[subclass.0 as usize] {
            Some(Object::Class(c)) => &mut c.methods,
            _ => unreachable!("expected class object"),
        };
        let before = methods.capacity_bytes();
        for (name, hash, method) in inherited {
            methods.set(name, hash, method);
        }
        *bytes_allocated += methods.capacity_bytes() - before;
    }

    // ------------------------------------------------------------------
    // Value predicates and rendering
    // ------------------------------------------------------------------

    /// Runtime truthiness: `nil`, `false`, `0`, and the empty string are
    /// falsey; everything else is truthy.
    pub fn is_falsey(&self, value: Value) -> bool {
        match value {
            Value::Nil => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n == 0.0,
            Value::Obj(r) => matches!(self.get(r), Object::String(s) if s.chars.is_empty()),
        }
    }

    /// Human-readable form of any value, used by `print`, `toString`, and
    /// diagnostics.
    pub fn stringify(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.stringify_object(r),
        }
    }

    fn stringify_object(&self, reference: ObjRef) -> String {
        match self.get(reference) {
            Object::String(s) => s.chars.to_string(),
            Object::Function(f) => self.function_label(f),
            Object::Closure(c) => self.function_label(self.function(c.function)),
            Object::Class(c) => format!("<class {}>", self.str_chars(c.name)),
            Object::Instance(inst) => {
                let class_name = match self.get(inst.class) {
                    Object::Class(c) => self.str_chars(c.name),
                    _ => "instance",
                };
                format!("<{class_name} instance at 0x{:x}>", reference.0)
            }
            Object::BoundMethod(bound) => {
                let method_name = match self.function(self.closure_function(bound.method)).name {
                    Some(name) => self.str_chars(name).to_string(),
                    None => "<anonymous>".to_string(),
                };
                format!(
                    "<bound method {method_name} of object '{}'>",
                    self.stringify(bound.receiver)
                )
            }
            Object::Native(_) => "<native fun>".to_string(),
            Object::Upvalue(_) => "upvalue".to_string(),
            Object::Array(a) => format!("<array of length {}>", a.items.len()),
        }
    }

    fn function_label(&self, function: &Function) -> String {
        match function.name {
            Some(name) => format!("<fun {}>", self.str_chars(name)),
            None => "<script>".to_string(),
        }
    }

    fn closure_function(&self, closure: ObjRef) -> ObjRef {
        match self.get(closure) {
            Object::Closure(c) => c.function,
            _ => unreachable!("expected closure object"),
        }
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// True when the next safepoint should collect.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Runs a full mark-and-sweep cycle. `mark_roots` receives a [`Marker`]
    /// and must mark every root the caller holds; everything reachable from
    /// the marked set survives, everything else is freed.
    pub fn collect(&mut self, mark_roots: impl FnOnce(&mut Marker<'_>)) {
        let before = self.bytes_allocated;

        self.marks.clear();
        self.marks.resize(self.slots.len(), false);
        let mut gray: Vec<ObjRef> = Vec::new();

        {
            let mut marker = Marker {
                marks: &mut self.marks,
                gray: &mut gray,
            };
            mark_roots(&mut marker);
        }

        // Trace: blacken gray objects until the worklist drains.
        while let Some(reference) = gray.pop() {
            let Heap { slots, marks, .. } = &mut *self;
            let mut marker = Marker {
                marks,
                gray: &mut gray,
            };
            if let Some(object) = &slots[reference.0 as usize] {
                object.trace(&mut marker);
            }
        }

        // The intern table must not keep strings alive on its own.
        let marks = &self.marks;
        self.strings.retain_keys(|key| marks[key.as_obj().0 as usize]);

        // Sweep.
        let mut freed = 0usize;
        let Heap {
            slots,
            marks,
            free,
            bytes_allocated,
            ..
        } = self;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_some() && !marks[index] {
                if let Some(object) = slot.take() {
                    let size = object_size(&object);
                    debug_assert!(*bytes_allocated >= size, "byte accounting drifted");
                    *bytes_allocated = bytes_allocated.saturating_sub(size);
                    free.push(index as u32);
                    freed += 1;
                }
            }
        }

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        self.collections += 1;
        debug!(
            bytes_before = before,
            bytes_after = self.bytes_allocated,
            freed,
            next_gc = self.next_gc,
            "garbage collection finished"
        );
    }
}

/// Marks objects live during a collection cycle.
pub struct Marker<'a> {
    marks: &'a mut Vec<bool>,
    gray: &'a mut Vec<ObjRef>,
}

impl Marker<'_> {
    /// Marks one object and queues it for tracing.
    pub fn mark(&mut self, reference: ObjRef) {
        let index = reference.0 as usize;
        if !self.marks[index] {
            self.marks[index] = true;
            self.gray.push(reference);
        }
    }

    pub fn mark_str(&mut self, reference: StrRef) {
        self.mark(reference.0);
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(reference) = value {
            self.mark(reference);
        }
    }
}

/// Approximate retained size of an object: the enum itself plus owned
/// storage. Computed identically at allocation and at sweep; growth in
/// between is reported through [`Heap::add_bytes`] by the mutation helpers.
fn object_size(object: &Object) -> usize {
    let payload = match object {
        Object::String(s) => s.chars.len(),
        Object::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * mem::size_of::<u32>()
                + f.chunk.constants.capacity() * mem::size_of::<Value>()
        }
        Object::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjRef>(),
        Object::Class(c) => c.methods.capacity_bytes(),
        Object::Instance(i) => i.fields.capacity_bytes(),
        Object::Array(a) => a.items.capacity() * mem::size_of::<Value>(),
        Object::Upvalue(_) | Object::BoundMethod(_) | Object::Native(_) => 0,
    };
    mem::size_of::<Object>() + payload
}
