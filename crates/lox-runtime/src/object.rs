//! Heap object payloads.
//!
//! The C rendition of this object model carries a per-object header (type
//! tag, mark bit, intrusive free-list pointer). Here the tag is the enum
//! discriminant, mark bits live in a side bitmap owned by the heap, and the
//! object list is the arena itself; see [`crate::heap`].

use std::time::Instant;

use crate::chunk::Chunk;
use crate::heap::{Heap, Marker};
use crate::table::Table;
use crate::value::Value;

/// Index of a heap object in the arena. Copyable, pointer-sized-or-smaller,
/// and only meaningful against the heap that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// Arena slot index; stable for the object's lifetime, reused after it
    /// is collected. Doubles as the identity shown in stringified instances.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A reference known to point at an interned string.
///
/// Produced only by [`Heap::intern`], so two `StrRef`s are equal exactly when
/// their contents are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrRef(pub(crate) ObjRef);

impl StrRef {
    pub fn as_obj(self) -> ObjRef {
        self.0
    }
}

impl From<StrRef> for ObjRef {
    fn from(s: StrRef) -> ObjRef {
        s.0
    }
}

impl From<StrRef> for Value {
    fn from(s: StrRef) -> Value {
        Value::Obj(s.0)
    }
}

/// Every kind of heap object.
#[derive(Debug)]
pub enum Object {
    String(LoxStr),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Native(Native),
    Array(Array),
}

/// An interned, immutable string with its FNV-1a hash precomputed at
/// interning time.
#[derive(Debug)]
pub struct LoxStr {
    pub chars: Box<str>,
    pub hash: u32,
}

/// Compiled function: arity, upvalue layout, optional name, and its code.
#[derive(Debug)]
pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    pub name: Option<StrRef>,
    pub chunk: Chunk,
}

/// A function paired with the upvalues it captured at creation.
///
/// The upvalue vector is fully built before the closure is allocated, so
/// every entry is always a live `Upvalue` object.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable: open while its stack slot is live, closed once the
/// slot has been popped and the value moved into the upvalue itself.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A class: name plus method table (name -> closure).
#[derive(Debug)]
pub struct Class {
    pub name: StrRef,
    pub methods: Table,
}

/// An instance: class reference plus field table.
#[derive(Debug)]
pub struct Instance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method closure bound to the receiver it was accessed through.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A built-in function implemented by the host.
#[derive(Debug)]
pub struct Native {
    pub name: &'static str,
    pub function: NativeFn,
}

/// A dynamic array of values.
#[derive(Debug)]
pub struct Array {
    pub items: Vec<Value>,
}

/// Signature of a built-in. Arguments arrive as a slice of the operand
/// stack; an `Err` is surfaced by the VM as a runtime error carrying the
/// native's message.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, NativeError>;

/// What a native gets to work with: the heap (for allocation, interning,
/// and object access) and the VM start time.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub started: Instant,
}

/// A failed native call. The message becomes the runtime-error diagnostic.
#[derive(Debug, PartialEq, Eq)]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl Object {
    /// Marks every object this one references. Strings and natives are
    /// leaves.
    pub fn trace(&self, marker: &mut Marker<'_>) {
        match self {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(function) => {
                if let Some(name) = function.name {
                    marker.mark_str(name);
                }
                for &constant in &function.chunk.constants {
                    marker.mark_value(constant);
                }
            }
            Object::Closure(closure) => {
                marker.mark(closure.function);
                for &upvalue in &closure.upvalues {
                    marker.mark(upvalue);
                }
            }
            Object::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    marker.mark_value(*value);
                }
            }
            Object::Class(class) => {
                marker.mark_str(class.name);
                class.methods.trace(marker);
            }
            Object::Instance(instance) => {
                marker.mark(instance.class);
                instance.fields.trace(marker);
            }
            Object::BoundMethod(bound) => {
                marker.mark_value(bound.receiver);
                marker.mark(bound.method);
            }
            Object::Array(array) => {
                for &item in &array.items {
                    marker.mark_value(item);
                }
            }
        }
    }
}
