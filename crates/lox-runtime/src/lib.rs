//! lox-runtime - Values, heap objects, bytecode chunks, and the collector.
//!
//! Everything the compiler emits into and the VM executes against lives here:
//!
//! - [`Value`]: the tagged value (nil, boolean, number, heap reference).
//! - [`Object`]: heap object payloads, from interned strings to arrays.
//! - [`Table`]: the open-addressed string-keyed map used for globals,
//!   instance fields, class method tables, and string interning.
//! - [`Chunk`] and [`OpCode`]: bytecode with a per-byte line map and a
//!   constant pool.
//! - [`Heap`]: a slot-arena holding every object, with string interning and
//!   a mark-and-sweep collector driven through explicit-root safepoints.
//!
//! Objects reference each other by arena index ([`ObjRef`]), never by owning
//! pointer, so reference cycles (closures capturing themselves, classes whose
//! methods mention the class) are collected like anything else.

pub mod chunk;
pub mod disasm;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, HeapStats, Marker};
pub use object::{
    Array, BoundMethod, Class, Closure, Function, Instance, LoxStr, Native, NativeCtx,
    NativeError, NativeFn, ObjRef, Object, StrRef, Upvalue,
};
pub use table::Table;
pub use value::{format_number, Value};
