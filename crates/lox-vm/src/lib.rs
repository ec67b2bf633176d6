//! lox-vm - The bytecode virtual machine.
//!
//! A stack machine over the chunks the compiler emits: an operand stack, a
//! call-frame stack, a global table, the open-upvalue list, and the heap. One
//! [`Vm`] value is one interpreter; feeding it source through
//! [`Vm::interpret`] compiles and runs a script against the persistent global
//! environment, which is what makes the REPL work line by line.
//!
//! Program output goes to the output sink, diagnostics to the error sink;
//! both default to stdout/stderr and are injectable for tests.

pub mod natives;

use std::io::Write;
use std::time::Instant;

use thiserror::Error;
use tracing::trace;

use lox_runtime::{
    Array, BoundMethod, Class, Closure, Heap, Instance, NativeCtx, NativeError, NativeFn, ObjRef,
    Object, OpCode, StrRef, Table, Upvalue, Value,
};

/// Call depth limit; one more call is a stack overflow.
pub const FRAMES_MAX: usize = 256;

/// Operand-stack headroom: every frame can address 256 slots.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// How an `interpret` call failed. Diagnostics have already been written to
/// the error sink when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

/// One call: the closure being run, its instruction pointer, and the stack
/// slot its locals start at (slot 0 holds the callee or `this`).
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

/// What a callee turned out to be, copied out of the heap so dispatch can
/// borrow the VM again.
enum Callee {
    Closure(ObjRef),
    Native(NativeFn),
    Bound(Value, ObjRef),
    Class(ObjRef),
    NotCallable,
}

/// The virtual machine.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Upvalues still pointing at live stack slots, sorted by descending
    /// slot index. At most one entry per slot.
    open_upvalues: Vec<ObjRef>,
    init_string: StrRef,
    started: Instant,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A VM writing to stdout/stderr.
    pub fn new() -> Self {
        Self::with_sinks(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    /// A VM with injected output and error sinks.
    pub fn with_sinks(out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            started: Instant::now(),
            out,
            err,
        };
        vm.define_natives();
        vm
    }

    fn define_natives(&mut self) {
        for (name, function) in natives::registry() {
            let name_ref = self.heap.intern(name);
            let native = self.heap.alloc(Object::Native(lox_runtime::Native {
                name,
                function,
            }));
            self.set_global(name_ref, Value::Obj(native));
        }
    }

    /// Read access to the heap, for disassembly and inspection.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access; lets tests flip GC stress mode.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Current operand-stack depth. Zero between clean `interpret` calls.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Compiles and runs one script against this VM's globals.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = self.compile_only(source)?;

        // Fresh execution state; globals and the heap persist across calls.
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        self.push(Value::Obj(function));
        let closure = self.heap.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_value(Value::Obj(closure), 0)?;

        self.run()
    }

    /// Compiles without running; the chunk can then be disassembled.
    pub fn compile_only(&mut self, source: &str) -> Result<ObjRef, InterpretError> {
        let Vm {
            heap,
            globals,
            err,
            init_string,
            ..
        } = self;
        lox_compiler::compile(source, heap, globals, *init_string, err.as_mut())
            .map_err(|_| InterpretError::Compile)
    }

    // ------------------------------------------------------------------
    // Stack primitives
    // ------------------------------------------------------------------

    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        debug_assert!(!self.stack.is_empty(), "operand stack underflow");
        self.stack.pop().unwrap_or(Value::Nil)
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ------------------------------------------------------------------
    // Bytecode reading
    // ------------------------------------------------------------------

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let index = self.frames.len() - 1;
        let frame = self.frames[index];
        let closure = self.heap.closure(frame.closure);
        let byte = self.heap.function(closure.function).chunk.code[frame.ip];
        self.frames[index].ip += 1;
        byte
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    #[inline]
    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frames[self.frames.len() - 1];
        let closure = self.heap.closure(frame.closure);
        self.heap.function(closure.function).chunk.constants[index]
    }

    #[inline]
    fn read_string(&mut self, long: bool) -> StrRef {
        let constant = self.read_constant(long);
        match self.heap.as_string(constant) {
            Some(string) => string,
            None => unreachable!("name constant is not a string"),
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Prints the diagnostic and a stack trace, resets the execution state,
    /// and returns the error to propagate.
    fn runtime_error(&mut self, message: &str) -> InterpretError {
        let _ = writeln!(self.err, "{message}");

        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            // The ip sits one past the instruction that failed.
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            match function.name {
                Some(name) => {
                    let _ = writeln!(self.err, "[line {line}] in {}()", self.heap.str_chars(name));
                }
                None => {
                    let _ = writeln!(self.err, "[line {line}] in script");
                }
            }
        }

        self.reset_stack();
        InterpretError::Runtime
    }

    // ------------------------------------------------------------------
    // Garbage collection safepoint
    // ------------------------------------------------------------------

    /// Collects if the heap asks for it, rooting everything the VM can
    /// reach: the operand stack, the call frames, the globals, the open
    /// upvalues, and the interned `init` name.
    fn maybe_gc(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let Vm {
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            init_string,
            ..
        } = self;
        heap.collect(|marker| {
            for &value in stack.iter() {
                marker.mark_value(value);
            }
            for frame in frames.iter() {
                marker.mark(frame.closure);
            }
            globals.trace(marker);
            for &upvalue in open_upvalues.iter() {
                marker.mark(upvalue);
            }
            marker.mark_str(*init_string);
        });
    }

    // ------------------------------------------------------------------
    // Globals
    // ------------------------------------------------------------------

    /// Table write with byte accounting; returns true when the name was new.
    fn set_global(&mut self, name: StrRef, value: Value) -> bool {
        let hash = self.heap.str_hash(name);
        let before = self.globals.capacity_bytes();
        let is_new = self.globals.set(name, hash, value);
        let grown = self.globals.capacity_bytes() - before;
        if grown > 0 {
            self.heap.add_bytes(grown);
        }
        is_new
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        let callee_kind = match callee.as_obj() {
            Some(reference) => match self.heap.get(reference) {
                Object::Closure(_) => Callee::Closure(reference),
                Object::Native(native) => Callee::Native(native.function),
                Object::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
                Object::Class(_) => Callee::Class(reference),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match callee_kind {
            Callee::Closure(closure) => self.call_closure(closure, arg_count),
            Callee::Native(function) => self.call_native(function, arg_count),
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Class(class) => self.call_class(class, arg_count),
            Callee::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        let arity = {
            let function = self.heap.closure(closure).function;
            self.heap.function(function).arity
        };
        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}");
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        trace!(depth = self.frames.len(), "pushed call frame");
        Ok(())
    }

    fn call_native(&mut self, function: NativeFn, arg_count: usize) -> Result<(), InterpretError> {
        let arg_start = self.stack.len() - arg_count;
        let result = {
            let Vm {
                heap,
                stack,
                started,
                ..
            } = self;
            let mut ctx = NativeCtx {
                heap,
                started: *started,
            };
            function(&mut ctx, &stack[arg_start..])
        };

        match result {
            Ok(value) => {
                self.stack.truncate(arg_start - 1);
                self.push(value);
                Ok(())
            }
            Err(NativeError(message)) => Err(self.runtime_error(&message)),
        }
    }

    /// Calling a class builds an instance and runs `init` if the class has
    /// one; without an initialiser the call must be nullary.
    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), InterpretError> {
        self.maybe_gc();
        let instance = self.heap.alloc(Object::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Obj(instance);

        match self.heap.class_method(class, self.init_string) {
            Some(Value::Obj(init)) => self.call_closure(init, arg_count),
            _ if arg_count != 0 => {
                let message = format!("Expected 0 arguments but got {arg_count}");
                Err(self.runtime_error(&message))
            }
            _ => Ok(()),
        }
    }

    /// `receiver.name(args)`: a field shadowing the method wins; otherwise
    /// dispatch straight off the class, skipping the bound-method object.
    fn invoke(&mut self, name: StrRef, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count);
        let instance = match receiver.as_obj() {
            Some(reference) if matches!(self.heap.get(reference), Object::Instance(_)) => reference,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        if let Some(field) = self.heap.instance_field(instance, name) {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count, receiver)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: StrRef,
        arg_count: usize,
        receiver: Value,
    ) -> Result<(), InterpretError> {
        match self.heap.class_method(class, name) {
            Some(Value::Obj(method)) => self.call_closure(method, arg_count),
            _ => {
                let message = format!(
                    "Undefined property '{}' of object '{}'.",
                    self.heap.str_chars(name),
                    self.heap.stringify(receiver)
                );
                Err(self.runtime_error(&message))
            }
        }
    }

    /// Replaces the receiver on top of the stack with `receiver.name` bound
    /// as a method. Errors exactly when the method is missing.
    fn bind_method(&mut self, class: ObjRef, name: StrRef) -> Result<(), InterpretError> {
        match self.heap.class_method(class, name) {
            Some(Value::Obj(method)) => {
                self.maybe_gc();
                let receiver = self.peek(0);
                let bound = self.heap.alloc(Object::BoundMethod(BoundMethod {
                    receiver,
                    method,
                }));
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            _ => {
                let message = format!(
                    "Undefined property '{}' of object '{}'.",
                    self.heap.str_chars(name),
                    self.heap.stringify(self.peek(0))
                );
                Err(self.runtime_error(&message))
            }
        }
    }

    // ------------------------------------------------------------------
    // Upvalues
    // ------------------------------------------------------------------

    /// Finds or creates the open upvalue for a stack slot, keeping the list
    /// sorted by descending slot index with one entry per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (position, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = match self.heap.upvalue(upvalue) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => continue,
            };
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = position;
                break;
            }
        }

        let created = self.heap.alloc(Object::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `from`: the slot's value moves
    /// into the upvalue, which leaves the open list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(first) {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(first) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Binary operator helpers
    // ------------------------------------------------------------------

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), InterpretError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn binary_arith(&mut self, op: fn(f64, f64) -> f64) -> Result<(), InterpretError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    /// Bitwise and shift operators work on the operands truncated to 64-bit
    /// integers; the result comes back as a double.
    fn binary_bitwise(&mut self, op: fn(i64, i64) -> i64) -> Result<(), InterpretError> {
        let (Some(b), Some(a)) = (self.peek(0).as_number(), self.peek(1).as_number()) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a as i64, b as i64) as f64));
        Ok(())
    }

    // ------------------------------------------------------------------
    // The dispatch loop
    // ------------------------------------------------------------------

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            let byte = self.read_byte();
            let Ok(op) = OpCode::try_from(byte) else {
                let message = format!("Unknown opcode {byte}.");
                return Err(self.runtime_error(&message));
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant(false);
                    self.push(constant);
                }
                OpCode::ConstantLong => {
                    let constant = self.read_constant(true);
                    self.push(constant);
                }
                OpCode::ByteNum => {
                    let value = self.read_byte();
                    self.push(Value::Number(f64::from(value)));
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),

                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }
                OpCode::Gt => self.binary_compare(|a, b| a > b)?,
                OpCode::Lt => self.binary_compare(|a, b| a < b)?,
                OpCode::Gte => self.binary_compare(|a, b| a >= b)?,
                OpCode::Lte => self.binary_compare(|a, b| a <= b)?,

                OpCode::Add => self.add_values()?,
                OpCode::Subtract => self.binary_arith(|a, b| a - b)?,
                OpCode::Multiply => self.binary_arith(|a, b| a * b)?,
                OpCode::Divide => self.binary_arith(|a, b| a / b)?,
                OpCode::ShiftLeft => self.binary_bitwise(|a, b| a.wrapping_shl(b as u32))?,
                OpCode::ShiftRight => self.binary_bitwise(|a, b| a.wrapping_shr(b as u32))?,
                OpCode::BitOr => self.binary_bitwise(|a, b| a | b)?,
                OpCode::BitXor => self.binary_bitwise(|a, b| a ^ b)?,
                OpCode::BitAnd => self.binary_bitwise(|a, b| a & b)?,

                OpCode::Negate => {
                    let Some(value) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-value));
                }
                OpCode::Invert => {
                    // Bitwise-not modelled as -x - 1; exact only for
                    // integer-valued operands.
                    let Some(value) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-value - 1.0));
                }
                OpCode::Not => {
                    let value = self.pop();
                    let falsey = self.heap.is_falsey(value);
                    self.push(Value::Bool(falsey));
                }

                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_string(op == OpCode::DefineGlobalLong);
                    let value = self.peek(0);
                    self.set_global(name, value);
                    self.pop();
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_string(op == OpCode::GetGlobalLong);
                    let hash = self.heap.str_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.str_chars(name));
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_string(op == OpCode::SetGlobalLong);
                    let value = self.peek(0);
                    if self.set_global(name, value) {
                        // Assignment must not create globals; undo the insert.
                        let hash = self.heap.str_hash(name);
                        self.globals.delete(name, hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.str_chars(name));
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames[self.frames.len() - 1].base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames[self.frames.len() - 1].base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frames[self.frames.len() - 1].closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack[*slot],
                        Upvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let closure = self.frames[self.frames.len() - 1].closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = self.peek(0);
                    let open_slot = match self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => Some(*slot),
                        Upvalue::Closed(_) => None,
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = value,
                        None => *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value),
                    }
                }

                OpCode::GetProperty | OpCode::GetPropertyLong => {
                    let name = self.read_string(op == OpCode::GetPropertyLong);
                    let receiver = self.peek(0);
                    let instance = match receiver.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    if let Some(value) = self.heap.instance_field(instance, name) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty | OpCode::SetPropertyLong => {
                    let name = self.read_string(op == OpCode::SetPropertyLong);
                    let receiver = self.peek(1);
                    let instance = match receiver.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Instance(_)) => r,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let value = self.peek(0);
                    self.heap.set_instance_field(instance, name, value);
                    // The assignment expression evaluates to the value.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper | OpCode::GetSuperLong => {
                    let name = self.read_string(op == OpCode::GetSuperLong);
                    let superclass = self.pop();
                    let class = match superclass.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    self.bind_method(class, name)?;
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    let condition = self.peek(0);
                    if self.heap.is_falsey(condition) {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    let condition = self.peek(0);
                    if !self.heap.is_falsey(condition) {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset;
                    }
                }
                OpCode::JumpBackwards => {
                    let offset = self.read_u16() as usize;
                    let index = self.frames.len() - 1;
                    self.frames[index].ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke | OpCode::InvokeLong => {
                    let name = self.read_string(op == OpCode::InvokeLong);
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke | OpCode::SuperInvokeLong => {
                    let name = self.read_string(op == OpCode::SuperInvokeLong);
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop();
                    let class = match superclass.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let receiver = self.peek(arg_count);
                    self.invoke_from_class(class, name, arg_count, receiver)?;
                }

                OpCode::Closure | OpCode::ClosureLong => {
                    self.maybe_gc();
                    let constant = self.read_constant(op == OpCode::ClosureLong);
                    let function = match constant.as_obj() {
                        Some(r) => r,
                        None => unreachable!("closure constant is not a function"),
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let frame = self.frames[self.frames.len() - 1];
                        if is_local {
                            upvalues.push(self.capture_upvalue(frame.base + index));
                        } else {
                            upvalues.push(self.heap.closure(frame.closure).upvalues[index]);
                        }
                    }
                    let closure = self.heap.alloc(Object::Closure(Closure {
                        function,
                        upvalues,
                    }));
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames[self.frames.len() - 1];
                    self.close_upvalues(frame.base);
                    self.frames.pop();
                    trace!(depth = self.frames.len(), "popped call frame");
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
                OpCode::ReturnNil => {
                    let frame = self.frames[self.frames.len() - 1];
                    self.close_upvalues(frame.base);
                    self.frames.pop();
                    trace!(depth = self.frames.len(), "popped call frame");
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(Value::Nil);
                }

                OpCode::Subscript => {
                    let count = self.read_byte();
                    if count != 1 {
                        let message = format!("Expected 1 subscript index but got {count}.");
                        return Err(self.runtime_error(&message));
                    }
                    let (array, index) = self.subscript_target(0)?;
                    let value = self.heap.array(array).items[index];
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::SubscriptAssign => {
                    let count = self.read_byte();
                    if count != 1 {
                        let message = format!("Expected 1 subscript index but got {count}.");
                        return Err(self.runtime_error(&message));
                    }
                    let value = self.peek(0);
                    let (array, index) = self.subscript_target(1)?;
                    self.heap.array_mut(array).items[index] = value;
                    let value = self.pop();
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::NewArray => {
                    let count = self.read_byte() as usize;
                    self.maybe_gc();
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    let array = self.heap.alloc(Object::Array(Array { items }));
                    self.push(Value::Obj(array));
                }

                OpCode::Class | OpCode::ClassLong => {
                    let name = self.read_string(op == OpCode::ClassLong);
                    self.maybe_gc();
                    let class = self.heap.alloc(Object::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let parent = match superclass.as_obj() {
                        Some(r) if matches!(self.heap.get(r), Object::Class(_)) => r,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let child = match self.peek(0).as_obj() {
                        Some(r) => r,
                        None => unreachable!("inherit without a class on the stack"),
                    };
                    self.heap.inherit_methods(parent, child);
                    self.pop();
                }
                OpCode::Method | OpCode::MethodLong => {
                    let name = self.read_string(op == OpCode::MethodLong);
                    let method = self.peek(0);
                    let class = match self.peek(1).as_obj() {
                        Some(r) => r,
                        None => unreachable!("method without a class on the stack"),
                    };
                    self.heap.define_method(class, name, method);
                    self.pop();
                }

                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.stringify(value);
                    let _ = writeln!(self.out, "{text}");
                }
                OpCode::Pop => {
                    self.pop();
                }
            }
        }
    }

    /// `Add` concatenates when either operand is a string (stringifying the
    /// other), adds when both are numbers, and errors otherwise.
    fn add_values(&mut self) -> Result<(), InterpretError> {
        let b = self.peek(0);
        let a = self.peek(1);
        let either_string =
            self.heap.as_string(a).is_some() || self.heap.as_string(b).is_some();

        if either_string {
            self.maybe_gc();
            let text = format!("{}{}", self.heap.stringify(a), self.heap.stringify(b));
            let result = self.heap.intern_value(&text);
            self.pop();
            self.pop();
            self.push(result);
            Ok(())
        } else if a.is_number() && b.is_number() {
            self.binary_arith(|a, b| a + b)
        } else {
            Err(self.runtime_error("Operands must be numbers or strings."))
        }
    }

    /// Validates an `array[index]` pair sitting at `depth` (0 for reads, 1
    /// for writes, with the stored value above). Returns the array and the
    /// in-range element index.
    fn subscript_target(&mut self, depth: usize) -> Result<(ObjRef, usize), InterpretError> {
        let index_value = self.peek(depth);
        let target = self.peek(depth + 1);

        let array = match target.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Array(_)) => r,
            _ => return Err(self.runtime_error("Can only subscript arrays.")),
        };
        let Some(number) = index_value.as_number() else {
            return Err(self.runtime_error("Array index must be a number."));
        };
        // C-style truncation toward zero.
        let index = number as i64;
        let length = self.heap.array(array).items.len();
        if index < 0 || index as usize >= length {
            return Err(self.runtime_error("Array index out of range."));
        }
        Ok((array, index as usize))
    }
}
