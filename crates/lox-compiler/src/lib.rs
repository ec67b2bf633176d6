//! lox-compiler - Single-pass Pratt compiler from source text to bytecode.
//!
//! There is no AST: the compiler pulls tokens from the scanner and emits
//! instructions into the current function's chunk as it parses. Nested
//! function bodies push a fresh [`FuncState`] (its own chunk, locals,
//! upvalues, and loop stack) onto a stack of in-flight functions; when a body
//! ends, the finished function object lands in the enclosing chunk's constant
//! pool behind a closure instruction.
//!
//! The in-flight function stack is also the compiler's GC root set: interning
//! an identifier can trigger a collection, and everything already sitting in
//! a half-built constant pool has to survive it.

mod expr;
mod stmt;

#[cfg(test)]
mod edge_cases;

use std::io::Write;

use rustc_hash::FxHashMap;
use thiserror::Error;

use lox_lex::{Scanner, Token, TokenKind};
use lox_runtime::{Chunk, Function, Heap, ObjRef, Object, OpCode, StrRef, Table, Value};
use lox_util::{ErrorReporter, Location};

/// Hard limits shared with the VM's instruction encoding.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_NESTED_LOOPS: usize = 256;
const MAX_CONSTANTS: usize = u16::MAX as usize + 1;

/// Compilation failed; diagnostics already went to the error sink.
#[derive(Debug, Error)]
#[error("compilation failed with {errors} error(s)")]
pub struct CompileError {
    pub errors: usize,
}

/// Compiles a script, returning the top-level function object.
///
/// `globals` and `init_string` are the VM-owned roots that must survive any
/// collection triggered mid-compile; the operand stack is empty while the
/// compiler runs, so together with the in-flight function stack they are the
/// complete root set.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    globals: &Table,
    init_string: StrRef,
    err: &mut dyn Write,
) -> Result<ObjRef, CompileError> {
    let reporter = ErrorReporter::new(err);
    let placeholder = Token::new(TokenKind::Eof, "", 0);
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        current: placeholder,
        previous: placeholder,
        panic_mode: false,
        reporter,
        heap,
        globals,
        init_string,
        states: vec![FuncState::new(FuncKind::Script, None)],
        classes: Vec::new(),
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();

    if compiler.reporter.had_errors() {
        Err(CompileError {
            errors: compiler.reporter.error_count(),
        })
    } else {
        Ok(function)
    }
}

/// Operator precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Comparison, // < > <= >=
    Shift,      // << >>
    Term,       // + -
    Factor,     // * /
    Unary,      // ! - ~
    Call,       // . () []
    Primary,
}

impl Precedence {
    /// The next-tighter level, used for left-associative infix parsing.
    pub(crate) fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FuncKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot. `depth == -1` marks "declared but not yet
/// initialised", which is how reads inside the initialiser are caught.
pub(crate) struct Local<'src> {
    pub name: &'src str,
    pub depth: i32,
    pub captured: bool,
}

/// One upvalue a function captures: a local slot of the enclosing function,
/// or one of the enclosing function's own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvalueSpec {
    pub index: u8,
    pub is_local: bool,
}

/// An enclosing loop: where `continue` jumps back to, the pending `break`
/// jump, and the scope depth at loop entry so `break` can discard the body's
/// locals.
pub(crate) struct LoopFrame {
    pub start: usize,
    pub break_jump: Option<usize>,
    pub depth: i32,
}

/// Per-function compile state: the function being built plus everything the
/// parser needs to resolve names inside it.
pub(crate) struct FuncState<'src> {
    pub kind: FuncKind,
    pub name: Option<StrRef>,
    pub arity: usize,
    pub chunk: Chunk,
    pub locals: Vec<Local<'src>>,
    pub upvalues: Vec<UpvalueSpec>,
    pub loops: Vec<LoopFrame>,
    pub scope_depth: i32,
    /// Dedupes string constants within this chunk's pool.
    pub string_constants: FxHashMap<StrRef, u16>,
}

impl<'src> FuncState<'src> {
    fn new(kind: FuncKind, name: Option<StrRef>) -> Self {
        // Slot 0 belongs to the callee; methods and initialisers expose it
        // as `this`.
        let slot_zero = Local {
            name: if matches!(kind, FuncKind::Method | FuncKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            captured: false,
        };
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            loops: Vec::new(),
            scope_depth: 0,
            string_constants: FxHashMap::default(),
        }
    }
}

/// Per-class compile state, for `this`/`super` validity checks.
pub(crate) struct ClassState {
    pub has_superclass: bool,
}

pub(crate) struct Compiler<'src, 'ctx> {
    pub scanner: Scanner<'src>,
    pub current: Token<'src>,
    pub previous: Token<'src>,
    pub panic_mode: bool,
    pub reporter: ErrorReporter<'ctx>,
    pub heap: &'ctx mut Heap,
    pub globals: &'ctx Table,
    pub init_string: StrRef,
    pub states: Vec<FuncState<'src>>,
    pub classes: Vec<ClassState>,
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    pub(crate) fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub(crate) fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    pub(crate) fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => Location::AtEnd,
            TokenKind::Error => Location::Bare,
            _ => Location::At(token.lexeme),
        };
        self.reporter.report(token.line, location, message);
    }

    // ------------------------------------------------------------------
    // Function state access
    // ------------------------------------------------------------------

    pub(crate) fn fs(&self) -> &FuncState<'src> {
        &self.states[self.states.len() - 1]
    }

    pub(crate) fn fs_mut(&mut self) -> &mut FuncState<'src> {
        let last = self.states.len() - 1;
        &mut self.states[last]
    }

    pub(crate) fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.fs_mut().chunk
    }

    pub(crate) fn code_len(&self) -> usize {
        self.fs().chunk.code.len()
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    pub(crate) fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Opcode plus a 16-bit big-endian operand.
    pub(crate) fn emit_long(&mut self, op: OpCode, operand: u16) {
        self.emit_op(op);
        self.emit_byte((operand >> 8) as u8);
        self.emit_byte(operand as u8);
    }

    /// Short form when the index fits a byte, long form otherwise. Used
    /// uniformly for constants, globals, properties, classes, methods,
    /// invocations, super access, and closures.
    pub(crate) fn emit_const_op(&mut self, index: u16, short: OpCode, long: OpCode) {
        if index <= u8::MAX as u16 {
            self.emit_op_byte(short, index as u8);
        } else {
            self.emit_long(long, index);
        }
    }

    /// Emits a forward jump with a placeholder offset; returns the offset of
    /// the operand for later patching.
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    /// Points the jump at `operand_offset` to the current end of code.
    pub(crate) fn patch_jump(&mut self, operand_offset: usize) {
        // Distance from the instruction after the operand to here.
        let jump = self.code_len() - operand_offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.chunk_mut();
        chunk.code[operand_offset] = (jump >> 8) as u8;
        chunk.code[operand_offset + 1] = jump as u8;
    }

    /// Emits a backward jump to `start`.
    pub(crate) fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::JumpBackwards);
        let offset = self.code_len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// The implicit return at the end of a function body: initialisers
    /// return `this`, everything else returns nil.
    pub(crate) fn emit_return(&mut self) {
        if self.fs().kind == FuncKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
            self.emit_op(OpCode::Return);
        } else {
            self.emit_op(OpCode::ReturnNil);
        }
    }

    // ------------------------------------------------------------------
    // Constants
    // ------------------------------------------------------------------

    /// Adds a constant to the current pool, deduping string constants
    /// through the per-function cache.
    pub(crate) fn make_constant(&mut self, value: Value) -> u16 {
        let as_string = self.heap.as_string(value);
        if let Some(string) = as_string {
            if let Some(&index) = self.fs().string_constants.get(&string) {
                return index;
            }
        }

        let index = self.chunk_mut().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk. (max is 65536)");
            return 0;
        }
        let index = index as u16;
        if let Some(string) = as_string {
            self.fs_mut().string_constants.insert(string, index);
        }
        index
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_const_op(index, OpCode::Constant, OpCode::ConstantLong);
    }

    /// Interns an identifier lexeme and returns its constant-pool index.
    pub(crate) fn identifier_constant(&mut self, token: Token<'src>) -> u16 {
        let name = self.intern(token.lexeme);
        self.make_constant(name.into())
    }

    /// Interning goes through a GC safepoint: the heap may collect here,
    /// with the in-flight function stack as roots.
    pub(crate) fn intern(&mut self, text: &str) -> StrRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let states = &self.states;
        let globals = self.globals;
        let init_string = self.init_string;
        self.heap.collect(|marker| {
            for state in states {
                if let Some(name) = state.name {
                    marker.mark_str(name);
                }
                for &constant in &state.chunk.constants {
                    marker.mark_value(constant);
                }
                for &key in state.string_constants.keys() {
                    marker.mark_str(key);
                }
            }
            globals.trace(marker);
            marker.mark_str(init_string);
        });
    }

    // ------------------------------------------------------------------
    // Scopes and variables
    // ------------------------------------------------------------------

    pub(crate) fn begin_scope(&mut self) {
        self.fs_mut().scope_depth += 1;
    }

    /// Closes a scope, popping its locals. Captured slots are closed into
    /// their upvalues instead of discarded.
    pub(crate) fn end_scope(&mut self) {
        self.fs_mut().scope_depth -= 1;
        loop {
            let state = self.fs();
            let Some(local) = state.locals.last() else {
                break;
            };
            if local.depth <= state.scope_depth {
                break;
            }
            let op = if local.captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_op(op);
            self.fs_mut().locals.pop();
        }
    }

    /// Consumes an identifier and declares it; returns the name's constant
    /// index when the variable is global, 0 otherwise.
    pub(crate) fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fs().scope_depth > 0 {
            return 0;
        }
        let token = self.previous;
        self.identifier_constant(token)
    }

    /// Declares a local in the current scope; globals are late-bound and
    /// need no declaration.
    pub(crate) fn declare_variable(&mut self) {
        if self.fs().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.fs();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    pub(crate) fn add_local(&mut self, name: &'src str) {
        if self.fs().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fs_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    /// Makes the just-declared local visible. Globals are defined at
    /// runtime instead.
    pub(crate) fn mark_initialized(&mut self) {
        let state = self.fs_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    pub(crate) fn define_variable(&mut self, global: u16) {
        if self.fs().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_const_op(global, OpCode::DefineGlobal, OpCode::DefineGlobalLong);
    }

    /// Finds `name` among a function's locals, innermost first.
    pub(crate) fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<usize> {
        let found = self.states[state_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth));
        let (slot, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot)
    }

    /// Finds or records an upvalue for `name` in the function at
    /// `state_index`, capturing through any number of enclosing functions.
    pub(crate) fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<usize> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local].captured = true;
            return Some(self.add_upvalue(state_index, local as u8, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_index, upvalue as u8, false));
        }

        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> usize {
        let spec = UpvalueSpec { index, is_local };
        let upvalues = &self.states[state_index].upvalues;
        if let Some(existing) = upvalues.iter().position(|&u| u == spec) {
            return existing;
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_index].upvalues.push(spec);
        self.states[state_index].upvalues.len() - 1
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    pub(crate) fn push_loop(&mut self, start: usize) {
        if self.fs().loops.len() == MAX_NESTED_LOOPS {
            self.error("Too many nested loops in function.");
            return;
        }
        let depth = self.fs().scope_depth;
        self.fs_mut().loops.push(LoopFrame {
            start,
            break_jump: None,
            depth,
        });
    }

    /// Ends the innermost loop, landing its `break` (if any) on the current
    /// instruction.
    pub(crate) fn pop_loop(&mut self) {
        if let Some(frame) = self.fs_mut().loops.pop() {
            if let Some(jump) = frame.break_jump {
                self.patch_jump(jump);
            }
        }
    }

    // ------------------------------------------------------------------
    // Function assembly
    // ------------------------------------------------------------------

    /// Finishes the innermost function: emits the implicit return, moves the
    /// built chunk into a heap `Function`, and hands back the upvalue specs
    /// the closure instruction must encode.
    pub(crate) fn end_function(&mut self) -> (ObjRef, Vec<UpvalueSpec>) {
        self.emit_return();
        // Safepoint while the finished state is still rooted.
        self.maybe_collect();
        let state = match self.states.pop() {
            Some(state) => state,
            None => unreachable!("compiler state stack underflow"),
        };
        let function = self.heap.alloc(Object::Function(Function {
            arity: state.arity,
            upvalue_count: state.upvalues.len(),
            name: state.name,
            chunk: state.chunk,
        }));
        (function, state.upvalues)
    }
}
