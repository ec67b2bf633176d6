//! Declarations, statements, and function/class bodies.

use lox_lex::TokenKind;
use lox_runtime::{OpCode, StrRef, Value};

use crate::{ClassState, Compiler, FuncKind};

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    /// declaration -> classDecl | funDecl | varDecl | statement
    pub(crate) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    pub(crate) fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Skips tokens until a statement boundary, ending panic mode. Keeps one
    /// syntax error from drowning the report in cascades.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        // `fun (` at statement level is a lambda with nowhere to go.
        if self.check(TokenKind::LeftParen) {
            self.error("Can't have an anonymous function expression statement.");
            return;
        }
        let global = self.parse_variable("Expect function name.");
        // Functions may recurse; the name is usable inside its own body.
        self.mark_initialized();
        let lexeme = self.previous.lexeme;
        let name = self.intern(lexeme);
        self.function_body(FuncKind::Function, name);
        self.define_variable(global);
    }

    /// Compiles a function body (everything from the parameter list on) and
    /// emits the closure instruction that builds it at runtime.
    pub(crate) fn function_body(&mut self, kind: FuncKind, name: StrRef) {
        self.states.push(crate::FuncState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.fs_mut().arity += 1;
                if self.fs().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let index = self.make_constant(Value::Obj(function));
        self.emit_const_op(index, OpCode::Closure, OpCode::ClosureLong);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let token = self.previous;
        let constant = self.identifier_constant(token);

        let kind = if token.lexeme == "init" {
            FuncKind::Initializer
        } else {
            FuncKind::Method
        };
        let name = self.intern(token.lexeme);
        self.function_body(kind, name);
        self.emit_const_op(constant, OpCode::Method, OpCode::MethodLong);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_const_op(name_constant, OpCode::Class, OpCode::ClassLong);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass = self.previous;
            self.named_variable(superclass, false);

            if class_name.lexeme == superclass.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // The superclass value stays on the stack as a scoped `super`
            // local, captured by method bodies that mention it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let had_superclass = self
            .classes
            .last()
            .is_some_and(|class| class.has_superclass);
        if had_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub(crate) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }

        match self.fs().kind {
            FuncKind::Script => self.error("Can't return a value from top-level code."),
            FuncKind::Initializer => self.error("Can't return a value from an initializer."),
            _ => {}
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_op(OpCode::Return);
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.push_loop(loop_start);

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        // `break` lands here, after the condition value is gone either way.
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after it:
            // jump over it into the body, loop back to it, then have it jump
            // to the condition. `continue` targets the increment.
            let body_jump = self.emit_jump(OpCode::Jump);

            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.push_loop(loop_start);

        self.statement();

        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.pop_loop();

        self.end_scope();
    }

    /// `break` discards the loop body's locals, then jumps past the loop's
    /// exit sequence. One break per loop.
    fn break_statement(&mut self) {
        if self.fs().loops.is_empty() {
            self.error("No loop to break out of.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        }
        let frame_index = self.fs().loops.len() - 1;
        if self.fs().loops[frame_index].break_jump.is_some() {
            self.error("Too many break statements in loop.");
            return;
        }

        // Pop locals declared since the loop was entered; the jump skips the
        // scope-exit code that would otherwise do it.
        let loop_depth = self.fs().loops[frame_index].depth;
        let ops: Vec<OpCode> = self
            .fs()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| {
                if local.captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }

        let jump = self.emit_jump(OpCode::Jump);
        self.fs_mut().loops[frame_index].break_jump = Some(jump);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    /// `continue` jumps back to the loop start (the increment, in a `for`).
    fn continue_statement(&mut self) {
        if self.fs().loops.is_empty() {
            self.error("No loop to continue to top of.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        }

        // Locals inside the body are popped before looping, same as break.
        let frame_index = self.fs().loops.len() - 1;
        let loop_depth = self.fs().loops[frame_index].depth;
        let ops: Vec<OpCode> = self
            .fs()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_depth)
            .map(|local| {
                if local.captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }

        let start = self.fs().loops[frame_index].start;
        self.emit_loop(start);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }
}
