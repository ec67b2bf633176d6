//! Expression parsing: the Pratt rule table and every prefix/infix rule.

use lox_lex::{Token, TokenKind};
use lox_runtime::{OpCode, Value};

use crate::{Compiler, Precedence};

/// A parse rule: how a token behaves in prefix position, in infix position,
/// and how tightly it binds as an infix operator.
pub(crate) struct ParseRule<'src, 'ctx> {
    pub prefix: Option<ParseFn<'src, 'ctx>>,
    pub infix: Option<ParseFn<'src, 'ctx>>,
    pub precedence: Precedence,
}

pub(crate) type ParseFn<'src, 'ctx> = fn(&mut Compiler<'src, 'ctx>, bool);

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    /// Dense token -> rule lookup.
    pub(crate) fn rule(kind: TokenKind) -> ParseRule<'src, 'ctx> {
        use TokenKind as T;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'ctx>>,
            Option<ParseFn<'src, 'ctx>>,
            Precedence,
        ) = match kind {
            T::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            T::LeftBracket => (Some(Self::array), Some(Self::subscript), Precedence::Call),
            T::Dot => (None, Some(Self::dot), Precedence::Call),
            T::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            T::Plus => (None, Some(Self::binary), Precedence::Term),
            T::Slash | T::Star => (None, Some(Self::binary), Precedence::Factor),
            T::Ampersand => (None, Some(Self::binary), Precedence::BitAnd),
            T::Pipe => (None, Some(Self::binary), Precedence::BitOr),
            T::Caret => (None, Some(Self::binary), Precedence::BitXor),
            T::Tilde => (Some(Self::unary), None, Precedence::Unary),
            T::Bang => (Some(Self::unary), None, Precedence::None),
            T::BangEqual | T::EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            T::GreaterGreater | T::LessLess => (None, Some(Self::binary), Precedence::Shift),
            T::Identifier => (Some(Self::variable), None, Precedence::None),
            T::String => (Some(Self::string), None, Precedence::None),
            T::Number => (Some(Self::number), None, Precedence::None),
            T::And => (None, Some(Self::and_op), Precedence::And),
            T::Or => (None, Some(Self::or_op), Precedence::Or),
            T::False | T::Nil | T::True => (Some(Self::literal), None, Precedence::None),
            T::Fun => (Some(Self::lambda), None, Precedence::None),
            T::Super => (Some(Self::super_access), None, Precedence::None),
            T::This => (Some(Self::this_access), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    /// The Pratt core: parse a prefix expression, then fold in infix
    /// operators while they bind at least as tightly as `precedence`.
    pub(crate) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // If no rule consumed the `=`, the left-hand side was not a place
        // expression.
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // ------------------------------------------------------------------
    // Prefix rules
    // ------------------------------------------------------------------

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::Invert),
            _ => {}
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => {}
        }
    }

    /// Number literal. Small non-negative integers compress to `ByteNum`
    /// instead of taking a constant-pool slot.
    fn number(&mut self, _can_assign: bool) {
        let value: f64 = match self.previous.lexeme.parse() {
            Ok(value) => value,
            Err(_) => {
                self.error("Invalid number literal.");
                return;
            }
        };
        if (0.0..=255.0).contains(&value) && value.trunc() == value {
            self.emit_op_byte(OpCode::ByteNum, value as u8);
        } else {
            self.emit_constant(Value::Number(value));
        }
    }

    /// String literal; the quotes are part of the lexeme and stripped here.
    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let interned = self.intern(content);
        self.emit_constant(interned.into());
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    /// Anonymous `fun (...) { ... }` expression. Named after its lexically
    /// enclosing function for stack traces.
    fn lambda(&mut self, _can_assign: bool) {
        let parent = match self.fs().name {
            Some(name) => self.heap.str_chars(name).to_string(),
            None => "<script>".to_string(),
        };
        let label = format!("{parent}.<anonymous>");
        let name = self.intern(&label);
        self.function_body(crate::FuncKind::Function, name);
    }

    fn this_access(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    /// `super.name` and the fused `super.name(args)` call.
    fn super_access(&mut self, _can_assign: bool) {
        let enclosing_class = self.classes.last().map(|class| class.has_superclass);
        match enclosing_class {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let token = self.previous;
        let name = self.identifier_constant(token);

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_const_op(name, OpCode::SuperInvoke, OpCode::SuperInvokeLong);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_const_op(name, OpCode::GetSuper, OpCode::GetSuperLong);
        }
    }

    /// `[a, b, c]` array literal.
    fn array(&mut self, _can_assign: bool) {
        let count = self.bracket_list();
        self.emit_op_byte(OpCode::NewArray, count);
    }

    // ------------------------------------------------------------------
    // Infix rules
    // ------------------------------------------------------------------

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_op(OpCode::Neq),
            TokenKind::EqualEqual => self.emit_op(OpCode::Eq),
            TokenKind::Greater => self.emit_op(OpCode::Gt),
            TokenKind::GreaterEqual => self.emit_op(OpCode::Gte),
            TokenKind::Less => self.emit_op(OpCode::Lt),
            TokenKind::LessEqual => self.emit_op(OpCode::Lte),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::LessLess => self.emit_op(OpCode::ShiftLeft),
            TokenKind::GreaterGreater => self.emit_op(OpCode::ShiftRight),
            TokenKind::Ampersand => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            _ => {}
        }
    }

    /// `and` short-circuits by jumping over the right operand when the left
    /// is falsey, leaving the left operand as the result.
    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    /// `.name` access: plain get, assignment, or the fused invoke form.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let token = self.previous;
        let name = self.identifier_constant(token);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_const_op(name, OpCode::SetProperty, OpCode::SetPropertyLong);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_const_op(name, OpCode::Invoke, OpCode::InvokeLong);
            self.emit_byte(arg_count);
        } else {
            self.emit_const_op(name, OpCode::GetProperty, OpCode::GetPropertyLong);
        }
    }

    /// `a[i]` read or `a[i] = v` write.
    fn subscript(&mut self, can_assign: bool) {
        let count = self.bracket_list();
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SubscriptAssign, count);
        } else {
            self.emit_op_byte(OpCode::Subscript, count);
        }
    }

    // ------------------------------------------------------------------
    // Shared pieces
    // ------------------------------------------------------------------

    /// Emits a load or store for `name`, resolving local, then upvalue, then
    /// falling back to a late-bound global.
    pub(crate) fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let state_index = self.states.len() - 1;

        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }

        let target = if let Some(slot) = self.resolve_local(state_index, name.lexeme) {
            Target::Local(slot as u8)
        } else if let Some(slot) = self.resolve_upvalue(state_index, name.lexeme) {
            Target::Upvalue(slot as u8)
        } else {
            Target::Global(self.identifier_constant(name))
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            match target {
                Target::Local(slot) => self.emit_op_byte(OpCode::SetLocal, slot),
                Target::Upvalue(slot) => self.emit_op_byte(OpCode::SetUpvalue, slot),
                Target::Global(index) => {
                    self.emit_const_op(index, OpCode::SetGlobal, OpCode::SetGlobalLong);
                }
            }
        } else {
            match target {
                Target::Local(slot) => self.emit_op_byte(OpCode::GetLocal, slot),
                Target::Upvalue(slot) => self.emit_op_byte(OpCode::GetUpvalue, slot),
                Target::Global(index) => {
                    self.emit_const_op(index, OpCode::GetGlobal, OpCode::GetGlobalLong);
                }
            }
        }
    }

    /// Parenthesised argument list; leaves the arguments on the stack.
    pub(crate) fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    /// Bracketed expression list, shared by array literals and subscripts.
    fn bracket_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after arguments.");
        count.min(255) as u8
    }
}
