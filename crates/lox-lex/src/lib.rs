//! lox-lex - Lexical analysis for Lox source text.
//!
//! The scanner is lazy: the compiler pulls one token at a time and looks at
//! most one token ahead, so the whole token stream never materialises. Each
//! token borrows its lexeme from the source string and carries the line it
//! started on.
//!
//! # Example
//!
//! ```
//! use lox_lex::{Scanner, TokenKind};
//!
//! let mut scanner = Scanner::new("var answer = 42;");
//! assert_eq!(scanner.next_token().kind, TokenKind::Var);
//! assert_eq!(scanner.next_token().lexeme, "answer");
//! ```

pub mod cursor;
pub mod scanner;
pub mod token;

pub use cursor::Cursor;
pub use scanner::Scanner;
pub use token::{Token, TokenKind};
