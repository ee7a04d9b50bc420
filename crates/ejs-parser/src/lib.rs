//! Ejscript language frontend
//!
//! Lexer, arena AST, and recursive descent parser for Ejscript source.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{Ast, Kind, Node, NodeId, QName};
pub use lexer::{LexError, Lexer};
pub use parser::{ParseError, Parser, SourceTree};
pub use token::{Span, Token};
