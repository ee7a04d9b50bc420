//! Recursive descent parser for Ejscript.
//!
//! The parser consumes the pre-scanned token stream and builds an arena AST.
//! Each grammar production pushes a `ParseScope` frame on entry and pops it
//! on every exit path; subtrees returned from a production transfer into the
//! caller's frame as `NodeId`s. Lookahead is positional (the stream is fully
//! scanned), which gives the grammar its `LOOK_AHEAD` window and one-step
//! putback for free.

pub mod defs;
pub mod error;
pub mod expr;
pub mod recovery;
pub mod stmt;

use crate::ast::{Ast, Attributes, Kind, Loc, NodeId};
use crate::lexer::{LexOutput, LexWarning, Lexer};
use crate::token::{Span, Token};
use rustc_hash::FxHashMap;
use std::rc::Rc;

pub use error::ParseError;

/// Guaranteed lookahead window for disambiguation.
pub const LOOK_AHEAD: usize = 8;

/// Hard cap on accumulated parse errors. Counting continues past the cap so
/// the final tally is still accurate.
pub const MAX_ERRORS: usize = 25;

const MAX_PARSE_DEPTH: usize = 256;

/// A parsed source file: arena, root `Program` node, and diagnostics.
pub struct SourceTree {
    pub ast: Ast,
    pub root: NodeId,
    pub path: String,
    pub errors: Vec<ParseError>,
    pub error_count: u32,
    pub warnings: Vec<LexWarning>,
}

impl SourceTree {
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

/// One state frame, pushed per production.
#[derive(Debug, Clone, Default)]
pub struct ParseScope {
    /// Attributes collected for the directive being parsed.
    pub attributes: Attributes,
    /// Namespace qualifier named by the attributes, if any.
    pub ns_qualifier: Option<String>,
    /// Default namespace from `use default namespace`.
    pub default_namespace: Option<String>,
    /// `for` header mode: the `in` operator is not a relational operator.
    pub noin: bool,
    pub in_function: bool,
    pub in_class: bool,
    pub in_interface: bool,
    /// Name of the enclosing class, for constructor detection.
    pub class_name: Option<String>,
}

/// Parser state for one source file.
pub struct Parser {
    tokens: Vec<(Token, Span)>,
    docs: FxHashMap<usize, String>,
    pos: usize,
    pub ast: Ast,
    file: Rc<str>,
    lines: Vec<Rc<str>>,
    errors: Vec<ParseError>,
    error_count: u32,
    scopes: Vec<ParseScope>,
    depth: usize,
    warnings: Vec<LexWarning>,
}

impl Parser {
    /// Create a parser over `source`, tokenizing it up front.
    pub fn new(path: &str, source: &str) -> Result<Self, Vec<crate::lexer::LexError>> {
        let LexOutput {
            tokens,
            docs,
            warnings,
            lines,
        } = Lexer::new(source).tokenize()?;

        Ok(Self {
            tokens,
            docs,
            pos: 0,
            ast: Ast::new(),
            file: Rc::from(path),
            lines,
            errors: Vec::new(),
            error_count: 0,
            scopes: vec![ParseScope::default()],
            depth: 0,
            warnings,
        })
    }

    /// Parse the whole input into a `Program` tree.
    ///
    /// Errors do not abort the parse: each one is recorded, the stream is
    /// resynchronized to the next statement boundary, and parsing resumes.
    pub fn parse(mut self) -> SourceTree {
        let root = self.node(Kind::Program);
        let directives = self.node(Kind::Directives);
        self.ast.append(root, directives);

        while !self.at_eof() {
            let before = self.pos;
            match self.parse_directive() {
                Ok(Some(id)) => self.ast.append(directives, id),
                Ok(None) => {}
                Err(err) => {
                    self.record_error(err);
                    recovery::sync_to_statement_boundary(&mut self);
                }
            }
            if self.pos == before && !self.at_eof() {
                // Ensure forward progress even on a pathological token.
                self.advance();
            }
        }

        SourceTree {
            ast: self.ast,
            root,
            path: self.file.to_string(),
            errors: self.errors,
            error_count: self.error_count,
            warnings: self.warnings,
        }
    }

    /// Parse one top-level or block-level directive.
    pub fn parse_directive(&mut self) -> Result<Option<NodeId>, ParseError> {
        match self.current() {
            Token::Semicolon => {
                self.advance();
                Ok(None)
            }
            Token::Use | Token::Require => defs::parse_pragma(self).map(Some),
            Token::Module => defs::parse_module(self).map(Some),
            Token::Class | Token::Interface => {
                defs::parse_annotatable(self, Attributes::empty(), None).map(Some)
            }
            Token::Function | Token::Var | Token::Let | Token::Const | Token::Namespace => {
                defs::parse_annotatable(self, Attributes::empty(), None).map(Some)
            }
            tok if tok.is_attribute_keyword() => {
                defs::parse_annotatable(self, Attributes::empty(), None).map(Some)
            }
            Token::Identifier(_) if self.attribute_run_ends_in_annotatable() => {
                defs::parse_annotatable(self, Attributes::empty(), None).map(Some)
            }
            _ => stmt::parse_statement(self).map(Some),
        }
    }

    // ========================================================================
    // Token management
    // ========================================================================

    #[inline(always)]
    pub fn current(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    #[inline(always)]
    pub fn current_span(&self) -> Span {
        self.tokens[self.pos].1
    }

    /// Peek `n` tokens ahead without consuming; `peek_at(0)` is the current
    /// token. Clamped to EOF.
    #[inline]
    pub fn peek_at(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].0
    }

    #[inline]
    pub fn peek(&self) -> &Token {
        self.peek_at(1)
    }

    /// Advance to the next token, returning the one consumed.
    #[inline]
    pub fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].0.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    /// One-step backup into the putback window.
    #[inline]
    pub fn putback(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    #[inline(always)]
    pub fn check(&self, expected: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(expected)
    }

    /// Consume the current token if it matches.
    #[inline]
    pub fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    #[inline(always)]
    pub fn at_eof(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    /// Current position in the token stream, for progress checks.
    #[inline(always)]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Consume the current token if it matches, or produce an error.
    pub fn expect(&mut self, expected: Token) -> Result<Token, ParseError> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(ParseError::expected(
                expected.describe(),
                self.current().clone(),
                self.here(),
            ))
        }
    }

    /// Doc comment attached to the current token, if any.
    pub fn take_doc(&mut self) -> Option<String> {
        self.docs.remove(&self.pos)
    }

    // ========================================================================
    // Locations and node construction
    // ========================================================================

    /// Location of the current token, with its source line snapshot.
    pub fn here(&self) -> Loc {
        let span = self.current_span();
        self.loc_at(span)
    }

    pub fn loc_at(&self, span: Span) -> Loc {
        let text = self
            .lines
            .get(span.line.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_else(|| Rc::from(""));
        Loc {
            file: self.file.clone(),
            line: span.line,
            column: span.column,
            text,
        }
    }

    /// Allocate a node located at the current token.
    pub fn node(&mut self, kind: Kind) -> NodeId {
        let loc = self.here();
        self.ast.alloc(kind, loc)
    }

    pub fn node_at(&mut self, kind: Kind, loc: Loc) -> NodeId {
        self.ast.alloc(kind, loc)
    }

    // ========================================================================
    // Scope frames
    // ========================================================================

    pub fn push_scope(&mut self) {
        let inherited = {
            let prev = self.scope();
            ParseScope {
                attributes: Attributes::empty(),
                ns_qualifier: None,
                default_namespace: prev.default_namespace.clone(),
                noin: prev.noin,
                in_function: prev.in_function,
                in_class: prev.in_class,
                in_interface: prev.in_interface,
                class_name: prev.class_name.clone(),
            }
        };
        self.scopes.push(inherited);
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "popping the root parse scope");
        self.scopes.pop();
    }

    pub fn scope(&self) -> &ParseScope {
        self.scopes.last().expect("scope stack is never empty")
    }

    pub fn scope_mut(&mut self) -> &mut ParseScope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    /// Set the default namespace on the *enclosing* frame, so it outlives
    /// the current directive and qualifies subsequent declarations.
    pub fn set_default_namespace(&mut self, ns: String) {
        let idx = self.scopes.len().saturating_sub(2);
        self.scopes[idx].default_namespace = Some(ns.clone());
        self.scope_mut().default_namespace = Some(ns);
    }

    /// The namespace that qualifies a declaration parsed right now.
    pub fn declaration_space(&self) -> String {
        self.scope().default_namespace.clone().unwrap_or_default()
    }

    // ========================================================================
    // Depth guard
    // ========================================================================

    pub fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            self.depth -= 1;
            return Err(ParseError::message(
                format!("maximum nesting depth ({}) exceeded", MAX_PARSE_DEPTH),
                self.here(),
            ));
        }
        Ok(())
    }

    pub fn leave(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }

    // ========================================================================
    // Error accumulation
    // ========================================================================

    /// Record a recoverable error. The list is capped; the count is not.
    pub fn record_error(&mut self, err: ParseError) {
        self.error_count += 1;
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(err);
        }
    }

    // ========================================================================
    // Attribute lookahead
    // ========================================================================

    /// Scan up to `LOOK_AHEAD` tokens to decide whether the identifiers at
    /// the cursor are declaration attributes: the run must end in one of the
    /// annotatable directive keywords, possibly after dotted name chains.
    pub fn attribute_run_ends_in_annotatable(&self) -> bool {
        let mut i = 0;
        while i < LOOK_AHEAD {
            let tok = self.peek_at(i);
            if tok.starts_annotatable() {
                return i > 0;
            }
            if tok.is_attribute_keyword() {
                i += 1;
                continue;
            }
            if matches!(tok, Token::Identifier(_)) {
                i += 1;
                while matches!(self.peek_at(i), Token::Dot)
                    && matches!(self.peek_at(i + 1), Token::Identifier(_))
                    && i + 2 <= LOOK_AHEAD
                {
                    i += 2;
                }
                continue;
            }
            return false;
        }
        false
    }

    /// Line number of the token at lookahead `n`.
    pub fn line_at(&self, n: usize) -> u32 {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        self.tokens[idx].1.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(src: &str) -> Parser {
        Parser::new("test.ejs", src).unwrap()
    }

    #[test]
    fn test_token_window() {
        let mut p = parser("var x = 1;");
        assert!(matches!(p.current(), Token::Var));
        assert!(matches!(p.peek(), Token::Identifier(_)));
        assert!(matches!(p.peek_at(2), Token::Equal));

        p.advance();
        assert!(matches!(p.current(), Token::Identifier(_)));
        p.putback();
        assert!(matches!(p.current(), Token::Var));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let p = parser("a b c d e f g h i");
        for n in 0..LOOK_AHEAD {
            let _ = p.peek_at(n);
        }
        assert!(matches!(p.current(), Token::Identifier(_)));
        assert_eq!(p.pos, 0);
    }

    #[test]
    fn test_attribute_lookahead() {
        assert!(parser("public static var x").attribute_run_ends_in_annotatable());
        assert!(parser("myspace var x").attribute_run_ends_in_annotatable());
        assert!(!parser("x + 1").attribute_run_ends_in_annotatable());
        // Plain declarations carry no attribute run.
        assert!(!parser("var x").attribute_run_ends_in_annotatable());
    }

    #[test]
    fn test_parse_empty_program() {
        let tree = parser("").parse();
        assert!(!tree.has_errors());
        assert!(matches!(tree.ast.kind(tree.root), Kind::Program));
        assert!(tree.ast.check_well_formed(tree.root).is_ok());
    }

    #[test]
    fn test_error_recovery_continues() {
        let tree = parser("var = ; var y = 2;").parse();
        assert!(tree.has_errors());
        // Recovery reaches the second declaration.
        let dirs = tree.ast.child(tree.root, 0).unwrap();
        assert!(!tree.ast.children(dirs).is_empty());
    }

    #[test]
    fn test_error_cap() {
        let src = "var = ;".repeat(40);
        let tree = parser(&src).parse();
        assert!(tree.error_count >= 40);
        assert!(tree.errors.len() <= MAX_ERRORS);
    }
}
