//! Parse error type.

use crate::ast::Loc;
use crate::token::Token;
use std::fmt;

/// A recoverable syntax error with its source coordinates and the text of
/// the offending line.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub loc: Loc,
    /// Fatal errors abort the pass instead of recovering.
    pub fatal: bool,
}

impl ParseError {
    pub fn message(message: impl Into<String>, loc: Loc) -> Self {
        Self {
            message: message.into(),
            loc,
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>, loc: Loc) -> Self {
        Self {
            message: message.into(),
            loc,
            fatal: true,
        }
    }

    pub fn expected(what: impl AsRef<str>, found: Token, loc: Loc) -> Self {
        Self {
            message: format!("expected {}, found {}", what.as_ref(), found.describe()),
            loc,
            fatal: false,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}: {}",
            self.loc.file, self.loc.line, self.message
        )
    }
}

impl std::error::Error for ParseError {}
