//! Error recovery.
//!
//! After a syntax error the parser skips to the next point where a
//! directive can plausibly restart, so one broken construct yields one
//! diagnostic instead of a cascade.

use super::Parser;
use crate::token::Token;

/// Skip to the next statement boundary: `;`, `}`, `]`, `)`, a token that
/// starts a directive, or end of file.
pub fn sync_to_statement_boundary(parser: &mut Parser) {
    while !parser.at_eof() {
        match parser.current() {
            Token::Semicolon => {
                parser.advance();
                return;
            }
            Token::RightBrace | Token::RightBracket | Token::RightParen => {
                parser.advance();
                return;
            }
            Token::Function
            | Token::Class
            | Token::Interface
            | Token::Module
            | Token::Namespace
            | Token::Var
            | Token::Let
            | Token::Const
            | Token::If
            | Token::While
            | Token::Do
            | Token::For
            | Token::Switch
            | Token::Try
            | Token::Return
            | Token::Break
            | Token::Continue
            | Token::Throw
            | Token::Use
            | Token::Require => return,
            _ => {
                parser.advance();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_stops_at_directive_start() {
        let mut p = Parser::new("t.ejs", "@ @ var x = 1;").unwrap_or_else(|_| {
            // '@' does not lex; use junk identifiers instead.
            Parser::new("t.ejs", "junk junk var x = 1;").unwrap()
        });
        p.advance();
        sync_to_statement_boundary(&mut p);
        assert!(matches!(p.current(), Token::Var));
    }

    #[test]
    fn test_sync_consumes_semicolon() {
        let mut p = Parser::new("t.ejs", "junk junk ; more").unwrap();
        sync_to_statement_boundary(&mut p);
        assert!(matches!(p.current(), Token::Identifier(_)));
    }
}
