//! Lexer for Ejscript source.
//!
//! The raw token layer is generated with logos. A thin incremental wrapper
//! adds the pieces the grammar needs beyond plain tokenization: line and
//! column tracking, shebang stripping, doc-comment capture, and the two
//! dedicated scanner modes (regular-expression literals and XML literals)
//! selected from the previous significant token.

use crate::token::{Span, Token};
use logos::Logos;
use rustc_hash::FxHashMap;
use std::rc::Rc;

#[derive(Logos, Debug, Clone, PartialEq)]
enum RawToken {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"//[^\n]*", logos::skip)]
    LineComment,

    // Block comments are captured so the wrapper can keep doc comments and
    // warn about nested openers.
    #[regex(r"/\*", lex_block_comment)]
    BlockComment(String),

    // Keywords
    #[token("break")]
    Break,
    #[token("callee")]
    Callee,
    #[token("case")]
    Case,
    #[token("cast")]
    Cast,
    #[token("catch")]
    Catch,
    #[token("class")]
    Class,
    #[token("const")]
    Const,
    #[token("continue")]
    Continue,
    #[token("default")]
    Default,
    #[token("delete")]
    Delete,
    #[token("do")]
    Do,
    #[token("dynamic")]
    Dynamic,
    #[token("each")]
    Each,
    #[token("else")]
    Else,
    #[token("enumerable")]
    Enumerable,
    #[token("false")]
    False,
    #[token("final")]
    Final,
    #[token("finally")]
    Finally,
    #[token("for")]
    For,
    #[token("function")]
    Function,
    #[token("generator")]
    Generator,
    #[token("get")]
    Get,
    #[token("has")]
    Has,
    #[token("if")]
    If,
    #[token("in")]
    In,
    #[token("instanceof")]
    Instanceof,
    #[token("interface")]
    Interface,
    #[token("internal")]
    Internal,
    #[token("intrinsic")]
    Intrinsic,
    #[token("is")]
    Is,
    #[token("lang")]
    Lang,
    #[token("let")]
    Let,
    #[token("like")]
    Like,
    #[token("module")]
    Module,
    #[token("namespace")]
    Namespace,
    #[token("native")]
    Native,
    #[token("new")]
    New,
    #[token("null")]
    Null,
    #[token("override")]
    Override,
    #[token("private")]
    Private,
    #[token("protected")]
    Protected,
    #[token("public")]
    Public,
    #[token("readonly")]
    Readonly,
    #[token("require")]
    Require,
    #[token("return")]
    Return,
    #[token("set")]
    Set,
    #[token("standard")]
    Standard,
    #[token("static")]
    Static,
    #[token("strict")]
    Strict,
    #[token("super")]
    Super,
    #[token("switch")]
    Switch,
    #[token("synchronized")]
    Synchronized,
    #[token("this")]
    This,
    #[token("throw")]
    Throw,
    #[token("to")]
    To,
    #[token("true")]
    True,
    #[token("try")]
    Try,
    #[token("type")]
    Type,
    #[token("typeof")]
    Typeof,
    #[token("undefined")]
    Undefined,
    #[token("use")]
    Use,
    #[token("var")]
    Var,
    #[token("void")]
    Void,
    #[token("volatile")]
    Volatile,
    #[token("while")]
    While,
    #[token("with")]
    With,
    #[token("yield")]
    Yield,

    #[regex(r"[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Identifier(String),

    #[regex(r"0[xX][0-9a-fA-F]+", parse_hex)]
    #[regex(r"[0-9]+", parse_int)]
    IntLiteral(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    FloatLiteral(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\\n]|\\.)*'", parse_string)]
    StringLiteral(String),

    // Operators, longest first
    #[token(">>>=")]
    GreaterGreaterGreaterEqual,
    #[token("===")]
    EqualEqualEqual,
    #[token("!==")]
    BangEqualEqual,
    #[token(">>>")]
    GreaterGreaterGreater,
    #[token("<<=")]
    LessLessEqual,
    #[token(">>=")]
    GreaterGreaterEqual,
    #[token("&&=")]
    AmpAmpEqual,
    #[token("||=")]
    PipePipeEqual,
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("<=")]
    LessEqual,
    #[token(">=")]
    GreaterEqual,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("<<")]
    LessLess,
    #[token(">>")]
    GreaterGreater,
    #[token("+=")]
    PlusEqual,
    #[token("-=")]
    MinusEqual,
    #[token("*=")]
    StarEqual,
    #[token("/=")]
    SlashEqual,
    #[token("%=")]
    PercentEqual,
    #[token("&=")]
    AmpEqual,
    #[token("|=")]
    PipeEqual,
    #[token("^=")]
    CaretEqual,
    #[token("::")]
    ColonColon,
    #[token("...")]
    Ellipsis,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("=")]
    Equal,
    #[token("?")]
    Question,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
    #[token("#")]
    Hash,
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
}

fn lex_block_comment(lex: &mut logos::Lexer<RawToken>) -> String {
    let remainder = lex.remainder();
    match remainder.find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            format!("/*{}*/", &remainder[..end])
        }
        None => {
            lex.bump(remainder.len());
            format!("/*{}", remainder)
        }
    }
}

fn parse_hex(lex: &mut logos::Lexer<RawToken>) -> Option<i64> {
    i64::from_str_radix(&lex.slice()[2..], 16).ok()
}

fn parse_int(lex: &mut logos::Lexer<RawToken>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_float(lex: &mut logos::Lexer<RawToken>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<RawToken>) -> Option<String> {
    let s = lex.slice();
    Some(unescape_string(&s[1..s.len() - 1]))
}

fn unescape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('b') => result.push('\u{8}'),
            Some('f') => result.push('\u{c}'),
            Some('v') => result.push('\u{b}'),
            Some('0') => result.push('\0'),
            Some('u') => {
                let mut code = 0u32;
                let mut n = 0;
                while n < 4 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            code = code * 16 + d;
                            chars.next();
                            n += 1;
                        }
                        None => break,
                    }
                }
                result.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            Some('x') => {
                let mut code = 0u32;
                let mut n = 0;
                while n < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            code = code * 16 + d;
                            chars.next();
                            n += 1;
                        }
                        None => break,
                    }
                }
                result.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            Some(c) => result.push(c),
            None => break,
        }
    }
    result
}

/// Lexer error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
    #[error("unterminated regular expression")]
    UnterminatedRegex { span: Span },
    #[error("unterminated XML literal")]
    UnterminatedXml { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedRegex { span }
            | LexError::UnterminatedXml { span } => *span,
        }
    }
}

/// Non-fatal lexer warning (nested comment openers and similar).
#[derive(Debug, Clone, PartialEq)]
pub struct LexWarning {
    pub message: String,
    pub span: Span,
}

/// Everything the lexer hands to the parser.
pub struct LexOutput {
    pub tokens: Vec<(Token, Span)>,
    /// Doc comment preceding the token at the given index.
    pub docs: FxHashMap<usize, String>,
    pub warnings: Vec<LexWarning>,
    /// Source split into lines, shared into node locations.
    pub lines: Vec<Rc<str>>,
}

/// Incremental lexer wrapper over the logos layer.
pub struct Lexer<'a> {
    source: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source }
    }

    /// Tokenize the whole input.
    ///
    /// A `#!` shebang on line 1 is blanked out before scanning so byte
    /// offsets and line numbers stay stable.
    pub fn tokenize(self) -> Result<LexOutput, Vec<LexError>> {
        let cleaned = strip_shebang(self.source);
        let source: &str = &cleaned;

        let lines: Vec<Rc<str>> = source.lines().map(Rc::from).collect();
        let mut tokens: Vec<(Token, Span)> = Vec::new();
        let mut docs: FxHashMap<usize, String> = FxHashMap::default();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut pending_doc: Option<String> = None;

        let mut lexer = RawToken::lexer(source);
        let mut line = 1u32;
        let mut column = 1u32;
        let mut last_end = 0usize;

        while let Some(result) = lexer.next() {
            let range = lexer.span();

            for c in source[last_end..range.start].chars() {
                if c == '\n' {
                    line += 1;
                    column = 1;
                } else {
                    column += 1;
                }
            }
            let span = Span::new(range.start, range.end, line, column);

            let raw = match result {
                Ok(raw) => raw,
                Err(_) => {
                    let ch = source[range.start..].chars().next().unwrap_or('\0');
                    errors.push(LexError::UnexpectedCharacter { ch, span });
                    advance_position(source, range.start, lexer.span().end, &mut line, &mut column);
                    last_end = lexer.span().end;
                    continue;
                }
            };

            match raw {
                RawToken::BlockComment(text) => {
                    if text[2..].contains("/*") {
                        warnings.push(LexWarning {
                            message: "nested '/*' inside block comment".to_string(),
                            span,
                        });
                    }
                    if text.starts_with("/**") && text.len() > 4 {
                        pending_doc = Some(clean_doc(&text));
                    }
                }
                RawToken::Slash | RawToken::SlashEqual
                    if regex_allowed(tokens.last().map(|(t, _)| t)) =>
                {
                    // Dedicated regex mode. The token stream is rewound to
                    // the '/' and the scanner consumes the whole literal.
                    let already = &source[range.start + 1..range.end];
                    match scan_regex(source, range.end, already) {
                        Some(consumed) => {
                            let end = range.end + consumed;
                            let text = source[range.start..end].to_string();
                            lexer.bump(consumed);
                            let span = Span::new(range.start, end, line, column);
                            push_token(
                                &mut tokens,
                                &mut docs,
                                &mut pending_doc,
                                Token::RegexLiteral(text),
                                span,
                            );
                        }
                        None => errors.push(LexError::UnterminatedRegex { span }),
                    }
                }
                RawToken::Less
                    if xml_allowed(tokens.last().map(|(t, _)| t))
                        && starts_xml(&source[range.end..]) =>
                {
                    match scan_xml(source, range.start) {
                        Some(end) => {
                            let text = source[range.start..end].to_string();
                            lexer.bump(end - range.end);
                            let span = Span::new(range.start, end, line, column);
                            push_token(
                                &mut tokens,
                                &mut docs,
                                &mut pending_doc,
                                Token::XmlLiteral(text),
                                span,
                            );
                        }
                        None => errors.push(LexError::UnterminatedXml { span }),
                    }
                }
                raw => {
                    let token = convert(raw);
                    push_token(&mut tokens, &mut docs, &mut pending_doc, token, span);
                }
            }

            let end = lexer.span().end;
            advance_position(source, range.start, end, &mut line, &mut column);
            last_end = end;
        }

        let eof_span = Span::new(source.len(), source.len(), line, column);
        tokens.push((Token::Eof, eof_span));

        if errors.is_empty() {
            Ok(LexOutput {
                tokens,
                docs,
                warnings,
                lines,
            })
        } else {
            Err(errors)
        }
    }
}

fn push_token(
    tokens: &mut Vec<(Token, Span)>,
    docs: &mut FxHashMap<usize, String>,
    pending_doc: &mut Option<String>,
    token: Token,
    span: Span,
) {
    if let Some(doc) = pending_doc.take() {
        docs.insert(tokens.len(), doc);
    }
    tokens.push((token, span));
}

fn advance_position(source: &str, start: usize, end: usize, line: &mut u32, column: &mut u32) {
    for c in source[start..end].chars() {
        if c == '\n' {
            *line += 1;
            *column = 1;
        } else {
            *column += 1;
        }
    }
}

fn strip_shebang(source: &str) -> std::borrow::Cow<'_, str> {
    if !source.starts_with("#!") {
        return std::borrow::Cow::Borrowed(source);
    }
    let end = source.find('\n').unwrap_or(source.len());
    let mut owned = String::with_capacity(source.len());
    owned.extend(std::iter::repeat(' ').take(end));
    owned.push_str(&source[end..]);
    std::borrow::Cow::Owned(owned)
}

fn clean_doc(text: &str) -> String {
    let inner = text
        .trim_start_matches("/**")
        .trim_end_matches("*/")
        .trim();
    inner
        .lines()
        .map(|l| l.trim().trim_start_matches('*').trim())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// A `/` starts a regular expression when the previous significant token
/// cannot end an expression.
fn regex_allowed(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(tok) => !tok.ends_expression(),
    }
}

fn xml_allowed(prev: Option<&Token>) -> bool {
    regex_allowed(prev)
}

fn starts_xml(rest: &str) -> bool {
    matches!(rest.chars().next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '!')
}

/// Scan a regex body + flags starting just past the opening `/`.
/// `already` holds characters logos consumed beyond the slash (the `=` of a
/// `/=` raw token). Returns the number of additional bytes to consume.
fn scan_regex(source: &str, from: usize, already: &str) -> Option<usize> {
    let mut in_class = false;
    let mut escaped = false;
    for c in already.chars() {
        match c {
            '\\' => escaped = true,
            '[' if !escaped => in_class = true,
            ']' if !escaped => in_class = false,
            _ => escaped = false,
        }
    }

    let bytes = source[from..].char_indices();
    let mut end = None;
    for (i, c) in bytes {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '[' => in_class = true,
            ']' => in_class = false,
            '\n' => return None,
            '/' if !in_class => {
                end = Some(from + i + 1);
                break;
            }
            _ => {}
        }
    }
    let mut end = end?;
    while let Some(c) = source[end..].chars().next() {
        if c.is_ascii_lowercase() {
            end += c.len_utf8();
        } else {
            break;
        }
    }
    Some(end - from)
}

/// Scan an XML literal starting at the opening `<`, tracking tag balance.
/// Returns the end offset past the final `>`.
fn scan_xml(source: &str, start: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut i = start;
    let mut depth = 0i32;

    while i < bytes.len() {
        if bytes[i] == b'<' {
            if source[i..].starts_with("<!--") {
                i += source[i..].find("-->")? + 3;
                continue;
            }
            let closing = bytes.get(i + 1) == Some(&b'/');
            let mut j = i + 1;
            let mut self_closing = false;
            while j < bytes.len() && bytes[j] != b'>' {
                if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'>') {
                    self_closing = true;
                }
                j += 1;
            }
            if j >= bytes.len() {
                return None;
            }
            if closing {
                depth -= 1;
            } else if !self_closing {
                depth += 1;
            }
            i = j + 1;
            if depth <= 0 {
                return Some(i);
            }
        } else {
            i += 1;
        }
    }
    None
}

fn convert(raw: RawToken) -> Token {
    match raw {
        RawToken::Break => Token::Break,
        RawToken::Callee => Token::Callee,
        RawToken::Case => Token::Case,
        RawToken::Cast => Token::Cast,
        RawToken::Catch => Token::Catch,
        RawToken::Class => Token::Class,
        RawToken::Const => Token::Const,
        RawToken::Continue => Token::Continue,
        RawToken::Default => Token::Default,
        RawToken::Delete => Token::Delete,
        RawToken::Do => Token::Do,
        RawToken::Dynamic => Token::Dynamic,
        RawToken::Each => Token::Each,
        RawToken::Else => Token::Else,
        RawToken::Enumerable => Token::Enumerable,
        RawToken::False => Token::False,
        RawToken::Final => Token::Final,
        RawToken::Finally => Token::Finally,
        RawToken::For => Token::For,
        RawToken::Function => Token::Function,
        RawToken::Generator => Token::Generator,
        RawToken::Get => Token::Get,
        RawToken::Has => Token::Has,
        RawToken::If => Token::If,
        RawToken::In => Token::In,
        RawToken::Instanceof => Token::Instanceof,
        RawToken::Interface => Token::Interface,
        RawToken::Internal => Token::Internal,
        RawToken::Intrinsic => Token::Intrinsic,
        RawToken::Is => Token::Is,
        RawToken::Lang => Token::Lang,
        RawToken::Let => Token::Let,
        RawToken::Like => Token::Like,
        RawToken::Module => Token::Module,
        RawToken::Namespace => Token::Namespace,
        RawToken::Native => Token::Native,
        RawToken::New => Token::New,
        RawToken::Null => Token::Null,
        RawToken::Override => Token::Override,
        RawToken::Private => Token::Private,
        RawToken::Protected => Token::Protected,
        RawToken::Public => Token::Public,
        RawToken::Readonly => Token::Readonly,
        RawToken::Require => Token::Require,
        RawToken::Return => Token::Return,
        RawToken::Set => Token::Set,
        RawToken::Standard => Token::Standard,
        RawToken::Static => Token::Static,
        RawToken::Strict => Token::Strict,
        RawToken::Super => Token::Super,
        RawToken::Switch => Token::Switch,
        RawToken::Synchronized => Token::Synchronized,
        RawToken::This => Token::This,
        RawToken::Throw => Token::Throw,
        RawToken::To => Token::To,
        RawToken::True => Token::True,
        RawToken::Try => Token::Try,
        RawToken::Type => Token::Type,
        RawToken::Typeof => Token::Typeof,
        RawToken::Undefined => Token::Undefined,
        RawToken::Use => Token::Use,
        RawToken::Var => Token::Var,
        RawToken::Void => Token::Void,
        RawToken::Volatile => Token::Volatile,
        RawToken::While => Token::While,
        RawToken::With => Token::With,
        RawToken::Yield => Token::Yield,
        RawToken::Identifier(s) => Token::Identifier(s),
        RawToken::IntLiteral(n) => Token::IntLiteral(n),
        RawToken::FloatLiteral(n) => Token::FloatLiteral(n),
        RawToken::StringLiteral(s) => Token::StringLiteral(s),
        RawToken::GreaterGreaterGreaterEqual => Token::GreaterGreaterGreaterEqual,
        RawToken::EqualEqualEqual => Token::EqualEqualEqual,
        RawToken::BangEqualEqual => Token::BangEqualEqual,
        RawToken::GreaterGreaterGreater => Token::GreaterGreaterGreater,
        RawToken::LessLessEqual => Token::LessLessEqual,
        RawToken::GreaterGreaterEqual => Token::GreaterGreaterEqual,
        RawToken::AmpAmpEqual => Token::AmpAmpEqual,
        RawToken::PipePipeEqual => Token::PipePipeEqual,
        RawToken::EqualEqual => Token::EqualEqual,
        RawToken::BangEqual => Token::BangEqual,
        RawToken::LessEqual => Token::LessEqual,
        RawToken::GreaterEqual => Token::GreaterEqual,
        RawToken::AmpAmp => Token::AmpAmp,
        RawToken::PipePipe => Token::PipePipe,
        RawToken::PlusPlus => Token::PlusPlus,
        RawToken::MinusMinus => Token::MinusMinus,
        RawToken::LessLess => Token::LessLess,
        RawToken::GreaterGreater => Token::GreaterGreater,
        RawToken::PlusEqual => Token::PlusEqual,
        RawToken::MinusEqual => Token::MinusEqual,
        RawToken::StarEqual => Token::StarEqual,
        RawToken::SlashEqual => Token::SlashEqual,
        RawToken::PercentEqual => Token::PercentEqual,
        RawToken::AmpEqual => Token::AmpEqual,
        RawToken::PipeEqual => Token::PipeEqual,
        RawToken::CaretEqual => Token::CaretEqual,
        RawToken::ColonColon => Token::ColonColon,
        RawToken::Ellipsis => Token::Ellipsis,
        RawToken::Plus => Token::Plus,
        RawToken::Minus => Token::Minus,
        RawToken::Star => Token::Star,
        RawToken::Slash => Token::Slash,
        RawToken::Percent => Token::Percent,
        RawToken::Bang => Token::Bang,
        RawToken::Tilde => Token::Tilde,
        RawToken::Less => Token::Less,
        RawToken::Greater => Token::Greater,
        RawToken::Amp => Token::Amp,
        RawToken::Pipe => Token::Pipe,
        RawToken::Caret => Token::Caret,
        RawToken::Equal => Token::Equal,
        RawToken::Question => Token::Question,
        RawToken::Dot => Token::Dot,
        RawToken::Colon => Token::Colon,
        RawToken::Semicolon => Token::Semicolon,
        RawToken::Comma => Token::Comma,
        RawToken::Hash => Token::Hash,
        RawToken::LeftParen => Token::LeftParen,
        RawToken::RightParen => Token::RightParen,
        RawToken::LeftBrace => Token::LeftBrace,
        RawToken::RightBrace => Token::RightBrace,
        RawToken::LeftBracket => Token::LeftBracket,
        RawToken::RightBracket => Token::RightBracket,
        RawToken::Whitespace | RawToken::LineComment | RawToken::BlockComment(_) => {
            unreachable!("trivia handled before conversion")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        let out = Lexer::new(src).tokenize().unwrap();
        out.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let t = toks("class Shape extendsIt");
        assert_eq!(t[0], Token::Class);
        assert_eq!(t[1], Token::Identifier("Shape".into()));
        assert_eq!(t[2], Token::Identifier("extendsIt".into()));
        assert_eq!(t[3], Token::Eof);
    }

    #[test]
    fn test_numbers() {
        let t = toks("1 0x10 3.5 1e3");
        assert_eq!(t[0], Token::IntLiteral(1));
        assert_eq!(t[1], Token::IntLiteral(16));
        assert_eq!(t[2], Token::FloatLiteral(3.5));
        assert_eq!(t[3], Token::FloatLiteral(1000.0));
    }

    #[test]
    fn test_string_escapes() {
        let t = toks(r#""a\nb\x41B""#);
        assert_eq!(t[0], Token::StringLiteral("a\nbAB".into()));
    }

    #[test]
    fn test_regex_mode() {
        // After '=' a slash starts a regex; after an identifier it divides.
        let t = toks("x = /ab+c/gi");
        assert_eq!(t[2], Token::RegexLiteral("/ab+c/gi".into()));

        let t = toks("x / y");
        assert_eq!(t[1], Token::Slash);
    }

    #[test]
    fn test_regex_with_leading_equal() {
        let t = toks("x = /=a/");
        assert_eq!(t[2], Token::RegexLiteral("/=a/".into()));
    }

    #[test]
    fn test_regex_class_contains_slash() {
        let t = toks("x = /[/]/");
        assert_eq!(t[2], Token::RegexLiteral("/[/]/".into()));
    }

    #[test]
    fn test_xml_literal() {
        let t = toks("x = <a><b/>text</a>");
        assert_eq!(t[2], Token::XmlLiteral("<a><b/>text</a>".into()));
    }

    #[test]
    fn test_less_than_is_not_xml() {
        let t = toks("a < b");
        assert_eq!(t[1], Token::Less);
    }

    #[test]
    fn test_shebang() {
        let t = toks("#!/usr/bin/env ejs\nvar x");
        assert_eq!(t[0], Token::Var);
        // Line numbering is preserved.
        let out = Lexer::new("#!/usr/bin/env ejs\nvar x").tokenize().unwrap();
        assert_eq!(out.tokens[0].1.line, 2);
    }

    #[test]
    fn test_doc_comment_capture() {
        let out = Lexer::new("/** Adds things. */ function add() {}")
            .tokenize()
            .unwrap();
        assert_eq!(out.docs.get(&0).map(String::as_str), Some("Adds things."));
    }

    #[test]
    fn test_nested_comment_warning() {
        let out = Lexer::new("/* outer /* inner */ var x").tokenize().unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.tokens[0].0, Token::Var);
    }

    #[test]
    fn test_hash_token() {
        let t = toks("# FEATURE { }");
        assert_eq!(t[0], Token::Hash);
        assert_eq!(t[1], Token::Identifier("FEATURE".into()));
    }
}
