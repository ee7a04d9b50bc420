//! Diagnostic accumulation and rendering.
//!
//! Messages render as
//! `<app>: <file>: <line>: <severity>: <message>` followed by the source
//! line and a caret line whose leading whitespace mirrors the tabs of the
//! source so the caret lands on the error column.

use ejs_parser::ast::Loc;
use std::fmt::Write as _;

/// Upper bound on retained diagnostics; counting continues past it.
pub const MAX_DIAGNOSTICS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

/// One diagnostic with its source coordinates and line snapshot.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub source_line: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, loc: &Loc) -> Self {
        Self {
            severity,
            message: message.into(),
            file: loc.file.to_string(),
            line: loc.line,
            column: loc.column,
            source_line: loc.text.to_string(),
        }
    }

    /// Render in the standard error format. Diagnostics without a line
    /// render the short form.
    pub fn render(&self, app: &str) -> String {
        let mut out = String::new();
        write!(
            out,
            "{}: {}: {}: {}: {}",
            app,
            self.file,
            self.line,
            self.severity.label(),
            self.message
        )
        .unwrap();

        if self.line > 0 && !self.source_line.is_empty() {
            out.push('\n');
            out.push_str("  ");
            out.push_str(&self.source_line);
            out.push('\n');
            out.push_str("  ");
            // Mirror tabs so the caret aligns under the error column.
            let col = (self.column.max(1) - 1) as usize;
            for c in self.source_line.chars().take(col) {
                out.push(if c == '\t' { '\t' } else { ' ' });
            }
            out.push('^');
        }
        out
    }
}

/// Running error/warning totals; `fatal` aborts the pass that sets it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    pub warnings: u32,
    pub errors: u32,
    pub fatal: bool,
}

impl Status {
    pub fn has_errors(&self) -> bool {
        self.errors > 0 || self.fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn loc(line: u32, column: u32, text: &str) -> Loc {
        Loc {
            file: Rc::from("demo.ejs"),
            line,
            column,
            text: Rc::from(text),
        }
    }

    #[test]
    fn test_render_with_caret() {
        let d = Diagnostic::new(Severity::Error, "undefined name 'x'", &loc(3, 5, "var y = x;"));
        let text = d.render("ejsc");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ejsc: demo.ejs: 3: error: undefined name 'x'");
        assert_eq!(lines[1], "  var y = x;");
        assert_eq!(lines[2], "      ^");
    }

    #[test]
    fn test_render_tabs_preserved() {
        let d = Diagnostic::new(Severity::Error, "bad", &loc(1, 3, "\t\tx;"));
        let text = d.render("ejsc");
        let caret_line = text.lines().last().unwrap();
        assert_eq!(caret_line, "  \t\t^");
    }

    #[test]
    fn test_render_no_line() {
        let d = Diagnostic::new(Severity::Fatal, "out of memory", &loc(0, 0, ""));
        assert_eq!(d.render("ejsc"), "ejsc: demo.ejs: 0: fatal: out of memory");
    }

    #[test]
    fn test_status() {
        let mut s = Status::default();
        assert!(!s.has_errors());
        s.errors += 1;
        assert!(s.has_errors());
    }
}
