//! Structured fault types for every stage of the pipeline.
//!
//! Each stage gets its own enum so call sites can match narrowly; [`Fault`]
//! is the crate-wide union that `?` promotes into once a fault crosses a
//! module boundary. None of these derive from a helper-macro crate: the
//! `Display`/`Error` impls are written by hand, matching how the rest of
//! this codebase reports its own errors.

use std::fmt;
use std::path::PathBuf;

use crate::position::Span;

/// Renders the `path:line:column: message` + caret format shared by
/// every fault kind.
pub fn render_diagnostic(
    f: &mut fmt::Formatter<'_>,
    path: Option<&str>,
    span: Span,
    column: usize,
    message: &str,
) -> fmt::Result {
    let path = path.unwrap_or("<unknown>");
    writeln!(f, "{}:{}:{}: {}", path, span.begin.line, column, message)?;
    let caret_indent = " ".repeat(column.saturating_sub(1));
    write!(f, "{}^", caret_indent)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexFault {
    pub message: String,
    pub span: Span,
    /// 1-based column of `span.begin`, computed against the source text
    /// by whichever stage holds it.
    pub column: usize,
    pub path: Option<String>,
}

impl fmt::Display for LexFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_diagnostic(f, self.path.as_deref(), self.span, self.column, &self.message)
    }
}
impl std::error::Error for LexFault {}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseFault {
    pub message: String,
    pub span: Span,
    pub column: usize,
    pub path: Option<String>,
}

impl fmt::Display for ParseFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_diagnostic(f, self.path.as_deref(), self.span, self.column, &self.message)
    }
}
impl std::error::Error for ParseFault {}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFault {
    pub message: String,
    pub span: Span,
    pub column: usize,
    pub path: Option<String>,
}

impl fmt::Display for ValidationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_diagnostic(f, self.path.as_deref(), self.span, self.column, &self.message)
    }
}
impl std::error::Error for ValidationFault {}

/// One stack frame of an evaluation backtrace: the scope active at the
/// throw point plus the AST span being evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktraceFrame {
    pub scope_name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalFault {
    pub message: String,
    pub span: Span,
    pub column: usize,
    pub path: Option<String>,
    /// Outermost frame first.
    pub backtrace: Vec<BacktraceFrame>,
}

impl EvalFault {
    /// The evaluator walks an AST without the source text in reach, so a
    /// fresh fault starts at column 1; [`Fault::locate`] fills in the
    /// real column at the pipeline boundary that owns the text.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        EvalFault {
            message: message.into(),
            span,
            column: 1,
            path: None,
            backtrace: Vec::new(),
        }
    }

    pub fn not_yet_implemented(what: &str, span: Span) -> Self {
        EvalFault::new(format!("{} is not yet implemented", what), span)
    }
}

impl fmt::Display for EvalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_diagnostic(f, self.path.as_deref(), self.span, self.column, &self.message)?;
        for frame in &self.backtrace {
            write!(f, "\n  at {} ({})", frame.scope_name, frame.span)?;
        }
        Ok(())
    }
}
impl std::error::Error for EvalFault {}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizationFault {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for FinalizationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for FinalizationFault {}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigFault {
    pub message: String,
    pub path: Option<PathBuf>,
}

impl fmt::Display for ConfigFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
impl std::error::Error for ConfigFault {}

/// Crate-wide union of every fault kind, used as the `Err` type once a
/// fault needs to cross a module boundary (e.g. the embedding API).
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Lex(LexFault),
    Parse(ParseFault),
    Validation(ValidationFault),
    Eval(EvalFault),
    Finalization(FinalizationFault),
    Config(ConfigFault),
    Io(String),
}

impl Fault {
    /// Computes the column of the underlying span against the source
    /// text it refers to. Validation and evaluation walk the AST without
    /// the text in reach, so the pipeline stage that owns it calls this
    /// before handing the fault out.
    pub fn locate(mut self, source: &str) -> Fault {
        match &mut self {
            Fault::Lex(e) => e.column = e.span.column(source),
            Fault::Parse(e) => e.column = e.span.column(source),
            Fault::Validation(e) => e.column = e.span.column(source),
            Fault::Eval(e) => e.column = e.span.column(source),
            Fault::Finalization(_) | Fault::Config(_) | Fault::Io(_) => {}
        }
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Lex(e) => write!(f, "{}", e),
            Fault::Parse(e) => write!(f, "{}", e),
            Fault::Validation(e) => write!(f, "{}", e),
            Fault::Eval(e) => write!(f, "{}", e),
            Fault::Finalization(e) => write!(f, "{}", e),
            Fault::Config(e) => write!(f, "{}", e),
            Fault::Io(msg) => write!(f, "{}", msg),
        }
    }
}
impl std::error::Error for Fault {}

impl From<LexFault> for Fault {
    fn from(e: LexFault) -> Self {
        Fault::Lex(e)
    }
}
impl From<ParseFault> for Fault {
    fn from(e: ParseFault) -> Self {
        Fault::Parse(e)
    }
}
impl From<ValidationFault> for Fault {
    fn from(e: ValidationFault) -> Self {
        Fault::Validation(e)
    }
}
impl From<EvalFault> for Fault {
    fn from(e: EvalFault) -> Self {
        Fault::Eval(e)
    }
}
impl From<FinalizationFault> for Fault {
    fn from(e: FinalizationFault) -> Self {
        Fault::Finalization(e)
    }
}
impl From<ConfigFault> for Fault {
    fn from(e: ConfigFault) -> Self {
        Fault::Config(e)
    }
}
