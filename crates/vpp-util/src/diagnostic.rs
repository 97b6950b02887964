//! Diagnostic reporting infrastructure.
//!
//! Every user-facing failure funnels through here: [`SourceError`] pins a
//! message to a source location and renders the offending line with a
//! caret; [`Handler`] counts errors per file and caps how many are shown;
//! [`Sink`] is the process-wide output channel that keeps diagnostic
//! blocks from interleaving when worker threads report concurrently.
//!
//! The rendered shape is:
//!
//! ```text
//! 3:9: semantic error: cannot find 'x'; identifier undefined
//! value=`x
//!         ^
//! ```
//!
//! with the reporting site prepending the file path and appending one
//! `from <file>:<line>:<column>` frame per enclosing call or include.

use std::cell::Cell;
use std::fmt;
use std::io::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::Span;

/// How many diagnostics a single file shows before the rest are
/// suppressed and only counted.
pub const MAX_SHOWN_ERRORS: usize = 5;

/// The phase a diagnostic originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    /// Unexpected byte while scanning a directive.
    Lexical,
    /// Token mismatch while parsing.
    Syntactic,
    /// Evaluation failure: bad types, undefined names, bad indices.
    Semantic,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Lexical => write!(f, "lexical error"),
            Category::Syntactic => write!(f, "syntax error"),
            Category::Semantic => write!(f, "semantic error"),
        }
    }
}

/// An error bound to a source location.
///
/// The offending source line is captured at construction time, so the
/// error stays renderable after the buffer it came from is gone (macro
/// bodies and interpolated strings have their own buffers).
///
/// # Examples
///
/// ```
/// use vpp_util::{Category, SourceError, Span};
///
/// let source = "value=`x\n";
/// let span = Span::new(7, 8, 1, 8);
/// let err = SourceError::new(Category::Semantic, span, source, "identifier undefined");
/// assert!(err.render().contains("semantic error"));
/// assert!(err.render().contains("value=`x"));
/// ```
#[derive(Clone, Debug, Error)]
#[error("{line}:{column}: {category}: {message}")]
pub struct SourceError {
    pub category: Category,
    pub line: u32,
    pub column: u32,
    pub message: String,
    source_line: String,
}

impl SourceError {
    /// Create an error at `span`, capturing the source line it points at.
    pub fn new(
        category: Category,
        span: Span,
        source: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            line: span.line,
            column: span.column,
            message: message.into(),
            source_line: extract_line(source, span),
        }
    }

    /// Shorthand for a [`Category::Lexical`] error.
    pub fn lexical(span: Span, source: &str, message: impl Into<String>) -> Self {
        Self::new(Category::Lexical, span, source, message)
    }

    /// Shorthand for a [`Category::Syntactic`] error.
    pub fn syntactic(span: Span, source: &str, message: impl Into<String>) -> Self {
        Self::new(Category::Syntactic, span, source, message)
    }

    /// Shorthand for a [`Category::Semantic`] error.
    pub fn semantic(span: Span, source: &str, message: impl Into<String>) -> Self {
        Self::new(Category::Semantic, span, source, message)
    }

    /// Render the full diagnostic block: headline, source line, caret.
    ///
    /// No trailing newline; callers append frames or terminate the block
    /// themselves.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}:{}: {}: {}\n{}\n",
            self.line, self.column, self.category, self.message, self.source_line
        );
        for _ in 1..self.column.max(1) {
            out.push(' ');
        }
        out.push('^');
        out
    }
}

/// Pull the full line containing `span` out of `source`.
///
/// The column is byte-based, so the line start is recovered by stepping
/// back `column - 1` bytes from the span start, exactly the way the
/// lexer counted forward.
fn extract_line(source: &str, span: Span) -> String {
    let start = span.start.min(source.len());
    let line_start = start.saturating_sub(span.column.saturating_sub(1) as usize);
    let bytes = source.as_bytes();
    let mut line_end = line_start;
    while line_end < bytes.len() && bytes[line_end] != b'\n' {
        line_end += 1;
    }
    String::from_utf8_lossy(&bytes[line_start..line_end]).into_owned()
}

/// Where diagnostic blocks go.
///
/// One `Sink` is shared by every worker thread; a single lock per block
/// keeps output line-atomic. The buffer variant exists for tests.
#[derive(Clone)]
pub struct Sink {
    target: Arc<Mutex<SinkTarget>>,
}

enum SinkTarget {
    Stderr,
    Buffer(String),
}

impl Sink {
    /// A sink writing to the process stderr.
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Stderr)),
        }
    }

    /// A sink capturing output in memory.
    pub fn buffer() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Buffer(String::new()))),
        }
    }

    /// Write one complete block. The block is emitted under a single
    /// lock acquisition so concurrent reporters never interleave.
    pub fn write(&self, block: &str) {
        let mut target = self.target.lock();
        match &mut *target {
            SinkTarget::Stderr => {
                let stderr = std::io::stderr();
                let mut stderr = stderr.lock();
                let _ = stderr.write_all(block.as_bytes());
            }
            SinkTarget::Buffer(buf) => buf.push_str(block),
        }
    }

    /// Captured contents of a buffer sink; empty for stderr sinks.
    pub fn contents(&self) -> String {
        match &*self.target.lock() {
            SinkTarget::Stderr => String::new(),
            SinkTarget::Buffer(buf) => buf.clone(),
        }
    }
}

/// Per-file error accounting.
///
/// The first [`MAX_SHOWN_ERRORS`] reported blocks are written to the
/// sink; everything after is only counted, and the caller emits a
/// `N more error(s)` summary at the end of the phase.
pub struct Handler {
    sink: Sink,
    errors: Cell<usize>,
}

impl Handler {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            errors: Cell::new(0),
        }
    }

    /// Report one diagnostic block, subject to the display cap.
    pub fn report(&self, block: &str) {
        if self.errors.get() < MAX_SHOWN_ERRORS {
            self.sink.write(block);
        }
        self.errors.set(self.errors.get() + 1);
    }

    /// Total errors reported, shown or not.
    pub fn error_count(&self) -> usize {
        self.errors.get()
    }

    pub fn has_errors(&self) -> bool {
        self.errors.get() != 0
    }

    /// Number of errors that were suppressed by the display cap.
    pub fn suppressed(&self) -> usize {
        self.errors.get().saturating_sub(MAX_SHOWN_ERRORS)
    }

    /// The sink this handler writes to.
    pub fn sink(&self) -> &Sink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(format!("{}", Category::Lexical), "lexical error");
        assert_eq!(format!("{}", Category::Syntactic), "syntax error");
        assert_eq!(format!("{}", Category::Semantic), "semantic error");
    }

    #[test]
    fn test_source_error_render() {
        let source = "let x = $\nnext line";
        let span = Span::new(8, 9, 1, 9);
        let err = SourceError::lexical(span, source, "unexpected character");
        let rendered = err.render();
        let mut lines = rendered.lines();
        assert_eq!(
            lines.next().unwrap(),
            "1:9: lexical error: unexpected character"
        );
        assert_eq!(lines.next().unwrap(), "let x = $");
        assert_eq!(lines.next().unwrap(), "        ^");
    }

    #[test]
    fn test_source_error_second_line() {
        let source = "first\nsecond line here\n";
        // span points at "line" (offset 13, line 2, column 8)
        let span = Span::new(13, 17, 2, 8);
        let err = SourceError::semantic(span, source, "bad");
        let rendered = err.render();
        assert!(rendered.contains("second line here"));
        assert!(rendered.ends_with("       ^"));
    }

    #[test]
    fn test_source_error_display_is_headline() {
        let err = SourceError::syntactic(Span::new(0, 1, 4, 2), "ab\n", "expecting ';'");
        assert_eq!(format!("{}", err), "4:2: syntax error: expecting ';'");
    }

    #[test]
    fn test_extract_line_at_eof() {
        let source = "no newline at end";
        let span = Span::new(3, 4, 1, 4);
        let err = SourceError::semantic(span, source, "x");
        assert!(err.render().contains("no newline at end"));
    }

    #[test]
    fn test_sink_buffer_captures() {
        let sink = Sink::buffer();
        sink.write("one\n");
        sink.write("two\n");
        assert_eq!(sink.contents(), "one\ntwo\n");
    }

    #[test]
    fn test_handler_counts() {
        let handler = Handler::new(Sink::buffer());
        assert!(!handler.has_errors());
        handler.report("a\n");
        handler.report("b\n");
        assert_eq!(handler.error_count(), 2);
        assert!(handler.has_errors());
        assert_eq!(handler.suppressed(), 0);
    }

    #[test]
    fn test_handler_caps_display() {
        let sink = Sink::buffer();
        let handler = Handler::new(sink.clone());
        for i in 0..8 {
            handler.report(&format!("error {i}\n"));
        }
        assert_eq!(handler.error_count(), 8);
        assert_eq!(handler.suppressed(), 3);
        let shown = sink.contents();
        assert!(shown.contains("error 4"));
        assert!(!shown.contains("error 5"));
    }
}
