//! vpp-par - Recursive-descent parser for templates.
//!
//! The grammar, in EBNF (statements own whole lines; `NL` is the
//! directive-terminating newline token):
//!
//! ```ebnf
//! template    = { plain-text | "`" directive } ;
//! directive   = NL                                        (* empty *)
//!             | "let" storage "=" ternary NL
//!             | "define" storage "=" ternary NL
//!             | "macro" storage "(" [ params ] ")" NL template "endmacro" NL
//!             | "if" "(" ternary ")" NL template
//!               { "elseif" "(" ternary ")" NL template }
//!               [ "else" NL template ] "endif" NL
//!             | "for" "(" storage ":" ternary ")" NL template "endfor" NL
//!             | "include" ternary NL
//!             | ternary ;                                  (* inline *)
//!
//! ternary     = logical-or [ "?" ternary ":" ternary ] ;
//! logical-or  = logical-and { "||" logical-and } ;
//! logical-and = bitwise-or { "&&" bitwise-or } ;
//! bitwise-or  = bitwise-xor { "|" bitwise-xor } ;
//! bitwise-xor = bitwise-and { "^" bitwise-and } ;
//! bitwise-and = equality { "&" equality } ;
//! equality    = relational { ( "==" | "!=" ) relational } ;
//! relational  = shift [ ( "<" | "<=" | ">" | ">=" | "inside" ) shift ] ;
//! shift       = additive { ( "<<" | ">>" ) additive } ;
//! additive    = multiplicative { ( "+" | "-" ) multiplicative } ;
//! multiplicative = exponent { ( "*" | "/" | "%" ) exponent } ;
//! exponent    = prefix [ "**" exponent ] ;                 (* right-assoc *)
//! prefix      = ( "!" | "$" | "+" | "-" | "~" | "@" ) prefix | postfix ;
//! postfix     = primary { "(" [ args ] ")" | "[" ternary "]" } ;
//! primary     = quotation | "(" ternary ")" | array | dictionary
//!             | builtin | INTEGER | IDENTIFIER | "true" | "false" ;
//! storage     = IDENTIFIER | "@" prefix ;
//! ```
//!
//! # Error recovery
//!
//! On a syntactic (or lexical) failure the parser reports at the
//! faulting token, resets the lexer to verbatim mode
//! ([`vpp_lex::Lexer::synchronize`]), drops one token, and resumes at
//! the next directive or newline boundary. At most
//! [`vpp_util::MAX_SHOWN_ERRORS`] diagnostics are shown per file; the
//! rest are counted and summarized. A parse yields an AST only when
//! zero errors were observed.

pub mod ast;
mod expr;
mod stmt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use vpp_lex::{Lexer, Token, TokenKind};
use vpp_util::{Handler, SourceError, Span};

pub use ast::{
    ArrayElement, ArrayExpr, BinOp, BinaryExpr, BuiltinExpr, BuiltinKind, DictionaryExpr, Expr,
    IndirectionExpr, InterpolateExpr, Macro, MacroCallExpr, QuotationExpr, Stmt, Storage,
    SubscriptExpr, TernaryExpr, UnOp, UnaryExpr,
};

/// Terminal parser failure: the file produced at least one diagnostic,
/// so its AST is discarded.
#[derive(Debug, Error)]
#[error("{}: compilation failed due to {errors} error(s)", .path.display())]
pub struct CompileFailed {
    pub path: PathBuf,
    pub errors: usize,
}

/// Result alias used throughout the parser internals.
pub(crate) type PResult<T> = Result<T, SourceError>;

/// Recursive-descent parser over the streaming [`Lexer`].
///
/// The lexer cannot be run ahead of the parser: directive/verbatim mode
/// switching and error resynchronization both depend on parse state, so
/// tokens are pulled one at a time.
pub struct Parser<'a> {
    path: &'a Path,
    source: &'a Arc<str>,
    lexer: Lexer<'a>,
    handler: &'a Handler,
    curr: Token,
}

impl<'a> Parser<'a> {
    /// Parser over a template file.
    pub fn new(path: &'a Path, source: &'a Arc<str>, handler: &'a Handler) -> Self {
        Self {
            path,
            source,
            lexer: Lexer::new(source),
            handler,
            curr: Token::new(TokenKind::EndOfFile, Span::DUMMY),
        }
    }

    /// Parser over an interpolated string: lexing starts in directive
    /// mode and [`Parser::parse_expression`] is the entry point.
    pub fn for_expression(path: &'a Path, source: &'a Arc<str>, handler: &'a Handler) -> Self {
        Self {
            lexer: Lexer::for_expression(source),
            ..Self::new(path, source, handler)
        }
    }

    /// Parse a whole template.
    ///
    /// Returns the root statement only if no diagnostics were produced;
    /// otherwise the tree is discarded and the error carries the count.
    pub fn parse(mut self) -> Result<Stmt, CompileFailed> {
        self.prime();
        let root = self.compound();
        if let Err(error) = self.consume(TokenKind::EndOfFile) {
            self.report(&error);
        }
        self.finish().map(|()| root)
    }

    /// Parse a single expression covering the whole input (the `$`
    /// interpolation entry point).
    pub fn parse_expression(mut self) -> Result<Expr, CompileFailed> {
        self.prime();
        let expr = match self.ternary().and_then(|expr| {
            self.consume(TokenKind::EndOfFile)?;
            Ok(expr)
        }) {
            Ok(expr) => Some(expr),
            Err(error) => {
                self.report(&error);
                None
            }
        };
        self.finish().map(|()| expr.expect("no expression despite zero errors"))
    }

    // =========================================================================
    // TOKEN PLUMBING
    // =========================================================================

    /// Load the first token. A lexical error this early is reported and
    /// resynchronized like any other.
    fn prime(&mut self) {
        loop {
            match self.lexer.next_token() {
                Ok(token) => {
                    self.curr = token;
                    return;
                }
                Err(error) => {
                    self.report(&error);
                    self.lexer.synchronize();
                }
            }
        }
    }

    /// The token under the cursor.
    pub(crate) fn current(&self) -> Token {
        self.curr
    }

    /// True if the current token has the given kind.
    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.curr.kind == kind
    }

    /// Consume the current token and return it, pulling the next one
    /// from the lexer. At end of file the cursor stays put.
    pub(crate) fn advance(&mut self) -> PResult<Token> {
        let prev = self.curr;
        if self.curr.kind != TokenKind::EndOfFile {
            self.curr = self.lexer.next_token()?;
        }
        Ok(prev)
    }

    /// Consume the current token if it has the expected kind; otherwise
    /// a syntax error at the current token.
    pub(crate) fn consume(&mut self, kind: TokenKind) -> PResult<Token> {
        if self.curr.kind == kind {
            self.advance()
        } else {
            Err(self.unexpected(format!(
                "expecting {}; found {}",
                kind, self.curr.kind
            )))
        }
    }

    /// Consume the current token if it matches, reporting whether it did.
    pub(crate) fn match_kind(&mut self, kind: TokenKind) -> PResult<bool> {
        if self.curr.kind == kind {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// A block directive's terminating newline. One stray backtick
    /// directly before it is tolerated (the `` `endfor` `` style).
    pub(crate) fn end_of_directive(&mut self) -> PResult<()> {
        if self.check(TokenKind::Backtick) {
            self.advance()?;
        }
        self.consume(TokenKind::Newline)?;
        Ok(())
    }

    /// A syntax error at the current token.
    pub(crate) fn unexpected(&self, message: String) -> SourceError {
        SourceError::syntactic(self.curr.span, self.source, message)
    }

    // =========================================================================
    // ERROR RECOVERY
    // =========================================================================

    /// Report a diagnostic, prefixed with the file path.
    pub(crate) fn report(&mut self, error: &SourceError) {
        self.handler
            .report(&format!("{}:{}\n", self.path.display(), error.render()));
    }

    /// Panic-mode recovery: reset the lexer and drop one token.
    pub(crate) fn synchronize(&mut self) {
        self.lexer.synchronize();
        // The lexer is back in verbatim mode, which cannot fail.
        let _ = self.advance();
    }

    /// Unwrap a parse result, reporting and resynchronizing on error.
    pub(crate) fn recover<T>(&mut self, result: PResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.report(&error);
                self.synchronize();
                None
            }
        }
    }

    /// Emit the suppressed-error summary and decide the parse outcome.
    fn finish(&self) -> Result<(), CompileFailed> {
        let errors = self.handler.error_count();
        if errors == 0 {
            return Ok(());
        }
        let suppressed = self.handler.suppressed();
        if suppressed > 0 {
            self.handler.sink().write(&format!(
                "{}: {} more error(s)\n",
                self.path.display(),
                suppressed
            ));
        }
        Err(CompileFailed {
            path: self.path.to_path_buf(),
            errors,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.path
    }

    pub(crate) fn source_arc(&self) -> Arc<str> {
        Arc::clone(self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpp_util::Sink;

    fn parse_source(text: &str) -> (Result<Stmt, CompileFailed>, Sink) {
        let sink = Sink::buffer();
        let handler = Handler::new(sink.clone());
        let source: Arc<str> = Arc::from(text);
        let path = Path::new("test.src");
        let parser = Parser::new(path, &source, &handler);
        (parser.parse(), sink)
    }

    #[test]
    fn test_parse_plain_text_only() {
        let (result, _) = parse_source("module m;\nendmodule\n");
        match result.unwrap() {
            Stmt::PlainText(_) => {}
            other => panic!("expected plain text, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty_input() {
        let (result, _) = parse_source("");
        assert!(matches!(result.unwrap(), Stmt::Compound(list) if list.is_empty()));
    }

    #[test]
    fn test_single_statement_is_unwrapped() {
        let (result, _) = parse_source("`let x = 1\n");
        assert!(matches!(result.unwrap(), Stmt::LocalVarDef { .. }));
    }

    #[test]
    fn test_multiple_statements_are_compound() {
        let (result, _) = parse_source("a`x`z");
        match result.unwrap() {
            Stmt::Compound(list) => assert_eq!(list.len(), 3),
            other => panic!("expected compound, got {other:?}"),
        }
    }

    #[test]
    fn test_error_discards_ast() {
        let (result, _) = parse_source("`let = 1\n");
        let failure = result.unwrap_err();
        assert_eq!(failure.errors, 1);
        assert!(failure.to_string().contains("compilation failed due to 1 error(s)"));
    }

    #[test]
    fn test_error_is_reported_with_path_and_caret() {
        let (result, sink) = parse_source("`let = 1\n");
        assert!(result.is_err());
        let output = sink.contents();
        assert!(output.contains("test.src:1:6: syntax error: expecting identifier; found '='"));
        assert!(output.contains('^'));
    }

    #[test]
    fn test_recovery_continues_after_error() {
        // First directive is broken; the second parses, so exactly one
        // error is counted.
        let (result, _) = parse_source("`let = 1\n`let y = 2\nok\n");
        assert_eq!(result.unwrap_err().errors, 1);
    }

    #[test]
    fn test_more_errors_summary() {
        let mut text = String::new();
        for _ in 0..7 {
            text.push_str("`let = 1\n");
        }
        let (result, sink) = parse_source(&text);
        assert_eq!(result.unwrap_err().errors, 7);
        let output = sink.contents();
        assert!(output.contains("test.src: 2 more error(s)"));
        // Only the first five rendered diagnostics appear.
        assert_eq!(output.matches("syntax error").count(), 5);
    }

    #[test]
    fn test_stray_terminator_reports_eof_mismatch() {
        let (result, sink) = parse_source("`endif\n");
        assert!(result.is_err());
        assert!(sink.contents().contains("expecting end of file; found 'endif'"));
    }

    #[test]
    fn test_lexical_error_is_recovered() {
        let (result, sink) = parse_source("`let x = #\nrest\n");
        assert!(result.is_err());
        assert!(sink.contents().contains("lexical error: unexpected character"));
    }

    #[test]
    fn test_parse_expression_entry() {
        let sink = Sink::buffer();
        let handler = Handler::new(sink.clone());
        let source: Arc<str> = Arc::from("1+2*3");
        let parser = Parser::for_expression(Path::new("test.src"), &source, &handler);
        let expr = parser.parse_expression().unwrap();
        match expr {
            Expr::Binary(b) => assert_eq!(b.op, BinOp::Add),
            other => panic!("expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_expression_rejects_trailing_tokens() {
        let sink = Sink::buffer();
        let handler = Handler::new(sink.clone());
        let source: Arc<str> = Arc::from("1 2");
        let parser = Parser::for_expression(Path::new("test.src"), &source, &handler);
        assert!(parser.parse_expression().is_err());
    }

    #[test]
    fn test_token_coverage_of_parse() {
        // Every value-bearing token of the input shows up in the tree.
        let text = "head`let xs = [1..3]\n`for (i : xs)\n`i`x\n`endfor\n";
        let (result, _) = parse_source(text);
        let root = result.unwrap();
        let mut covered = Vec::new();
        root.for_each_token(&mut |token| covered.push(token));
        let texts: Vec<&str> = covered
            .iter()
            .filter(|t| {
                matches!(
                    t.kind,
                    TokenKind::PlainText | TokenKind::Identifier | TokenKind::Integer
                )
            })
            .map(|t| t.text(text))
            .collect();
        for expected in ["head", "xs", "1", "3", "i", "xs", "i", "x"] {
            assert!(texts.contains(&expected), "missing token {expected:?}");
        }
    }
}
