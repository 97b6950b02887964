//! Three-mode scanner over one template buffer.
//!
//! The lexer switches between three modes while scanning a single
//! immutable buffer:
//!
//! - **Verbatim**: the default. Emits maximal [`TokenKind::PlainText`]
//!   runs; a single backtick switches to directive mode, a run of `N >= 2`
//!   backticks escapes to `N-1` literal backticks.
//! - **Directive**: the embedded expression/statement language. Skips
//!   spaces and tabs, recognizes the operator/keyword/builtin vocabulary,
//!   and emits [`TokenKind::Newline`] only when no grouping is open, so
//!   directives may span lines inside `(...)`, `[...]` or `{...}`.
//! - **Quotation**: inside a string literal. Emits text runs and
//!   single-byte escape sequences until the closing quote.
//!
//! Whether a directive is *inline* (entered with a bare backtick, ends at
//! the first token that cannot extend an expression) or a *block*
//! directive (keyword-introduced, runs to the newline) is decided while
//! scanning: seeing a keyword clears the inline flag; in inline mode the
//! lexer drops back to verbatim after an integer, after an identifier not
//! followed by `(` or `[`, or after a closing bracket that leaves all
//! groupings closed.

use vpp_util::{SourceError, Span};

use crate::cursor::Cursor;
use crate::token::{Token, TokenKind};

/// Scanner mode. See the module docs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Verbatim,
    Directive,
    Quotation,
}

/// The three-mode lexer.
pub struct Lexer<'a> {
    cursor: Cursor<'a>,

    /// Current scanner mode.
    mode: Mode,

    /// True while scanning an inline directive that has not yet proven
    /// itself to be a block directive.
    inline: bool,

    /// Open `(`/`[`/`{` groupings inside the current directive.
    nesting: u32,

    /// Start of the token being scanned.
    token_start: usize,
    token_line: u32,
    token_column: u32,
}

impl<'a> Lexer<'a> {
    /// Lexer over a template, starting in verbatim mode.
    pub fn new(source: &'a str) -> Self {
        Self {
            cursor: Cursor::new(source),
            mode: Mode::Verbatim,
            inline: false,
            nesting: 0,
            token_start: 0,
            token_line: 1,
            token_column: 1,
        }
    }

    /// Lexer over an interpolated string, starting directly in directive
    /// mode so the whole input reads as one expression.
    pub fn for_expression(source: &'a str) -> Self {
        Self {
            mode: Mode::Directive,
            ..Self::new(source)
        }
    }

    /// The buffer this lexer scans.
    pub fn source(&self) -> &'a str {
        self.cursor.source()
    }

    /// Scan the next token.
    pub fn next_token(&mut self) -> Result<Token, SourceError> {
        match self.mode {
            Mode::Verbatim => Ok(self.verbatim()),
            Mode::Directive => self.directive(),
            Mode::Quotation => Ok(self.quotation()),
        }
    }

    /// Reset after a parse error: back to verbatim mode, inline flag
    /// cleared, all groupings abandoned. The parser then drops one token
    /// to resume at the next directive or newline boundary.
    pub fn synchronize(&mut self) {
        self.mode = Mode::Verbatim;
        self.inline = false;
        self.nesting = 0;
    }

    // =========================================================================
    // MODES
    // =========================================================================

    fn verbatim(&mut self) -> Token {
        self.begin_token();
        match self.cursor.advance() {
            0 => self.emit(TokenKind::EndOfFile),

            b'`' => {
                if self.cursor.match_byte(b'`') {
                    // Escaped backtick: a run of N backticks collapses to
                    // N-1 literal ones. Drop the first from the token.
                    self.token_start += 1;
                    self.token_column += 1;
                    while self.cursor.peek() == b'`' {
                        self.cursor.advance();
                    }
                    self.emit(TokenKind::PlainText)
                } else {
                    self.mode = Mode::Directive;
                    self.inline = true;
                    self.emit(TokenKind::Backtick)
                }
            }

            _ => {
                while self.cursor.peek() != b'`' && self.cursor.peek() != 0 {
                    self.cursor.advance();
                }
                self.emit(TokenKind::PlainText)
            }
        }
    }

    fn directive(&mut self) -> Result<Token, SourceError> {
        loop {
            self.begin_token();
            let token = match self.cursor.advance() {
                0 => self.emit(TokenKind::EndOfFile),

                b'\n' => {
                    if self.nesting != 0 {
                        // Inside a grouping the newline is whitespace.
                        continue;
                    }
                    self.mode = Mode::Verbatim;
                    self.emit(TokenKind::Newline)
                }

                b' ' | b'\t' => {
                    while matches!(self.cursor.peek(), b' ' | b'\t') {
                        self.cursor.advance();
                    }
                    continue;
                }

                b'!' => {
                    if self.cursor.match_byte(b'=') {
                        self.emit(TokenKind::BangEqual)
                    } else {
                        self.emit(TokenKind::Bang)
                    }
                }

                b'"' => {
                    self.mode = Mode::Quotation;
                    self.emit(TokenKind::DoubleQuote)
                }

                b'$' => self.emit(TokenKind::Dollar),
                b'%' => self.emit(TokenKind::Percent),

                b'&' => {
                    if self.cursor.match_byte(b'&') {
                        self.emit(TokenKind::AmpAmp)
                    } else {
                        self.emit(TokenKind::Amp)
                    }
                }

                b'(' => {
                    self.nesting += 1;
                    self.emit(TokenKind::LParen)
                }

                b')' => {
                    self.close_grouping();
                    self.emit(TokenKind::RParen)
                }

                b'*' => {
                    if self.cursor.match_byte(b'*') {
                        self.emit(TokenKind::StarStar)
                    } else {
                        self.emit(TokenKind::Star)
                    }
                }

                b'+' => {
                    if self.cursor.match_byte(b'=') {
                        self.emit(TokenKind::PlusEqual)
                    } else {
                        self.emit(TokenKind::Plus)
                    }
                }

                b',' => self.emit(TokenKind::Comma),
                b'-' => self.emit(TokenKind::Minus),

                b'.' => {
                    if self.cursor.match_byte(b'.') {
                        self.emit(TokenKind::DotDot)
                    } else {
                        self.emit(TokenKind::Dot)
                    }
                }

                b'/' => self.emit(TokenKind::Slash),

                b'0'..=b'9' => {
                    while self.cursor.peek().is_ascii_digit() {
                        self.cursor.advance();
                    }
                    self.maybe_leave_inline();
                    self.emit(TokenKind::Integer)
                }

                b':' => self.emit(TokenKind::Colon),

                b'<' => {
                    if self.cursor.match_byte(b'=') {
                        self.emit(TokenKind::LessEqual)
                    } else if self.cursor.match_byte(b'<') {
                        self.emit(TokenKind::LessLess)
                    } else {
                        self.emit(TokenKind::Less)
                    }
                }

                b'=' => {
                    if self.cursor.match_byte(b'=') {
                        self.emit(TokenKind::EqualEqual)
                    } else {
                        self.emit(TokenKind::Equal)
                    }
                }

                b'>' => {
                    if self.cursor.match_byte(b'=') {
                        self.emit(TokenKind::GreaterEqual)
                    } else if self.cursor.match_byte(b'>') {
                        self.emit(TokenKind::GreaterGreater)
                    } else {
                        self.emit(TokenKind::Greater)
                    }
                }

                b'?' => self.emit(TokenKind::Question),
                b'@' => self.emit(TokenKind::At),

                b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.identifier(),

                b'[' => {
                    self.nesting += 1;
                    self.emit(TokenKind::LBracket)
                }

                b']' => {
                    self.close_grouping();
                    self.emit(TokenKind::RBracket)
                }

                b'^' => self.emit(TokenKind::Caret),
                b'`' => self.emit(TokenKind::Backtick),

                b'{' => {
                    self.nesting += 1;
                    self.emit(TokenKind::LBrace)
                }

                b'|' => {
                    if self.cursor.match_byte(b'|') {
                        self.emit(TokenKind::PipePipe)
                    } else {
                        self.emit(TokenKind::Pipe)
                    }
                }

                b'}' => {
                    self.close_grouping();
                    self.emit(TokenKind::RBrace)
                }

                b'~' => self.emit(TokenKind::Tilde),

                _ => {
                    let token = self.emit(TokenKind::Invalid);
                    return Err(SourceError::lexical(
                        token.span,
                        self.source(),
                        "unexpected character",
                    ));
                }
            };
            return Ok(token);
        }
    }

    fn identifier(&mut self) -> Token {
        while matches!(self.cursor.peek(), b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_') {
            self.cursor.advance();
        }
        let text = self.cursor.slice_from(self.token_start);
        if let Some(kind) = TokenKind::keyword(text) {
            // A keyword turns the directive into a block directive that
            // runs to the newline.
            self.inline = false;
            return self.emit(kind);
        }
        if let Some(kind) = TokenKind::builtin(text) {
            return self.emit(kind);
        }
        // A call or subscript extends an inline expression; anything else
        // ends it.
        if self.nesting == 0 && self.inline && !matches!(self.cursor.peek(), b'(' | b'[') {
            self.mode = Mode::Verbatim;
        }
        self.emit(TokenKind::Identifier)
    }

    fn quotation(&mut self) -> Token {
        self.begin_token();
        match self.cursor.advance() {
            0 => self.emit(TokenKind::EndOfFile),

            b'"' => {
                self.mode = Mode::Directive;
                self.emit(TokenKind::DoubleQuote)
            }

            b'\\' => {
                // The token is the single escaped byte, backslash dropped.
                self.begin_token();
                self.cursor.advance();
                self.emit(TokenKind::EscapeSeq)
            }

            _ => {
                loop {
                    match self.cursor.peek() {
                        b'\\' | b'"' | 0 => break,
                        _ => {
                            self.cursor.advance();
                        }
                    }
                }
                self.emit(TokenKind::PlainText)
            }
        }
    }

    // =========================================================================
    // HANDLES
    // =========================================================================

    /// Mark the current cursor position as the start of the next token.
    fn begin_token(&mut self) {
        self.token_start = self.cursor.position();
        self.token_line = self.cursor.line();
        self.token_column = self.cursor.column();
    }

    /// Emit a token spanning from the marked start to the cursor.
    fn emit(&mut self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Span::new(
                self.token_start,
                self.cursor.position(),
                self.token_line,
                self.token_column,
            ),
        )
    }

    /// Handle a closing `)`/`]`/`}`: pop one grouping level and drop an
    /// inline directive back to verbatim once everything is closed.
    fn close_grouping(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
        self.maybe_leave_inline();
    }

    fn maybe_leave_inline(&mut self) {
        if self.nesting == 0 && self.inline {
            self.mode = Mode::Verbatim;
        }
    }
}
