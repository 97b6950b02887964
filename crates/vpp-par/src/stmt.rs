//! Statement parsing: the compound loop and the directive parsers.
//!
//! The compound loop interleaves two producers: verbatim text runs
//! become [`Stmt::PlainText`], and a backtick hands off to the directive
//! parser selected by the following keyword (or to an inline expression
//! statement). It stops at end of input or at a keyword that belongs to
//! an enclosing construct (`else`, `elseif`, `endif`, `endfor`,
//! `endmacro`), leaving that keyword for the caller.
//!
//! Each directive parser is recovery-structured: header and footer are
//! parsed inside a fallible section; a failure is reported and
//! resynchronized, but bodies are still consumed so the construct's
//! framing keywords stay matched. A directive that lost any part yields
//! `None` — the statement never reaches the tree, which is sound
//! because a file with errors discards its tree anyway.

use std::sync::Arc;

use vpp_lex::{Token, TokenKind};

use crate::ast::{Expr, Macro, Stmt, Storage};
use crate::{PResult, Parser};

impl<'a> Parser<'a> {
    /// Parse a statement sequence until end of input or an enclosing
    /// construct's keyword. Single statements are returned unwrapped.
    pub(crate) fn compound(&mut self) -> Stmt {
        let mut list: Vec<Stmt> = Vec::new();
        loop {
            if self.check(TokenKind::Backtick) {
                if let Err(error) = self.advance() {
                    self.report(&error);
                    self.synchronize();
                    continue;
                }
                match self.current().kind {
                    TokenKind::Newline => {
                        // Empty directive: swallows its newline.
                        let result = self.advance();
                        if let Err(error) = result {
                            self.report(&error);
                            self.synchronize();
                        }
                    }
                    TokenKind::Define => {
                        if let Some(stmt) = self.global_var_def() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::For => {
                        if let Some(stmt) = self.iteration() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::If => {
                        if let Some(stmt) = self.selection() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::Include => {
                        if let Some(stmt) = self.inclusion() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::Let => {
                        if let Some(stmt) = self.local_var_def() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::Macro => {
                        if let Some(stmt) = self.macro_def() {
                            list.push(stmt);
                        }
                    }
                    TokenKind::Else
                    | TokenKind::Elseif
                    | TokenKind::Endfor
                    | TokenKind::Endif
                    | TokenKind::Endmacro => break,
                    _ => {
                        if let Some(stmt) = self.expr_stmt() {
                            list.push(stmt);
                        }
                    }
                }
            } else if self.check(TokenKind::PlainText) {
                match self.advance() {
                    Ok(token) => list.push(Stmt::PlainText(token)),
                    Err(error) => {
                        self.report(&error);
                        self.synchronize();
                    }
                }
            } else {
                break;
            }
        }
        if list.len() == 1 {
            list.pop().expect("len checked")
        } else {
            Stmt::Compound(list)
        }
    }

    /// An inline directive: one expression, stringified into the output.
    fn expr_stmt(&mut self) -> Option<Stmt> {
        let token = self.current();
        let result = self.ternary();
        let expr = self.recover(result)?;
        Some(Stmt::ExprStmt { token, expr })
    }

    /// `` `let <storage> = <expr> ``
    fn local_var_def(&mut self) -> Option<Stmt> {
        let result = self.var_def_parts();
        let (token, target, expr) = self.recover(result)?;
        Some(Stmt::LocalVarDef {
            token,
            target,
            expr,
        })
    }

    /// `` `define <storage> = <expr> ``
    fn global_var_def(&mut self) -> Option<Stmt> {
        let result = self.var_def_parts();
        let (token, target, expr) = self.recover(result)?;
        Some(Stmt::GlobalVarDef {
            token,
            target,
            expr,
        })
    }

    fn var_def_parts(&mut self) -> PResult<(Token, Storage, Expr)> {
        let token = self.advance()?;
        let target = self.lhs_storage()?;
        self.consume(TokenKind::Equal)?;
        let expr = self.ternary()?;
        self.end_of_directive()?;
        Ok((token, target, expr))
    }

    /// `` `macro name(params) body `endmacro ``
    fn macro_def(&mut self) -> Option<Stmt> {
        let header = self.macro_header();
        let header = self.recover(header);
        let body = self.compound();
        let footer = self.directive_footer(TokenKind::Endmacro);
        if let Err(error) = footer {
            self.report(&error);
            self.synchronize();
        }
        let (token, target, params) = header?;
        let decl = Macro {
            file: self.path().to_path_buf(),
            source: self.source_arc(),
            params,
            body,
        };
        Some(Stmt::MacroDef {
            token,
            target,
            decl: Arc::new(decl),
        })
    }

    fn macro_header(&mut self) -> PResult<(Token, Storage, Vec<Token>)> {
        let token = self.advance()?;
        let target = self.lhs_storage()?;
        self.consume(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.match_kind(TokenKind::RParen)? {
            loop {
                params.push(self.consume(TokenKind::Identifier)?);
                if !self.match_kind(TokenKind::Comma)? {
                    break;
                }
            }
            self.consume(TokenKind::RParen)?;
        }
        self.end_of_directive()?;
        Ok((token, target, params))
    }

    /// `` `if (cond) ... `elseif (cond) ... `else ... `endif ``
    fn selection(&mut self) -> Option<Stmt> {
        let token = match self.advance() {
            Ok(token) => token,
            Err(error) => {
                self.report(&error);
                self.synchronize();
                return None;
            }
        };
        let mut arms: Vec<(Option<Expr>, Stmt)> = Vec::new();

        let cond = self.guard_parts();
        let cond = self.recover(cond);
        let body = self.compound();
        arms.push((cond, body));

        while self.check(TokenKind::Elseif) {
            let cond = self.elseif_parts();
            let cond = self.recover(cond);
            let body = self.compound();
            arms.push((cond, body));
        }

        if self.check(TokenKind::Else) {
            let header = self.else_parts();
            let else_token = self.recover(header);
            let body = self.compound();
            // The else branch is a synthetic always-true condition.
            arms.push((else_token.map(Expr::True), body));
        }

        let footer = self.directive_footer(TokenKind::Endif);
        if let Err(error) = footer {
            self.report(&error);
            self.synchronize();
        }

        let mut checked = Vec::with_capacity(arms.len());
        for (cond, body) in arms {
            checked.push((cond?, body));
        }
        Some(Stmt::Selection {
            token,
            arms: checked,
        })
    }

    /// `(cond) NL` after `if`.
    fn guard_parts(&mut self) -> PResult<Expr> {
        self.consume(TokenKind::LParen)?;
        let cond = self.ternary()?;
        self.consume(TokenKind::RParen)?;
        self.end_of_directive()?;
        Ok(cond)
    }

    /// `elseif (cond) NL`.
    fn elseif_parts(&mut self) -> PResult<Expr> {
        self.advance()?;
        self.guard_parts()
    }

    /// `else NL`; yields the `else` token for the synthetic condition.
    fn else_parts(&mut self) -> PResult<Token> {
        let token = self.advance()?;
        self.end_of_directive()?;
        Ok(token)
    }

    /// `` `for (<storage> : <expr>) body `endfor ``
    fn iteration(&mut self) -> Option<Stmt> {
        let header = self.iteration_header();
        let header = self.recover(header);
        let body = self.compound();
        let footer = self.directive_footer(TokenKind::Endfor);
        if let Err(error) = footer {
            self.report(&error);
            self.synchronize();
        }
        let (token, target, expr) = header?;
        Some(Stmt::Iteration {
            token,
            target,
            expr,
            body: Box::new(body),
        })
    }

    fn iteration_header(&mut self) -> PResult<(Token, Storage, Expr)> {
        let token = self.advance()?;
        self.consume(TokenKind::LParen)?;
        let target = self.lhs_storage()?;
        self.consume(TokenKind::Colon)?;
        let expr = self.ternary()?;
        self.consume(TokenKind::RParen)?;
        self.end_of_directive()?;
        Ok((token, target, expr))
    }

    /// `` `include <expr> ``
    fn inclusion(&mut self) -> Option<Stmt> {
        let result = self.inclusion_parts();
        let (token, expr) = self.recover(result)?;
        Some(Stmt::Inclusion { token, expr })
    }

    fn inclusion_parts(&mut self) -> PResult<(Token, Expr)> {
        let token = self.advance()?;
        let expr = self.ternary()?;
        self.end_of_directive()?;
        Ok((token, expr))
    }

    /// Closing keyword plus newline of a block construct.
    fn directive_footer(&mut self, kind: TokenKind) -> PResult<()> {
        self.consume(kind)?;
        self.end_of_directive()?;
        Ok(())
    }
}
