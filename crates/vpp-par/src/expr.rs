//! Expression parsing: precedence climbing from loosest to tightest.
//!
//! # Operator precedence (loosest to tightest)
//!
//! | Level | Operators | Associativity |
//! |-------|-----------|---------------|
//! | 1 | `?:` | Right |
//! | 2 | `\|\|` | Left |
//! | 3 | `&&` | Left |
//! | 4 | `\|` | Left |
//! | 5 | `^` | Left |
//! | 6 | `&` | Left |
//! | 7 | `==`, `!=` | Left |
//! | 8 | `<`, `<=`, `>`, `>=`, `inside` | None (single) |
//! | 9 | `<<`, `>>` | Left |
//! | 10 | `+`, `-` | Left |
//! | 11 | `*`, `/`, `%` | Left |
//! | 12 | `**` | Right |
//! | 13 | prefix `!`, `$`, `+`, `-`, `~`, `@` | Prefix |
//! | 14 | call `(...)`, subscript `[...]` | Postfix |
//!
//! Each level is a named method that parses the tighter level and folds
//! its own operators, so the grammar reads directly off the code. The
//! relational level deliberately does not iterate: `a < b < c` is a
//! syntax error rather than a surprise, since the second `<` has no
//! integer left operand worth chaining.

use vpp_lex::{Token, TokenKind};

use crate::ast::{
    ArrayElement, ArrayExpr, BinOp, BinaryExpr, BuiltinExpr, BuiltinKind, DictionaryExpr, Expr,
    IndirectionExpr, InterpolateExpr, MacroCallExpr, QuotationExpr, Storage, SubscriptExpr,
    TernaryExpr, UnOp, UnaryExpr,
};
use crate::{PResult, Parser};

impl<'a> Parser<'a> {
    /// Entry point for a full expression.
    pub(crate) fn ternary(&mut self) -> PResult<Expr> {
        let cond = self.logical_or()?;
        if !self.check(TokenKind::Question) {
            return Ok(cond);
        }
        let token = self.advance()?;
        let then_expr = self.ternary()?;
        self.consume(TokenKind::Colon)?;
        let else_expr = self.ternary()?;
        Ok(Expr::Ternary(Box::new(TernaryExpr {
            token,
            cond,
            then_expr,
            else_expr,
        })))
    }

    fn binary(op: BinOp, token: Token, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(Box::new(BinaryExpr { op, token, lhs, rhs }))
    }

    fn logical_or(&mut self) -> PResult<Expr> {
        let mut expr = self.logical_and()?;
        while self.check(TokenKind::PipePipe) {
            let token = self.advance()?;
            let rhs = self.logical_and()?;
            expr = Self::binary(BinOp::Or, token, expr, rhs);
        }
        Ok(expr)
    }

    fn logical_and(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_or()?;
        while self.check(TokenKind::AmpAmp) {
            let token = self.advance()?;
            let rhs = self.bitwise_or()?;
            expr = Self::binary(BinOp::And, token, expr, rhs);
        }
        Ok(expr)
    }

    fn bitwise_or(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_xor()?;
        while self.check(TokenKind::Pipe) {
            let token = self.advance()?;
            let rhs = self.bitwise_xor()?;
            expr = Self::binary(BinOp::BitOr, token, expr, rhs);
        }
        Ok(expr)
    }

    fn bitwise_xor(&mut self) -> PResult<Expr> {
        let mut expr = self.bitwise_and()?;
        while self.check(TokenKind::Caret) {
            let token = self.advance()?;
            let rhs = self.bitwise_and()?;
            expr = Self::binary(BinOp::BitXor, token, expr, rhs);
        }
        Ok(expr)
    }

    fn bitwise_and(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.check(TokenKind::Amp) {
            let token = self.advance()?;
            let rhs = self.equality()?;
            expr = Self::binary(BinOp::BitAnd, token, expr, rhs);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.relational()?;
        loop {
            let op = match self.current().kind {
                TokenKind::EqualEqual => BinOp::Eq,
                TokenKind::BangEqual => BinOp::Ne,
                _ => return Ok(expr),
            };
            let token = self.advance()?;
            let rhs = self.relational()?;
            expr = Self::binary(op, token, expr, rhs);
        }
    }

    fn relational(&mut self) -> PResult<Expr> {
        let expr = self.shift()?;
        let op = match self.current().kind {
            TokenKind::Greater => BinOp::Gt,
            TokenKind::GreaterEqual => BinOp::Ge,
            TokenKind::Less => BinOp::Lt,
            TokenKind::LessEqual => BinOp::Le,
            TokenKind::Inside => BinOp::Inside,
            _ => return Ok(expr),
        };
        let token = self.advance()?;
        let rhs = self.shift()?;
        Ok(Self::binary(op, token, expr, rhs))
    }

    fn shift(&mut self) -> PResult<Expr> {
        let mut expr = self.additive()?;
        loop {
            let op = match self.current().kind {
                TokenKind::LessLess => BinOp::Shl,
                TokenKind::GreaterGreater => BinOp::Shr,
                _ => return Ok(expr),
            };
            let token = self.advance()?;
            let rhs = self.additive()?;
            expr = Self::binary(op, token, expr, rhs);
        }
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut expr = self.multiplicative()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Ok(expr),
            };
            let token = self.advance()?;
            let rhs = self.multiplicative()?;
            expr = Self::binary(op, token, expr, rhs);
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut expr = self.exponentiation()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Rem,
                _ => return Ok(expr),
            };
            let token = self.advance()?;
            let rhs = self.exponentiation()?;
            expr = Self::binary(op, token, expr, rhs);
        }
    }

    /// `**` is right-associative: `2 ** 3 ** 2` is `2 ** (3 ** 2)`.
    fn exponentiation(&mut self) -> PResult<Expr> {
        let expr = self.rhs_prefix()?;
        if !self.check(TokenKind::StarStar) {
            return Ok(expr);
        }
        let token = self.advance()?;
        let rhs = self.exponentiation()?;
        Ok(Self::binary(BinOp::Pow, token, expr, rhs))
    }

    pub(crate) fn rhs_prefix(&mut self) -> PResult<Expr> {
        let op = match self.current().kind {
            TokenKind::Bang => Some(UnOp::Not),
            TokenKind::Plus => Some(UnOp::Plus),
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Tilde => Some(UnOp::BitNot),
            TokenKind::Dollar => {
                let token = self.advance()?;
                let expr = self.rhs_prefix()?;
                return Ok(Expr::Interpolate(Box::new(InterpolateExpr { token, expr })));
            }
            TokenKind::At => {
                let token = self.advance()?;
                let expr = self.rhs_prefix()?;
                return Ok(Expr::Indirection(Box::new(IndirectionExpr { token, expr })));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                let token = self.advance()?;
                let expr = self.rhs_prefix()?;
                Ok(Expr::Unary(Box::new(UnaryExpr { op, token, expr })))
            }
            None => self.rhs_postfix(),
        }
    }

    fn rhs_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.rhs_primary()?;
        loop {
            match self.current().kind {
                TokenKind::LParen => {
                    let token = self.advance()?;
                    let args = self.call_args()?;
                    expr = Expr::MacroCall(Box::new(MacroCallExpr {
                        token,
                        callee: expr,
                        args,
                    }));
                }
                TokenKind::LBracket => {
                    let token = self.advance()?;
                    let index = self.subscript_tail()?;
                    expr = Expr::Subscript(Box::new(SubscriptExpr {
                        token,
                        base: expr,
                        index,
                    }));
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Argument list after a consumed `(`.
    fn call_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.match_kind(TokenKind::RParen)? {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if !self.match_kind(TokenKind::Comma)? {
                break;
            }
        }
        self.consume(TokenKind::RParen)?;
        Ok(args)
    }

    /// Index expression after a consumed `[`.
    fn subscript_tail(&mut self) -> PResult<Expr> {
        let index = self.ternary()?;
        self.consume(TokenKind::RBracket)?;
        Ok(index)
    }

    fn rhs_primary(&mut self) -> PResult<Expr> {
        match self.current().kind {
            TokenKind::DoubleQuote => self.quotation(),
            TokenKind::LParen => {
                self.advance()?;
                let expr = self.ternary()?;
                self.consume(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => self.array(),
            TokenKind::LBrace => self.dictionary(),
            TokenKind::Log2 => self.unary_builtin(BuiltinKind::Log2),
            TokenKind::Clog2 => self.unary_builtin(BuiltinKind::Clog2),
            TokenKind::Size => self.unary_builtin(BuiltinKind::Size),
            TokenKind::Max => self.variadic_builtin(BuiltinKind::Max),
            TokenKind::Min => self.variadic_builtin(BuiltinKind::Min),
            TokenKind::Integer => Ok(Expr::Integer(self.advance()?)),
            TokenKind::Identifier => Ok(Expr::Identifier(self.advance()?)),
            TokenKind::True => Ok(Expr::True(self.advance()?)),
            TokenKind::False => Ok(Expr::False(self.advance()?)),
            found => Err(self.unexpected(format!(
                "expecting \"(\", \"[\", literal or identifier; found {found}"
            ))),
        }
    }

    /// `"..."`: alternating text fragments and escapes until the
    /// closing quote.
    fn quotation(&mut self) -> PResult<Expr> {
        let token = self.advance()?;
        let mut segments = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::EscapeSeq => segments.push(Expr::EscapeSeq(self.advance()?)),
                TokenKind::PlainText => segments.push(Expr::StringLit(self.advance()?)),
                TokenKind::DoubleQuote => {
                    self.advance()?;
                    return Ok(Expr::Quotation(Box::new(QuotationExpr { token, segments })));
                }
                found => {
                    return Err(self.unexpected(format!(
                        "expecting text or escaped character in string; found {found}"
                    )))
                }
            }
        }
    }

    /// `[e, lo..hi, ...]`
    fn array(&mut self) -> PResult<Expr> {
        let token = self.advance()?;
        let mut elements = Vec::new();
        if !self.check(TokenKind::RBracket) {
            loop {
                let lo = self.ternary()?;
                let hi = if self.match_kind(TokenKind::DotDot)? {
                    Some(self.ternary()?)
                } else {
                    None
                };
                elements.push(ArrayElement { lo, hi });
                if !self.match_kind(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket)?;
        Ok(Expr::Array(Box::new(ArrayExpr { token, elements })))
    }

    /// `{k: v, ...}`; keys are full expressions evaluated to strings.
    fn dictionary(&mut self) -> PResult<Expr> {
        let token = self.advance()?;
        let mut entries = Vec::new();
        if !self.check(TokenKind::RBrace) {
            loop {
                let key = self.ternary()?;
                self.consume(TokenKind::Colon)?;
                let value = self.ternary()?;
                entries.push((key, value));
                if !self.match_kind(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBrace)?;
        Ok(Expr::Dictionary(Box::new(DictionaryExpr { token, entries })))
    }

    /// `log2(e)`, `clog2(e)`, `size(e)`: exactly one argument.
    fn unary_builtin(&mut self, kind: BuiltinKind) -> PResult<Expr> {
        let token = self.advance()?;
        self.consume(TokenKind::LParen)?;
        let arg = self.ternary()?;
        self.consume(TokenKind::RParen)?;
        Ok(Expr::Builtin(Box::new(BuiltinExpr {
            kind,
            token,
            args: vec![arg],
        })))
    }

    /// `min(e1, ...)`, `max(e1, ...)`: one or more arguments.
    fn variadic_builtin(&mut self, kind: BuiltinKind) -> PResult<Expr> {
        let token = self.advance()?;
        self.consume(TokenKind::LParen)?;
        let mut args = Vec::new();
        loop {
            args.push(self.ternary()?);
            if !self.match_kind(TokenKind::Comma)? {
                break;
            }
        }
        self.consume(TokenKind::RParen)?;
        Ok(Expr::Builtin(Box::new(BuiltinExpr { kind, token, args })))
    }

    /// A definable place: `name` or `@<computed-name>`.
    pub(crate) fn lhs_storage(&mut self) -> PResult<Storage> {
        if self.check(TokenKind::At) {
            let token = self.advance()?;
            let expr = self.rhs_prefix()?;
            Ok(Storage::Indirection(Box::new(IndirectionExpr {
                token,
                expr,
            })))
        } else {
            let token = self.consume(TokenKind::Identifier)?;
            Ok(Storage::Identifier(token))
        }
    }
}
