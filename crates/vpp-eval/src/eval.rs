//! Tree-walking evaluator.
//!
//! Evaluation of a [`Stmt`] appends to the output and mutates the
//! environment; evaluation of an [`Expr`] yields a [`Variant`].
//! Semantic errors are caught at statement boundaries: the statement is
//! reported, contributes nothing to the output, and evaluation
//! continues with the next statement. Errors inside expressions
//! propagate up to the enclosing statement, so a failed expression
//! statement commits no partial output.
//!
//! The evaluator walks one file's tree, but three constructs change
//! which buffer and path it reads against: macro calls evaluate the
//! body with the macro's defining file and buffer, `include` evaluates
//! another context's tree in place, and `$` interpolation re-enters the
//! lexer and parser on a runtime string under the outer file's path.

use std::path::{Path, PathBuf};

use thiserror::Error;

use vpp_lex::Token;
use vpp_par::{
    ArrayElement, BinOp, BuiltinExpr, BuiltinKind, Expr, InterpolateExpr, MacroCallExpr, Parser,
    Stmt, Storage, SubscriptExpr, UnOp,
};
use vpp_util::{Handler, SourceError};

use crate::context::Registry;
use crate::env::Environment;
use crate::value::{AccessError, ArrayRef, DictRef, Variant};

/// Terminal evaluation failure for one file.
#[derive(Debug, Error)]
#[error("{}: generation failed due to {errors} error(s)", .path.display())]
pub struct GenerationFailed {
    pub path: PathBuf,
    pub errors: usize,
}

/// Evaluate a parsed tree into its output string.
///
/// Diagnostics are reported through the environment as evaluation runs;
/// if any accumulated by the end (including errors inherited from an
/// enclosing evaluation sharing this environment), the output is
/// withheld and the count is returned instead. The suppressed-error
/// summary is emitted only at the outermost call.
pub fn visit(
    path: &Path,
    source: &str,
    ast: &Stmt,
    env: &mut Environment,
    registry: &Registry,
) -> Result<String, GenerationFailed> {
    let mut output = String::new();
    Evaluator::new(path, source, env, registry, &mut output).eval_stmt(ast);
    let errors = env.error_count();
    if errors == 0 {
        return Ok(output);
    }
    if env.call_depth() == 0 {
        let suppressed = env.suppressed();
        if suppressed > 0 {
            env.sink()
                .write(&format!("{}: {} more error(s)\n", path.display(), suppressed));
        }
    }
    Err(GenerationFailed {
        path: path.to_path_buf(),
        errors,
    })
}

/// A resolved l-value: somewhere a [`Variant`] can be read from and
/// written to. Identifiers and indirections resolve to environment
/// bindings; subscripts project into a shared container.
#[derive(Debug)]
pub enum Place {
    Binding(String),
    ArrayElement(ArrayRef, usize),
    DictEntry(DictRef, String),
}

/// The tree walk over one buffer. See [`visit`] for the entry point.
pub struct Evaluator<'a> {
    path: &'a Path,
    source: &'a str,
    env: &'a mut Environment,
    registry: &'a Registry,
    output: &'a mut String,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        path: &'a Path,
        source: &'a str,
        env: &'a mut Environment,
        registry: &'a Registry,
        output: &'a mut String,
    ) -> Self {
        Self {
            path,
            source,
            env,
            registry,
            output,
        }
    }

    /// A semantic error at `token`, rendered against this evaluator's
    /// buffer.
    fn semantic(&self, token: Token, message: impl ToString) -> SourceError {
        SourceError::semantic(token.span, self.source, message.to_string())
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    /// Evaluate one statement, catching and reporting its errors.
    pub fn eval_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Compound(list) => {
                for stmt in list {
                    self.eval_stmt(stmt);
                }
            }

            Stmt::PlainText(token) => self.output.push_str(token.text(self.source)),

            Stmt::ExprStmt { token, expr } => {
                let result = self.eval_expr(expr).and_then(|value| {
                    value
                        .to_output()
                        .map_err(|error| self.semantic(*token, error))
                });
                match result {
                    Ok(text) => self.output.push_str(&text),
                    Err(error) => self.env.report(&error),
                }
            }

            Stmt::LocalVarDef { target, expr, .. } => {
                let result = self
                    .eval_expr(expr)
                    .and_then(|value| self.define(target, value, false));
                if let Err(error) = result {
                    self.env.report(&error);
                }
            }

            Stmt::GlobalVarDef { target, expr, .. } => {
                let result = self
                    .eval_expr(expr)
                    .and_then(|value| self.define(target, value, true));
                if let Err(error) = result {
                    self.env.report(&error);
                }
            }

            Stmt::MacroDef { target, decl, .. } => {
                let value = Variant::Macro(decl.clone());
                if let Err(error) = self.define(target, value, true) {
                    self.env.report(&error);
                }
            }

            Stmt::Selection { arms, .. } => {
                if let Err(error) = self.eval_selection(arms) {
                    self.env.report(&error);
                }
            }

            Stmt::Iteration {
                token,
                target,
                expr,
                body,
            } => {
                if let Err(error) = self.eval_iteration(*token, target, expr, body) {
                    self.env.report(&error);
                }
            }

            Stmt::Inclusion { token, expr } => {
                if let Err(error) = self.eval_inclusion(*token, expr) {
                    self.env.report(&error);
                }
            }
        }
    }

    /// Bind `value` to a storage target, locally or globally.
    fn define(
        &mut self,
        target: &Storage,
        value: Variant,
        global: bool,
    ) -> Result<(), SourceError> {
        let name = match target {
            Storage::Identifier(token) => token.text(self.source).to_string(),
            Storage::Indirection(node) => {
                let computed = self.eval_expr(&node.expr)?;
                computed
                    .get_string()
                    .map_err(|error| self.semantic(node.token, error))?
            }
        };
        let result = if global {
            self.env.put_global(name.clone(), value)
        } else {
            self.env.put_local(name.clone(), value)
        };
        result.map_err(|_| {
            self.semantic(
                target.token(),
                format!("cannot define '{name}'; identifier already defined"),
            )
        })
    }

    /// First arm whose condition holds evaluates in a fresh block scope.
    fn eval_selection(&mut self, arms: &[(Expr, Stmt)]) -> Result<(), SourceError> {
        for (cond, body) in arms {
            let value = self.eval_expr(cond)?;
            let fire = value
                .get_bool()
                .map_err(|error| self.semantic(cond.token(), error))?;
            if fire {
                self.env
                    .push_block()
                    .map_err(|error| self.semantic(cond.token(), error))?;
                self.eval_stmt(body);
                self.env
                    .pop_block()
                    .map_err(|error| self.semantic(cond.token(), error))?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Iterate an array: per element, a fresh block scope binding
    /// `index` and the loop variable.
    fn eval_iteration(
        &mut self,
        token: Token,
        target: &Storage,
        expr: &Expr,
        body: &Stmt,
    ) -> Result<(), SourceError> {
        let value = self.eval_expr(expr)?;
        let items = value
            .as_array()
            .map_err(|error| self.semantic(token, error))?;
        // Iterate a snapshot of the handles; the elements themselves
        // stay shared.
        let snapshot: Vec<Variant> = items.borrow().clone();
        for (index, item) in snapshot.into_iter().enumerate() {
            self.env
                .push_block()
                .map_err(|error| self.semantic(token, error))?;
            let bound = self
                .env
                .put_local("index".to_string(), Variant::Int(index as i32))
                .map_err(|_| {
                    self.semantic(token, "cannot define 'index'; identifier already defined")
                })
                .and_then(|()| self.define(target, item, false));
            if let Err(error) = bound {
                let _ = self.env.pop_block();
                return Err(error);
            }
            self.eval_stmt(body);
            self.env
                .pop_block()
                .map_err(|error| self.semantic(token, error))?;
        }
        Ok(())
    }

    /// Evaluate another file's tree for its definitions. The included
    /// file's own output is discarded; headers exist to define things.
    fn eval_inclusion(&mut self, token: Token, expr: &Expr) -> Result<(), SourceError> {
        let value = self.eval_expr(expr)?;
        let name = value
            .get_string()
            .map_err(|error| self.semantic(token, error))?;
        let incl_path = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&name),
            _ => PathBuf::from(&name),
        };
        let Some(context) = self.registry.lookup(&incl_path) else {
            return Err(self.semantic(
                token,
                format!("cannot include '{name}'; file does not exist"),
            ));
        };
        let Some(ast) = &context.ast else {
            return Err(self.semantic(
                token,
                format!("failed to include '{name}' due to previous error(s)"),
            ));
        };
        self.env
            .push_include(context.path.clone(), token.span.line, token.span.column);
        let result = visit(&context.path, &context.source, ast, self.env, self.registry);
        self.env.pop_include();
        match result {
            Ok(_discarded_output) => Ok(()),
            Err(_) => Err(self.semantic(
                token,
                format!("failed to include '{name}' due to previous error(s)"),
            )),
        }
    }

    // =========================================================================
    // EXPRESSIONS
    // =========================================================================

    pub fn eval_expr(&mut self, expr: &Expr) -> Result<Variant, SourceError> {
        match expr {
            Expr::Binary(node) => {
                if node.op == BinOp::Inside {
                    return self.eval_inside(node.token, &node.lhs, &node.rhs);
                }
                let lhs = self.eval_expr(&node.lhs)?;
                let rhs = self.eval_expr(&node.rhs)?;
                let result = match node.op {
                    BinOp::Or => lhs.logical_or(&rhs),
                    BinOp::And => lhs.logical_and(&rhs),
                    BinOp::BitOr => lhs.bit_or(&rhs),
                    BinOp::BitXor => lhs.bit_xor(&rhs),
                    BinOp::BitAnd => lhs.bit_and(&rhs),
                    BinOp::Eq => lhs.eq_value(&rhs),
                    BinOp::Ne => lhs.ne_value(&rhs),
                    BinOp::Lt => lhs.lt(&rhs),
                    BinOp::Le => lhs.le(&rhs),
                    BinOp::Gt => lhs.gt(&rhs),
                    BinOp::Ge => lhs.ge(&rhs),
                    BinOp::Shl => lhs.shl(&rhs),
                    BinOp::Shr => lhs.shr(&rhs),
                    BinOp::Add => lhs.add(&rhs),
                    BinOp::Sub => lhs.sub(&rhs),
                    BinOp::Mul => lhs.mul(&rhs),
                    BinOp::Div => lhs.div(&rhs),
                    BinOp::Rem => lhs.rem(&rhs),
                    BinOp::Pow => lhs.pow(&rhs),
                    BinOp::Inside => unreachable!("handled above"),
                };
                result.map_err(|error| self.semantic(node.token, error))
            }

            Expr::Ternary(node) => {
                let cond = self.eval_expr(&node.cond)?;
                let taken = cond
                    .get_bool()
                    .map_err(|error| self.semantic(node.token, error))?;
                if taken {
                    self.eval_expr(&node.then_expr)
                } else {
                    self.eval_expr(&node.else_expr)
                }
            }

            Expr::Unary(node) => {
                let value = self.eval_expr(&node.expr)?;
                let result = match node.op {
                    UnOp::Not => value.logical_not(),
                    UnOp::Plus => value.unary_plus(),
                    UnOp::Neg => value.unary_minus(),
                    UnOp::BitNot => value.bit_not(),
                };
                result.map_err(|error| self.semantic(node.token, error))
            }

            Expr::Interpolate(node) => self.eval_interpolation(node),

            Expr::Indirection(node) => {
                let computed = self.eval_expr(&node.expr)?;
                let name = computed
                    .get_string()
                    .map_err(|error| self.semantic(node.token, error))?;
                self.env.get(&name).map_err(|_| {
                    self.semantic(
                        node.token,
                        format!("cannot find '{name}'; identifier undefined"),
                    )
                })
            }

            Expr::Builtin(node) => self.eval_builtin(node),

            Expr::Integer(token) => token
                .text(self.source)
                .parse::<i32>()
                .map(Variant::Int)
                .map_err(|_| self.semantic(*token, "integer literal out of range")),

            Expr::True(_) => Ok(Variant::Bool(true)),
            Expr::False(_) => Ok(Variant::Bool(false)),

            Expr::StringLit(token) => Ok(Variant::string(token.text(self.source))),

            Expr::EscapeSeq(token) => self.eval_escape(*token),

            Expr::Quotation(node) => {
                let mut text = Variant::string("");
                for segment in &node.segments {
                    let value = self.eval_expr(segment)?;
                    let piece = value
                        .to_output()
                        .map_err(|error| self.semantic(node.token, error))?;
                    text.add_assign(&Variant::string(piece))
                        .map_err(|error| self.semantic(node.token, error))?;
                }
                Ok(text)
            }

            Expr::Array(node) => self.eval_array(node.token, &node.elements),

            Expr::Dictionary(node) => {
                let mut entries = indexmap::IndexMap::new();
                for (key_expr, value_expr) in &node.entries {
                    let key = self.eval_expr(key_expr)?;
                    let key = key
                        .get_string()
                        .map_err(|error| self.semantic(node.token, error))?;
                    let value = self.eval_expr(value_expr)?;
                    entries.insert(key, value);
                }
                Ok(Variant::dict(entries))
            }

            Expr::MacroCall(node) => self.eval_macro_call(node),

            Expr::Identifier(token) => {
                let name = token.text(self.source);
                self.env.get(name).map_err(|_| {
                    self.semantic(
                        *token,
                        format!("cannot find '{name}'; identifier undefined"),
                    )
                })
            }

            Expr::Subscript(node) => {
                let base = self.eval_expr(&node.base)?;
                let index = self.eval_expr(&node.index)?;
                base.subscript(&index)
                    .map_err(|error| self.semantic(node.token, error))
            }
        }
    }

    /// `x inside arr`: true iff any element equals `x` under `==`.
    fn eval_inside(&mut self, token: Token, lhs: &Expr, rhs: &Expr) -> Result<Variant, SourceError> {
        let needle = self.eval_expr(lhs)?;
        let haystack = self.eval_expr(rhs)?;
        let items = haystack
            .as_array()
            .map_err(|error| self.semantic(token, error))?;
        let snapshot: Vec<Variant> = items.borrow().clone();
        for item in &snapshot {
            let equal = needle
                .eq_value(item)
                .map_err(|error| self.semantic(token, error))?;
            if matches!(equal, Variant::Bool(true)) {
                return Ok(Variant::Bool(true));
            }
        }
        Ok(Variant::Bool(false))
    }

    fn eval_builtin(&mut self, node: &BuiltinExpr) -> Result<Variant, SourceError> {
        match node.kind {
            BuiltinKind::Log2 => {
                let value = self.eval_expr(&node.args[0])?;
                value.log2().map_err(|error| self.semantic(node.token, error))
            }
            BuiltinKind::Clog2 => {
                let value = self.eval_expr(&node.args[0])?;
                value
                    .clog2()
                    .map_err(|error| self.semantic(node.token, error))
            }
            BuiltinKind::Size => {
                let value = self.eval_expr(&node.args[0])?;
                let items = value
                    .as_array()
                    .map_err(|error| self.semantic(node.token, error))?;
                let len = items.borrow().len();
                Ok(Variant::Int(len as i32))
            }
            BuiltinKind::Min => self.eval_fold(node, Variant::Int(i32::MAX), Variant::lt),
            BuiltinKind::Max => self.eval_fold(node, Variant::Int(i32::MIN), Variant::gt),
        }
    }

    /// `min`/`max`: fold the comparison over the arguments.
    fn eval_fold(
        &mut self,
        node: &BuiltinExpr,
        mut best: Variant,
        wins: fn(&Variant, &Variant) -> Result<Variant, AccessError>,
    ) -> Result<Variant, SourceError> {
        for arg in &node.args {
            let value = self.eval_expr(arg)?;
            let better = wins(&value, &best).map_err(|error| self.semantic(node.token, error))?;
            if matches!(better, Variant::Bool(true)) {
                best = value;
            }
        }
        Ok(best)
    }

    fn eval_escape(&self, token: Token) -> Result<Variant, SourceError> {
        let text = token.text(self.source);
        let expansion = match text {
            "'" => "'",
            "\"" => "\"",
            "\\" => "\\",
            "a" => "\x07",
            "b" => "\x08",
            "f" => "\x0c",
            "n" => "\n",
            "r" => "\r",
            "t" => "\t",
            "v" => "\x0b",
            _ => {
                return Err(self.semantic(
                    token,
                    format!("unknown escaped character '{text}'"),
                ))
            }
        };
        Ok(Variant::string(expansion))
    }

    /// `[e, lo..hi, ...]`: ranges expand to the closed integer sequence,
    /// counting down when `lo > hi`.
    fn eval_array(
        &mut self,
        token: Token,
        elements: &[ArrayElement],
    ) -> Result<Variant, SourceError> {
        let mut items = Vec::new();
        for element in elements {
            match &element.hi {
                Some(hi_expr) => {
                    let lo = self
                        .eval_expr(&element.lo)?
                        .get_int()
                        .map_err(|error| self.semantic(token, error))?;
                    let hi = self
                        .eval_expr(hi_expr)?
                        .get_int()
                        .map_err(|error| self.semantic(token, error))?;
                    let step: i32 = if lo <= hi { 1 } else { -1 };
                    let mut value = lo;
                    loop {
                        items.push(Variant::Int(value));
                        if value == hi {
                            break;
                        }
                        value = value.wrapping_add(step);
                    }
                }
                None => items.push(self.eval_expr(&element.lo)?),
            }
        }
        Ok(Variant::array(items))
    }

    /// Call a macro: arity-check, evaluate arguments in the caller's
    /// scope, run the body in a fresh call frame against the macro's
    /// defining buffer. Macros produce output by side effect and
    /// evaluate to void.
    fn eval_macro_call(&mut self, node: &MacroCallExpr) -> Result<Variant, SourceError> {
        let callee = self.eval_expr(&node.callee)?;
        let decl = callee
            .as_macro()
            .map_err(|error| self.semantic(node.token, error))?;
        if node.args.len() != decl.params.len() {
            return Err(self.semantic(
                node.token,
                format!(
                    "mismatched macro parameters; expecting {} got {}",
                    decl.params.len(),
                    node.args.len()
                ),
            ));
        }
        let mut values = Vec::with_capacity(node.args.len());
        for arg in &node.args {
            values.push(self.eval_expr(arg)?);
        }

        self.env
            .push_call(decl.file.clone(), node.token.span.line, node.token.span.column);
        let result = (|| -> Result<(), SourceError> {
            for (param, value) in decl.params.iter().zip(values) {
                let name = param.text(&decl.source).to_string();
                self.env.put_local(name.clone(), value).map_err(|_| {
                    SourceError::semantic(
                        param.span,
                        &decl.source,
                        format!("cannot define '{name}'; identifier already defined"),
                    )
                })?;
            }
            Evaluator::new(
                &decl.file,
                &decl.source,
                self.env,
                self.registry,
                self.output,
            )
            .eval_stmt(&decl.body);
            Ok(())
        })();
        self.env.pop_call();
        result.map(|()| Variant::Void)
    }

    /// `$e`: evaluate to a string, then lex, parse and evaluate that
    /// string as one expression sharing this environment and registry.
    /// Diagnostics attribute to this file; failures inside re-raise
    /// here.
    fn eval_interpolation(&mut self, node: &InterpolateExpr) -> Result<Variant, SourceError> {
        let value = self.eval_expr(&node.expr)?;
        let text = value
            .get_string()
            .map_err(|error| self.semantic(node.token, error))?;

        let nested_source: std::sync::Arc<str> = std::sync::Arc::from(text.as_str());
        let handler = Handler::new(self.env.sink().clone());
        let parser = Parser::for_expression(self.path, &nested_source, &handler);
        let Ok(expr) = parser.parse_expression() else {
            return Err(self.semantic(
                node.token,
                "interpolation failed due to previous errors",
            ));
        };

        let mut nested_output = String::new();
        let result = Evaluator::new(
            self.path,
            &nested_source,
            self.env,
            self.registry,
            &mut nested_output,
        )
        .eval_expr(&expr);
        match result {
            Ok(value) => {
                let rendered = value
                    .to_output()
                    .map_err(|error| self.semantic(node.token, error))?;
                Ok(Variant::string(rendered))
            }
            Err(error) => {
                self.env.report(&error);
                Err(self.semantic(
                    node.token,
                    "interpolation failed due to previous errors",
                ))
            }
        }
    }

    // =========================================================================
    // PLACES (L-VALUES)
    // =========================================================================

    /// Resolve a location expression to a mutable place. Identifiers
    /// and indirections resolve to their environment binding; a
    /// subscript resolves its base as a place, then projects into the
    /// container. Anything else is not a location.
    pub fn resolve_place(&mut self, expr: &Expr) -> Result<Place, SourceError> {
        match expr {
            Expr::Identifier(token) => {
                let name = token.text(self.source).to_string();
                self.env.get(&name).map_err(|_| {
                    self.semantic(
                        *token,
                        format!("cannot find '{name}'; identifier undefined"),
                    )
                })?;
                Ok(Place::Binding(name))
            }
            Expr::Indirection(node) => {
                let computed = self.eval_expr(&node.expr)?;
                let name = computed
                    .get_string()
                    .map_err(|error| self.semantic(node.token, error))?;
                self.env.get(&name).map_err(|_| {
                    self.semantic(
                        node.token,
                        format!("cannot find '{name}'; identifier undefined"),
                    )
                })?;
                Ok(Place::Binding(name))
            }
            Expr::Subscript(node) => self.resolve_subscript_place(node),
            other => Err(self.semantic(other.token(), "expression is not a location")),
        }
    }

    fn resolve_subscript_place(&mut self, node: &SubscriptExpr) -> Result<Place, SourceError> {
        let base = self.resolve_place(&node.base)?;
        let container = self.read_place(&base)?;
        let index = self.eval_expr(&node.index)?;
        match &container {
            Variant::Array(items) => {
                let i = index
                    .get_int()
                    .map_err(|error| self.semantic(node.token, error))?;
                let slot = usize::try_from(i)
                    .ok()
                    .filter(|&i| i < items.borrow().len())
                    .ok_or_else(|| self.semantic(node.token, AccessError::OutOfRange))?;
                Ok(Place::ArrayElement(items.clone(), slot))
            }
            Variant::Dict(entries) => {
                let key = index
                    .get_string()
                    .map_err(|error| self.semantic(node.token, error))?;
                if !entries.borrow().contains_key(&key) {
                    return Err(self.semantic(node.token, AccessError::OutOfRange));
                }
                Ok(Place::DictEntry(entries.clone(), key))
            }
            other => Err(self.semantic(
                node.token,
                format!(
                    "unexpected {} on '[]' left-hand side; expecting list or dictionary",
                    other.type_name()
                ),
            )),
        }
    }

    /// Read the current value out of a place.
    pub fn read_place(&mut self, place: &Place) -> Result<Variant, SourceError> {
        match place {
            Place::Binding(name) => Ok(self
                .env
                .get(name)
                .expect("place bindings are checked at resolution")),
            Place::ArrayElement(items, index) => Ok(items.borrow()[*index].clone()),
            Place::DictEntry(entries, key) => Ok(entries.borrow()[key.as_str()].clone()),
        }
    }

    /// Write a value into a place.
    pub fn write_place(&mut self, place: &Place, value: Variant) -> Result<(), SourceError> {
        match place {
            Place::Binding(name) => {
                *self
                    .env
                    .get_mut(name)
                    .expect("place bindings are checked at resolution") = value;
            }
            Place::ArrayElement(items, index) => items.borrow_mut()[*index] = value,
            Place::DictEntry(entries, key) => {
                entries.borrow_mut().insert(key.clone(), value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::Arc;
    use vpp_util::Sink;

    /// Compile one buffer into a context, panicking on parse errors
    /// unless `allow_failure` callers use [`compile_lenient`].
    fn compile(path: &str, text: &str) -> Context {
        let source: Arc<str> = Arc::from(text);
        let handler = Handler::new(Sink::buffer());
        let ast = Parser::new(Path::new(path), &source, &handler)
            .parse()
            .unwrap_or_else(|failure| panic!("unexpected parse failure: {failure}"));
        Context::new(path.into(), source, Some(ast))
    }

    fn compile_lenient(path: &str, text: &str) -> Context {
        let source: Arc<str> = Arc::from(text);
        let handler = Handler::new(Sink::buffer());
        let ast = Parser::new(Path::new(path), &source, &handler).parse().ok();
        Context::new(path.into(), source, ast)
    }

    /// Evaluate a set of compiled files, generating the first.
    fn generate(contexts: Vec<Context>) -> Result<String, (usize, String)> {
        let sink = Sink::buffer();
        let registry = Registry::new(contexts);
        let context = &registry.contexts()[0];
        let mut env = Environment::new(context.path.clone(), sink.clone());
        let ast = context.ast.as_ref().expect("generated file must parse");
        visit(&context.path, &context.source, ast, &mut env, &registry)
            .map_err(|failure| (failure.errors, sink.contents()))
    }

    fn expand(text: &str) -> String {
        generate(vec![compile("top.src", text)]).expect("generation failed")
    }

    fn expand_err(text: &str) -> (usize, String) {
        generate(vec![compile("top.src", text)]).expect_err("generation succeeded")
    }

    // =========================================================================
    // SPEC SCENARIOS
    // =========================================================================

    #[test]
    fn test_scenario_let_and_inline() {
        assert_eq!(expand("`let x = 2 + 3\nvalue=`x\n"), "value=5\n");
    }

    #[test]
    fn test_scenario_for_over_range() {
        assert_eq!(expand("`for (i : [1..3])\na`i\n`endfor\n"), "a1\na2\na3\n");
    }

    #[test]
    fn test_scenario_macro_call() {
        let text = "`macro greet(n)\nHello `n!\n`endmacro\n`greet(\"world\")`\n";
        assert_eq!(expand(text), "Hello world!\n");
    }

    #[test]
    fn test_scenario_selection() {
        assert_eq!(expand("`if (1 < 2)\nY\n`else\nN\n`endif\n"), "Y\n");
        assert_eq!(expand("`if (2 < 1)\nY\n`else\nN\n`endif\n"), "N\n");
    }

    #[test]
    fn test_scenario_include_definitions() {
        let header = compile("a.dat", "`let k = 1\n");
        let main = compile("b.src", "`include \"a.dat\"\nk=`k\n");
        assert_eq!(generate(vec![main, header]).unwrap(), "k=1\n");
    }

    #[test]
    fn test_scenario_interpolation() {
        assert_eq!(expand("`let s = \"1+2\"\n`$s\n"), "3\n");
    }

    #[test]
    fn test_verbatim_identity() {
        let text = "module m;\n  assign y = ~a;\nendmodule\n";
        assert_eq!(expand(text), text);
    }

    #[test]
    fn test_escaped_backtick() {
        assert_eq!(expand("a``b\n"), "a`b\n");
    }

    proptest::proptest! {
        /// A template with no directives expands to itself.
        #[test]
        fn prop_no_directives_is_identity(text in "[^`\\x00]{0,120}") {
            proptest::prop_assert_eq!(expand(&text), text);
        }
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    #[test]
    fn test_empty_iteration_produces_nothing() {
        assert_eq!(expand("`let xs = []\n`for (i : xs)\nx\n`endfor\n"), "");
    }

    #[test]
    fn test_iteration_binds_index() {
        assert_eq!(
            expand("`for (v : [10, 20])\n`index:`v\n`endfor\n"),
            "0:10\n1:20\n"
        );
    }

    #[test]
    fn test_iteration_descending_range() {
        assert_eq!(expand("`for (i : [3..1])\n`i\n`endfor\n"), "3\n2\n1\n");
    }

    #[test]
    fn test_iteration_single_element_range() {
        assert_eq!(expand("`for (i : [5..5])\n`i\n`endfor\n"), "5\n");
    }

    #[test]
    fn test_loop_variable_named_index_is_duplicate() {
        let (errors, output) = expand_err("`for (index : [1])\nx\n`endfor\n");
        assert_eq!(errors, 1);
        assert!(output.contains("cannot define 'index'; identifier already defined"));
    }

    #[test]
    fn test_selection_scopes_are_blocks() {
        // A let inside a taken branch is gone after `endif`.
        let (errors, output) =
            expand_err("`if (true)\n`let t = 1\n`endif\n`t\n");
        assert_eq!(errors, 1);
        assert!(output.contains("cannot find 't'; identifier undefined"));
    }

    #[test]
    fn test_selection_first_true_arm_wins() {
        let text = "`if (false)\nA\n`elseif (true)\nB\n`elseif (true)\nC\n`endif\n";
        assert_eq!(expand(text), "B\n");
    }

    #[test]
    fn test_selection_no_arm_fires() {
        assert_eq!(expand("`if (false)\nA\n`endif\nrest\n"), "rest\n");
    }

    #[test]
    fn test_selection_condition_type_error_is_caught() {
        let (errors, output) = expand_err("`if (1)\nA\n`endif\nafter\n");
        assert_eq!(errors, 1);
        assert!(output.contains("expecting boolean"));
    }

    #[test]
    fn test_define_is_global_across_include() {
        let header = compile("lib.dat", "`define WIDTH = 8\n");
        let main = compile("m.src", "`include \"lib.dat\"\n`WIDTH\n");
        assert_eq!(generate(vec![main, header]).unwrap(), "8\n");
    }

    #[test]
    fn test_indirect_definition() {
        assert_eq!(expand("`let @(\"a\" + \"b\") = 7\n`ab\n"), "7\n");
    }

    #[test]
    fn test_indirect_read() {
        assert_eq!(expand("`let ab = 7\n`let n = \"ab\"\n`@n\n"), "7\n");
    }

    #[test]
    fn test_include_output_is_discarded() {
        let header = compile("h.dat", "HEADER TEXT\n`let k = 2\n");
        let main = compile("m.src", "`include \"h.dat\"\n`k\n");
        assert_eq!(generate(vec![main, header]).unwrap(), "2\n");
    }

    #[test]
    fn test_include_missing_file() {
        let (errors, output) = expand_err("`include \"nope.dat\"\n");
        assert_eq!(errors, 1);
        assert!(output.contains("cannot include 'nope.dat'; file does not exist"));
    }

    #[test]
    fn test_include_of_failed_file() {
        let header = compile_lenient("bad.dat", "`let = broken\n");
        assert!(header.ast.is_none());
        let main = compile("m.src", "`include \"bad.dat\"\n");
        let (errors, output) = generate(vec![main, header]).unwrap_err();
        assert_eq!(errors, 1);
        assert!(output.contains("failed to include 'bad.dat' due to previous error(s)"));
    }

    #[test]
    fn test_include_resolves_relative_to_including_file() {
        let header = compile("sub/h.dat", "`let k = 3\n");
        let main = compile("sub/m.src", "`include \"h.dat\"\n`k\n");
        assert_eq!(generate(vec![main, header]).unwrap(), "3\n");
    }

    // =========================================================================
    // EXPRESSIONS
    // =========================================================================

    #[test]
    fn test_expression_operators_end_to_end() {
        assert_eq!(expand("`(2 ** 10)\n"), "1024\n");
        assert_eq!(expand("`(1 << 4 | 1)\n"), "17\n");
        assert_eq!(expand("`(7 % 3)\n"), "1\n");
        assert_eq!(expand("`(true && !false)\n"), "true\n");
        assert_eq!(expand("`(1 != 2)\n"), "true\n");
        assert_eq!(expand("`(\"a\" + \"b\")\n"), "ab\n");
    }

    #[test]
    fn test_ternary_expression() {
        assert_eq!(expand("`let w = 16\n`(w > 8 ? 1 : 0)\n"), "1\n");
    }

    #[test]
    fn test_inside_expression() {
        assert_eq!(expand("`(3 inside [1..4])\n"), "true\n");
        assert_eq!(expand("`(9 inside [1..4])\n"), "false\n");
        assert_eq!(expand("`(\"b\" inside [\"a\", \"b\"])\n"), "true\n");
    }

    #[test]
    fn test_logical_operands_are_eager() {
        // Both sides evaluate even when the left already decides.
        let (errors, output) = expand_err("`(true || missing)\n");
        assert_eq!(errors, 1);
        assert!(output.contains("cannot find 'missing'; identifier undefined"));
    }

    #[test]
    fn test_ternary_condition_must_be_boolean() {
        let (_, output) = expand_err("`(1 ? 2 : 3)\n");
        assert!(output.contains("expecting boolean"));
    }

    #[test]
    fn test_inside_type_mismatch() {
        let (_, output) = expand_err("`(1 inside [\"a\"])\n");
        assert!(output.contains("semantic error"));
    }

    #[test]
    fn test_builtin_expressions() {
        assert_eq!(expand("`log2(64)\n"), "6\n");
        assert_eq!(expand("`clog2(9)\n"), "4\n");
        assert_eq!(expand("`size([4..7])\n"), "4\n");
        assert_eq!(expand("`min(4, 2, 9)\n"), "2\n");
        assert_eq!(expand("`max(4, 2, 9)\n"), "9\n");
    }

    #[test]
    fn test_quotation_with_escapes() {
        assert_eq!(expand("`let s = \"a\\tb\\\\\"\n`s\n"), "a\tb\\\n");
    }

    #[test]
    fn test_unknown_escape_reports() {
        let (errors, output) = expand_err("`let s = \"\\q\"\n");
        assert_eq!(errors, 1);
        assert!(output.contains("unknown escaped character 'q'"));
    }

    #[test]
    fn test_dictionary_roundtrip() {
        let text = "`let cfg = {\"width\": 8, \"depth\": 32}\n`cfg[\"depth\"]\n";
        assert_eq!(expand(text), "32\n");
    }

    #[test]
    fn test_dictionary_missing_key() {
        let (_, output) = expand_err("`let d = {}\n`d[\"k\"]\n");
        assert!(output.contains("index is out of range"));
    }

    #[test]
    fn test_dictionary_concat_right_wins() {
        let text = "`let d = {\"a\": 1} + {\"a\": 2}\n`d[\"a\"]\n";
        assert_eq!(expand(text), "2\n");
    }

    #[test]
    fn test_array_concat_and_subscript() {
        assert_eq!(expand("`let a = [1] + [2, 3]\n`a[2]\n"), "3\n");
    }

    #[test]
    fn test_integer_literal_overflow() {
        let (errors, output) = expand_err("`9999999999\n");
        assert_eq!(errors, 1);
        assert!(output.contains("integer literal out of range"));
    }

    #[test]
    fn test_shared_array_mutation_via_two_names() {
        // Arrays copy by handle: concatenation does not alias, but two
        // bindings to one array observe the same payload.
        let text = "`let a = [1]\n`let b = a\n`size(b)\n";
        assert_eq!(expand(text), "1\n");
    }

    // =========================================================================
    // MACROS
    // =========================================================================

    #[test]
    fn test_macro_args_evaluated_in_caller_scope() {
        let text = "`macro emit(v)\n<`v>\n`endmacro\n`let x = 5\n`emit(x + 1)`\n";
        assert_eq!(expand(text), "<6>\n");
    }

    #[test]
    fn test_macro_does_not_see_caller_locals() {
        let text = "`macro peek()\n`hidden\n`endmacro\n`let hidden = 1\n`peek()`\n";
        let (errors, output) = expand_err(text);
        assert_eq!(errors, 1);
        assert!(output.contains("cannot find 'hidden'; identifier undefined"));
        // The call site shows up as a stack frame.
        assert!(output.contains("from top.src:5:6"));
    }

    #[test]
    fn test_macro_sees_globals() {
        let text = "`macro emit()\n`G\n`endmacro\n`define G = 3\n`emit()`\n";
        assert_eq!(expand(text), "3\n");
    }

    #[test]
    fn test_macro_arity_mismatch() {
        let text = "`macro two(a, b)\n`endmacro\n`two(1)`\n";
        let (errors, output) = expand_err(text);
        assert_eq!(errors, 1);
        assert!(output.contains("mismatched macro parameters; expecting 2 got 1"));
    }

    #[test]
    fn test_call_of_non_macro() {
        let (_, output) = expand_err("`let x = 1\n`x(2)`\n");
        assert!(output.contains("expecting macro"));
    }

    #[test]
    fn test_macro_value_is_void() {
        // The call's own value stringifies to nothing.
        let text = "`macro nop()\n`endmacro\n[`nop()]\n";
        assert_eq!(expand(text), "[]\n");
    }

    #[test]
    fn test_recursive_macro() {
        let text = concat!(
            "`macro count(n)\n",
            "`if (n > 0)\n",
            "`n\n",
            "`count(n - 1)`\n",
            "`endif\n",
            "`endmacro\n",
            "`count(3)`\n",
        );
        assert_eq!(expand(text), "3\n2\n1\n");
    }

    #[test]
    fn test_define_inside_macro_escapes_the_call() {
        // Globals bound by a macro body survive the call frame.
        let text = "`macro setup()\n`define G2 = 1\n`endmacro\n`setup()`\n`G2\n";
        assert_eq!(expand(text), "1\n");
    }

    #[test]
    fn test_chained_includes() {
        let inner = compile("c.dat", "`let deep = 9\n");
        let middle = compile("b.dat", "`include \"c.dat\"\n");
        let main = compile("a.src", "`include \"b.dat\"\n`deep\n");
        assert_eq!(generate(vec![main, middle, inner]).unwrap(), "9\n");
    }

    #[test]
    fn test_macro_defined_in_header_called_in_source() {
        let header = compile("lib.dat", "`macro tick(n)\n`n``ns\n`endmacro\n");
        let main = compile("m.src", "`include \"lib.dat\"\n`tick(10)`\n");
        assert_eq!(generate(vec![main, header]).unwrap(), "10`ns\n");
    }

    // =========================================================================
    // INTERPOLATION
    // =========================================================================

    #[test]
    fn test_interpolation_sees_environment() {
        let text = "`let w = 4\n`let e = \"w * 2\"\n`$e\n";
        assert_eq!(expand(text), "8\n");
    }

    #[test]
    fn test_interpolation_result_is_string() {
        // $e yields a string, so + concatenates rather than adds.
        let text = "`let e = \"2\"\n`($e + \"0\")\n";
        assert_eq!(expand(text), "20\n");
    }

    #[test]
    fn test_interpolation_parse_failure() {
        let (errors, output) = expand_err("`let e = \"1 +\"\n`$e\n");
        assert_eq!(errors, 1);
        assert!(output.contains("interpolation failed due to previous errors"));
    }

    #[test]
    fn test_interpolation_of_non_string() {
        let (_, output) = expand_err("`$5\n");
        assert!(output.contains("expecting string"));
    }

    // =========================================================================
    // ERROR SCENARIOS
    // =========================================================================

    #[test]
    fn test_undefined_identifier_scenario() {
        let (errors, output) = expand_err("before\n`x\nafter\n");
        assert_eq!(errors, 1);
        assert!(output.contains("top.src:2:2: semantic error: cannot find 'x'; identifier undefined"));
    }

    #[test]
    fn test_failed_statement_emits_nothing() {
        let output = generate(vec![compile("top.src", "a\n`x\nb\n")]);
        let (_, diagnostics) = output.unwrap_err();
        assert!(diagnostics.contains("identifier undefined"));
    }

    #[test]
    fn test_duplicate_definition_scenario() {
        let (errors, output) = expand_err("`let x = 1\n`let x = 2\n");
        assert_eq!(errors, 1);
        assert!(output.contains("cannot define 'x'; identifier already defined"));
        assert!(output.contains("top.src:2:6"));
    }

    #[test]
    fn test_out_of_range_scenario() {
        let (errors, output) = expand_err("`let a = [1,2,3]\n`a[5]\n");
        assert_eq!(errors, 1);
        assert!(output.contains("index is out of range"));
    }

    #[test]
    fn test_error_cap_and_summary() {
        let mut text = String::new();
        for _ in 0..8 {
            text.push_str("`missing\n");
        }
        let (errors, output) = expand_err(&text);
        assert_eq!(errors, 8);
        assert_eq!(output.matches("identifier undefined").count(), 5);
        assert!(output.contains("top.src: 3 more error(s)"));
    }

    #[test]
    fn test_stringify_array_fails() {
        let (_, output) = expand_err("`let a = [1]\n`a\n");
        assert!(output.contains("cannot stringify list"));
    }

    // =========================================================================
    // PLACES
    // =========================================================================

    #[test]
    fn test_place_resolution_and_write() {
        let sink = Sink::buffer();
        let mut env = Environment::new("place.src", sink.clone());
        env.put_local("a".into(), Variant::array(vec![Variant::Int(1), Variant::Int(2)]))
            .unwrap();
        let registry = Registry::new(Vec::new());

        let source: Arc<str> = Arc::from("a[1]");
        let handler = Handler::new(sink.clone());
        let expr = Parser::for_expression(Path::new("place.src"), &source, &handler)
            .parse_expression()
            .unwrap();

        let mut output = String::new();
        let mut evaluator =
            Evaluator::new(Path::new("place.src"), &source, &mut env, &registry, &mut output);
        let place = evaluator.resolve_place(&expr).unwrap();
        assert_eq!(evaluator.read_place(&place).unwrap().get_int().unwrap(), 2);
        evaluator.write_place(&place, Variant::Int(9)).unwrap();
        assert_eq!(evaluator.read_place(&place).unwrap().get_int().unwrap(), 9);

        // The write went through the shared container.
        assert_eq!(
            env.get("a").unwrap().subscript(&Variant::Int(1)).unwrap().get_int().unwrap(),
            9
        );
    }

    #[test]
    fn test_place_of_identifier() {
        let sink = Sink::buffer();
        let mut env = Environment::new("place.src", sink.clone());
        env.put_local("x".into(), Variant::Int(1)).unwrap();
        let registry = Registry::new(Vec::new());

        let source: Arc<str> = Arc::from("x");
        let handler = Handler::new(sink.clone());
        let expr = Parser::for_expression(Path::new("place.src"), &source, &handler)
            .parse_expression()
            .unwrap();

        let mut output = String::new();
        let mut evaluator =
            Evaluator::new(Path::new("place.src"), &source, &mut env, &registry, &mut output);
        let place = evaluator.resolve_place(&expr).unwrap();
        evaluator.write_place(&place, Variant::Int(5)).unwrap();
        assert_eq!(env.get("x").unwrap().get_int().unwrap(), 5);
    }

    #[test]
    fn test_place_rejects_non_location() {
        let sink = Sink::buffer();
        let mut env = Environment::new("place.src", sink.clone());
        let registry = Registry::new(Vec::new());

        let source: Arc<str> = Arc::from("1 + 2");
        let handler = Handler::new(sink.clone());
        let expr = Parser::for_expression(Path::new("place.src"), &source, &handler)
            .parse_expression()
            .unwrap();

        let mut output = String::new();
        let mut evaluator =
            Evaluator::new(Path::new("place.src"), &source, &mut env, &registry, &mut output);
        let error = evaluator.resolve_place(&expr).unwrap_err();
        assert!(error.message.contains("not a location"));
    }
}
