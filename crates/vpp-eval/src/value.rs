//! The dynamic value model of the directive language.
//!
//! A [`Variant`] holds one of seven alternatives. Integers and booleans
//! are inline; strings, arrays and dictionaries are reference-counted
//! containers with shared semantics on copy, so mutating a container
//! through one handle is visible through every other. Macros are shared
//! references into parsed trees.
//!
//! Every operation below is total on its declared domain and fails with
//! [`AccessError`] otherwise; there is no implicit coercion anywhere.
//! All integer arithmetic wraps on 32 bits.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use vpp_par::Macro;

/// Shared string payload.
pub type StrRef = Rc<RefCell<String>>;
/// Shared array payload.
pub type ArrayRef = Rc<RefCell<Vec<Variant>>>;
/// Shared dictionary payload; keys keep insertion order.
pub type DictRef = Rc<RefCell<IndexMap<String, Variant>>>;

/// Failure of a variant operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    /// Operand type outside an operation's domain.
    #[error("{0}")]
    BadAccess(String),
    /// Array index or dictionary key misses.
    #[error("index is out of range")]
    OutOfRange,
}

fn bad(message: String) -> AccessError {
    AccessError::BadAccess(message)
}

/// The dynamic value type.
#[derive(Clone, Debug)]
pub enum Variant {
    Void,
    Int(i32),
    Bool(bool),
    Str(StrRef),
    Array(ArrayRef),
    Dict(DictRef),
    Macro(Arc<Macro>),
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Variant::Void, Variant::Void) => true,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Str(a), Variant::Str(b)) => a == b,
            (Variant::Array(a), Variant::Array(b)) => a == b,
            (Variant::Dict(a), Variant::Dict(b)) => a == b,
            (Variant::Macro(a), Variant::Macro(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Variant {
    /// A fresh string value.
    pub fn string(text: impl Into<String>) -> Self {
        Variant::Str(Rc::new(RefCell::new(text.into())))
    }

    /// A fresh array value.
    pub fn array(items: Vec<Variant>) -> Self {
        Variant::Array(Rc::new(RefCell::new(items)))
    }

    /// A fresh dictionary value.
    pub fn dict(entries: IndexMap<String, Variant>) -> Self {
        Variant::Dict(Rc::new(RefCell::new(entries)))
    }

    /// The type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Void => "void type",
            Variant::Int(_) => "integer",
            Variant::Bool(_) => "boolean",
            Variant::Str(_) => "string",
            Variant::Array(_) => "list",
            Variant::Dict(_) => "dictionary",
            Variant::Macro(_) => "macro",
        }
    }

    // =========================================================================
    // CONVERSIONS
    // =========================================================================

    pub fn get_int(&self) -> Result<i32, AccessError> {
        match self {
            Variant::Int(value) => Ok(*value),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting integer",
                other.type_name()
            ))),
        }
    }

    pub fn get_bool(&self) -> Result<bool, AccessError> {
        match self {
            Variant::Bool(value) => Ok(*value),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting boolean",
                other.type_name()
            ))),
        }
    }

    pub fn get_string(&self) -> Result<String, AccessError> {
        match self {
            Variant::Str(text) => Ok(text.borrow().clone()),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting string",
                other.type_name()
            ))),
        }
    }

    pub fn as_array(&self) -> Result<ArrayRef, AccessError> {
        match self {
            Variant::Array(items) => Ok(Rc::clone(items)),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting list",
                other.type_name()
            ))),
        }
    }

    pub fn as_dict(&self) -> Result<DictRef, AccessError> {
        match self {
            Variant::Dict(entries) => Ok(Rc::clone(entries)),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting dictionary",
                other.type_name()
            ))),
        }
    }

    pub fn as_macro(&self) -> Result<Arc<Macro>, AccessError> {
        match self {
            Variant::Macro(decl) => Ok(Arc::clone(decl)),
            other => Err(bad(format!(
                "unexpected {} on type conversion; expecting macro",
                other.type_name()
            ))),
        }
    }

    /// Stringification for template output: integers in decimal,
    /// booleans as `true`/`false`, strings as themselves, void as the
    /// empty string. Containers and macros cannot be stringified.
    pub fn to_output(&self) -> Result<String, AccessError> {
        match self {
            Variant::Int(value) => Ok(value.to_string()),
            Variant::Bool(value) => Ok(value.to_string()),
            Variant::Str(text) => Ok(text.borrow().clone()),
            Variant::Void => Ok(String::new()),
            other => Err(bad(format!("cannot stringify {}", other.type_name()))),
        }
    }

    // =========================================================================
    // UNARY OPERATORS
    // =========================================================================

    pub fn bit_not(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Int(value) => Ok(Variant::Int(!value)),
            other => Err(bad(format!(
                "unexpected {} on '~'; expecting integer",
                other.type_name()
            ))),
        }
    }

    pub fn logical_not(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Bool(value) => Ok(Variant::Bool(!value)),
            other => Err(bad(format!(
                "unexpected {} on '!'; expecting boolean",
                other.type_name()
            ))),
        }
    }

    pub fn unary_plus(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Int(value) => Ok(Variant::Int(*value)),
            other => Err(bad(format!(
                "unexpected {} on '+'; expecting integer",
                other.type_name()
            ))),
        }
    }

    pub fn unary_minus(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Int(value) => Ok(Variant::Int(value.wrapping_neg())),
            other => Err(bad(format!(
                "unexpected {} on '-'; expecting integer",
                other.type_name()
            ))),
        }
    }

    // =========================================================================
    // BINARY OPERATORS
    // =========================================================================

    /// Integer-only binary operator scaffold.
    fn int_op(
        &self,
        rhs: &Variant,
        op: &str,
        f: impl FnOnce(i32, i32) -> Result<i32, AccessError>,
    ) -> Result<Variant, AccessError> {
        match (self, rhs) {
            (Variant::Int(a), Variant::Int(b)) => Ok(Variant::Int(f(*a, *b)?)),
            (Variant::Int(_), other) => Err(bad(format!(
                "unexpected {} on '{}' right-hand side; expecting integer",
                other.type_name(),
                op
            ))),
            (other, _) => Err(bad(format!(
                "unexpected {} on '{}' left-hand side; expecting integer",
                other.type_name(),
                op
            ))),
        }
    }

    /// `+`: integer addition, or concatenation of two strings, two
    /// arrays, or two dictionaries (right-hand entries win on duplicate
    /// keys).
    pub fn add(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        let expected = match self {
            Variant::Int(_) => "integer",
            Variant::Str(_) => "string",
            Variant::Array(_) => "list",
            Variant::Dict(_) => "dictionary",
            other => {
                return Err(bad(format!(
                    "unexpected {} on '+' left-hand side; expecting any valid type",
                    other.type_name()
                )))
            }
        };
        match (self, rhs) {
            (Variant::Int(a), Variant::Int(b)) => Ok(Variant::Int(a.wrapping_add(*b))),
            (Variant::Str(a), Variant::Str(b)) => {
                let mut text = a.borrow().clone();
                text.push_str(&b.borrow());
                Ok(Variant::string(text))
            }
            (Variant::Array(a), Variant::Array(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Variant::array(items))
            }
            (Variant::Dict(a), Variant::Dict(b)) => {
                let mut entries = a.borrow().clone();
                for (key, value) in b.borrow().iter() {
                    entries.insert(key.clone(), value.clone());
                }
                Ok(Variant::dict(entries))
            }
            (_, other) => Err(bad(format!(
                "unexpected {} on '+' right-hand side; expecting {}",
                other.type_name(),
                expected
            ))),
        }
    }

    /// `+=`: the in-place form of `+`, mutating through this handle.
    pub fn add_assign(&mut self, rhs: &Variant) -> Result<(), AccessError> {
        fn mismatch(op_rhs: &Variant, expected: &str) -> AccessError {
            bad(format!(
                "unexpected {} on '+=' right-hand side; expecting {}",
                op_rhs.type_name(),
                expected
            ))
        }
        match self {
            Variant::Int(a) => match rhs {
                Variant::Int(b) => {
                    *a = a.wrapping_add(*b);
                    Ok(())
                }
                other => Err(mismatch(other, "integer")),
            },
            Variant::Str(a) => match rhs {
                Variant::Str(b) => {
                    if Rc::ptr_eq(a, b) {
                        let text = a.borrow().clone();
                        a.borrow_mut().push_str(&text);
                    } else {
                        a.borrow_mut().push_str(&b.borrow());
                    }
                    Ok(())
                }
                other => Err(mismatch(other, "string")),
            },
            Variant::Array(a) => match rhs {
                Variant::Array(b) => {
                    if Rc::ptr_eq(a, b) {
                        let items = a.borrow().clone();
                        a.borrow_mut().extend(items);
                    } else {
                        a.borrow_mut().extend(b.borrow().iter().cloned());
                    }
                    Ok(())
                }
                other => Err(mismatch(other, "list")),
            },
            Variant::Dict(a) => match rhs {
                Variant::Dict(b) => {
                    if !Rc::ptr_eq(a, b) {
                        let mut target = a.borrow_mut();
                        for (key, value) in b.borrow().iter() {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                    Ok(())
                }
                other => Err(mismatch(other, "dictionary")),
            },
            other => Err(bad(format!(
                "unexpected {} on '+=' left-hand side; expecting any valid type",
                other.type_name()
            ))),
        }
    }

    pub fn sub(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "-", |a, b| Ok(a.wrapping_sub(b)))
    }

    pub fn mul(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "*", |a, b| Ok(a.wrapping_mul(b)))
    }

    pub fn div(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "/", |a, b| {
            if b == 0 {
                Err(bad("division by zero".into()))
            } else {
                Ok(a.wrapping_div(b))
            }
        })
    }

    pub fn rem(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "%", |a, b| {
            if b == 0 {
                Err(bad("modulo by zero".into()))
            } else {
                Ok(a.wrapping_rem(b))
            }
        })
    }

    pub fn bit_and(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "&", |a, b| Ok(a & b))
    }

    pub fn bit_or(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "|", |a, b| Ok(a | b))
    }

    pub fn bit_xor(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "^", |a, b| Ok(a ^ b))
    }

    /// Shift counts are taken modulo 32.
    pub fn shl(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, "<<", |a, b| Ok(a.wrapping_shl(b as u32)))
    }

    pub fn shr(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_op(rhs, ">>", |a, b| Ok(a.wrapping_shr(b as u32)))
    }

    /// `**` by repeated multiplication; the exponent must be
    /// non-negative and the result wraps like multiplication.
    pub fn pow(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        match (self, rhs) {
            (Variant::Int(base), Variant::Int(exponent)) => {
                if *exponent < 0 {
                    return Err(bad(
                        "value on '**' right-hand side must be positive or null".into(),
                    ));
                }
                let mut result: i32 = 1;
                for _ in 0..*exponent {
                    result = result.wrapping_mul(*base);
                }
                Ok(Variant::Int(result))
            }
            (Variant::Int(_), other) => Err(bad(format!(
                "unexpected {} on '**' right-hand side; expecting integer",
                other.type_name()
            ))),
            (other, _) => Err(bad(format!(
                "unexpected {} on '**' left-hand side; expecting integer",
                other.type_name()
            ))),
        }
    }

    // =========================================================================
    // COMPARISONS
    // =========================================================================

    fn int_cmp(
        &self,
        rhs: &Variant,
        op: &str,
        f: impl FnOnce(i32, i32) -> bool,
    ) -> Result<Variant, AccessError> {
        match (self, rhs) {
            (Variant::Int(a), Variant::Int(b)) => Ok(Variant::Bool(f(*a, *b))),
            (Variant::Int(_), other) => Err(bad(format!(
                "unexpected {} on '{}' right-hand side; expecting integer",
                other.type_name(),
                op
            ))),
            (other, _) => Err(bad(format!(
                "unexpected {} on '{}' left-hand side; expecting integer",
                other.type_name(),
                op
            ))),
        }
    }

    pub fn lt(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_cmp(rhs, "<", |a, b| a < b)
    }

    pub fn le(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_cmp(rhs, "<=", |a, b| a <= b)
    }

    pub fn gt(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_cmp(rhs, ">", |a, b| a > b)
    }

    pub fn ge(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.int_cmp(rhs, ">=", |a, b| a >= b)
    }

    /// `==` compares by value on integers, booleans and strings; other
    /// operand combinations are domain errors.
    pub fn eq_value(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        match (self, rhs) {
            (Variant::Int(a), Variant::Int(b)) => Ok(Variant::Bool(a == b)),
            (Variant::Bool(a), Variant::Bool(b)) => Ok(Variant::Bool(a == b)),
            (Variant::Str(a), Variant::Str(b)) => Ok(Variant::Bool(*a.borrow() == *b.borrow())),
            (Variant::Int(_), other) | (Variant::Bool(_), other) | (Variant::Str(_), other) => {
                Err(bad(format!(
                    "unexpected {} on '==' right-hand side; expecting {}",
                    other.type_name(),
                    self.type_name()
                )))
            }
            (other, _) => Err(bad(format!(
                "unexpected {} on '==' left-hand side; expecting integer, boolean or string",
                other.type_name()
            ))),
        }
    }

    pub fn ne_value(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        match self.eq_value(rhs) {
            Ok(Variant::Bool(equal)) => Ok(Variant::Bool(!equal)),
            Ok(_) => unreachable!("eq_value yields booleans"),
            Err(AccessError::BadAccess(message)) => {
                Err(bad(message.replace("'=='", "'!='")))
            }
            Err(other) => Err(other),
        }
    }

    // =========================================================================
    // LOGICAL OPERATORS (eager)
    // =========================================================================

    fn bool_op(
        &self,
        rhs: &Variant,
        op: &str,
        f: impl FnOnce(bool, bool) -> bool,
    ) -> Result<Variant, AccessError> {
        match (self, rhs) {
            (Variant::Bool(a), Variant::Bool(b)) => Ok(Variant::Bool(f(*a, *b))),
            (Variant::Bool(_), other) => Err(bad(format!(
                "unexpected {} on '{}' right-hand side; expecting boolean",
                other.type_name(),
                op
            ))),
            (other, _) => Err(bad(format!(
                "unexpected {} on '{}' left-hand side; expecting boolean",
                other.type_name(),
                op
            ))),
        }
    }

    pub fn logical_and(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.bool_op(rhs, "&&", |a, b| a && b)
    }

    pub fn logical_or(&self, rhs: &Variant) -> Result<Variant, AccessError> {
        self.bool_op(rhs, "||", |a, b| a || b)
    }

    // =========================================================================
    // SUBSCRIPT
    // =========================================================================

    /// Array indexed by integer, dictionary indexed by string. Out of
    /// bounds (including negative indices) and missing keys fail with
    /// [`AccessError::OutOfRange`].
    pub fn subscript(&self, index: &Variant) -> Result<Variant, AccessError> {
        match self {
            Variant::Array(items) => match index {
                Variant::Int(i) => usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.borrow().get(i).cloned())
                    .ok_or(AccessError::OutOfRange),
                other => Err(bad(format!(
                    "unexpected {} on '[]' right-hand side; expecting integer",
                    other.type_name()
                ))),
            },
            Variant::Dict(entries) => match index {
                Variant::Str(key) => entries
                    .borrow()
                    .get(key.borrow().as_str())
                    .cloned()
                    .ok_or(AccessError::OutOfRange),
                other => Err(bad(format!(
                    "unexpected {} on '[]' right-hand side; expecting integer or string",
                    other.type_name()
                ))),
            },
            other => Err(bad(format!(
                "unexpected {} on '[]' left-hand side; expecting list or dictionary",
                other.type_name()
            ))),
        }
    }

    // =========================================================================
    // BUILT-IN MATH
    // =========================================================================

    /// `log2(n)` = floor(log2 n); requires `n > 0`.
    pub fn log2(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Int(value) => {
                if *value > 0 {
                    Ok(Variant::Int(31 - value.leading_zeros() as i32))
                } else {
                    Err(bad("value on 'log2' must be positive".into()))
                }
            }
            other => Err(bad(format!(
                "unexpected {} on 'log2'; expecting integer",
                other.type_name()
            ))),
        }
    }

    /// `clog2(n)` = ceil(log2 n); requires `n > 0`.
    pub fn clog2(&self) -> Result<Variant, AccessError> {
        match self {
            Variant::Int(value) => {
                if *value > 0 {
                    let floor = 31 - value.leading_zeros() as i32;
                    let ceil = if value & (value - 1) != 0 { floor + 1 } else { floor };
                    Ok(Variant::Int(ceil))
                } else {
                    Err(bad("value on 'clog2' must be positive".into()))
                }
            }
            other => Err(bad(format!(
                "unexpected {} on 'clog2'; expecting integer",
                other.type_name()
            ))),
        }
    }
}
