use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::ast::{Expr, Stmt};
use crate::environment::RegisteredCallable;
use crate::error::{Error, Result};

/// Keyword arguments of a filter, test or function call.
pub type Kwargs = BTreeMap<String, Value>;

/// A single variable scope.
pub type Scope = BTreeMap<String, Value>;

/// The runtime value model.
///
/// Extends the classic scalar/array/map set with the undefined sentinel,
/// the safe-string marker (`Markup`) and the callable values the renderer
/// produces (registered functions, macros, the `loop` object).
#[derive(Clone)]
pub enum Value {
    /// Absent or unresolved name; distinct from `None`.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A string that is already escaped and safe to emit verbatim.
    Markup(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Func(Rc<RegisteredCallable>),
    Macro(Rc<MacroValue>),
    Loop(Rc<LoopValue>),
}

/// A macro (or `call`-block caller) compiled to a reusable callable.
pub struct MacroValue {
    pub name: String,
    pub args: Vec<String>,
    /// Default expressions, aligned with the trailing `args`.
    pub defaults: Vec<Expr>,
    pub body: Rc<Vec<Stmt>>,
    /// Captured scopes; present on `caller` values, absent on macros
    /// (macros see only their arguments plus globals).
    pub closure: Option<Vec<Scope>>,
}

/// Per-iteration snapshot backing the `loop` variable.
pub struct LoopValue {
    pub index0: usize,
    pub len: usize,
    pub depth0: usize,
    pub items: Rc<Vec<Value>>,
    /// Index into the renderer's active-loop stack, for recursive calls.
    pub slot: usize,
    pub recursive: bool,
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Markup(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Func(_) => "function",
            Value::Macro(_) => "macro",
            Value::Loop(_) => "loop",
        }
    }

    /// Python-style truthiness: empty collections, empty strings, zero
    /// and absent values are false, everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(s) | Value::Markup(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Func(_) | Value::Macro(_) | Value::Loop(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Markup(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    /// The textual form written to the output sink.
    ///
    /// Strings and markup emit as-is, absent values emit nothing, floats
    /// always carry a decimal point, containers use a Python-style repr.
    pub fn to_output_string(&self) -> String {
        match self {
            Value::Undefined | Value::None => String::new(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format_float(*v),
            Value::String(s) | Value::Markup(s) => s.clone(),
            Value::Array(_) | Value::Map(_) => self.repr(),
            Value::Func(f) => format!("<function {}>", f.name()),
            Value::Macro(m) => format!("<macro {}>", m.name),
            Value::Loop(l) => format!("<loop {}/{}>", l.index0 + 1, l.len),
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::None => "none".to_string(),
            Value::String(s) | Value::Markup(s) => repr_string(s),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", repr_string(k), v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            other => other.to_output_string(),
        }
    }

    /// The string form used as a map key, for value kinds that can be one.
    pub(crate) fn as_map_key(&self) -> Result<String> {
        match self {
            Value::String(s) | Value::Markup(s) => Ok(s.clone()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Bool(b) => Ok(if *b { "true" } else { "false" }.to_string()),
            Value::Float(v) => Ok(format_float(*v)),
            Value::None => Ok("none".to_string()),
            other => Err(Error::runtime(format!(
                "value of type {} cannot be used as a map key",
                other.kind()
            ))),
        }
    }
}

fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn repr_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// HTML-escapes `& < > " '`.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_output_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Func(c) => write!(f, "<function {}>", c.name()),
            Value::Macro(m) => write!(f, "<macro {}>", m.name),
            Value::Loop(_) => f.write_str("<loop>"),
            Value::String(s) | Value::Markup(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.repr()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        ops::value_eq(self, other)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Converts any serializable value into the template value model.
pub fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value)
        .map(Value::from)
        .map_err(|err| Error::runtime(format!("failed to serialize template data: {err}")))
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Value {
        Value::Map(v)
    }
}

/// Fallible operator implementations shared by the renderer and the
/// constant-folding pass, so folding cannot change semantics.
pub(crate) mod ops {
    use super::*;
    use crate::ast::{BinOp, CmpOp};
    use std::cmp::Ordering;

    pub fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
        match op {
            BinOp::Add => add(left, right),
            BinOp::Sub => sub(left, right),
            BinOp::Mul => mul(left, right),
            BinOp::Div => div(left, right),
            BinOp::FloorDiv => floordiv(left, right),
            BinOp::Mod => rem(left, right),
            BinOp::Pow => pow(left, right),
            // and/or short-circuit in the renderer; folding only sees
            // both sides already constant.
            BinOp::And => Ok(if left.is_truthy() {
                right.clone()
            } else {
                left.clone()
            }),
            BinOp::Or => Ok(if left.is_truthy() {
                left.clone()
            } else {
                right.clone()
            }),
        }
    }

    fn type_error(op: &str, left: &Value, right: &Value) -> Error {
        Error::runtime(format!(
            "unsupported operand types for '{op}': {} and {}",
            left.kind(),
            right.kind()
        ))
    }

    pub fn add(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| Error::runtime("integer overflow in '+'")),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => {
                if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                    return Ok(Value::String(format!("{a}{b}")));
                }
                match (left.as_f64(), right.as_f64()) {
                    (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                    _ => Err(type_error("+", left, right)),
                }
            }
        }
    }

    pub fn sub(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| Error::runtime("integer overflow in '-'")),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(type_error("-", left, right)),
            },
        }
    }

    pub fn mul(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| Error::runtime("integer overflow in '*'")),
            (Value::String(s), Value::Int(n)) | (Value::Int(n), Value::String(s)) => {
                Ok(Value::String(s.repeat((*n).max(0) as usize)))
            }
            (Value::Array(items), Value::Int(n)) | (Value::Int(n), Value::Array(items)) => {
                let mut out = Vec::new();
                for _ in 0..(*n).max(0) {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::Array(out))
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(type_error("*", left, right)),
            },
        }
    }

    pub fn div(left: &Value, right: &Value) -> Result<Value> {
        match (left.as_f64(), right.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(Error::runtime("division by zero")),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(type_error("/", left, right)),
        }
    }

    pub fn floordiv(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err(Error::runtime("division by zero")),
            (Value::Int(a), Value::Int(b)) => {
                let q = a / b;
                // floor semantics, like Python's //
                if a % b != 0 && (a < &0) != (b < &0) {
                    Ok(Value::Int(q - 1))
                } else {
                    Ok(Value::Int(q))
                }
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err(Error::runtime("division by zero")),
                (Some(a), Some(b)) => Ok(Value::Float((a / b).floor())),
                _ => Err(type_error("//", left, right)),
            },
        }
    }

    pub fn rem(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err(Error::runtime("division by zero")),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(((a % b) + b) % b)),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err(Error::runtime("division by zero")),
                (Some(a), Some(b)) => Ok(Value::Float(((a % b) + b) % b)),
                _ => Err(type_error("%", left, right)),
            },
        }
    }

    pub fn pow(left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Int(a), Value::Int(b)) if *b >= 0 => u32::try_from(*b)
                .ok()
                .and_then(|exp| a.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(|| Error::runtime("integer overflow in '**'")),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
                _ => Err(type_error("**", left, right)),
            },
        }
    }

    pub fn neg(value: &Value) -> Result<Value> {
        match value {
            Value::Int(v) => v
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| Error::runtime("integer overflow in unary '-'")),
            Value::Float(v) => Ok(Value::Float(-v)),
            other => Err(Error::runtime(format!(
                "bad operand type for unary '-': {}",
                other.kind()
            ))),
        }
    }

    pub fn pos(value: &Value) -> Result<Value> {
        match value {
            Value::Int(_) | Value::Float(_) => Ok(value.clone()),
            other => Err(Error::runtime(format!(
                "bad operand type for unary '+': {}",
                other.kind()
            ))),
        }
    }

    pub fn value_eq(left: &Value, right: &Value) -> bool {
        match (left, right) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| value_eq(x, y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && value_eq(va, vb))
            }
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Macro(a), Value::Macro(b)) => Rc::ptr_eq(a, b),
            (Value::Loop(a), Value::Loop(b)) => Rc::ptr_eq(a, b),
            _ => {
                if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                    return a == b;
                }
                match (left, right) {
                    (Value::Int(a), Value::Int(b)) => a == b,
                    _ => match (left.as_f64(), right.as_f64()) {
                        (Some(a), Some(b))
                            if matches!(left, Value::Int(_) | Value::Float(_))
                                && matches!(right, Value::Int(_) | Value::Float(_)) =>
                        {
                            a == b
                        }
                        _ => false,
                    },
                }
            }
        }
    }

    pub fn cmp_values(left: &Value, right: &Value) -> Result<Ordering> {
        if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
            return Ok(a.cmp(b));
        }
        match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match cmp_values(x, y)? {
                        Ordering::Equal => continue,
                        other => return Ok(other),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => a
                    .partial_cmp(&b)
                    .ok_or_else(|| Error::runtime("cannot order NaN values")),
                _ => Err(Error::runtime(format!(
                    "cannot compare {} with {}",
                    left.kind(),
                    right.kind()
                ))),
            },
        }
    }

    pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
        match op {
            CmpOp::Eq => Ok(value_eq(left, right)),
            CmpOp::Ne => Ok(!value_eq(left, right)),
            CmpOp::Lt => Ok(cmp_values(left, right)? == Ordering::Less),
            CmpOp::Lteq => Ok(cmp_values(left, right)? != Ordering::Greater),
            CmpOp::Gt => Ok(cmp_values(left, right)? == Ordering::Greater),
            CmpOp::Gteq => Ok(cmp_values(left, right)? != Ordering::Less),
            CmpOp::In => contains(right, left),
            CmpOp::NotIn => contains(right, left).map(|b| !b),
        }
    }

    pub fn contains(container: &Value, item: &Value) -> Result<bool> {
        match container {
            Value::Array(items) => Ok(items.iter().any(|v| value_eq(v, item))),
            Value::Map(entries) => Ok(entries.contains_key(&item.as_map_key()?)),
            Value::String(s) | Value::Markup(s) => match item.as_str() {
                Some(needle) => Ok(s.contains(needle)),
                _ => Err(Error::runtime(format!(
                    "'in <string>' requires a string operand, not {}",
                    item.kind()
                ))),
            },
            other => Err(Error::runtime(format!(
                "value of type {} does not support 'in'",
                other.kind()
            ))),
        }
    }

    /// Plain subscript lookup; `None` means "no such element".
    pub fn get_item(value: &Value, key: &Value) -> Option<Value> {
        match (value, key) {
            (Value::Array(items), Value::Int(idx)) => {
                let idx = normalize_index(*idx, items.len())?;
                items.get(idx).cloned()
            }
            (Value::String(s), Value::Int(idx)) | (Value::Markup(s), Value::Int(idx)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(*idx, chars.len())?;
                chars.get(idx).map(|c| Value::String(c.to_string()))
            }
            (Value::Map(entries), key) => {
                let key = key.as_map_key().ok()?;
                entries.get(&key).cloned()
            }
            _ => None,
        }
    }

    fn normalize_index(idx: i64, len: usize) -> Option<usize> {
        if idx < 0 {
            let adjusted = idx + len as i64;
            if adjusted < 0 {
                return None;
            }
            Some(adjusted as usize)
        } else {
            Some(idx as usize)
        }
    }

    pub fn slice(
        value: &Value,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<Value> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(Error::runtime("slice step cannot be zero"));
        }
        match value {
            Value::Array(items) => {
                let indices = slice_indices(items.len(), start, stop, step);
                Ok(Value::Array(
                    indices.map(|i| items[i].clone()).collect::<Vec<_>>(),
                ))
            }
            Value::String(s) | Value::Markup(s) => {
                let chars: Vec<char> = s.chars().collect();
                let indices = slice_indices(chars.len(), start, stop, step);
                Ok(Value::String(indices.map(|i| chars[i]).collect()))
            }
            other => Err(Error::runtime(format!(
                "value of type {} cannot be sliced",
                other.kind()
            ))),
        }
    }

    fn slice_indices(
        len: usize,
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    ) -> Box<dyn Iterator<Item = usize>> {
        let len = len as i64;
        let clamp = |v: i64, lo: i64, hi: i64| v.max(lo).min(hi);
        let adjust = |v: i64| if v < 0 { v + len } else { v };
        if step > 0 {
            let start = clamp(start.map(adjust).unwrap_or(0), 0, len);
            let stop = clamp(stop.map(adjust).unwrap_or(len), 0, len);
            Box::new(
                (start..stop)
                    .step_by(step as usize)
                    .map(|i| i as usize),
            )
        } else {
            let start = clamp(start.map(adjust).unwrap_or(len - 1), -1, len - 1);
            let stop = clamp(stop.map(adjust).unwrap_or(-1), -1, len - 1);
            let mut out = Vec::new();
            let mut i = start;
            while i > stop {
                out.push(i as usize);
                i += step;
            }
            Box::new(out.into_iter())
        }
    }
}
