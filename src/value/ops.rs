//! Operators on values. Semantics follow Python, which the template language inherits.

use std::{cmp::Ordering, sync::Arc};

use super::{Key, Value};
use crate::error::Error;

/// Binary arithmetic operators.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOpKind {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

/// Comparison operators, including membership tests.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

impl CmpOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// Escapes HTML special characters.
pub fn escape(input: &str) -> String {
    let mut rv = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => rv.push_str("&amp;"),
            '<' => rv.push_str("&lt;"),
            '>' => rv.push_str("&gt;"),
            '"' => rv.push_str("&#34;"),
            '\'' => rv.push_str("&#39;"),
            c => rv.push(c),
        }
    }
    rv
}

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn unsupported(op: BinOpKind, left: &Value, right: &Value) -> Error {
    Error::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.kind_name(),
        right.kind_name()
    ))
}

fn overflow() -> Error {
    Error::runtime("integer overflow")
}

fn zero_division() -> Error {
    Error::runtime("division by zero")
}

/// Repetition and padding results longer than this (in bytes or items) are refused.
pub(crate) const MAX_REPEAT: usize = 10_000_000;

/// Fails unless `unit * times` stays within [`MAX_REPEAT`].
pub(crate) fn check_repeat(unit: usize, times: usize) -> Result<(), Error> {
    match unit.checked_mul(times) {
        Some(total) if total <= MAX_REPEAT => Ok(()),
        _ => Err(Error::runtime("result of repetition is too large")),
    }
}

fn repeat(value: &Value, times: i64) -> Result<Option<Value>, Error> {
    let times = usize::try_from(times.max(0)).unwrap_or(usize::MAX);
    let rv = match value {
        Value::String(s) => {
            check_repeat(s.len(), times)?;
            Value::String(s.repeat(times).into())
        }
        Value::Safe(s) => {
            check_repeat(s.len(), times)?;
            Value::Safe(s.repeat(times).into())
        }
        Value::Seq(items) | Value::Tuple(items) => {
            check_repeat(items.len(), times)?;
            let mut rv = Vec::with_capacity(items.len().saturating_mul(times));
            for _ in 0..times {
                rv.extend(items.iter().cloned());
            }
            if matches!(value, Value::Tuple(_)) {
                Value::tuple(rv)
            } else {
                Value::from(rv)
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(rv))
}

fn add_strings(left: &Value, right: &Value) -> Option<Value> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(Value::String(format!("{}{}", a, b).into())),
        (Value::Safe(a), Value::Safe(b)) => Some(Value::Safe(format!("{}{}", a, b).into())),
        (Value::Safe(a), Value::String(b)) => {
            Some(Value::Safe(format!("{}{}", a, escape(b)).into()))
        }
        (Value::String(a), Value::Safe(b)) => {
            Some(Value::Safe(format!("{}{}", escape(a), b).into()))
        }
        _ => None,
    }
}

fn floor_div_int(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(zero_division());
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    let r = a.checked_rem(b).ok_or_else(overflow)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        q.checked_sub(1).ok_or_else(overflow)
    } else {
        Ok(q)
    }
}

fn mod_int(a: i64, b: i64) -> Result<i64, Error> {
    if b == 0 {
        return Err(zero_division());
    }
    let r = a.checked_rem(b).ok_or_else(overflow)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        r.checked_add(b).ok_or_else(overflow)
    } else {
        Ok(r)
    }
}

fn mod_float(a: f64, b: f64) -> Result<f64, Error> {
    if b == 0.0 {
        return Err(zero_division());
    }
    let r = a % b;
    Ok(if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    })
}

/// Applies a binary arithmetic operator.
pub fn binop(op: BinOpKind, left: &Value, right: &Value) -> Result<Value, Error> {
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return match (a, b) {
            (Num::Int(a), Num::Int(b)) => int_binop(op, a, b),
            (Num::Int(a), Num::Float(b)) => float_binop(op, a as f64, b),
            (Num::Float(a), Num::Int(b)) => float_binop(op, a, b as f64),
            (Num::Float(a), Num::Float(b)) => float_binop(op, a, b),
        };
    }
    match op {
        BinOpKind::Add => {
            if let Some(rv) = add_strings(left, right) {
                return Ok(rv);
            }
            match (left, right) {
                (Value::Seq(a), Value::Seq(b)) => {
                    return Ok(Value::from(
                        a.iter().chain(b.iter()).cloned().collect::<Vec<_>>(),
                    ));
                }
                (Value::Tuple(a), Value::Tuple(b)) => {
                    return Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()));
                }
                _ => {}
            }
        }
        BinOpKind::Mul => {
            let repeated = match (left, right) {
                (Value::Int(n), other) | (other, Value::Int(n)) => repeat(other, *n)?,
                _ => None,
            };
            if let Some(rv) = repeated {
                return Ok(rv);
            }
        }
        BinOpKind::Sub | BinOpKind::Div | BinOpKind::FloorDiv | BinOpKind::Mod | BinOpKind::Pow => {
        }
    }
    Err(unsupported(op, left, right))
}

fn int_binop(op: BinOpKind, a: i64, b: i64) -> Result<Value, Error> {
    let rv = match op {
        BinOpKind::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOpKind::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOpKind::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOpKind::Div => return float_binop(op, a as f64, b as f64),
        BinOpKind::FloorDiv => floor_div_int(a, b)?,
        BinOpKind::Mod => mod_int(a, b)?,
        BinOpKind::Pow => match u32::try_from(b) {
            Ok(exp) => a.checked_pow(exp).ok_or_else(overflow)?,
            Err(_) => return float_binop(op, a as f64, b as f64),
        },
    };
    Ok(Value::Int(rv))
}

fn float_binop(op: BinOpKind, a: f64, b: f64) -> Result<Value, Error> {
    let rv = match op {
        BinOpKind::Add => a + b,
        BinOpKind::Sub => a - b,
        BinOpKind::Mul => a * b,
        BinOpKind::Div => {
            if b == 0.0 {
                return Err(zero_division());
            }
            a / b
        }
        BinOpKind::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division());
            }
            (a / b).floor()
        }
        BinOpKind::Mod => mod_float(a, b)?,
        BinOpKind::Pow => a.powf(b),
    };
    Ok(Value::Float(rv))
}

pub fn neg(value: &Value) -> Result<Value, Error> {
    match as_num(value) {
        Some(Num::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        Some(Num::Float(f)) => Ok(Value::Float(-f)),
        None => Err(Error::type_error(format!(
            "bad operand type for unary -: '{}'",
            value.kind_name()
        ))),
    }
}

pub fn pos(value: &Value) -> Result<Value, Error> {
    match as_num(value) {
        Some(Num::Int(i)) => Ok(Value::Int(i)),
        Some(Num::Float(f)) => Ok(Value::Float(f)),
        None => Err(Error::type_error(format!(
            "bad operand type for unary +: '{}'",
            value.kind_name()
        ))),
    }
}

/// Equality with numeric coercion between ints, floats and booleans.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) | (Value::Undefined(_), Value::Undefined(_)) => true,
        (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => a == b,
        (Value::Seq(a), Value::Seq(b)) | (Value::Tuple(a), Value::Tuple(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| loose_eq(x, y)),
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| loose_eq(v, other)))
        }
        (Value::Object(a), Value::Object(b)) => a.0.ptr_eq(&b.0),
        (Value::OneShot(a), Value::OneShot(b)) => Arc::ptr_eq(a, b),
        _ => match (as_num(left), as_num(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => num_f64(&a) == num_f64(&b),
            _ => false,
        },
    }
}

const fn num_f64(num: &Num) -> f64 {
    match num {
        Num::Int(i) => *i as f64,
        Num::Float(f) => *f,
    }
}

/// Ordering between values, `None` when the types cannot be ordered.
pub fn partial_cmp(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a) | Value::Safe(a), Value::String(b) | Value::Safe(b)) => Some(a.cmp(b)),
        (Value::Seq(a), Value::Seq(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match partial_cmp(x, y)? {
                    Ordering::Equal => {}
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => match (as_num(left)?, as_num(right)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => num_f64(&a).partial_cmp(&num_f64(&b)),
        },
    }
}

/// Membership test: substring, list item or map key.
pub fn contains(container: &Value, item: &Value) -> Result<bool, Error> {
    match container {
        Value::String(s) | Value::Safe(s) => match item.as_str() {
            Some(needle) => Ok(s.contains(needle)),
            None => Err(Error::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                item.kind_name()
            ))),
        },
        Value::Seq(items) | Value::Tuple(items) => Ok(items.iter().any(|x| loose_eq(x, item))),
        Value::Map(map) => Ok(Key::from_value(item).is_ok_and(|key| map.contains_key(&key))),
        Value::Undefined(_) => Ok(false),
        _ => Err(Error::type_error(format!(
            "argument of type '{}' is not iterable",
            container.kind_name()
        ))),
    }
}

/// Evaluates one comparison of a comparison chain.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, Error> {
    let ordered = |accept: fn(Ordering) -> bool| {
        partial_cmp(left, right).map(accept).ok_or_else(|| {
            Error::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                left.kind_name(),
                right.kind_name()
            ))
        })
    };
    match op {
        CmpOp::Eq => Ok(loose_eq(left, right)),
        CmpOp::Ne => Ok(!loose_eq(left, right)),
        CmpOp::Lt => ordered(Ordering::is_lt),
        CmpOp::LtEq => ordered(Ordering::is_le),
        CmpOp::Gt => ordered(Ordering::is_gt),
        CmpOp::GtEq => ordered(Ordering::is_ge),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
    }
}

fn normalize_index(idx: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let idx = if idx < 0 { idx.checked_add(len)? } else { idx };
    if (0..len).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

/// `obj[key]`. `Ok(None)` means the item does not exist.
pub fn get_item(value: &Value, key: &Value) -> Result<Option<Value>, Error> {
    match value {
        Value::Seq(items) | Value::Tuple(items) => Ok(key
            .as_i64()
            .and_then(|idx| normalize_index(idx, items.len()))
            .and_then(|idx| items.get(idx).cloned())),
        Value::Map(map) => Ok(Key::from_value(key).ok().and_then(|k| map.get(&k).cloned())),
        Value::String(s) | Value::Safe(s) => Ok(key.as_i64().and_then(|idx| {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(idx, chars.len())
                .and_then(|idx| chars.get(idx))
                .map(|c| Value::from(c.to_string()))
        })),
        Value::Object(object) => Ok(key.as_str().and_then(|name| object.0.get_attr(name))),
        _ => Ok(None),
    }
}

/// `obj.attr`, which falls back to item lookup like the original language does.
pub fn get_attr(value: &Value, attr: &str) -> Option<Value> {
    match value {
        Value::Map(map) => map.get(&Key::from(attr)).cloned(),
        Value::Object(object) => object.0.get_attr(attr),
        _ => None,
    }
}

fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
) -> Result<Vec<usize>, Error> {
    if step == 0 {
        return Err(Error::runtime("slice step cannot be zero"));
    }
    let len = i64::try_from(len).map_err(|_| overflow())?;
    let clamp = |v: Option<i64>, default: i64, lower: i64, upper: i64| match v {
        None => default,
        Some(v) if v < 0 => (v.saturating_add(len)).max(lower),
        Some(v) => v.min(upper),
    };
    let mut rv = Vec::new();
    if step > 0 {
        let start = clamp(start, 0, 0, len);
        let stop = clamp(stop, len, 0, len);
        let mut idx = start;
        while idx < stop {
            rv.extend(usize::try_from(idx).ok());
            idx = idx.saturating_add(step);
        }
    } else {
        let start = clamp(start, len.saturating_sub(1), -1, len.saturating_sub(1));
        let stop = clamp(stop, -1, -1, len.saturating_sub(1));
        let mut idx = start;
        while idx > stop {
            rv.extend(usize::try_from(idx).ok());
            idx = idx.saturating_add(step);
        }
    }
    Ok(rv)
}

fn opt_int(value: &Value, what: &str) -> Result<Option<i64>, Error> {
    match value {
        Value::None | Value::Undefined(_) => Ok(None),
        other => other.as_i64().map(Some).ok_or_else(|| {
            Error::type_error(format!(
                "slice {} must be an integer or None, not '{}'",
                what,
                other.kind_name()
            ))
        }),
    }
}

/// `obj[start:stop:step]`.
pub fn slice(value: &Value, start: &Value, stop: &Value, step: &Value) -> Result<Value, Error> {
    let start = opt_int(start, "start")?;
    let stop = opt_int(stop, "stop")?;
    let step = opt_int(step, "step")?.unwrap_or(1);
    match value {
        Value::Seq(items) | Value::Tuple(items) => {
            let indices = slice_indices(items.len(), start, stop, step)?;
            let rv: Vec<Value> = indices
                .into_iter()
                .filter_map(|idx| items.get(idx).cloned())
                .collect();
            Ok(if matches!(value, Value::Tuple(_)) {
                Value::tuple(rv)
            } else {
                Value::from(rv)
            })
        }
        Value::String(s) | Value::Safe(s) => {
            let chars: Vec<char> = s.chars().collect();
            let indices = slice_indices(chars.len(), start, stop, step)?;
            let rv: String = indices.into_iter().filter_map(|idx| chars.get(idx)).collect();
            Ok(if value.is_safe() {
                Value::Safe(rv.into())
            } else {
                Value::String(rv.into())
            })
        }
        Value::Undefined(_) => Ok(value.clone()),
        _ => Err(Error::type_error(format!(
            "'{}' object is not subscriptable",
            value.kind_name()
        ))),
    }
}

/// Joins values into one string, escaping unsafe parts when `autoescape` is on.
pub fn string_concat(values: &[Value], autoescape: bool) -> Value {
    let mut rv = String::new();
    for value in values {
        if autoescape && !value.is_safe() {
            rv.push_str(&escape(&value.to_string()));
        } else {
            rv.push_str(&value.to_string());
        }
    }
    if autoescape {
        Value::Safe(rv.into())
    } else {
        Value::String(rv.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_repetition_is_bounded() {
        let huge = Value::Int(4_611_686_018_427_387_904);
        assert_eq!(
            binop(BinOpKind::Mul, &Value::from("ab"), &Value::Int(3)).unwrap(),
            Value::from("ababab")
        );
        assert_eq!(binop(BinOpKind::Mul, &Value::from("ab"), &Value::Int(-1)).unwrap(), Value::from(""));
        let err = binop(BinOpKind::Mul, &Value::from("ab"), &huge).unwrap_err();
        assert_eq!(err.message(), "result of repetition is too large");
        assert!(binop(BinOpKind::Mul, &huge, &Value::from(vec![1])).is_err());
        assert!(binop(BinOpKind::Mul, &Value::from(""), &huge).is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tuples_keep_their_kind() {
        let pair = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let joined = binop(BinOpKind::Add, &pair, &Value::tuple(vec![Value::Int(3)])).unwrap();
        assert_eq!(joined.to_string(), "(1, 2, 3)");
        assert_eq!(binop(BinOpKind::Mul, &pair, &Value::Int(2)).unwrap().to_string(), "(1, 2, 1, 2)");
        assert_eq!(slice(&joined, &Value::Int(2), &Value::None, &Value::None).unwrap().to_string(), "(3,)");
        assert!(binop(BinOpKind::Add, &pair, &Value::from(vec![3])).is_err());
        assert_ne!(pair, Value::from(vec![1, 2]));
        assert!(compare(CmpOp::Lt, &pair, &Value::tuple(vec![Value::Int(1), Value::Int(3)])).unwrap());
        assert!(compare(CmpOp::In, &Value::Int(2), &pair).unwrap());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_python_division_semantics() {
        assert_eq!(binop(BinOpKind::Div, &Value::Int(7), &Value::Int(2)).unwrap(), Value::Float(3.5));
        assert_eq!(binop(BinOpKind::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binop(BinOpKind::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1));
        assert_eq!(binop(BinOpKind::Pow, &Value::Int(2), &Value::Int(10)).unwrap(), Value::Int(1024));
        assert!(binop(BinOpKind::Div, &Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_string_and_list_operators() {
        assert_eq!(
            binop(BinOpKind::Add, &Value::from("a"), &Value::from("b")).unwrap(),
            Value::from("ab")
        );
        assert_eq!(
            binop(BinOpKind::Mul, &Value::from("ab"), &Value::Int(3)).unwrap(),
            Value::from("ababab")
        );
        let err = binop(BinOpKind::Add, &Value::from("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), "unsupported operand type(s) for +: 'str' and 'int'");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_safe_concat_escapes_unsafe_side() {
        let rv = binop(BinOpKind::Add, &Value::from_safe_string("<b>"), &Value::from("<i>")).unwrap();
        assert_eq!(rv.as_str(), Some("<b>&lt;i&gt;"));
        assert!(rv.is_safe());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparisons() {
        assert!(compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOp::In, &Value::from("b"), &Value::from("abc")).unwrap());
        assert!(compare(CmpOp::NotIn, &Value::Int(4), &Value::from(vec![1, 2])).unwrap());
        assert!(compare(CmpOp::Lt, &Value::from("a"), &Value::Int(1)).is_err());
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_slices() {
        let seq = Value::from(vec![0, 1, 2, 3, 4]);
        assert_eq!(
            slice(&seq, &Value::Int(1), &Value::Int(-1), &Value::None).unwrap(),
            Value::from(vec![1, 2, 3])
        );
        assert_eq!(
            slice(&seq, &Value::None, &Value::None, &Value::Int(-2)).unwrap(),
            Value::from(vec![4, 2, 0])
        );
        assert_eq!(
            slice(&Value::from("hello"), &Value::None, &Value::Int(2), &Value::None).unwrap(),
            Value::from("he")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_negative_item_index() {
        let seq = Value::from(vec![1, 2, 3]);
        assert_eq!(get_item(&seq, &Value::Int(-1)).unwrap(), Some(Value::Int(3)));
        assert_eq!(get_item(&seq, &Value::Int(5)).unwrap(), None);
    }
}
