//! Built-in tests, the predicates used by `value is name(args)`.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    error::{Error, JinjateResult},
    functions::{Args, State},
    value::{CmpOp, Value, ops},
};

type TestFn = dyn Fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<bool> + Send + Sync;

#[derive(Clone)]
pub struct Test {
    func: Arc<TestFn>,
}

impl Test {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<bool> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    pub(crate) fn call(&self, state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<bool> {
        (self.func)(state, value, args)
    }
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Test")
    }
}

fn other<'a>(args: &Args<'a>, test: &str) -> JinjateResult<&'a Value> {
    args.get(0, "other")
        .ok_or_else(|| Error::type_error(format!("test '{}' requires an argument", test)))
}

fn compare(op: CmpOp, value: &Value, args: &Args<'_>) -> JinjateResult<bool> {
    ops::compare(op, value, other(args, op.symbol())?)
}

fn is_int_like(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

fn is_lower(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.chars().any(char::is_alphabetic) && !s.chars().any(char::is_uppercase))
}

fn is_upper(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.chars().any(char::is_alphabetic) && !s.chars().any(char::is_lowercase))
}

/// The tests every environment starts with.
pub(crate) fn builtin_tests() -> IndexMap<String, Test> {
    let mut rv: IndexMap<String, Test> = IndexMap::new();
    let mut add = |names: &[&str], test: Test| {
        for name in names {
            rv.insert((*name).to_string(), test.clone());
        }
    };

    add(&["defined"], Test::new(|_, v, _| Ok(!v.is_undefined())));
    add(&["undefined"], Test::new(|_, v, _| Ok(v.is_undefined())));
    add(&["none"], Test::new(|_, v, _| Ok(v.is_none())));
    add(&["boolean"], Test::new(|_, v, _| Ok(matches!(v, Value::Bool(_)))));
    add(&["true"], Test::new(|_, v, _| Ok(matches!(v, Value::Bool(true)))));
    add(&["false"], Test::new(|_, v, _| Ok(matches!(v, Value::Bool(false)))));
    add(&["integer"], Test::new(|_, v, _| Ok(matches!(v, Value::Int(_)))));
    add(&["float"], Test::new(|_, v, _| Ok(matches!(v, Value::Float(_)))));
    add(&["number"], Test::new(|_, v, _| Ok(v.is_number())));
    add(&["string"], Test::new(|_, v, _| Ok(v.as_str().is_some())));
    add(&["mapping"], Test::new(|_, v, _| Ok(matches!(v, Value::Map(_)))));
    add(
        &["sequence"],
        Test::new(|_, v, _| Ok(matches!(v, Value::Seq(_) | Value::Tuple(_) | Value::Map(_) | Value::String(_) | Value::Safe(_)))),
    );
    add(&["iterable"], Test::new(|_, v, _| Ok(v.try_iter().is_ok())));
    add(
        &["callable"],
        Test::new(|_, v, _| {
            Ok(matches!(
                v.object(),
                Some(
                    crate::runtime::ObjectKind::Function(_)
                        | crate::runtime::ObjectKind::Macro(_)
                        | crate::runtime::ObjectKind::BlockRef(_)
                )
            ))
        }),
    );
    add(
        &["odd"],
        Test::new(|_, v, _| Ok(is_int_like(v).is_some_and(|i| i.rem_euclid(2) == 1))),
    );
    add(
        &["even"],
        Test::new(|_, v, _| Ok(is_int_like(v).is_some_and(|i| i.rem_euclid(2) == 0))),
    );
    add(
        &["divisibleby"],
        Test::new(|_, v, args| {
            let num = args
                .get(0, "num")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::type_error("divisibleby requires an integer"))?;
            if num == 0 {
                return Err(Error::runtime("integer division or modulo by zero"));
            }
            Ok(v.as_i64().is_some_and(|i| i.rem_euclid(num) == 0))
        }),
    );
    add(&["eq", "==", "equalto"], Test::new(|_, v, a| compare(CmpOp::Eq, v, a)));
    add(&["ne", "!="], Test::new(|_, v, a| compare(CmpOp::Ne, v, a)));
    add(&["lt", "<", "lessthan"], Test::new(|_, v, a| compare(CmpOp::Lt, v, a)));
    add(&["le", "<="], Test::new(|_, v, a| compare(CmpOp::LtEq, v, a)));
    add(&["gt", ">", "greaterthan"], Test::new(|_, v, a| compare(CmpOp::Gt, v, a)));
    add(&["ge", ">="], Test::new(|_, v, a| compare(CmpOp::GtEq, v, a)));
    add(
        &["in"],
        Test::new(|_, v, a| {
            let seq = a
                .get(0, "seq")
                .ok_or_else(|| Error::type_error("test 'in' requires an argument"))?;
            ops::contains(seq, v)
        }),
    );
    add(&["lower"], Test::new(|_, v, _| Ok(is_lower(v))));
    add(&["upper"], Test::new(|_, v, _| Ok(is_upper(v))));
    add(
        &["sameas"],
        Test::new(|_, v, a| {
            let other = other(a, "sameas")?;
            Ok(match (v, other) {
                (Value::Object(x), Value::Object(y)) => x.0.ptr_eq(&y.0),
                (Value::None, Value::None) => true,
                (Value::Bool(x), Value::Bool(y)) => x == y,
                _ => false,
            })
        }),
    );
    add(&["escaped"], Test::new(|_, v, _| Ok(v.is_safe())));
    add(
        &["filter"],
        Test::new(|state, v, _| Ok(v.as_str().is_some_and(|name| state.env().filter(name).is_some()))),
    );
    add(
        &["test"],
        Test::new(|state, v, _| Ok(v.as_str().is_some_and(|name| state.env().test(name).is_some()))),
    );
    rv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{environment::Environment, value::Kwargs};

    fn check(name: &str, value: Value, args: &[Value]) -> bool {
        let env = Environment::new();
        let state = State::new(&env, None, false);
        let kwargs = Kwargs::new();
        env.test(name)
            .expect("builtin test")
            .call(&state, &value, &Args::new(args, &kwargs))
            .unwrap()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_type_tests() {
        assert!(check("defined", Value::from(1), &[]));
        assert!(check("undefined", Value::undefined("x"), &[]));
        assert!(check("none", Value::None, &[]));
        assert!(check("number", Value::from(1.5), &[]));
        assert!(!check("integer", Value::Bool(true), &[]));
        assert!(check("sequence", Value::from("abc"), &[]));
        assert!(check("iterable", Value::from(Vec::<Value>::new()), &[]));
        assert!(!check("iterable", Value::from(3), &[]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_numeric_tests() {
        assert!(check("odd", Value::from(-3), &[]));
        assert!(check("even", Value::from(4), &[]));
        assert!(check("divisibleby", Value::from(9), &[Value::from(3)]));
        assert!(check("<", Value::from(1), &[Value::from(2)]));
        assert!(check("in", Value::from(2), &[Value::from(vec![1, 2])]));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_case_and_registry_tests() {
        assert!(check("lower", Value::from("abc1"), &[]));
        assert!(!check("upper", Value::from("Abc"), &[]));
        assert!(check("filter", Value::from("upper"), &[]));
        assert!(!check("test", Value::from("nope"), &[]));
        assert!(check("escaped", Value::from_safe_string("x"), &[]));
    }
}
