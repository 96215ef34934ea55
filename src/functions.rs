//! Native callables: the calling convention, global functions and methods on built-in types.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    environment::Environment,
    error::{Error, JinjateResult},
    runtime::{Namespace, ObjectKind, RenderContext},
    value::{Key, Kwargs, UndefinedBehavior, Value},
};

/// Ranges larger than this are refused instead of being materialized.
const MAX_RANGE: i64 = 1_000_000;

/// What a native function, filter or test can see of the render that called it.
pub struct State<'a> {
    env: &'a Environment,
    ctx: Option<&'a RenderContext>,
    autoescape: bool,
}

impl<'a> State<'a> {
    pub(crate) const fn new(
        env: &'a Environment,
        ctx: Option<&'a RenderContext>,
        autoescape: bool,
    ) -> Self {
        Self {
            env,
            ctx,
            autoescape,
        }
    }

    pub const fn env(&self) -> &'a Environment {
        self.env
    }

    /// Whether output is currently being autoescaped.
    pub const fn autoescape(&self) -> bool {
        self.autoescape
    }

    pub fn undefined_behavior(&self) -> UndefinedBehavior {
        self.env.undefined_behavior()
    }

    /// The name of the template being rendered. `None` while constant folding.
    pub fn name(&self) -> Option<&str> {
        self.ctx.and_then(RenderContext::name)
    }

    /// Looks up a variable of the render context.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.ctx.and_then(|ctx| ctx.resolve_or_missing(name))
    }
}

/// The arguments of a call, after `*args` and `**kwargs` have been expanded.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    args: &'a [Value],
    kwargs: &'a Kwargs,
}

impl<'a> Args<'a> {
    pub const fn new(args: &'a [Value], kwargs: &'a Kwargs) -> Self {
        Self { args, kwargs }
    }

    pub const fn positional(&self) -> &'a [Value] {
        self.args
    }

    pub const fn kwargs(&self) -> &'a Kwargs {
        self.kwargs
    }

    pub const fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// The argument at position `idx`, or passed by keyword as `name`.
    pub fn get(&self, idx: usize, name: &str) -> Option<&'a Value> {
        self.args.get(idx).or_else(|| self.kwargs.get(name))
    }

    /// Rejects more positional arguments than `names` and keywords not in `names`.
    pub fn expect(&self, func: &str, names: &[&str]) -> JinjateResult<()> {
        if self.args.len() > names.len() {
            return Err(Error::type_error(format!(
                "{}() takes at most {} argument(s) ({} given)",
                func,
                names.len(),
                self.args.len()
            )));
        }
        if let Some(unknown) = self.kwargs.keys().find(|key| !names.contains(&key.as_str())) {
            return Err(Error::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, unknown
            )));
        }
        Ok(())
    }
}

type NativeFn = dyn Fn(&State<'_>, &Args<'_>) -> JinjateResult<Value> + Send + Sync;

/// A host function exposed to templates.
pub struct Function {
    name: String,
    func: Box<NativeFn>,
}

impl Function {
    pub(crate) fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&State<'_>, &Args<'_>) -> JinjateResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, state: &State<'_>, args: &Args<'_>) -> JinjateResult<Value> {
        (self.func)(state, args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

fn int_arg(value: &Value, func: &str) -> JinjateResult<i64> {
    value.as_i64().ok_or_else(|| {
        Error::type_error(format!(
            "'{}' object cannot be interpreted as an integer in {}()",
            value.kind_name(),
            func
        ))
    })
}

/// `range([start,] stop[, step])`
pub fn range(_state: &State<'_>, args: &Args<'_>) -> JinjateResult<Value> {
    if !args.kwargs().is_empty() {
        return Err(Error::type_error("range() takes no keyword arguments"));
    }
    let (start, stop, step) = match args.positional() {
        [stop] => (0, int_arg(stop, "range")?, 1),
        [start, stop] => (int_arg(start, "range")?, int_arg(stop, "range")?, 1),
        [start, stop, step] => (
            int_arg(start, "range")?,
            int_arg(stop, "range")?,
            int_arg(step, "range")?,
        ),
        other => {
            return Err(Error::type_error(format!(
                "range expected at most 3 arguments, got {}",
                other.len()
            )));
        }
    };
    if step == 0 {
        return Err(Error::runtime("range() arg 3 must not be zero"));
    }
    let span = if step > 0 {
        stop.saturating_sub(start)
    } else {
        start.saturating_sub(stop)
    };
    let count = if span <= 0 {
        0
    } else {
        let step_abs = step.saturating_abs();
        span.saturating_add(step_abs.saturating_sub(1)) / step_abs
    };
    if count > MAX_RANGE {
        return Err(Error::runtime(format!(
            "range too big, the limit is {}",
            MAX_RANGE
        )));
    }
    let mut items = Vec::new();
    let mut current = start;
    for _ in 0..count {
        items.push(Value::Int(current));
        current = current.saturating_add(step);
    }
    Ok(Value::from(items))
}

/// `dict(**kwargs)`
pub fn dict(_state: &State<'_>, args: &Args<'_>) -> JinjateResult<Value> {
    let mut map: IndexMap<Key, Value> = IndexMap::new();
    match args.positional() {
        [] => {}
        [Value::Map(items)] => map.extend(items.iter().map(|(k, v)| (k.clone(), v.clone()))),
        [other] => {
            return Err(Error::type_error(format!(
                "cannot convert '{}' to a dict",
                other.kind_name()
            )));
        }
        other => {
            return Err(Error::type_error(format!(
                "dict expected at most 1 argument, got {}",
                other.len()
            )));
        }
    }
    map.extend(
        args.kwargs()
            .iter()
            .map(|(k, v)| (Key::from(k.as_str()), v.clone())),
    );
    Ok(Value::Map(Arc::new(map)))
}

/// `namespace(**kwargs)`: a mutable attribute bag that `{% set ns.attr = ... %}` can assign to.
pub fn namespace(_state: &State<'_>, args: &Args<'_>) -> JinjateResult<Value> {
    let namespace = Namespace::default();
    for value in args.positional() {
        let Some(map) = value.as_map() else {
            return Err(Error::type_error(format!(
                "cannot initialize a namespace from '{}'",
                value.kind_name()
            )));
        };
        for (key, value) in map.iter() {
            if let Some(key) = key.as_str() {
                namespace.set(key, value.clone());
            }
        }
    }
    for (key, value) in args.kwargs() {
        namespace.set(key, value.clone());
    }
    Ok(Value::from_object(ObjectKind::Namespace(Arc::new(namespace))))
}

/// The global functions every environment starts with.
pub fn builtin_globals() -> IndexMap<String, Value> {
    let mut rv = IndexMap::new();
    rv.insert("range".to_string(), Value::from_function("range", range));
    rv.insert("dict".to_string(), Value::from_function("dict", dict));
    rv.insert(
        "namespace".to_string(),
        Value::from_function("namespace", namespace),
    );
    rv
}

fn str_arg<'v>(args: &Args<'v>, idx: usize, name: &str, method: &str) -> JinjateResult<&'v str> {
    args.get(idx, name).and_then(Value::as_str).ok_or_else(|| {
        Error::type_error(format!("{}() argument '{}' must be a string", method, name))
    })
}

fn keep_safety(original: &Value, s: String) -> Value {
    if original.is_safe() {
        Value::from_safe_string(s)
    } else {
        Value::from(s)
    }
}

fn string_method(value: &Value, s: &str, name: &str, args: &Args<'_>) -> Option<JinjateResult<Value>> {
    let rv = match name {
        "upper" => Ok(keep_safety(value, s.to_uppercase())),
        "lower" => Ok(keep_safety(value, s.to_lowercase())),
        "strip" | "lstrip" | "rstrip" => {
            let chars: Option<Vec<char>> = args.get(0, "chars").and_then(Value::as_str).map(|c| c.chars().collect());
            let pattern = |c: char| chars.as_ref().map_or(c.is_whitespace(), |set| set.contains(&c));
            let stripped = match name {
                "lstrip" => s.trim_start_matches(pattern),
                "rstrip" => s.trim_end_matches(pattern),
                _ => s.trim_matches(pattern),
            };
            Ok(keep_safety(value, stripped.to_string()))
        }
        "startswith" => str_arg(args, 0, "prefix", name).map(|p| Value::Bool(s.starts_with(p))),
        "endswith" => str_arg(args, 0, "suffix", name).map(|p| Value::Bool(s.ends_with(p))),
        "replace" => str_arg(args, 0, "old", name).and_then(|old| {
            let new = str_arg(args, 1, "new", name)?;
            Ok(keep_safety(value, s.replace(old, new)))
        }),
        "split" => {
            let parts: Vec<Value> = match args.get(0, "sep").and_then(Value::as_str) {
                Some(sep) if !sep.is_empty() => s.split(sep).map(Value::from).collect(),
                _ => s.split_whitespace().map(Value::from).collect(),
            };
            Ok(Value::from(parts))
        }
        "title" => Ok(keep_safety(value, crate::filters::title_case(s))),
        "capitalize" => Ok(keep_safety(value, crate::filters::capitalize(s))),
        _ => return None,
    };
    Some(rv)
}

fn map_method(map: &IndexMap<Key, Value>, name: &str, args: &Args<'_>) -> Option<JinjateResult<Value>> {
    let rv = match name {
        "items" => Ok(map
            .iter()
            .map(|(k, v)| Value::tuple(vec![k.to_value(), v.clone()]))
            .collect()),
        "keys" => Ok(map.keys().map(Key::to_value).collect()),
        "values" => Ok(map.values().cloned().collect()),
        "get" => match args.get(0, "key") {
            Some(key) => Ok(Key::from_value(key)
                .ok()
                .and_then(|key| map.get(&key).cloned())
                .or_else(|| args.get(1, "default").cloned())
                .unwrap_or(Value::None)),
            None => Err(Error::type_error("get() expected at least 1 argument")),
        },
        _ => return None,
    };
    Some(rv)
}

/// Methods of the built-in value types, like `dict.items()` or `str.upper()`.
///
/// Returns `None` when the value has no such method.
pub(crate) fn builtin_method(value: &Value, name: &str, args: &Args<'_>) -> Option<JinjateResult<Value>> {
    match value {
        Value::String(s) | Value::Safe(s) => string_method(value, s, name, args),
        Value::Map(map) => map_method(map, name, args),
        Value::Seq(items) | Value::Tuple(items) => match name {
            "count" => Some(Ok(Value::from(
                args.get(0, "value")
                    .map_or(0, |needle| items.iter().filter(|item| *item == needle).count()),
            ))),
            "index" => Some(
                args.get(0, "value")
                    .and_then(|needle| items.iter().position(|item| item == needle))
                    .map(Value::from)
                    .ok_or_else(|| Error::new(crate::error::ErrorKind::TemplateRuntime, "value is not in list")),
            ),
            _ => None,
        },
        _ => None,
    }
}
