//! Built-in filters and the type every filter is stored as.

use std::{cmp::Ordering, fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    error::{Error, JinjateResult},
    functions::{Args, State},
    value::{Kwargs, Undefined, Value, ops},
};

type FilterFn = dyn Fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<Value> + Send + Sync;

/// A filter callable: `value|name(args)`.
#[derive(Clone)]
pub struct Filter {
    func: Arc<FilterFn>,
    pass_context: bool,
}

impl Filter {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<Value> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            pass_context: false,
        }
    }

    /// A filter that reads the render context. It is never evaluated at compile time.
    pub fn with_context<F>(func: F) -> Self
    where
        F: Fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<Value> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            pass_context: true,
        }
    }

    pub const fn pass_context(&self) -> bool {
        self.pass_context
    }

    pub(crate) fn call(&self, state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
        (self.func)(state, value, args)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("pass_context", &self.pass_context)
            .finish_non_exhaustive()
    }
}

/// Uppercases the first letter of every word and lowercases the rest.
pub(crate) fn title_case(s: &str) -> String {
    let mut rv = String::with_capacity(s.len());
    let mut boundary = true;
    for c in s.chars() {
        if c.is_whitespace() || matches!(c, '-' | '(' | '{' | '[' | '<') {
            boundary = true;
            rv.push(c);
        } else if boundary {
            boundary = false;
            rv.extend(c.to_uppercase());
        } else {
            rv.extend(c.to_lowercase());
        }
    }
    rv
}

pub(crate) fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// Stringifies a value, keeping it safe if it already is.
fn soft_str(state: &State<'_>, value: &Value) -> JinjateResult<Value> {
    Ok(match value {
        Value::Safe(_) | Value::String(_) => value.clone(),
        Value::Undefined(undefined) => Value::from(state.undefined_behavior().render(undefined)?),
        other => Value::from(other.to_string()),
    })
}

fn map_str(state: &State<'_>, value: &Value, f: impl FnOnce(&str) -> String) -> JinjateResult<Value> {
    let value = soft_str(state, value)?;
    let s = value.as_str().unwrap_or_default();
    Ok(if value.is_safe() {
        Value::from_safe_string(f(s))
    } else {
        Value::from(f(s))
    })
}

fn items_of(state: &State<'_>, value: &Value) -> JinjateResult<Vec<Value>> {
    state.undefined_behavior().check_soft_use(value)?;
    Ok(value.try_iter()?.collect())
}

fn bool_arg(args: &Args<'_>, idx: usize, name: &str, default: bool) -> bool {
    args.get(idx, name).map_or(default, Value::is_true)
}

fn int_arg(args: &Args<'_>, idx: usize, name: &str, default: i64) -> JinjateResult<i64> {
    match args.get(idx, name) {
        None => Ok(default),
        Some(value) => value.as_i64().ok_or_else(|| {
            Error::type_error(format!(
                "argument '{}' must be an integer, not '{}'",
                name,
                value.kind_name()
            ))
        }),
    }
}

fn str_arg<'a>(args: &Args<'a>, idx: usize, name: &str) -> Option<&'a str> {
    args.get(idx, name).and_then(Value::as_str)
}

/// Resolves a dotted attribute path like `user.address.city` or `items.0`.
fn attribute_of(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for part in path.split('.') {
        let next = match part.parse::<i64>() {
            Ok(idx) => ops::get_item(&current, &Value::Int(idx)).ok().flatten(),
            Err(_) => ops::get_attr(&current, part)
                .or_else(|| ops::get_item(&current, &Value::from(part)).ok().flatten()),
        };
        current = next.unwrap_or_else(|| Value::undefined(part));
    }
    current
}

/// Sort key: lowercases strings unless the comparison is case sensitive.
fn sort_key(value: &Value, case_sensitive: bool) -> Value {
    match value {
        Value::String(s) | Value::Safe(s) if !case_sensitive => Value::from(s.to_lowercase()),
        other => other.clone(),
    }
}

fn cmp_keys(a: &Value, b: &Value) -> JinjateResult<Ordering> {
    a.cmp_values(b).ok_or_else(|| {
        Error::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.kind_name(),
            b.kind_name()
        ))
    })
}

fn sort_by_key(items: &mut [(Value, Value)]) -> JinjateResult<()> {
    let mut failure = None;
    items.sort_by(|(a, _), (b, _)| match cmp_keys(a, b) {
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    failure.map_or(Ok(()), Err)
}

fn upper(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    map_str(state, value, str::to_uppercase)
}

fn lower(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    map_str(state, value, str::to_lowercase)
}

fn title(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    map_str(state, value, title_case)
}

fn capitalize_filter(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    map_str(state, value, capitalize)
}

fn trim(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let chars: Option<Vec<char>> = str_arg(args, 0, "chars").map(|c| c.chars().collect());
    map_str(state, value, |s| match &chars {
        Some(chars) => s.trim_matches(|c| chars.contains(&c)).to_string(),
        None => s.trim().to_string(),
    })
}

fn length(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    state.undefined_behavior().check_soft_use(value)?;
    match value {
        Value::Undefined(_) => Ok(Value::Int(0)),
        Value::OneShot(_) => Ok(Value::from(value.try_iter()?.count())),
        other => other.len().map(Value::from).ok_or_else(|| {
            Error::type_error(format!("object of type '{}' has no len()", other.kind_name()))
        }),
    }
}

fn default(_: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let fallback = args.get(0, "default_value").cloned().unwrap_or_else(|| Value::from(""));
    let boolean = bool_arg(args, 1, "boolean", false);
    if value.is_undefined() || (boolean && !value.is_true()) {
        return Ok(fallback);
    }
    Ok(value.clone())
}

fn escape(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    match value {
        Value::Undefined(undefined) => Ok(Value::from_safe_string(ops::escape(
            &state.undefined_behavior().render(undefined)?,
        ))),
        other => Ok(other.escape()),
    }
}

fn forceescape(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    let s = soft_str(state, value)?;
    Ok(Value::from_safe_string(ops::escape(s.as_str().unwrap_or_default())))
}

fn safe(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    let s = soft_str(state, value)?;
    Ok(Value::from_safe_string(s.as_str().unwrap_or_default()))
}

fn string(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    soft_str(state, value)
}

fn join(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let separator = args.get(0, "d").cloned().unwrap_or_else(|| Value::from(""));
    let mut items = items_of(state, value)?;
    if let Some(attribute) = str_arg(args, 1, "attribute") {
        items = items.iter().map(|item| attribute_of(item, attribute)).collect();
    }
    let escaping = state.autoescape() && (separator.is_safe() || items.iter().any(Value::is_safe));
    let mut rv = String::new();
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            if escaping {
                rv.push_str(separator.escape().as_str().unwrap_or_default());
            } else {
                rv.push_str(&separator.to_string());
            }
        }
        let text = soft_str(state, item)?;
        if escaping {
            rv.push_str(text.escape().as_str().unwrap_or_default());
        } else {
            rv.push_str(text.as_str().unwrap_or_default());
        }
    }
    Ok(if escaping {
        Value::from_safe_string(rv)
    } else {
        Value::from(rv)
    })
}

fn first(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    state.undefined_behavior().check_soft_use(value)?;
    Ok(value.try_iter()?.next().unwrap_or_else(|| {
        Value::Undefined(Undefined::with_hint(None, "No first item, sequence was empty."))
    }))
}

fn last(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    Ok(items_of(state, value)?.pop().unwrap_or_else(|| {
        Value::Undefined(Undefined::with_hint(None, "No last item, sequence was empty."))
    }))
}

fn list(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    Ok(Value::from(items_of(state, value)?))
}

fn int(_: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let fallback = args.get(0, "default").cloned().unwrap_or(Value::Int(0));
    let base = int_arg(args, 1, "base", 10)?;
    let radix = u32::try_from(base)
        .ok()
        .filter(|radix| (2..=36).contains(radix))
        .ok_or_else(|| Error::type_error("int() base must be between 2 and 36"))?;
    Ok(match value {
        Value::Int(_) => value.clone(),
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Float(f) if f.is_finite() => Value::Int(f.trunc() as i64),
        Value::String(s) | Value::Safe(s) => {
            let s = s.trim().replace('_', "");
            i64::from_str_radix(&s, radix)
                .map(Value::Int)
                .or_else(|_| s.parse::<f64>().map(|f| Value::Int(f.trunc() as i64)))
                .unwrap_or(fallback)
        }
        _ => fallback,
    })
}

fn float(_: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let fallback = args.get(0, "default").cloned().unwrap_or(Value::Float(0.0));
    Ok(match value {
        Value::String(s) | Value::Safe(s) => s.trim().parse::<f64>().map_or(fallback, Value::Float),
        other => other.as_f64().map_or(fallback, Value::Float),
    })
}

fn abs(_: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    match value {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| Error::runtime("integer overflow")),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(Error::type_error(format!(
            "bad operand type for abs(): '{}'",
            other.kind_name()
        ))),
    }
}

fn round(_: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let precision = int_arg(args, 0, "precision", 0)?;
    let method = str_arg(args, 1, "method").unwrap_or("common");
    let number = value.as_f64().ok_or_else(|| {
        Error::type_error(format!("must be real number, not {}", value.kind_name()))
    })?;
    let exp = i32::try_from(precision).map_err(|_| Error::runtime("precision out of range"))?;
    let factor = 10f64.powi(exp);
    let scaled = number * factor;
    let rounded = match method {
        "common" => scaled.round(),
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        _ => return Err(Error::type_error("method must be common, ceil or floor")),
    };
    Ok(Value::Float(rounded / factor))
}

fn replace(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let (Some(old), Some(new)) = (args.get(0, "old"), args.get(1, "new")) else {
        return Err(Error::type_error("replace() requires 'old' and 'new' arguments"));
    };
    let count = match args.get(2, "count") {
        Some(Value::None) | None => None,
        Some(count) => Some(count.as_i64().unwrap_or(-1)),
    };
    let source = soft_str(state, value)?;
    let escaping = state.autoescape() && source.is_safe();
    let render = |v: &Value| {
        if escaping {
            v.escape().to_string()
        } else {
            v.to_string()
        }
    };
    let (old, new) = (render(old), render(new));
    let s = source.as_str().unwrap_or_default();
    let replaced = match count.and_then(|count| usize::try_from(count).ok()) {
        Some(count) => s.replacen(old.as_str(), &new, count),
        None => s.replace(old.as_str(), &new),
    };
    Ok(if source.is_safe() {
        Value::from_safe_string(replaced)
    } else {
        Value::from(replaced)
    })
}

fn reverse(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    match value {
        Value::String(_) | Value::Safe(_) => map_str(state, value, |s| s.chars().rev().collect()),
        other => {
            let mut items = items_of(state, other)?;
            items.reverse();
            Ok(Value::from(items))
        }
    }
}

fn sort(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let reverse = bool_arg(args, 0, "reverse", false);
    let case_sensitive = bool_arg(args, 1, "case_sensitive", false);
    let attribute = str_arg(args, 2, "attribute");
    let mut keyed: Vec<(Value, Value)> = items_of(state, value)?
        .into_iter()
        .map(|item| {
            let key = attribute.map_or_else(|| item.clone(), |attr| attribute_of(&item, attr));
            (sort_key(&key, case_sensitive), item)
        })
        .collect();
    sort_by_key(&mut keyed)?;
    if reverse {
        keyed.reverse();
    }
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

fn pairs(state: &State<'_>, value: &Value) -> JinjateResult<Vec<(Value, Value)>> {
    match value {
        Value::Map(map) => Ok(map.iter().map(|(k, v)| (k.to_value(), v.clone())).collect()),
        Value::Undefined(_) => {
            state.undefined_behavior().check_soft_use(value)?;
            Ok(Vec::new())
        }
        other => Err(Error::type_error(format!(
            "can only get item pairs from a mapping, not '{}'",
            other.kind_name()
        ))),
    }
}

fn items(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    Ok(pairs(state, value)?
        .into_iter()
        .map(|(k, v)| Value::tuple(vec![k, v]))
        .collect())
}

fn dictsort(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let case_sensitive = bool_arg(args, 0, "case_sensitive", false);
    let by_value = match str_arg(args, 1, "by").unwrap_or("key") {
        "key" => false,
        "value" => true,
        _ => return Err(Error::runtime("You can only sort by either 'key' or 'value'")),
    };
    let reverse = bool_arg(args, 2, "reverse", false);
    let mut keyed: Vec<(Value, Value)> = pairs(state, value)?
        .into_iter()
        .map(|(k, v)| {
            let key = sort_key(if by_value { &v } else { &k }, case_sensitive);
            (key, Value::tuple(vec![k, v]))
        })
        .collect();
    sort_by_key(&mut keyed)?;
    if reverse {
        keyed.reverse();
    }
    Ok(keyed.into_iter().map(|(_, pair)| pair).collect())
}

fn unique(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let case_sensitive = bool_arg(args, 0, "case_sensitive", false);
    let attribute = str_arg(args, 1, "attribute");
    let mut seen: Vec<Value> = Vec::new();
    let mut rv = Vec::new();
    for item in items_of(state, value)? {
        let key = attribute.map_or_else(|| item.clone(), |attr| attribute_of(&item, attr));
        let key = sort_key(&key, case_sensitive);
        if !seen.contains(&key) {
            seen.push(key);
            rv.push(item);
        }
    }
    Ok(Value::from(rv))
}

fn extreme(state: &State<'_>, value: &Value, args: &Args<'_>, want: Ordering) -> JinjateResult<Value> {
    let case_sensitive = bool_arg(args, 0, "case_sensitive", false);
    let attribute = str_arg(args, 1, "attribute");
    let mut best: Option<(Value, Value)> = None;
    for item in items_of(state, value)? {
        let key = attribute.map_or_else(|| item.clone(), |attr| attribute_of(&item, attr));
        let key = sort_key(&key, case_sensitive);
        let better = match &best {
            None => true,
            Some((best_key, _)) => cmp_keys(&key, best_key)? == want,
        };
        if better {
            best = Some((key, item));
        }
    }
    Ok(best.map_or_else(
        || Value::Undefined(Undefined::with_hint(None, "No aggregated item, sequence was empty.")),
        |(_, item)| item,
    ))
}

fn min(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    extreme(state, value, args, Ordering::Less)
}

fn max(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    extreme(state, value, args, Ordering::Greater)
}

fn sum(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let attribute = str_arg(args, 0, "attribute");
    let mut total = args.get(1, "start").cloned().unwrap_or(Value::Int(0));
    for item in items_of(state, value)? {
        let item = attribute.map_or_else(|| item.clone(), |attr| attribute_of(&item, attr));
        total = ops::binop(ops::BinOpKind::Add, &total, &item)?;
    }
    Ok(total)
}

fn batch(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let size = int_arg(args, 0, "linecount", 0)?;
    let size = usize::try_from(size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| Error::runtime("batch size must be positive"))?;
    let fill = args.get(1, "fill_with").filter(|fill| !fill.is_none());
    if fill.is_some() {
        ops::check_repeat(1, size)?;
    }
    let mut rv = Vec::new();
    for chunk in items_of(state, value)?.chunks(size) {
        let mut row = chunk.to_vec();
        if let Some(fill) = fill {
            row.resize(size, fill.clone());
        }
        rv.push(Value::from(row));
    }
    Ok(Value::from(rv))
}

fn attr(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let name = str_arg(args, 0, "name").ok_or_else(|| Error::type_error("attr() requires a name"))?;
    if let Value::Undefined(undefined) = value {
        return Err(undefined.to_error());
    }
    if let Some(policy) = state.env().sandbox() {
        if let Some(found) = ops::get_attr(value, name) {
            if !policy.is_safe_attribute(value, name, &found) {
                return Ok(crate::sandbox::unsafe_undefined(value, name));
            }
            return Ok(found);
        }
    }
    Ok(ops::get_attr(value, name).unwrap_or_else(|| {
        Value::Undefined(Undefined::with_hint(
            Some(name),
            &format!("'{} object' has no attribute '{}'", value.kind_name(), name),
        ))
    }))
}

/// Splits `(name, *rest)` call arguments for `map`, `select` and friends.
fn forwarded(args: &Args<'_>, skip: usize) -> (Vec<Value>, Kwargs) {
    let positional = args.positional().iter().skip(skip).cloned().collect();
    (positional, args.kwargs().clone())
}

fn map(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let items = items_of(state, value)?;
    if let Some(attribute) = args.kwargs().get("attribute").and_then(Value::as_str) {
        let fallback = args.kwargs().get("default");
        return Ok(items
            .iter()
            .map(|item| match (attribute_of(item, attribute), fallback) {
                (Value::Undefined(_), Some(fallback)) => fallback.clone(),
                (found, _) => found,
            })
            .collect());
    }
    let name = args
        .positional()
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::type_error("map requires a filter argument"))?;
    let filter = state
        .env()
        .filter(name)
        .ok_or_else(|| Error::runtime(format!("No filter named '{}'.", name)))?;
    let (rest, kwargs) = forwarded(args, 1);
    let forwarded = Args::new(&rest, &kwargs);
    items
        .iter()
        .map(|item| filter.call(state, item, &forwarded))
        .collect::<JinjateResult<Vec<_>>>()
        .map(Value::from)
}

fn run_test(state: &State<'_>, item: &Value, name: Option<&str>, args: &Args<'_>) -> JinjateResult<bool> {
    let Some(name) = name else {
        return Ok(item.is_true());
    };
    let test = state
        .env()
        .test(name)
        .ok_or_else(|| Error::runtime(format!("No test named '{}'.", name)))?;
    test.call(state, item, args)
}

fn select_common(
    state: &State<'_>,
    value: &Value,
    args: &Args<'_>,
    by_attribute: bool,
    keep: bool,
) -> JinjateResult<Value> {
    let mut skip = 0;
    let attribute = if by_attribute {
        skip = 1;
        Some(
            args.positional()
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Error::type_error("Missing parameter for attribute name"))?,
        )
    } else {
        None
    };
    let test_name = args.positional().get(skip).and_then(Value::as_str);
    let (rest, kwargs) = forwarded(args, skip.saturating_add(1));
    let forwarded = Args::new(&rest, &kwargs);
    let mut rv = Vec::new();
    for item in items_of(state, value)? {
        let subject = attribute.map_or_else(|| item.clone(), |attr| attribute_of(&item, attr));
        if run_test(state, &subject, test_name, &forwarded)? == keep {
            rv.push(item);
        }
    }
    Ok(Value::from(rv))
}

fn select(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    select_common(state, value, args, false, true)
}

fn reject(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    select_common(state, value, args, false, false)
}

fn selectattr(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    select_common(state, value, args, true, true)
}

fn rejectattr(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    select_common(state, value, args, true, false)
}

fn center(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let width = usize::try_from(int_arg(args, 0, "width", 80)?).unwrap_or(0);
    ops::check_repeat(1, width)?;
    map_str(state, value, |s| {
        let len = s.chars().count();
        if len >= width {
            return s.to_string();
        }
        let total = width.saturating_sub(len);
        let left = total / 2 + (total & width & 1);
        let right = total.saturating_sub(left);
        format!("{}{}{}", " ".repeat(left), s, " ".repeat(right))
    })
}

fn indent(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let width = match args.get(0, "width") {
        Some(Value::String(s) | Value::Safe(s)) => s.to_string(),
        Some(other) => {
            let width = usize::try_from(other.as_i64().unwrap_or(4)).unwrap_or(0);
            ops::check_repeat(1, width)?;
            " ".repeat(width)
        }
        None => "    ".to_string(),
    };
    let first = bool_arg(args, 1, "first", false);
    let blank = bool_arg(args, 2, "blank", false);
    map_str(state, value, |s| {
        let mut rv = String::with_capacity(s.len());
        for (idx, line) in s.split('\n').enumerate() {
            if idx > 0 {
                rv.push('\n');
                if blank || !line.is_empty() {
                    rv.push_str(&width);
                }
            } else if first {
                rv.push_str(&width);
            }
            rv.push_str(line);
        }
        rv
    })
}

fn wordcount(state: &State<'_>, value: &Value, _: &Args<'_>) -> JinjateResult<Value> {
    let s = soft_str(state, value)?;
    Ok(Value::from(
        s.as_str()
            .unwrap_or_default()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|word| !word.is_empty())
            .count(),
    ))
}

fn truncate(state: &State<'_>, value: &Value, args: &Args<'_>) -> JinjateResult<Value> {
    let length = usize::try_from(int_arg(args, 0, "length", 255)?).unwrap_or(0);
    let killwords = bool_arg(args, 1, "killwords", false);
    let end = str_arg(args, 2, "end").unwrap_or("...").to_string();
    let leeway = usize::try_from(int_arg(args, 3, "leeway", 5)?).unwrap_or(0);
    let end_len = end.chars().count();
    if length < end_len {
        return Err(Error::runtime(format!("expected length >= {}, got {}", end_len, length)));
    }
    map_str(state, value, |s| {
        if s.chars().count() <= length.saturating_add(leeway) {
            return s.to_string();
        }
        let mut cut: String = s.chars().take(length.saturating_sub(end_len)).collect();
        if !killwords {
            if let Some(idx) = cut.rfind(' ') {
                cut.truncate(idx);
            }
        }
        cut.push_str(&end);
        cut
    })
}

/// The filters every environment starts with.
pub(crate) fn builtin_filters() -> IndexMap<String, Filter> {
    type Builtin = fn(&State<'_>, &Value, &Args<'_>) -> JinjateResult<Value>;
    let table: &[(&str, Builtin)] = &[
        ("upper", upper),
        ("lower", lower),
        ("title", title),
        ("capitalize", capitalize_filter),
        ("trim", trim),
        ("length", length),
        ("count", length),
        ("default", default),
        ("d", default),
        ("escape", escape),
        ("e", escape),
        ("forceescape", forceescape),
        ("safe", safe),
        ("string", string),
        ("join", join),
        ("first", first),
        ("last", last),
        ("list", list),
        ("int", int),
        ("float", float),
        ("abs", abs),
        ("round", round),
        ("replace", replace),
        ("reverse", reverse),
        ("sort", sort),
        ("dictsort", dictsort),
        ("items", items),
        ("unique", unique),
        ("min", min),
        ("max", max),
        ("sum", sum),
        ("batch", batch),
        ("attr", attr),
        ("map", map),
        ("select", select),
        ("reject", reject),
        ("selectattr", selectattr),
        ("rejectattr", rejectattr),
        ("center", center),
        ("indent", indent),
        ("wordcount", wordcount),
        ("truncate", truncate),
    ];
    table
        .iter()
        .map(|(name, func)| ((*name).to_string(), Filter::new(*func)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    fn apply(name: &str, value: Value, args: &[Value]) -> JinjateResult<Value> {
        apply_kw(name, value, args, &Kwargs::new(), false)
    }

    fn apply_kw(
        name: &str,
        value: Value,
        args: &[Value],
        kwargs: &Kwargs,
        autoescape: bool,
    ) -> JinjateResult<Value> {
        let env = Environment::new();
        let state = State::new(&env, None, autoescape);
        let filter = env.filter(name).expect("builtin filter");
        filter.call(&state, &value, &Args::new(args, kwargs))
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_case_filters() {
        assert_eq!(title_case("hello wORLD-foo (bar)"), "Hello World-Foo (Bar)");
        assert_eq!(capitalize("hELLO world"), "Hello world");
        assert_eq!(apply("upper", Value::from("abc"), &[]).unwrap().to_string(), "ABC");
        let safe = apply("upper", Value::from_safe_string("<b>"), &[]).unwrap();
        assert!(safe.is_safe());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_default_respects_boolean_flag() {
        let missing = Value::undefined("x");
        assert_eq!(apply("default", missing, &[Value::from("y")]).unwrap().to_string(), "y");
        assert_eq!(apply("d", Value::from(""), &[Value::from("y")]).unwrap().to_string(), "");
        let rv = apply("d", Value::from(""), &[Value::from("y"), Value::Bool(true)]).unwrap();
        assert_eq!(rv.to_string(), "y");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_join_escapes_when_autoescaping() {
        let items = Value::from(vec![Value::from("<a>"), Value::from_safe_string("<b>")]);
        let rv = apply_kw("join", items.clone(), &[Value::from(",")], &Kwargs::new(), true).unwrap();
        assert_eq!(rv.to_string(), "&lt;a&gt;,<b>");
        let rv = apply("join", items, &[Value::from(",")]).unwrap();
        assert_eq!(rv.to_string(), "<a>,<b>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_sort_and_dictsort() {
        let items = Value::from(vec![Value::from("b"), Value::from("A"), Value::from("c")]);
        assert_eq!(apply("sort", items, &[]).unwrap().to_string(), "['A', 'b', 'c']");
        let map = Value::from_map([("b", 1), ("a", 2)]);
        assert_eq!(
            apply("dictsort", map, &[]).unwrap().to_string(),
            "[('a', 2), ('b', 1)]"
        );
        let mixed = Value::from(vec![Value::from(1), Value::from("a")]);
        assert!(apply("sort", mixed, &[]).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_map_and_select() {
        let users = Value::from(vec![
            Value::from_map([("name", "ann")]),
            Value::from_map([("name", "bob")]),
        ]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("attribute".into(), Value::from("name"));
        let names = apply_kw("map", users, &[], &kwargs, false).unwrap();
        assert_eq!(names.to_string(), "['ann', 'bob']");
        let upper = apply("map", names, &[Value::from("upper")]).unwrap();
        assert_eq!(upper.to_string(), "['ANN', 'BOB']");

        let numbers = Value::from((1..=6).map(Value::from).collect::<Vec<_>>());
        let odd = apply("select", numbers.clone(), &[Value::from("odd")]).unwrap();
        assert_eq!(odd.to_string(), "[1, 3, 5]");
        let big = apply("reject", numbers, &[Value::from("lt"), Value::from(5)]).unwrap();
        assert_eq!(big.to_string(), "[5, 6]");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_batch_pads_last_row() {
        let numbers = Value::from((1..=5).map(Value::from).collect::<Vec<_>>());
        let rv = apply("batch", numbers, &[Value::from(2), Value::from(0)]).unwrap();
        assert_eq!(rv.to_string(), "[[1, 2], [3, 4], [5, 0]]");
        let huge = Value::from(i64::MAX);
        assert!(apply("batch", Value::from(vec![1]), &[huge.clone(), Value::from(0)]).is_err());
        assert!(apply("center", Value::from("x"), &[huge.clone()]).is_err());
        assert!(apply("indent", Value::from("a\nb"), &[huge]).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_numeric_filters() {
        assert_eq!(apply("int", Value::from("42"), &[]).unwrap(), Value::Int(42));
        assert_eq!(apply("int", Value::from("x"), &[Value::from(7)]).unwrap(), Value::Int(7));
        assert_eq!(apply("round", Value::from(2.567), &[Value::from(1)]).unwrap().to_string(), "2.6");
        assert_eq!(apply("abs", Value::from(-3), &[]).unwrap(), Value::Int(3));
        let numbers = Value::from(vec![Value::from(1), Value::from(2)]);
        assert_eq!(apply("sum", numbers, &[]).unwrap(), Value::Int(3));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_truncate_and_indent() {
        let text = Value::from("foo bar baz qux");
        let rv = apply("truncate", text, &[Value::from(9), Value::Bool(false), Value::from("..."), Value::from(0)]).unwrap();
        assert_eq!(rv.to_string(), "foo...");
        let rv = apply("indent", Value::from("a\nb\n\nc"), &[Value::from(2)]).unwrap();
        assert_eq!(rv.to_string(), "a\n  b\n\n  c");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_first_of_empty_is_undefined() {
        let rv = apply("first", Value::from(Vec::<Value>::new()), &[]).unwrap();
        assert!(rv.is_undefined());
        assert_eq!(apply("length", Value::undefined("x"), &[]).unwrap(), Value::Int(0));
    }
}
