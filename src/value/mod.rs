//! The dynamic value type templates operate on.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::{
    error::{Error, ErrorKind},
    functions::Function,
    runtime::ObjectKind,
};

pub(crate) mod ops;
#[cfg(feature = "serde")]
mod serialize;

pub use ops::{BinOpKind, CmpOp, escape};

/// Keyword arguments of a call, in call order.
pub type Kwargs = IndexMap<String, Value>;

/// How undefined values behave when they are used.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum UndefinedBehavior {
    /// Renders as an empty string, is falsy and iterates as empty. Anything else fails.
    #[default]
    Default,
    /// Like `Default`, but attribute and item access return the undefined value again.
    Chainable,
    /// Fails on every use, including printing, truth tests and iteration.
    Strict,
    /// Like `Default`, but prints `{{ name }}` so missing values stay visible.
    Debug,
}

impl UndefinedBehavior {
    /// Fails if `value` is undefined and this behavior forbids printing, testing or iterating it.
    pub(crate) fn check_soft_use(self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Undefined(undefined) if self == Self::Strict => Err(undefined.to_error()),
            _ => Ok(()),
        }
    }

    /// The text an undefined value prints as.
    pub(crate) fn render(self, undefined: &Undefined) -> Result<String, Error> {
        match self {
            Self::Strict => Err(undefined.to_error()),
            Self::Debug => Ok(match (undefined.hint(), undefined.name()) {
                (Some(hint), _) => format!("{{{{ undefined value printed: {} }}}}", hint),
                (None, Some(name)) => format!("{{{{ {} }}}}", name),
                (None, None) => "{{ undefined value }}".to_string(),
            }),
            Self::Default | Self::Chainable => Ok(String::new()),
        }
    }
}

/// The payload of [`Value::Undefined`]: what was looked up and why it failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Undefined {
    name: Option<Arc<str>>,
    hint: Option<Arc<str>>,
    /// Produced by the sandbox; using it is a security error.
    denied: bool,
}

impl Undefined {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.into()),
            hint: None,
            denied: false,
        }
    }

    pub fn with_hint(name: Option<&str>, hint: &str) -> Self {
        Self {
            name: name.map(Into::into),
            hint: Some(hint.into()),
            denied: false,
        }
    }

    pub(crate) fn denied(name: &str, hint: &str) -> Self {
        Self {
            denied: true,
            ..Self::with_hint(Some(name), hint)
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// The message raised when this value is used illegally.
    pub fn message(&self) -> String {
        match (&self.hint, &self.name) {
            (Some(hint), _) => hint.to_string(),
            (None, Some(name)) => format!("'{}' is undefined", name),
            (None, None) => "value is undefined".to_string(),
        }
    }

    pub(crate) fn to_error(&self) -> Error {
        let kind = if self.denied {
            ErrorKind::Security
        } else {
            ErrorKind::Undefined
        };
        Error::new(kind, self.message())
    }
}

/// A hashable map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    None,
    Bool(bool),
    Int(i64),
    String(Arc<str>),
}

impl Key {
    pub(crate) fn from_value(value: &Value) -> Result<Self, Error> {
        match value {
            Value::None => Ok(Self::None),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(Self::Int(*f as i64)),
            Value::String(s) | Value::Safe(s) => Ok(Self::String(s.clone())),
            Value::Undefined(_)
            | Value::Float(_)
            | Value::Seq(_)
            | Value::Tuple(_)
            | Value::Map(_)
            | Value::OneShot(_)
            | Value::Object(_) => Err(Error::type_error(format!(
                "unhashable type: '{}'",
                value.kind_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::None | Self::Bool(_) | Self::Int(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

/// An iterator that can be consumed exactly once, like a generator.
pub struct OneShot {
    iter: Mutex<Option<Box<dyn Iterator<Item = Value> + Send>>>,
}

impl OneShot {
    pub(crate) fn take(&self) -> Box<dyn Iterator<Item = Value> + Send> {
        self.iter
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(std::iter::empty()))
    }
}

impl fmt::Debug for OneShot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<generator>")
    }
}

/// An opaque runtime object: macros, loop contexts, namespaces, modules, functions.
#[derive(Clone)]
pub struct Object(pub(crate) ObjectKind);

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0.type_name())
    }
}

/// A dynamically typed template value.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Undefined(Undefined),
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    /// A string that is already escaped and must not be escaped again.
    Safe(Arc<str>),
    Seq(Arc<Vec<Value>>),
    /// An immutable sequence. Behaves like `Seq` but prints with parentheses.
    Tuple(Arc<Vec<Value>>),
    Map(Arc<IndexMap<Key, Value>>),
    OneShot(Arc<OneShot>),
    Object(Object),
}

impl Default for Value {
    fn default() -> Self {
        Self::None
    }
}

/// An owned iterator over a value's items.
pub(crate) struct ValueIter {
    inner: Box<dyn Iterator<Item = Value> + Send>,
    len: Option<usize>,
}

impl ValueIter {
    pub(crate) fn new(inner: Box<dyn Iterator<Item = Value> + Send>, len: Option<usize>) -> Self {
        Self { inner, len }
    }

    pub(crate) fn empty() -> Self {
        Self::new(Box::new(std::iter::empty()), Some(0))
    }

    /// The number of items, if it is known without consuming the iterator.
    pub(crate) const fn known_len(&self) -> Option<usize> {
        self.len
    }

    pub(crate) fn into_inner(self) -> Box<dyn Iterator<Item = Value> + Send> {
        self.inner
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.inner.next()
    }
}

impl Value {
    /// Wraps a string that is already escaped.
    pub fn from_safe_string<S: Into<Arc<str>>>(s: S) -> Self {
        Self::Safe(s.into())
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::Tuple(Arc::new(items))
    }

    /// Wraps an iterator that can only be walked once.
    pub fn from_iter_once<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::OneShot(Arc::new(OneShot {
            iter: Mutex::new(Some(Box::new(iter.into_iter()))),
        }))
    }

    /// Wraps a native function so templates can call it.
    pub fn from_function<F>(name: &str, func: F) -> Self
    where
        F: Fn(&crate::State<'_>, &crate::Args<'_>) -> crate::JinjateResult<Value>
            + Send
            + Sync
            + 'static,
    {
        Self::Object(Object(ObjectKind::Function(Arc::new(Function::new(
            name, func,
        )))))
    }

    pub(crate) fn from_object(kind: ObjectKind) -> Self {
        Self::Object(Object(kind))
    }

    pub(crate) fn undefined(name: &str) -> Self {
        Self::Undefined(Undefined::named(name))
    }

    pub fn from_map<K: Into<Key>, V: Into<Value>, I: IntoIterator<Item = (K, V)>>(items: I) -> Self {
        Self::Map(Arc::new(
            items
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    pub(crate) fn object(&self) -> Option<&ObjectKind> {
        match self {
            Self::Object(Object(kind)) => Some(kind),
            _ => None,
        }
    }

    /// A python-like name of the value's type, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Undefined(_) => "Undefined",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "str",
            Self::Safe(_) => "Markup",
            Self::Seq(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "dict",
            Self::OneShot(_) => "generator",
            Self::Object(Object(kind)) => kind.type_name(),
        }
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined(_))
    }

    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub const fn is_safe(&self) -> bool {
        matches!(self, Self::Safe(_))
    }

    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Safe(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<Key, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Python truthiness. Undefined values are falsy here; strict handling is done by the caller.
    pub fn is_true(&self) -> bool {
        match self {
            Self::None | Self::Undefined(_) => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) | Self::Safe(s) => !s.is_empty(),
            Self::Seq(items) | Self::Tuple(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::OneShot(_) | Self::Object(_) => true,
        }
    }

    /// The number of items, for values that know it without iterating.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::String(s) | Self::Safe(s) => Some(s.chars().count()),
            Self::Seq(items) | Self::Tuple(items) => Some(items.len()),
            Self::Map(map) => Some(map.len()),
            Self::Object(Object(kind)) => kind.len(),
            Self::None
            | Self::Undefined(_)
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::OneShot(_) => None,
        }
    }

    /// Iterates over the value. Maps iterate over their keys and strings over their characters.
    pub(crate) fn try_iter(&self) -> Result<ValueIter, Error> {
        match self {
            Self::Undefined(_) => Ok(ValueIter::empty()),
            Self::Seq(items) | Self::Tuple(items) => {
                let items = items.clone();
                let len = items.len();
                Ok(ValueIter::new(
                    Box::new((0..len).filter_map(move |idx| items.get(idx).cloned())),
                    Some(len),
                ))
            }
            Self::Map(map) => {
                let keys: Vec<Value> = map.keys().map(Key::to_value).collect();
                let len = keys.len();
                Ok(ValueIter::new(Box::new(keys.into_iter()), Some(len)))
            }
            Self::String(s) | Self::Safe(s) => {
                let safe = self.is_safe();
                let chars: Vec<Value> = s
                    .chars()
                    .map(|c| {
                        let s: Arc<str> = c.to_string().into();
                        if safe { Self::Safe(s) } else { Self::String(s) }
                    })
                    .collect();
                let len = chars.len();
                Ok(ValueIter::new(Box::new(chars.into_iter()), Some(len)))
            }
            Self::OneShot(one_shot) => Ok(ValueIter::new(one_shot.take(), None)),
            Self::Object(Object(kind)) => kind.try_iter().ok_or_else(|| {
                Error::type_error(format!("'{}' object is not iterable", kind.type_name()))
            }),
            Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) => Err(Error::type_error(
                format!("'{}' object is not iterable", self.kind_name()),
            )),
        }
    }

    /// Converts to an escaped, safe string.
    pub fn escape(&self) -> Self {
        match self {
            Self::Safe(_) => self.clone(),
            Self::Undefined(_) => Self::Safe("".into()),
            Self::Object(Object(kind)) if kind.is_markup() => Self::Safe(self.to_string().into()),
            _ => Self::Safe(escape(&self.to_string()).into()),
        }
    }

    /// The `repr` of a value, used when printing collections.
    pub(crate) fn repr(&self) -> String {
        match self {
            Self::String(s) | Self::Safe(s) => quote(s),
            _ => self.to_string(),
        }
    }

    pub(crate) fn cmp_values(&self, other: &Self) -> Option<Ordering> {
        ops::partial_cmp(self, other)
    }
}

fn quote(s: &str) -> String {
    let delimiter = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut rv = String::with_capacity(s.len().saturating_add(2));
    rv.push(delimiter);
    for c in s.chars() {
        match c {
            '\\' => rv.push_str("\\\\"),
            '\n' => rv.push_str("\\n"),
            '\r' => rv.push_str("\\r"),
            '\t' => rv.push_str("\\t"),
            c if c == delimiter => {
                rv.push('\\');
                rv.push(c);
            }
            c => rv.push(c),
        }
    }
    rv.push(delimiter);
    rv
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn fmt_items(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        f.write_str(&item.repr())?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Undefined(_) => Ok(()),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::String(s) | Self::Safe(s) => f.write_str(s),
            Self::Seq(items) => {
                f.write_str("[")?;
                fmt_items(f, items)?;
                f.write_str("]")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                fmt_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (idx, (key, value)) in map.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key.to_value().repr(), value.repr())?;
                }
                f.write_str("}")
            }
            Self::OneShot(_) => f.write_str("<generator object>"),
            Self::Object(Object(kind)) => kind.fmt_display(f),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        ops::loose_eq(self, other)
    }
}

macro_rules! value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::Int(i64::from(value))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

impl From<Arc<str>> for Value {
    fn from(value: Arc<str>) -> Self {
        Self::String(value)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::Seq(Arc::new(value.into_iter().map(Into::into).collect()))
    }
}

impl<K: Into<Key>, V: Into<Value>> From<BTreeMap<K, V>> for Value {
    fn from(value: BTreeMap<K, V>) -> Self {
        Self::from_map(value)
    }
}

impl<K: Into<Key>, V: Into<Value>> From<HashMap<K, V>> for Value {
    fn from(value: HashMap<K, V>) -> Self {
        Self::from_map(value)
    }
}

impl<K: Into<Key>, V: Into<Value>> From<IndexMap<K, V>> for Value {
    fn from(value: IndexMap<K, V>) -> Self {
        Self::from_map(value)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::Seq(Arc::new(iter.into_iter().collect()))
    }
}
