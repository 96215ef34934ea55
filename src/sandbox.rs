//! Restricting what templates may reach through attribute access and calls.
//!
//! A policy is installed with [`crate::Environment::set_sandbox`]. Unsafe attribute lookups
//! produce an undefined value that raises a security error when used; calling an unsafe object
//! fails right away.

use std::collections::HashSet;

use crate::{
    error::{Error, ErrorKind},
    runtime::ObjectKind,
    value::{Undefined, Value},
};

/// Decides which attributes and callables a sandboxed template may use.
pub trait SandboxPolicy: Send + Sync {
    /// Whether `obj.attr` (which resolved to `value`) may be read. Private names are refused.
    fn is_safe_attribute(&self, obj: &Value, attr: &str, value: &Value) -> bool {
        let _ = (obj, value);
        !attr.starts_with('_')
    }

    /// Whether `obj` may be called.
    fn is_safe_callable(&self, obj: &Value) -> bool {
        let _ = obj;
        true
    }
}

/// The stock policy: hides private attributes plus any explicitly denied names.
#[derive(Debug, Clone, Default)]
pub struct DefaultSandbox {
    denied_attributes: HashSet<String>,
    denied_callables: HashSet<String>,
}

impl DefaultSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deny_attribute(mut self, name: &str) -> Self {
        self.denied_attributes.insert(name.to_string());
        self
    }

    /// Refuses calls to functions and macros with this name.
    #[must_use]
    pub fn deny_callable(mut self, name: &str) -> Self {
        self.denied_callables.insert(name.to_string());
        self
    }
}

fn callable_name(obj: &Value) -> Option<&str> {
    match obj.object()? {
        ObjectKind::Function(func) => Some(func.name()),
        ObjectKind::Macro(m) => Some(&m.spec.name),
        _ => None,
    }
}

impl SandboxPolicy for DefaultSandbox {
    fn is_safe_attribute(&self, _obj: &Value, attr: &str, _value: &Value) -> bool {
        !attr.starts_with('_') && !self.denied_attributes.contains(attr)
    }

    fn is_safe_callable(&self, obj: &Value) -> bool {
        callable_name(obj).is_none_or(|name| !self.denied_callables.contains(name))
    }
}

/// The value an unsafe attribute lookup produces.
pub(crate) fn unsafe_undefined(obj: &Value, attr: &str) -> Value {
    Value::Undefined(Undefined::denied(
        attr,
        &format!(
            "access to attribute '{}' of '{}' object is unsafe.",
            attr,
            obj.kind_name()
        ),
    ))
}

pub(crate) fn unsafe_call(obj: &Value) -> Error {
    Error::new(ErrorKind::Security, format!("{} is not safely callable", obj.repr()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_private_and_denied_attributes() {
        let policy = DefaultSandbox::new().deny_attribute("secret");
        let obj = Value::from_map([("a", 1)]);
        assert!(policy.is_safe_attribute(&obj, "a", &Value::None));
        assert!(!policy.is_safe_attribute(&obj, "_a", &Value::None));
        assert!(!policy.is_safe_attribute(&obj, "secret", &Value::None));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_denied_callables() {
        let policy = DefaultSandbox::new().deny_callable("range");
        let range = Value::from_function("range", crate::functions::range);
        let dict = Value::from_function("dict", crate::functions::dict);
        assert!(!policy.is_safe_callable(&range));
        assert!(policy.is_safe_callable(&dict));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unsafe_undefined_raises_security_error() {
        let value = unsafe_undefined(&Value::from_map([("_x", 1)]), "_x");
        let Value::Undefined(undefined) = value else {
            panic!("expected an undefined value");
        };
        let err = undefined.to_error();
        assert_eq!(err.kind(), ErrorKind::Security);
        assert_eq!(err.message(), "access to attribute '_x' of 'dict' object is unsafe.");
    }
}
