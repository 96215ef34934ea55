use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::{environment::Environment, value::Value};

/// The variables a template is rendered with.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: AsRef<str>, V: Into<Value>>(&mut self, name: T, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value.into());
        self
    }

    pub fn get<T: AsRef<str>>(&self, name: T) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<T: AsRef<str>>(&self, name: T) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(name, value)| (name.into(), value.into())).collect(),
        }
    }
}

impl From<Context> for Value {
    fn from(context: Context) -> Self {
        Self::from(context.data)
    }
}

/// A named-template engine: register templates, render them by name, and ask which variables
/// a render would still need.
pub trait TemplateEngine {
    /// `add_template` compiles a template and makes it available under `name`.
    ///
    /// # Errors
    /// - If the template fails to compile.
    fn add_template<N: AsRef<str>, S: AsRef<str>>(&mut self, name: N, source: S) -> crate::JinjateResult<()>;

    /// `render` renders a template with the given context.
    ///
    /// # Errors
    /// - If the template name is not found.
    /// - If rendering fails.
    fn render<N: AsRef<str>>(&self, template_name: N, context: Option<&Context>) -> crate::JinjateResult<String>;

    /// `context` returns the variables the template reads that neither `context` nor the
    /// environment's globals provide.
    ///
    /// # Errors
    /// - If the template name is not found.
    fn context<N: AsRef<str>>(&self, template_name: N, context: &Context) -> crate::JinjateResult<BTreeSet<String>>;
}

impl TemplateEngine for Environment {
    fn add_template<N: AsRef<str>, S: AsRef<str>>(&mut self, name: N, source: S) -> crate::JinjateResult<()> {
        Self::add_template(self, name.as_ref(), source.as_ref())
    }

    fn render<N: AsRef<str>>(&self, template_name: N, context: Option<&Context>) -> crate::JinjateResult<String> {
        let template = self.get_template(template_name.as_ref())?;
        match context {
            Some(context) => template.render(context),
            None => template.render(&Context::new()),
        }
    }

    fn context<N: AsRef<str>>(&self, template_name: N, context: &Context) -> crate::JinjateResult<BTreeSet<String>> {
        let template = self.get_template(template_name.as_ref())?;
        Ok(template
            .undeclared_variables()
            .iter()
            .filter(|name| !context.contains(name) && !self.globals().contains_key(name.as_str()))
            .cloned()
            .collect())
    }
}
