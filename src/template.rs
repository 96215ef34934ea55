use std::{collections::BTreeSet, fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    environment::Environment,
    error::JinjateResult,
    instructions::CompiledTemplate,
    interface::Context,
    output::{ChunkCollector, Output},
    value::Value,
    vm::Vm,
};

/// A compiled template, bound to the environment it was loaded from.
///
/// Templates are cheap to clone and are created through [`Environment::get_template`],
/// [`Environment::select_template`] or [`Environment::from_string`].
///
/// # Example
///
/// ```rust
/// use jinjate::{Context, Environment};
///
/// let env = Environment::new();
/// let template = env.from_string("Hello {{ name|upper }}!").unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "world");
///
/// assert_eq!(template.render(&context).unwrap(), "Hello WORLD!");
/// ```
#[derive(Clone)]
pub struct Template<'env> {
    env: &'env Environment,
    compiled: Arc<CompiledTemplate>,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.compiled.name)
            .field("filename", &self.compiled.filename)
            .finish_non_exhaustive()
    }
}

impl<'env> Template<'env> {
    pub(crate) const fn new(env: &'env Environment, compiled: Arc<CompiledTemplate>) -> Self {
        Self { env, compiled }
    }

    /// The name the template was loaded under, `None` for string templates.
    pub fn name(&self) -> Option<&str> {
        self.compiled.name.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.compiled.filename.as_deref()
    }

    pub const fn compiled(&self) -> &Arc<CompiledTemplate> {
        &self.compiled
    }

    fn vars(&self, context: &Context) -> IndexMap<String, Value> {
        let mut vars = self.env.globals().clone();
        vars.extend(context.iter().map(|(name, value)| (name.to_string(), value.clone())));
        vars
    }

    /// Renders the whole template to a string.
    ///
    /// # Errors
    /// - Any error raised while executing the template, with template relative line numbers.
    pub fn render(&self, context: &Context) -> JinjateResult<String> {
        let mut rv = String::new();
        self.render_to(context, &mut rv)?;
        Ok(rv)
    }

    /// Streams the output into `w`. Output written before an error stays written.
    ///
    /// # Errors
    /// - Any error raised while executing the template, or a failing writer.
    pub fn render_to(&self, context: &Context, w: &mut dyn fmt::Write) -> JinjateResult<()> {
        let mut out = Output::new(w);
        Vm::new(self.env)
            .render(&self.compiled, self.vars(context), &mut out)
            .map(drop)
    }

    /// Renders into chunks of output. A failed render ends with the error as the last item.
    pub fn generate(&self, context: &Context) -> impl Iterator<Item = JinjateResult<String>> + use<> {
        let mut collector = ChunkCollector::default();
        let rv = self.render_to(context, &mut collector);
        collector.chunks.into_iter().map(Ok).chain(rv.err().map(Err))
    }

    /// Renders the template and returns its output together with its exported top level names.
    ///
    /// # Errors
    /// - Any error raised while executing the template.
    pub fn module(&self, context: &Context) -> JinjateResult<TemplateModule> {
        let mut body = String::new();
        let mut vm = Vm::new(self.env);
        let ctx = {
            let mut out = Output::new(&mut body);
            vm.render(&self.compiled, self.vars(context), &mut out)?
        };
        let exports = ctx.get_exported();
        drop(vm);
        Ok(TemplateModule {
            name: self.compiled.name.clone(),
            body,
            exports,
        })
    }

    /// Names the template reads from its render context, including globals.
    pub fn undeclared_variables(&self) -> &BTreeSet<String> {
        &self.compiled.resolved
    }

    /// Block names in source order.
    pub fn blocks(&self) -> Vec<&str> {
        self.compiled.blocks.keys().map(String::as_str).collect()
    }

    /// `(template line, instruction offset)` pairs of the top level code.
    pub fn debug_info(&self) -> &[(usize, usize)] {
        self.compiled.root().map_or(&[], |unit| unit.debug_info.as_slice())
    }
}

/// The result of [`Template::module`].
#[derive(Debug, Clone)]
pub struct TemplateModule {
    name: Option<String>,
    body: String,
    exports: IndexMap<String, Value>,
}

impl TemplateModule {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.exports.get(name)
    }

    pub const fn exports(&self) -> &IndexMap<String, Value> {
        &self.exports
    }
}

impl fmt::Display for TemplateModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}
