//! The [`Environment`]: configuration, registries, caches and template lookup.
//!
//! An environment is set up once through its setters and then shared read-only between renders.
//! Templates come from three places, checked in order: templates added directly with
//! [`Environment::add_template`], the bounded template cache, and the configured [`Loader`]
//! (optionally backed by a [`BytecodeCache`]).

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    ast,
    bccache::BytecodeCache,
    cache::LruCache,
    compiler,
    error::{Error, JinjateResult},
    ext::{ExprStmt, Extension, LoopControls},
    filters::{Filter, builtin_filters},
    functions::{Args, State, builtin_globals},
    instructions::{CompiledTemplate, TemplateLookup},
    lexer::{Lexer, LexerCache, LexerConfig, Token, TokenIter, TokenStream},
    loader::{Loader, UpToDate},
    optimizer::{self, FoldCtx},
    parser::{Parser, TagHandlers},
    sandbox::SandboxPolicy,
    template::Template,
    tests::{Test, builtin_tests},
    value::{UndefinedBehavior, Value},
};

const DEFAULT_CACHE_SIZE: usize = 400;
const DEFAULT_LEXER_CACHE_SIZE: usize = 50;
const DEFAULT_RECURSION_LIMIT: usize = 100;

/// Delimiters of the template language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syntax {
    pub block_start: String,
    pub block_end: String,
    pub variable_start: String,
    pub variable_end: String,
    pub comment_start: String,
    pub comment_end: String,
    /// Lines starting with this prefix are parsed as block statements.
    pub line_statement_prefix: Option<String>,
    /// Text after this prefix up to the end of the line is ignored.
    pub line_comment_prefix: Option<String>,
}

impl Default for Syntax {
    fn default() -> Self {
        let config = LexerConfig::default();
        Self {
            block_start: config.block_start,
            block_end: config.block_end,
            variable_start: config.variable_start,
            variable_end: config.variable_end,
            comment_start: config.comment_start,
            comment_end: config.comment_end,
            line_statement_prefix: None,
            line_comment_prefix: None,
        }
    }
}

type AutoEscapeFn = dyn Fn(Option<&str>) -> bool + Send + Sync;

/// Whether output of a template is HTML escaped by default.
#[derive(Clone, Default)]
pub enum AutoEscape {
    #[default]
    Disabled,
    Enabled,
    /// Decided per template name. Templates created from strings pass `None`.
    Callback(Arc<AutoEscapeFn>),
}

impl AutoEscape {
    pub fn callback<F: Fn(Option<&str>) -> bool + Send + Sync + 'static>(func: F) -> Self {
        Self::Callback(Arc::new(func))
    }

    fn for_name(&self, name: Option<&str>) -> bool {
        match self {
            Self::Disabled => false,
            Self::Enabled => true,
            Self::Callback(func) => func(name),
        }
    }
}

impl fmt::Debug for AutoEscape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Autoescaping by file extension.
///
/// Names ending in one of `enabled` are escaped, names ending in one of `disabled` are not,
/// string templates use `default_for_string` and everything else uses `default`.
pub fn select_autoescape(enabled: &[&str], disabled: &[&str], default_for_string: bool, default: bool) -> AutoEscape {
    let suffixes = |exts: &[&str]| -> Vec<String> {
        exts.iter()
            .map(|ext| format!(".{}", ext.trim_start_matches('.').to_lowercase()))
            .collect()
    };
    let enabled = suffixes(enabled);
    let disabled = suffixes(disabled);
    AutoEscape::callback(move |name| {
        let Some(name) = name else {
            return default_for_string;
        };
        let name = name.to_lowercase();
        if enabled.iter().any(|ext| name.ends_with(ext.as_str())) {
            return true;
        }
        if disabled.iter().any(|ext| name.ends_with(ext.as_str())) {
            return false;
        }
        default
    })
}

#[derive(Clone)]
struct CachedTemplate {
    compiled: Arc<CompiledTemplate>,
    uptodate: Option<UpToDate>,
}

pub struct Environment {
    lexer_config: LexerConfig,
    autoescape: AutoEscape,
    undefined: UndefinedBehavior,
    optimized: bool,
    auto_reload: bool,
    recursion_limit: usize,
    filters: IndexMap<String, Filter>,
    tests: IndexMap<String, Test>,
    globals: IndexMap<String, Value>,
    templates: IndexMap<String, Arc<CompiledTemplate>>,
    loader: Option<Box<dyn Loader>>,
    bytecode_cache: Option<Box<dyn BytecodeCache>>,
    extensions: Vec<Arc<dyn Extension>>,
    tag_handlers: TagHandlers,
    sandbox: Option<Box<dyn SandboxPolicy>>,
    cache: LruCache<String, CachedTemplate>,
    lexer_cache: Arc<LexerCache>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("lexer_config", &self.lexer_config)
            .field("autoescape", &self.autoescape)
            .field("undefined", &self.undefined)
            .field("optimized", &self.optimized)
            .field("auto_reload", &self.auto_reload)
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.len())
            .field("tests", &self.tests.len())
            .field("extensions", &self.extensions.iter().map(|ext| ext.name()).collect::<Vec<_>>())
            .field("sandboxed", &self.sandbox.is_some())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// An environment with the built-in filters, tests and globals and the `break`/`continue`
    /// and `do` extensions enabled.
    pub fn new() -> Self {
        Self::with_lexer_cache(Arc::new(LexerCache::new(DEFAULT_LEXER_CACHE_SIZE)))
    }

    /// Like [`Environment::new`], sharing compiled lexers with other environments.
    pub fn with_lexer_cache(lexer_cache: Arc<LexerCache>) -> Self {
        let mut env = Self {
            lexer_config: LexerConfig::default(),
            autoescape: AutoEscape::default(),
            undefined: UndefinedBehavior::default(),
            optimized: true,
            auto_reload: true,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            filters: builtin_filters(),
            tests: builtin_tests(),
            globals: builtin_globals(),
            templates: IndexMap::new(),
            loader: None,
            bytecode_cache: None,
            extensions: Vec::new(),
            tag_handlers: TagHandlers::new(),
            sandbox: None,
            cache: LruCache::new(DEFAULT_CACHE_SIZE),
            lexer_cache,
        };
        env.add_extension(LoopControls);
        env.add_extension(ExprStmt);
        env
    }

    pub fn set_syntax(&mut self, syntax: Syntax) {
        self.lexer_config.block_start = syntax.block_start;
        self.lexer_config.block_end = syntax.block_end;
        self.lexer_config.variable_start = syntax.variable_start;
        self.lexer_config.variable_end = syntax.variable_end;
        self.lexer_config.comment_start = syntax.comment_start;
        self.lexer_config.comment_end = syntax.comment_end;
        self.lexer_config.line_statement_prefix = syntax.line_statement_prefix;
        self.lexer_config.line_comment_prefix = syntax.line_comment_prefix;
        self.cache.clear();
    }

    /// Removes the first newline after a block tag.
    pub fn set_trim_blocks(&mut self, value: bool) {
        self.lexer_config.trim_blocks = value;
        self.cache.clear();
    }

    /// Strips whitespace from the start of a line up to a block tag.
    pub fn set_lstrip_blocks(&mut self, value: bool) {
        self.lexer_config.lstrip_blocks = value;
        self.cache.clear();
    }

    pub fn set_keep_trailing_newline(&mut self, value: bool) {
        self.lexer_config.keep_trailing_newline = value;
        self.cache.clear();
    }

    /// Sets the newline written for line breaks in template data. Only `"\n"`, `"\r\n"` and
    /// `"\r"` are accepted; anything else fails when the next template is compiled.
    pub fn set_newline_sequence(&mut self, value: &str) {
        value.clone_into(&mut self.lexer_config.newline_sequence);
        self.cache.clear();
    }

    pub fn set_autoescape(&mut self, autoescape: AutoEscape) {
        self.autoescape = autoescape;
        self.cache.clear();
    }

    pub fn set_undefined_behavior(&mut self, behavior: UndefinedBehavior) {
        self.undefined = behavior;
    }

    /// Enables constant folding at compile time.
    pub fn set_optimized(&mut self, value: bool) {
        self.optimized = value;
        self.cache.clear();
    }

    /// Re-checks loaded templates with their loader's up-to-date callback on every lookup.
    pub const fn set_auto_reload(&mut self, value: bool) {
        self.auto_reload = value;
    }

    /// Sets how many loaded templates are kept. Zero disables the cache.
    pub fn set_cache_size(&mut self, capacity: usize) {
        self.cache = LruCache::new(capacity);
    }

    pub const fn set_recursion_limit(&mut self, limit: usize) {
        self.recursion_limit = limit;
    }

    pub fn set_loader<L: Loader + 'static>(&mut self, loader: L) {
        self.loader = Some(Box::new(loader));
        self.cache.clear();
    }

    pub fn set_bytecode_cache<C: BytecodeCache + 'static>(&mut self, cache: C) {
        self.bytecode_cache = Some(Box::new(cache));
    }

    /// Installs a sandbox policy. Without one, attribute access and calls are unrestricted.
    pub fn set_sandbox<P: SandboxPolicy + 'static>(&mut self, policy: P) {
        self.sandbox = Some(Box::new(policy));
        self.cache.clear();
    }

    pub fn add_filter(&mut self, name: &str, filter: Filter) {
        self.filters.insert(name.to_string(), filter);
        self.cache.clear();
    }

    pub fn add_test(&mut self, name: &str, test: Test) {
        self.tests.insert(name.to_string(), test);
        self.cache.clear();
    }

    pub fn add_global<V: Into<Value>>(&mut self, name: &str, value: V) {
        self.globals.insert(name.to_string(), value.into());
    }

    /// Registers a global function.
    pub fn add_function<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&State<'_>, &Args<'_>) -> JinjateResult<Value> + Send + Sync + 'static,
    {
        self.add_global(name, Value::from_function(name, func));
    }

    /// Registers an extension, replacing one with the same name.
    pub fn add_extension<E: Extension + 'static>(&mut self, extension: E) {
        let extension: Arc<dyn Extension> = Arc::new(extension);
        self.extensions.retain(|ext| ext.name() != extension.name());
        self.extensions.push(extension);
        self.extensions.sort_by_key(|ext| ext.priority());
        self.tag_handlers = self
            .extensions
            .iter()
            .flat_map(|ext| ext.tags().iter().map(move |tag| ((*tag).to_string(), Arc::clone(ext))))
            .collect();
        self.cache.clear();
    }

    /// Compiles `source` and makes it available under `name`, replacing any template added
    /// under that name before.
    ///
    /// # Errors
    /// - If the source fails to lex, parse or compile.
    pub fn add_template(&mut self, name: &str, source: &str) -> JinjateResult<()> {
        let compiled = self.compile(source, Some(name), None)?;
        self.templates.insert(name.to_string(), compiled);
        Ok(())
    }

    pub fn remove_template(&mut self, name: &str) {
        self.templates.shift_remove(name);
        self.cache.remove(&name.to_string());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub(crate) fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.get(name)
    }

    pub(crate) fn test(&self, name: &str) -> Option<&Test> {
        self.tests.get(name)
    }

    pub fn globals(&self) -> &IndexMap<String, Value> {
        &self.globals
    }

    pub fn sandbox(&self) -> Option<&dyn SandboxPolicy> {
        self.sandbox.as_deref()
    }

    pub const fn undefined_behavior(&self) -> UndefinedBehavior {
        self.undefined
    }

    pub fn autoescape_for(&self, name: Option<&str>) -> bool {
        self.autoescape.for_name(name)
    }

    pub const fn optimized(&self) -> bool {
        self.optimized
    }

    pub const fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    fn preprocess(&self, source: &str, name: Option<&str>, filename: Option<&str>) -> String {
        self.extensions
            .iter()
            .fold(source.to_string(), |source, ext| ext.preprocess(source, name, filename))
    }

    /// Tokenizes `source` after extension preprocessing, without the extension stream filters.
    ///
    /// # Errors
    /// - If the lexer configuration is invalid or the source is malformed.
    pub fn lex(&self, source: &str, name: Option<&str>, filename: Option<&str>) -> JinjateResult<Vec<Token>> {
        let source = self.preprocess(source, name, filename);
        Lexer::cached(&self.lexer_cache, &self.lexer_config)
            .and_then(|lexer| lexer.tokenize(&source).collect())
            .map_err(|err| err.with_source_info(name, filename))
    }

    /// Parses `source` into a syntax tree.
    ///
    /// # Errors
    /// - If the source fails to lex or parse.
    pub fn parse(&self, source: &str, name: Option<&str>, filename: Option<&str>) -> JinjateResult<ast::Template> {
        let source = self.preprocess(source, name, filename);
        Lexer::cached(&self.lexer_cache, &self.lexer_config)
            .and_then(|lexer| {
                let tokens: TokenIter = Box::new(lexer.tokenize(&source));
                let tokens = self.extensions.iter().fold(tokens, |tokens, ext| ext.filter_stream(tokens));
                TokenStream::new(tokens, name, filename)
            })
            .and_then(|stream| Parser::new(stream, &self.tag_handlers).parse())
            .map_err(|err| err.with_source_info(name, filename))
    }

    /// Runs the whole pipeline: parse, fold constants when optimizing, generate code.
    ///
    /// # Errors
    /// - If the source fails to lex, parse or compile.
    pub fn compile(&self, source: &str, name: Option<&str>, filename: Option<&str>) -> JinjateResult<Arc<CompiledTemplate>> {
        let mut tree = self.parse(source, name, filename)?;
        if self.optimized {
            let ctx = FoldCtx {
                env: self,
                autoescape: self.autoescape_for(name),
                volatile: false,
            };
            optimizer::optimize(&mut tree.body, &ctx);
        }
        let compiled = compiler::generate(self, &tree, name, filename).map_err(|err| err.with_source_info(name, filename))?;
        tracing::debug!(
            name = name.unwrap_or("<string>"),
            instructions = compiled.instruction_count(),
            "compiled template"
        );
        Ok(Arc::new(compiled))
    }

    pub(crate) fn load(&self, name: &str) -> JinjateResult<Arc<CompiledTemplate>> {
        if let Some(compiled) = self.templates.get(name) {
            return Ok(Arc::clone(compiled));
        }
        let key = name.to_string();
        if let Some(cached) = self.cache.get(&key) {
            match &cached.uptodate {
                Some(uptodate) if self.auto_reload && !uptodate() => {
                    tracing::trace!(name, "cached template is stale, reloading");
                }
                _ => {
                    tracing::trace!(name, "template cache hit");
                    return Ok(cached.compiled);
                }
            }
        }

        let loader = self.loader.as_deref().ok_or_else(|| Error::not_found(name))?;
        tracing::debug!(name, "loading template source");
        let loaded = loader.get_source(name)?;
        let filename = loaded.filename.as_deref();
        let compiled = match self.bytecode_cache.as_deref() {
            Some(bytecode_cache) => {
                let mut bucket = bytecode_cache.get_bucket(name, filename, &loaded.source);
                if let Some(code) = bucket.code() {
                    tracing::debug!(name, "bytecode cache hit");
                    Arc::clone(code)
                } else {
                    tracing::debug!(name, "bytecode cache miss");
                    let code = self.compile(&loaded.source, Some(name), filename)?;
                    bucket.set_code(Arc::clone(&code));
                    bytecode_cache.set_bucket(&bucket);
                    code
                }
            }
            None => self.compile(&loaded.source, Some(name), filename)?,
        };
        self.cache.insert(
            key,
            CachedTemplate {
                compiled: Arc::clone(&compiled),
                uptodate: loaded.uptodate,
            },
        );
        Ok(compiled)
    }

    /// Loads the first of `names` that exists.
    pub(crate) fn load_first<S: AsRef<str>>(&self, names: &[S]) -> JinjateResult<Arc<CompiledTemplate>> {
        for name in names {
            match self.load(name.as_ref()) {
                Err(err) if err.kind().is_not_found() => {}
                other => return other,
            }
        }
        Err(Error::none_found(
            names.iter().map(|name| name.as_ref().to_string()).collect(),
        ))
    }

    /// Loads a template named by a string, or the first existing one of a list of names.
    pub(crate) fn load_value(&self, value: &Value, lookup: TemplateLookup) -> JinjateResult<Arc<CompiledTemplate>> {
        if let Value::Undefined(undefined) = value {
            return Err(undefined.to_error());
        }
        match (lookup, value) {
            (TemplateLookup::Get | TemplateLookup::Either, Value::String(name) | Value::Safe(name)) => self.load(name),
            (TemplateLookup::Select | TemplateLookup::Either, Value::Seq(items) | Value::Tuple(items)) => {
                let names: Vec<String> = items.iter().map(ToString::to_string).collect();
                self.load_first(&names)
            }
            _ => Err(Error::type_error(format!(
                "cannot load a template from a value of type '{}'",
                value.kind_name()
            ))),
        }
    }

    /// Looks up a template by name.
    ///
    /// # Errors
    /// - `TemplateNotFound` if no added template or loader knows the name.
    /// - If the template fails to compile.
    pub fn get_template(&self, name: &str) -> JinjateResult<Template<'_>> {
        self.load(name).map(|compiled| Template::new(self, compiled))
    }

    /// Returns the first of `names` that exists.
    ///
    /// # Errors
    /// - `TemplatesNotFound` listing every candidate if none exists.
    pub fn select_template<S: AsRef<str>>(&self, names: &[S]) -> JinjateResult<Template<'_>> {
        self.load_first(names).map(|compiled| Template::new(self, compiled))
    }

    /// [`Environment::get_template`] for a string, [`Environment::select_template`] for a list.
    ///
    /// # Errors
    /// - As the underlying lookup, or a type error for any other value.
    pub fn get_or_select_template(&self, names: &Value) -> JinjateResult<Template<'_>> {
        self.load_value(names, TemplateLookup::Either)
            .map(|compiled| Template::new(self, compiled))
    }

    /// Compiles a template that has no name.
    ///
    /// # Errors
    /// - If the source fails to lex, parse or compile.
    pub fn from_string(&self, source: &str) -> JinjateResult<Template<'_>> {
        self.compile(source, None, None).map(|compiled| Template::new(self, compiled))
    }

    /// Names of added templates followed by those the loader can list.
    pub fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        if let Some(loader) = &self.loader {
            names.extend(loader.list_templates());
        }
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bccache::MemoryBytecodeCache, error::ErrorKind, interface::Context, loader::MapLoader};

    fn env_with(templates: &[(&str, &str)]) -> (Environment, MapLoader) {
        let loader: MapLoader = templates.iter().copied().collect();
        let mut env = Environment::new();
        env.set_loader(loader.clone());
        (env, loader)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_select_template_reports_every_candidate() {
        let (env, _) = env_with(&[("b.html", "B")]);
        let found = env.select_template(&["a.html", "b.html"]).unwrap();
        assert_eq!(found.name(), Some("b.html"));
        let err = env.select_template(&["x.html", "y.html"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplatesNotFound);
        assert_eq!(err.templates(), ["x.html".to_string(), "y.html".to_string()]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_get_or_select_template() {
        let (env, _) = env_with(&[("a.html", "A")]);
        assert!(env.get_or_select_template(&Value::from("a.html")).is_ok());
        assert!(env.get_or_select_template(&Value::from(vec!["nope", "a.html"])).is_ok());
        let err = env.get_or_select_template(&Value::from(42)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_auto_reload_picks_up_changes() {
        let (mut env, loader) = env_with(&[("a.html", "one")]);
        let ctx = Context::new();
        assert_eq!(env.get_template("a.html").unwrap().render(&ctx).unwrap(), "one");
        loader.insert("a.html", "two");
        assert_eq!(env.get_template("a.html").unwrap().render(&ctx).unwrap(), "two");
        env.set_auto_reload(false);
        loader.insert("a.html", "three");
        assert_eq!(env.get_template("a.html").unwrap().render(&ctx).unwrap(), "two");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bytecode_cache_is_shared_and_checked() {
        let shared = MemoryBytecodeCache::new();
        let (mut first, _) = env_with(&[("a.html", "{{ 1 + 1 }}")]);
        first.set_bytecode_cache(shared.clone());
        let compiled = first.load("a.html").unwrap();
        assert_eq!(shared.len(), 1);

        let (mut second, loader) = env_with(&[("a.html", "{{ 1 + 1 }}")]);
        second.set_bytecode_cache(shared.clone());
        assert!(Arc::ptr_eq(&second.load("a.html").unwrap(), &compiled));

        loader.insert("a.html", "{{ 2 + 2 }}");
        let reloaded = second.get_template("a.html").unwrap();
        assert_eq!(reloaded.render(&Context::new()).unwrap(), "4");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_added_templates_win_and_can_be_listed() {
        let (mut env, _) = env_with(&[("a.html", "loaded"), ("b.html", "B")]);
        env.add_template("a.html", "added").unwrap();
        let ctx = Context::new();
        assert_eq!(env.get_template("a.html").unwrap().render(&ctx).unwrap(), "added");
        assert_eq!(env.list_templates(), vec!["a.html".to_string(), "b.html".to_string()]);
        env.remove_template("a.html");
        assert_eq!(env.get_template("a.html").unwrap().render(&ctx).unwrap(), "loaded");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_template_without_loader() {
        let err = Environment::new().get_template("nope.html").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
        assert_eq!(err.message(), "nope.html");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_select_autoescape() {
        let policy = select_autoescape(&["html", "xml"], &["txt"], true, false);
        assert!(policy.for_name(Some("index.HTML")));
        assert!(!policy.for_name(Some("notes.txt")));
        assert!(!policy.for_name(Some("data.json")));
        assert!(policy.for_name(None));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_invalid_lexer_configuration() {
        let mut env = Environment::new();
        env.set_newline_sequence("\t");
        assert!(env.from_string("x").is_err());
        let mut env = Environment::new();
        env.set_syntax(Syntax {
            variable_start: "{%".into(),
            ..Syntax::default()
        });
        assert!(env.from_string("x").is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_custom_syntax_and_line_statements() {
        let mut env = Environment::new();
        env.set_syntax(Syntax {
            variable_start: "${".into(),
            variable_end: "}".into(),
            line_statement_prefix: Some("#".into()),
            ..Syntax::default()
        });
        let template = env.from_string("# for i in range(2)\n${ i }\n# endfor\n").unwrap();
        assert_eq!(template.render(&Context::new()).unwrap(), "0\n1\n");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_lex_returns_tokens() {
        let tokens = Environment::new().lex("a{{ b }}", None, None).unwrap();
        let kinds: Vec<String> = tokens.iter().map(Token::describe).collect();
        assert_eq!(kinds.first().map(String::as_str), Some("template data / text"));
        assert!(tokens.len() >= 4);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_extension_replacement_and_tags() {
        struct Noop;
        impl Extension for Noop {
            fn name(&self) -> &str {
                "loopcontrols"
            }
        }
        let mut env = Environment::new();
        env.add_extension(Noop);
        let err = env.from_string("{% for i in x %}{% break %}{% endfor %}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateSyntax);
    }
}
