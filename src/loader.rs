//! Where template source comes from.
//!
//! A [`Loader`] maps a template name to its source, an optional origin filename and an optional
//! up-to-date check the environment consults when `auto_reload` is on.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{Error, JinjateResult};

/// Returns `true` while previously loaded source is still current.
pub type UpToDate = Arc<dyn Fn() -> bool + Send + Sync>;

/// The result of a successful lookup.
#[derive(Clone)]
pub struct TemplateSource {
    pub source: String,
    pub filename: Option<String>,
    pub uptodate: Option<UpToDate>,
}

impl TemplateSource {
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            filename: None,
            uptodate: None,
        }
    }

    #[must_use]
    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_uptodate<F: Fn() -> bool + Send + Sync + 'static>(mut self, check: F) -> Self {
        self.uptodate = Some(Arc::new(check));
        self
    }
}

impl fmt::Debug for TemplateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateSource")
            .field("source", &self.source)
            .field("filename", &self.filename)
            .field("uptodate", &self.uptodate.is_some())
            .finish()
    }
}

pub trait Loader: Send + Sync {
    /// Looks up the source of `name`.
    ///
    /// # Errors
    /// - `TemplateNotFound` if this loader does not know the template.
    fn get_source(&self, name: &str) -> JinjateResult<TemplateSource>;

    /// Every name this loader can serve, if it can enumerate them.
    fn list_templates(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Serves templates from an in-memory map that can be updated while in use.
///
/// Sources handed out are reported stale once the map holds different text for the name.
#[derive(Debug, Clone, Default)]
pub struct MapLoader {
    sources: Arc<Mutex<IndexMap<String, String>>>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a template.
    pub fn insert<N: Into<String>, S: Into<String>>(&self, name: N, source: S) {
        self.sources.lock().insert(name.into(), source.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.sources.lock().shift_remove(name)
    }
}

impl<N: Into<String>, S: Into<String>> FromIterator<(N, S)> for MapLoader {
    fn from_iter<I: IntoIterator<Item = (N, S)>>(iter: I) -> Self {
        let sources = iter.into_iter().map(|(name, source)| (name.into(), source.into())).collect();
        Self {
            sources: Arc::new(Mutex::new(sources)),
        }
    }
}

impl Loader for MapLoader {
    fn get_source(&self, name: &str) -> JinjateResult<TemplateSource> {
        let source = self
            .sources
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(name))?;
        let sources = Arc::clone(&self.sources);
        let key = name.to_string();
        let loaded = source.clone();
        Ok(TemplateSource::new(source)
            .with_uptodate(move || sources.lock().get(&key).is_some_and(|current| *current == loaded)))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

type LoadFn = dyn Fn(&str) -> Option<TemplateSource> + Send + Sync;

/// Delegates lookups to a closure returning `None` for unknown names.
pub struct FunctionLoader {
    load: Box<LoadFn>,
}

impl FunctionLoader {
    pub fn new<F>(load: F) -> Self
    where
        F: Fn(&str) -> Option<TemplateSource> + Send + Sync + 'static,
    {
        Self { load: Box::new(load) }
    }
}

impl fmt::Debug for FunctionLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionLoader")
    }
}

impl Loader for FunctionLoader {
    fn get_source(&self, name: &str) -> JinjateResult<TemplateSource> {
        (self.load)(name).ok_or_else(|| Error::not_found(name))
    }
}

/// Tries a list of loaders in order and uses the first that finds the template.
#[derive(Default)]
pub struct ChoiceLoader {
    loaders: Vec<Box<dyn Loader>>,
}

impl ChoiceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_loader<L: Loader + 'static>(mut self, loader: L) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }
}

impl Loader for ChoiceLoader {
    fn get_source(&self, name: &str) -> JinjateResult<TemplateSource> {
        for loader in &self.loaders {
            match loader.get_source(name) {
                Err(err) if err.kind().is_not_found() => {}
                other => return other,
            }
        }
        Err(Error::not_found(name))
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaders.iter().flat_map(|loader| loader.list_templates()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Dispatches on the part of the name before the delimiter, e.g. `app/index.html`.
pub struct PrefixLoader {
    loaders: IndexMap<String, Box<dyn Loader>>,
    delimiter: char,
}

impl Default for PrefixLoader {
    fn default() -> Self {
        Self {
            loaders: IndexMap::new(),
            delimiter: '/',
        }
    }
}

impl PrefixLoader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    #[must_use]
    pub fn with_loader<P: Into<String>, L: Loader + 'static>(mut self, prefix: P, loader: L) -> Self {
        self.loaders.insert(prefix.into(), Box::new(loader));
        self
    }
}

impl Loader for PrefixLoader {
    fn get_source(&self, name: &str) -> JinjateResult<TemplateSource> {
        let (prefix, rest) = name
            .split_once(self.delimiter)
            .ok_or_else(|| Error::not_found(name))?;
        let loader = self.loaders.get(prefix).ok_or_else(|| Error::not_found(name))?;
        // Report the full name rather than the stripped one.
        loader
            .get_source(rest)
            .map_err(|err| if err.kind().is_not_found() { Error::not_found(name) } else { err })
    }

    fn list_templates(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (prefix, loader) in &self.loaders {
            names.extend(
                loader
                    .list_templates()
                    .into_iter()
                    .map(|name| format!("{}{}{}", prefix, self.delimiter, name)),
            );
        }
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    #[ntest::timeout(100)]
    fn test_map_loader_tracks_changes() {
        let loader: MapLoader = [("a.html", "one")].into_iter().collect();
        let loaded = loader.get_source("a.html").unwrap();
        assert_eq!(loaded.source, "one");
        let uptodate = loaded.uptodate.unwrap();
        assert!(uptodate());
        loader.insert("a.html", "two");
        assert!(!uptodate());
        assert_eq!(
            loader.get_source("missing").unwrap_err().kind(),
            ErrorKind::TemplateNotFound
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_choice_loader_falls_through() {
        let first: MapLoader = [("a", "from first")].into_iter().collect();
        let second: MapLoader = [("a", "from second"), ("b", "only second")].into_iter().collect();
        let loader = ChoiceLoader::new().with_loader(first).with_loader(second);
        assert_eq!(loader.get_source("a").unwrap().source, "from first");
        assert_eq!(loader.get_source("b").unwrap().source, "only second");
        assert!(loader.get_source("c").is_err());
        assert_eq!(loader.list_templates(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_function_and_prefix_loaders() {
        let func = FunctionLoader::new(|name| {
            (name == "hello").then(|| TemplateSource::new("Hi").with_filename("virtual/hello"))
        });
        let loader = PrefixLoader::new().with_loader("app", func);
        let loaded = loader.get_source("app/hello").unwrap();
        assert_eq!(loaded.source, "Hi");
        assert_eq!(loaded.filename.as_deref(), Some("virtual/hello"));
        let err = loader.get_source("app/missing").unwrap_err();
        assert_eq!(err.templates(), ["app/missing".to_string()]);
        assert!(loader.get_source("nope").is_err());
    }
}
