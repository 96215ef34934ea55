//! Reusing compiled templates across environments.
//!
//! The environment asks the cache for a [`Bucket`] keyed by template name and filename. A bucket
//! only hands out code whose checksum matches the current source, so edited templates are always
//! recompiled.

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::instructions::CompiledTemplate;

fn digest<T: Hash + ?Sized>(value: &T) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// One template's slot in a bytecode cache.
#[derive(Debug, Clone)]
pub struct Bucket {
    key: String,
    checksum: String,
    code: Option<Arc<CompiledTemplate>>,
}

impl Bucket {
    pub const fn new(key: String, checksum: String) -> Self {
        Self {
            key,
            checksum,
            code: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub const fn code(&self) -> Option<&Arc<CompiledTemplate>> {
        self.code.as_ref()
    }

    pub fn reset(&mut self) {
        self.code = None;
    }

    /// Fills the bucket from storage, ignoring code compiled from different source.
    pub fn load_code(&mut self, checksum: &str, code: Arc<CompiledTemplate>) {
        if checksum == self.checksum {
            self.code = Some(code);
        } else {
            self.reset();
        }
    }

    pub fn set_code(&mut self, code: Arc<CompiledTemplate>) {
        self.code = Some(code);
    }
}

pub trait BytecodeCache: Send + Sync {
    /// Fills `bucket` from storage, leaving it empty on a miss.
    fn load_bytecode(&self, bucket: &mut Bucket);

    /// Stores the code in `bucket`.
    fn dump_bytecode(&self, bucket: &Bucket);

    fn clear(&self) {}

    fn cache_key(&self, name: &str, filename: Option<&str>) -> String {
        match filename {
            Some(filename) => digest(&(name, "|", filename)),
            None => digest(name),
        }
    }

    /// Two independent digests followed by the source's byte length.
    fn checksum(&self, source: &str) -> String {
        format!("{}{}-{:x}", digest(source), digest(&(source.len(), source)), source.len())
    }

    fn get_bucket(&self, name: &str, filename: Option<&str>, source: &str) -> Bucket {
        let mut bucket = Bucket::new(self.cache_key(name, filename), self.checksum(source));
        self.load_bytecode(&mut bucket);
        bucket
    }

    fn set_bucket(&self, bucket: &Bucket) {
        self.dump_bytecode(bucket);
    }
}

/// Keeps compiled templates in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBytecodeCache {
    entries: Arc<Mutex<HashMap<String, (String, Arc<CompiledTemplate>)>>>,
}

impl MemoryBytecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BytecodeCache for MemoryBytecodeCache {
    fn load_bytecode(&self, bucket: &mut Bucket) {
        let entry = self.entries.lock().get(bucket.key()).cloned();
        match entry {
            Some((checksum, code)) => bucket.load_code(&checksum, code),
            None => bucket.reset(),
        }
    }

    fn dump_bytecode(&self, bucket: &Bucket) {
        if let Some(code) = bucket.code() {
            self.entries
                .lock()
                .insert(bucket.key().to_string(), (bucket.checksum().to_string(), Arc::clone(code)));
        }
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_checksum_mismatch_empties_bucket() {
        let cache = MemoryBytecodeCache::new();
        let mut bucket = cache.get_bucket("a.html", None, "one");
        assert!(bucket.code().is_none());
        bucket.set_code(Arc::new(CompiledTemplate::default()));
        cache.set_bucket(&bucket);
        assert!(cache.get_bucket("a.html", None, "one").code().is_some());
        assert!(cache.get_bucket("a.html", None, "two").code().is_none());
        assert!(cache.get_bucket("b.html", None, "one").code().is_none());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_checksum_covers_source_length() {
        let cache = MemoryBytecodeCache::new();
        let checksum = cache.checksum("one");
        assert!(checksum.ends_with("-3"));
        assert_ne!(checksum, cache.checksum("one "));
        assert_eq!(checksum, cache.checksum("one"));

        let mut bucket = Bucket::new("k".to_string(), checksum.clone());
        let resized = format!("{}-4", checksum.trim_end_matches("-3"));
        bucket.load_code(&resized, Arc::new(CompiledTemplate::default()));
        assert!(bucket.code().is_none());
        bucket.load_code(&checksum, Arc::new(CompiledTemplate::default()));
        assert!(bucket.code().is_some());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_keys_depend_on_filename() {
        let cache = MemoryBytecodeCache::new();
        assert_eq!(cache.cache_key("a", None), cache.cache_key("a", None));
        assert_ne!(cache.cache_key("a", Some("x/a")), cache.cache_key("a", None));
        cache.clear();
        assert!(cache.is_empty());
    }
}
