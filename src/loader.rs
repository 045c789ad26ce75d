use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Template text returned by a [`Loader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub text: String,
    /// Full name of the template; relative names are resolved against it.
    pub path: String,
    /// May the environment keep the compiled template?
    pub cacheable: bool,
}

/// Where template sources come from.
#[async_trait(?Send)]
pub trait Loader: Send + Sync {
    /// `Ok(None)` means "not here"; the next loader is asked.
    async fn get_source(&self, name: &str) -> Result<Option<Source>>;

    fn is_relative(&self, name: &str) -> bool {
        name.starts_with("./") || name.starts_with("../")
    }

    /// Resolve `name` against the directory of `parent`.
    fn resolve(&self, parent: &str, name: &str) -> String {
        let mut parts: Vec<&str> = parent.split('/').collect();
        parts.pop();
        for part in name.split('/') {
            match part {
                "." | "" => {}
                ".." => {
                    parts.pop();
                }
                part => parts.push(part),
            }
        }
        parts.retain(|p| !p.is_empty());
        parts.join("/")
    }
}

/// Templates held in memory, keyed by name.
#[derive(Debug)]
pub struct MemoryLoader {
    templates: DashMap<String, String>,
    cacheable: bool,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            cacheable: true,
        }
    }

    /// Builder form of [`MemoryLoader::insert`].
    pub fn with_template(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    pub fn insert(&self, name: impl Into<String>, text: impl Into<String>) {
        self.templates.insert(name.into(), text.into());
    }

    /// Mark sources as non-cacheable so edits are picked up on the next load.
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Loader for MemoryLoader {
    async fn get_source(&self, name: &str) -> Result<Option<Source>> {
        Ok(self.templates.get(name).map(|text| Source {
            text: text.value().clone(),
            path: name.to_string(),
            cacheable: self.cacheable,
        }))
    }
}
