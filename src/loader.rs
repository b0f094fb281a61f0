use std::collections::BTreeMap;

use crate::environment::Environment;
use crate::error::{Error, Result};

/// Source of template text, consulted by `Environment::get_template`.
///
/// Implementations resolve a name to template source; the environment
/// takes care of compiling and caching.
pub trait Loader {
    /// Returns the source for `name`, or `Error::TemplateNotFound`.
    fn load(&self, env: &Environment, name: &str) -> Result<String>;

    /// Names this loader can resolve, where enumerable.
    fn list(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory loader mapping names to sources.
#[derive(Debug, Default, Clone)]
pub struct MapLoader {
    templates: BTreeMap<String, String>,
}

impl MapLoader {
    pub fn new() -> MapLoader {
        MapLoader::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut MapLoader {
        self.templates.insert(name.into(), source.into());
        self
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MapLoader {
    fn from(entries: [(&str, &str); N]) -> MapLoader {
        MapLoader {
            templates: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Loader for MapLoader {
    fn load(&self, _env: &Environment, name: &str) -> Result<String> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()))
    }

    fn list(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }
}
