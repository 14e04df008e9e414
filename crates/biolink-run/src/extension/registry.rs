use super::builtin::{Countdown, Template};
use super::Extension;
use crate::config::NO_EXTENSION;
use std::collections::BTreeMap;
use thiserror::Error;

pub type ExtensionFactory = fn() -> Box<dyn Extension>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown extension '{name}' (available: {available})")]
pub struct ExtensionSelectionError {
    pub name: String,
    pub available: String,
}

/// Name to factory table, filled once at startup.
#[derive(Clone)]
pub struct ExtensionRegistry {
    factories: BTreeMap<&'static str, ExtensionFactory>,
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the extensions that ship with BioLink.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("countdown", || Box::new(Countdown));
        registry.register("template", || Box::new(Template));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ExtensionFactory) {
        self.factories.insert(name, factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Resolve a configured name; [`NO_EXTENSION`] or an empty name selects
    /// no extension.
    pub fn select(&self, name: &str) -> Result<Option<&'static str>, ExtensionSelectionError> {
        let name = name.trim();
        if name.is_empty() || name == NO_EXTENSION {
            return Ok(None);
        }
        self.factories
            .get_key_value(name)
            .map(|(key, _)| Some(*key))
            .ok_or_else(|| self.unknown(name))
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Extension>, ExtensionSelectionError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| self.unknown(name))
    }

    fn unknown(&self, name: &str) -> ExtensionSelectionError {
        ExtensionSelectionError {
            name: name.to_string(),
            available: self.names().join(", "),
        }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_listed_sorted() {
        assert_eq!(ExtensionRegistry::builtin().names(), vec!["countdown", "template"]);
    }

    #[test]
    fn none_selects_no_extension() {
        let registry = ExtensionRegistry::builtin();
        assert_eq!(registry.select("None").unwrap(), None);
        assert_eq!(registry.select("").unwrap(), None);
        assert_eq!(registry.select(" template ").unwrap(), Some("template"));
    }

    #[test]
    fn unknown_name_names_the_alternatives() {
        let err = ExtensionRegistry::builtin().select("stroop").unwrap_err();
        assert_eq!(err.name, "stroop");
        assert!(err.to_string().contains("countdown, template"));
        assert!(ExtensionRegistry::empty().create("template").is_err());
    }
}
