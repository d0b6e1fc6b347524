//! Registry of engine factories keyed by language.

use std::sync::Arc;

use dashmap::DashMap;

use kernelhive_protocols::{EngineError, EngineFactory};

/// Engine factories available to the manager.
pub struct EngineRegistry {
    factories: DashMap<String, Arc<dyn EngineFactory>>,
}

impl EngineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Register a factory under its language.
    ///
    /// Returns an error if the language is already served.
    pub fn register(&self, factory: Arc<dyn EngineFactory>) -> Result<(), EngineError> {
        let language = factory.language().to_string();

        if self.factories.contains_key(&language) {
            return Err(EngineError::AlreadyRegistered(language));
        }

        self.factories.insert(language, factory);
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(self, factory: Arc<dyn EngineFactory>) -> Result<Self, EngineError> {
        self.register(factory)?;
        Ok(self)
    }

    /// Remove the factory for a language.
    pub fn unregister(&self, language: &str) -> Result<(), EngineError> {
        self.factories
            .remove(language)
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))?;
        Ok(())
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn EngineFactory>> {
        self.factories.get(language).map(|f| f.clone())
    }

    pub fn contains(&self, language: &str) -> bool {
        self.factories.contains_key(language)
    }

    /// Registered languages, sorted.
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        languages.sort();
        languages
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
