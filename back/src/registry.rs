//! Lookup of engine backends by name.

use fxhash::FxHashMap;
use log::debug;
use thiserror::Error;

use crate::engine::Engine;
use crate::script::ScriptEngine;

/// Name the built-in script engine is registered under.
pub const SCRIPT_BACKEND: &str = "libtlmu-script.so";

pub type EngineFactory = Box<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("failed to load tlmu {0}")]
    NotFound(String),
}

/// Set of engine backends a core can be loaded from.
#[derive(Default)]
pub struct BackendRegistry {
    factories: FxHashMap<String, EngineFactory>,
}
impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the built-in script engine.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(SCRIPT_BACKEND, || Box::new(ScriptEngine::new()));
        reg
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
        where F: Fn() -> Box<dyn Engine> + Send + Sync + 'static
    {
        let name = name.into();
        debug!(target: "CORE", "registered backend {name}");
        self.factories.insert(name, Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a fresh engine from some backend.
    pub fn load(&self, name: &str) -> Result<Box<dyn Engine>, LoadError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(LoadError::NotFound(name.to_owned())),
        }
    }
}
