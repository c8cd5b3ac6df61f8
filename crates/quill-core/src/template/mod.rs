//! Template registry: per-family turn markers and tool protocol settings.
//!
//! A model family is selected by name.  Each name maps to a factory that
//! builds its [`TemplateSet`]; the registry is assembled once at startup and
//! only read afterwards.

mod protocol;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use protocol::{ToolProtocolConfig, default_protocols};

/// Constant turn markers for one model family.
///
/// An empty `system` marker means the family has no system turn; system text
/// is then carried into the next user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSet {
    pub user: String,
    pub assistant: String,
    #[serde(default)]
    pub system: String,
    pub end: String,
}

impl TemplateSet {
    pub fn chatml() -> Self {
        Self {
            user: "<|im_start|>user".into(),
            assistant: "<|im_start|>assistant".into(),
            system: "<|im_start|>system".into(),
            end: "<|im_end|>".into(),
        }
    }

    pub fn llama3() -> Self {
        Self {
            user: "<|start_header_id|>user<|end_header_id|>\n".into(),
            assistant: "<|start_header_id|>assistant<|end_header_id|>\n".into(),
            system: "<|start_header_id|>system<|end_header_id|>\n".into(),
            end: "<|eot_id|>".into(),
        }
    }

    pub fn zephyr() -> Self {
        Self {
            user: "<|user|>".into(),
            assistant: "<|assistant|>".into(),
            system: "<|system|>".into(),
            end: "<|end|>".into(),
        }
    }

    pub fn gemma() -> Self {
        Self {
            user: "<start_of_turn>user".into(),
            assistant: "<start_of_turn>model".into(),
            system: String::new(),
            end: "<end_of_turn>".into(),
        }
    }

    /// Whether this family has a dedicated system turn.
    pub fn has_system_turn(&self) -> bool {
        !self.system.trim().is_empty()
    }
}

type TemplateFactory = Box<dyn Fn() -> TemplateSet + Send + Sync>;

/// Family name → [`TemplateSet`] factory.
pub struct TemplateRegistry {
    factories: HashMap<String, TemplateFactory>,
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TemplateRegistry").field("families", &names).finish()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TemplateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in families: `chatml`, `llama3`, `zephyr`
    /// and `gemma`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("chatml", TemplateSet::chatml);
        registry.register("llama3", TemplateSet::llama3);
        registry.register("zephyr", TemplateSet::zephyr);
        registry.register("gemma", TemplateSet::gemma);
        registry
    }

    /// Register (or replace) a family factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> TemplateSet + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    /// Register a fixed template set under `name`.
    pub fn register_set(&mut self, name: impl Into<String>, set: TemplateSet) -> &mut Self {
        self.register(name, move || set.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the template set for `name`.
    pub fn resolve(&self, name: &str) -> Result<TemplateSet, ConfigError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownTemplate {
                name: name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve() {
        let registry = TemplateRegistry::with_builtins();
        assert_eq!(registry.resolve("chatml").unwrap(), TemplateSet::chatml());
        assert_eq!(registry.resolve("llama3").unwrap().end, "<|eot_id|>");
        assert!(!registry.resolve("gemma").unwrap().has_system_turn());
        assert!(registry.resolve("zephyr").unwrap().has_system_turn());
    }

    #[test]
    fn unknown_family_is_a_config_error() {
        let registry = TemplateRegistry::with_builtins();
        let err = registry.resolve("phi").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTemplate { ref name } if name == "phi"));
    }

    #[test]
    fn custom_set_overrides_builtin() {
        let mut registry = TemplateRegistry::with_builtins();
        registry.register_set(
            "chatml",
            TemplateSet {
                user: "U".into(),
                assistant: "A".into(),
                system: "S".into(),
                end: "E".into(),
            },
        );
        assert_eq!(registry.resolve("chatml").unwrap().user, "U");
    }
}
