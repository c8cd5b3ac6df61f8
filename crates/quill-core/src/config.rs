//! Model profiles and tool protocol settings.
//!
//! Loaded from a TOML (or JSON, by extension) file at startup.  Every field
//! has a default so the server runs without a settings file: one `default`
//! ChatML profile pointing at a local llama.cpp server and the built-in
//! tool protocol.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::template::{TemplateRegistry, TemplateSet, ToolProtocolConfig, default_protocols};
use crate::tool_prompt::ToolPromptGenerator;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8080";

/// Which tool protocol a model uses, and in which language its instructions
/// are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPromptSettings {
    #[serde(default)]
    pub index: usize,
    #[serde(default = "default_lang")]
    pub lang: String,
}

impl Default for ToolPromptSettings {
    fn default() -> Self {
        Self {
            index: 0,
            lang: default_lang(),
        }
    }
}

fn default_lang() -> String {
    "en".to_owned()
}

/// Where a model's generation engine lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            api_key: None,
        }
    }
}

fn default_engine_url() -> String {
    DEFAULT_ENGINE_URL.to_owned()
}

/// One servable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Template family key.
    #[serde(default = "default_template")]
    pub template: String,
    /// Default system text, used when a conversation brings none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Model-level stop sequences.
    #[serde(default)]
    pub anti_prompts: Vec<String>,
    #[serde(default)]
    pub tool_prompt: ToolPromptSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_template() -> String {
    "chatml".to_owned()
}

impl ModelProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            template: default_template(),
            system_prompt: None,
            anti_prompts: Vec::new(),
            tool_prompt: ToolPromptSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_models")]
    pub models: Vec<ModelProfile>,
    /// Extra template families, added to (or overriding) the built-ins.
    #[serde(default)]
    pub templates: HashMap<String, TemplateSet>,
    #[serde(default = "default_protocols")]
    pub tool_protocols: Vec<ToolProtocolConfig>,
}

fn default_models() -> Vec<ModelProfile> {
    vec![ModelProfile::new("default")]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            models: default_models(),
            templates: HashMap::new(),
            tool_protocols: default_protocols(),
        }
    }
}

impl Settings {
    /// Read settings from `path`: JSON when the extension is `.json`, TOML
    /// otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed: Result<Settings, String> = if is_json {
            serde_json::from_str(&raw).map_err(|e| e.to_string())
        } else {
            toml::from_str(&raw).map_err(|e| e.to_string())
        };
        let settings = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Built-in families plus the custom ones from this file.
    pub fn template_registry(&self) -> TemplateRegistry {
        let mut registry = TemplateRegistry::with_builtins();
        for (name, set) in &self.templates {
            registry.register_set(name.clone(), set.clone());
        }
        registry
    }

    pub fn tool_generator(&self) -> Result<ToolPromptGenerator, ConfigError> {
        ToolPromptGenerator::new(self.tool_protocols.clone())
    }

    /// Surface every fatal configuration error before serving: unknown
    /// template families, protocol indices out of range, missing language
    /// entries and broken extraction patterns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        let templates = self.template_registry();
        let generator = self.tool_generator()?;
        for profile in &self.models {
            templates.resolve(&profile.template)?;
            generator
                .protocol(profile.tool_prompt.index)?
                .check_language(&profile.tool_prompt.lang)?;
        }
        Ok(())
    }
}
