//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use quill_core::config::ModelProfile;
use quill_core::engine::{GenerationEngine, LlamaServerEngine};
use quill_core::{ChatService, ConfigError, ModelContext, Settings, ToolOrchestrator, ToolRegistry};
use tracing::info;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Process-wide tool catalog shared by every model.
    pub registry: Arc<ToolRegistry>,
    /// One chat service per configured model, in settings order.
    services: Vec<ChatService>,
}

impl AppState {
    /// Build one service per profile, each talking to its own
    /// llama.cpp-compatible server.
    pub fn new(config: Config, settings: &Settings) -> Result<Self, ConfigError> {
        Self::with_engines(config, settings, Arc::new(ToolRegistry::new()), |profile| {
            Arc::new(LlamaServerEngine::new(
                profile.engine.base_url.clone(),
                profile.engine.api_key.clone(),
            ))
        })
    }

    /// Like [`new`](Self::new), with the engine for each profile supplied by
    /// `engine_for`.
    pub fn with_engines<F>(
        config: Config,
        settings: &Settings,
        registry: Arc<ToolRegistry>,
        mut engine_for: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnMut(&ModelProfile) -> Arc<dyn GenerationEngine>,
    {
        settings.validate()?;
        let templates = settings.template_registry();
        let generator = Arc::new(settings.tool_generator()?);
        let orchestrator = ToolOrchestrator::new(Arc::clone(&registry), config.tool_timeout);

        let services = settings
            .models
            .iter()
            .map(|profile| {
                let engine = engine_for(profile);
                let context = ModelContext::from_profile(profile.clone(), &templates, engine)?;
                info!(
                    model = %profile.name,
                    template = %profile.template,
                    engine = %profile.engine.base_url,
                    "model ready"
                );
                ChatService::new(context, Arc::clone(&generator), orchestrator.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;
        if services.is_empty() {
            return Err(ConfigError::NoModels);
        }

        Ok(Self {
            config: Arc::new(config),
            registry,
            services,
        })
    }

    /// The service whose profile is called `model`, else the first one.
    pub fn service(&self, model: &str) -> Option<&ChatService> {
        self.services
            .iter()
            .find(|service| service.profile().name == model)
            .or_else(|| self.services.first())
    }

    pub fn services(&self) -> &[ChatService] {
        &self.services
    }
}
