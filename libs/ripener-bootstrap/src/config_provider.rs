use crate::config::AppConfig;
use ripener::contracts::{ConfigurationSource, Discovery};
use ripener::ModuleDefinition;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serves the `modules` and `configurations` sections of an [`AppConfig`]
/// as the runtime's discovery and configuration collaborators.
#[derive(Debug, Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }
}

impl ConfigurationSource for AppConfigProvider {
    fn get_config(&self, pid: &str) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        Ok(self.0.configuration(pid))
    }
}

impl Discovery for AppConfigProvider {
    fn discover(&self) -> anyhow::Result<Vec<ModuleDefinition>> {
        let definitions = self.0.module_definitions();
        tracing::debug!(count = definitions.len(), "Module definitions from config");
        Ok(definitions)
    }
}
