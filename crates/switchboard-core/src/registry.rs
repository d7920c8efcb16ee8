//! Name-based provider lookup.
//!
//! Providers are registered under their [`name`](AgentProvider::name); a few
//! older names still resolve through aliases. The first registered provider
//! is the default until another is chosen.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ProvidersConfig;
use crate::error::ProviderError;
use crate::providers::{AgentProvider, ClaudeProvider, CodexProvider, OpenCodeProvider};
use crate::server::ServerManager;

/// Legacy names and the provider they now refer to.
const ALIASES: &[(&str, &str)] = &[
    ("claude-code", "claude"),
    ("codex-cli", "codex"),
    ("open-code", "opencode"),
];

fn canonical_name(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, target)| *target)
        .unwrap_or(name)
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AgentProvider>>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    default: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with Claude, Codex and OpenCode configured from `config`.
    ///
    /// Codex headless sessions share one app-server. `default_provider`, if
    /// set, must name a registered provider.
    pub fn with_builtin_providers(config: &ProvidersConfig) -> Result<Self, ProviderError> {
        let server = Arc::new(ServerManager::codex());

        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeProvider::new(config.provider("claude"))));
        registry.register(Arc::new(CodexProvider::new(config.provider("codex"), server)));
        registry.register(Arc::new(OpenCodeProvider::new(config.provider("opencode"))));

        if let Some(name) = &config.default_provider {
            registry.set_default(name)?;
        }
        Ok(registry)
    }

    /// Add a provider, replacing any with the same name.
    pub fn register(&mut self, provider: Arc<dyn AgentProvider>) {
        let name = provider.name().to_string();
        log::debug!("Registering provider {}", name);
        if self.providers.insert(name.clone(), provider).is_none() {
            self.order.push(name.clone());
        }
        if self.default.is_none() {
            self.default = Some(name);
        }
    }

    /// Look up by name or alias.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentProvider>> {
        self.providers.get(canonical_name(name)).cloned()
    }

    /// Look up a provider that is registered and installed.
    pub fn get_or_throw(&self, name: &str) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        let provider = self
            .get(name)
            .ok_or_else(|| ProviderError::ProviderNotRegistered {
                name: name.to_string(),
                registered: self.order.clone(),
            })?;

        if !provider.is_available() {
            return Err(ProviderError::ProviderUnavailable {
                name: provider.name().to_string(),
                install_instructions: provider.install_instructions().to_string(),
            });
        }
        Ok(provider)
    }

    /// The default provider, installed or not. Pass its name to
    /// [`get_or_throw`](Self::get_or_throw) to check availability.
    pub fn get_default(&self) -> Option<Arc<dyn AgentProvider>> {
        self.default.as_deref().and_then(|name| self.get(name))
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), ProviderError> {
        let canonical = canonical_name(name);
        if !self.providers.contains_key(canonical) {
            return Err(ProviderError::ProviderNotRegistered {
                name: name.to_string(),
                registered: self.order.clone(),
            });
        }
        self.default = Some(canonical.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Providers whose binaries can be found.
    pub fn available(&self) -> Vec<Arc<dyn AgentProvider>> {
        self.order
            .iter()
            .filter_map(|name| self.providers.get(name))
            .filter(|provider| provider.is_available())
            .cloned()
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
