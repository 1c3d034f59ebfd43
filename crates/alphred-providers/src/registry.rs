// crates/alphred-providers/src/registry.rs
// ============================================================================
// Module: Alphred Provider Registry
// Description: Name-keyed provider resolver.
// Purpose: Map node provider names onto registered implementations.
// Dependencies: alphred-core
// ============================================================================

//! ## Overview
//! The registry is a plain name map; unknown names fail closed with an
//! [`ProviderError::UnknownProvider`] error the executor records as a phase
//! failure. Registration happens at process assembly time.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use alphred_core::AgentProvider;
use alphred_core::ProviderError;
use alphred_core::ProviderResolver;

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Name-keyed provider registry.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Registered providers by name.
    providers: BTreeMap<String, Arc<dyn AgentProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn AgentProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Returns the registered provider names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

impl ProviderResolver for ProviderRegistry {
    fn resolve(&self, provider: &str) -> Result<Arc<dyn AgentProvider>, ProviderError> {
        self.providers
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(provider.to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use std::sync::Arc;

    use alphred_core::ProviderError;
    use alphred_core::ProviderResolver;

    use super::ProviderRegistry;
    use crate::scripted::ScriptedProvider;

    /// Resolves registered names and rejects unknown ones.
    #[test]
    fn resolve_known_and_unknown() {
        let mut registry = ProviderRegistry::new();
        registry.register("scripted", Arc::new(ScriptedProvider::new()));
        assert!(registry.resolve("scripted").is_ok());
        assert!(matches!(
            registry.resolve("missing"),
            Err(ProviderError::UnknownProvider(name)) if name == "missing"
        ));
    }
}
