use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::info;

use photo3d_contracts::providers::{ProviderCapabilities, ProviderKind};
use photo3d_contracts::{GenerationError, GenerationResult};

use crate::config::ProviderCredentials;
use crate::providers::{
    Hitem3dAdapter, HunyuanAdapter, MeshyAdapter, ProviderAdapter, RodinAdapter, TripoAdapter,
};

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSummary {
    pub provider: ProviderKind,
    pub configured: bool,
    pub missing: Vec<&'static str>,
    pub capabilities: ProviderCapabilities,
}

/// Resolves provider ids to adapters, building each one at most once.
///
/// Construct one registry at startup and share it by reference; adapters
/// are cached per registry instance.
pub struct ProviderRegistry {
    credentials: ProviderCredentials,
    adapters: RwLock<HashMap<ProviderKind, Arc<dyn ProviderAdapter>>>,
}

impl ProviderRegistry {
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self {
            credentials,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_valid_provider(raw: &str) -> bool {
        ProviderKind::is_valid(raw)
    }

    pub fn credentials(&self) -> &ProviderCredentials {
        &self.credentials
    }

    /// Adapter for a provider id. Unknown ids and missing credentials fail
    /// with `Configuration` before any network traffic.
    pub fn get_provider(&self, raw: &str) -> GenerationResult<Arc<dyn ProviderAdapter>> {
        let kind = raw.parse::<ProviderKind>()?;
        self.get(kind)
    }

    pub fn get(&self, kind: ProviderKind) -> GenerationResult<Arc<dyn ProviderAdapter>> {
        if let Some(adapter) = self.read_cached(kind)? {
            return Ok(adapter);
        }
        let mut adapters = self
            .adapters
            .write()
            .map_err(|_| GenerationError::Configuration("provider cache lock poisoned".to_string()))?;
        // Another caller may have built it while we waited for the lock.
        if let Some(adapter) = adapters.get(&kind) {
            return Ok(Arc::clone(adapter));
        }
        self.credentials.ensure_configured(kind)?;
        let adapter = self.build(kind)?;
        info!(provider = %kind, "provider adapter initialised");
        adapters.insert(kind, Arc::clone(&adapter));
        Ok(adapter)
    }

    fn read_cached(&self, kind: ProviderKind) -> GenerationResult<Option<Arc<dyn ProviderAdapter>>> {
        let adapters = self
            .adapters
            .read()
            .map_err(|_| GenerationError::Configuration("provider cache lock poisoned".to_string()))?;
        Ok(adapters.get(&kind).map(Arc::clone))
    }

    fn build(&self, kind: ProviderKind) -> GenerationResult<Arc<dyn ProviderAdapter>> {
        let adapter: Arc<dyn ProviderAdapter> = match kind {
            ProviderKind::Meshy => Arc::new(MeshyAdapter::new(&self.credentials.meshy)?),
            ProviderKind::Tripo => Arc::new(TripoAdapter::new(&self.credentials.tripo)?),
            ProviderKind::Hunyuan => Arc::new(HunyuanAdapter::new(&self.credentials.hunyuan)?),
            ProviderKind::Rodin => Arc::new(RodinAdapter::new(&self.credentials.rodin)?),
            ProviderKind::Hitem3d => Arc::new(Hitem3dAdapter::new(&self.credentials.hitem3d)?),
        };
        Ok(adapter)
    }

    /// Install a ready-made adapter, replacing any cached one.
    pub fn register(&self, adapter: Arc<dyn ProviderAdapter>) -> GenerationResult<()> {
        let mut adapters = self
            .adapters
            .write()
            .map_err(|_| GenerationError::Configuration("provider cache lock poisoned".to_string()))?;
        adapters.insert(adapter.kind(), adapter);
        Ok(())
    }

    pub fn clear_cache(&self) {
        if let Ok(mut adapters) = self.adapters.write() {
            adapters.clear();
        }
    }

    pub fn list(&self) -> Vec<ProviderSummary> {
        ProviderKind::ALL
            .into_iter()
            .map(|provider| {
                let missing = self.credentials.missing_for(provider);
                ProviderSummary {
                    provider,
                    configured: missing.is_empty(),
                    missing,
                    capabilities: static_capabilities(provider),
                }
            })
            .collect()
    }
}

pub fn static_capabilities(kind: ProviderKind) -> ProviderCapabilities {
    match kind {
        ProviderKind::Meshy => MeshyAdapter::static_capabilities(),
        ProviderKind::Tripo => TripoAdapter::static_capabilities(),
        ProviderKind::Hunyuan => HunyuanAdapter::static_capabilities(),
        ProviderKind::Rodin => RodinAdapter::static_capabilities(),
        ProviderKind::Hitem3d => Hitem3dAdapter::static_capabilities(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use photo3d_contracts::providers::ProviderKind;
    use photo3d_contracts::GenerationError;

    use super::ProviderRegistry;
    use crate::config::{ApiKeyCredential, ProviderCredentials};

    fn meshy_only() -> ProviderCredentials {
        ProviderCredentials {
            meshy: ApiKeyCredential {
                api_key: Some("test-key".to_string()),
                api_base: Some("http://127.0.0.1:9".to_string()),
            },
            ..ProviderCredentials::default()
        }
    }

    #[test]
    fn repeated_lookups_share_one_instance() -> anyhow::Result<()> {
        let registry = ProviderRegistry::new(meshy_only());
        let first = registry.get_provider("meshy")?;
        let second = registry.get_provider("MESHY")?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), ProviderKind::Meshy);
        Ok(())
    }

    #[test]
    fn unknown_provider_is_a_configuration_error() {
        let registry = ProviderRegistry::new(meshy_only());
        assert!(matches!(
            registry.get_provider("unknown"),
            Err(GenerationError::Configuration(_))
        ));
        assert!(!ProviderRegistry::is_valid_provider("unknown"));
        assert!(ProviderRegistry::is_valid_provider("rodin"));
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let registry = ProviderRegistry::new(meshy_only());
        let err = registry.get_provider("hunyuan").err();
        match err {
            Some(GenerationError::Configuration(message)) => {
                assert!(message.contains("HUNYUAN_SECRET_ID"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn clearing_the_cache_builds_a_new_instance() -> anyhow::Result<()> {
        let registry = ProviderRegistry::new(meshy_only());
        let first = registry.get_provider("meshy")?;
        registry.clear_cache();
        let second = registry.get_provider("meshy")?;
        assert!(!Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn concurrent_first_access_yields_one_instance() -> anyhow::Result<()> {
        let registry = ProviderRegistry::new(meshy_only());
        let adapters = thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| scope.spawn(|| registry.get_provider("meshy")))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| anyhow::anyhow!("lookup thread panicked")))
                .collect::<anyhow::Result<Vec<_>>>()
        })?;
        let first = adapters[0].clone()?;
        for adapter in adapters {
            assert!(Arc::ptr_eq(&first, &adapter?));
        }
        Ok(())
    }

    #[test]
    fn list_reports_configuration_state() {
        let registry = ProviderRegistry::new(meshy_only());
        let summaries = registry.list();
        assert_eq!(summaries.len(), 5);
        let meshy = summaries.iter().find(|row| row.provider == ProviderKind::Meshy);
        assert!(meshy.map(|row| row.configured).unwrap_or(false));
        let rodin = summaries.iter().find(|row| row.provider == ProviderKind::Rodin);
        assert_eq!(rodin.map(|row| row.missing.clone()), Some(vec!["RODIN_API_KEY"]));
    }
}
