//! Descriptor decoding with a per-generation cache

use crate::client::DescriptorProvider;
use crate::error::{LifecycleError, Result};
use dashmap::DashMap;
use kube::ResourceExt;
use lifecycle_types::{Descriptor, ModuleTemplate};
use std::sync::Arc;
use tracing::debug;

type CacheKey = (String, String, i64);

/// Decodes `spec.descriptor` once per template generation
pub struct CachedDescriptorProvider {
    cache: DashMap<CacheKey, Arc<Descriptor>>,
}

impl CachedDescriptorProvider {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for CachedDescriptorProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorProvider for CachedDescriptorProvider {
    fn get_descriptor(&self, template: &ModuleTemplate) -> Result<Arc<Descriptor>> {
        let key = (
            template.namespace().unwrap_or_default(),
            template.name_any(),
            template.generation(),
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }

        if template.spec.descriptor.is_null() {
            return Err(LifecycleError::Descriptor(format!(
                "template {} has no descriptor",
                key.1
            )));
        }
        let descriptor = Descriptor::from_raw(&template.spec.descriptor)
            .map_err(|e| LifecycleError::Descriptor(format!("template {}: {e}", key.1)))?;

        debug!(template = %key.1, generation = key.2, "Decoded component descriptor");
        let descriptor = Arc::new(descriptor);
        self.cache.insert(key, Arc::clone(&descriptor));
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle_types::ModuleTemplateSpec;
    use serde_json::json;

    fn template(generation: i64, version: &str) -> ModuleTemplate {
        let mut template = ModuleTemplate::new(
            "m1-1.0.0",
            ModuleTemplateSpec {
                module_name: "m1".to_string(),
                descriptor: json!({"component": {"name": "kyma-project.io/module/m1", "version": version}}),
                ..Default::default()
            },
        );
        template.metadata.namespace = Some("kcp-system".to_string());
        template.metadata.generation = Some(generation);
        template
    }

    #[test]
    fn test_cache_keyed_by_generation() {
        let provider = CachedDescriptorProvider::new();

        let first = provider.get_descriptor(&template(1, "1.0.0")).unwrap();
        assert_eq!(first.version, "1.0.0");

        // Same generation, cached value wins
        let cached = provider.get_descriptor(&template(1, "9.9.9")).unwrap();
        assert_eq!(cached.version, "1.0.0");
        assert_eq!(provider.len(), 1);

        let bumped = provider.get_descriptor(&template(2, "1.0.1")).unwrap();
        assert_eq!(bumped.version, "1.0.1");
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_missing_descriptor_is_an_error() {
        let provider = CachedDescriptorProvider::default();
        let mut template = template(1, "1.0.0");
        template.spec.descriptor = serde_json::Value::Null;

        assert!(matches!(
            provider.get_descriptor(&template),
            Err(LifecycleError::Descriptor(_))
        ));
        assert!(provider.is_empty());
    }
}
