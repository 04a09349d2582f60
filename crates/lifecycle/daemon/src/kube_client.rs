//! Kube-backed implementations of the engine collaborators
//!
//! Everything here is a thin mapping onto `kube::Api`; the decisions live in
//! the engine. Manifests are written with server-side apply under the Kyma's
//! field owner so only one writer owns their spec.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use lifecycle_engine::{
    ClientError, ClientResult, KymaStore, ManifestApplier, TemplateReader, TemplateWriter,
};
use lifecycle_types::{labels, Kyma, Manifest, ModuleReleaseMeta, ModuleTemplate};
use serde_json::json;
use tracing::debug;

/// Map kube errors onto the engine's client errors
pub fn map_kube_error(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClientError::NotFound(response.message),
            409 => ClientError::Conflict(response.message),
            401 | 403 => ClientError::Unauthorized(response.message),
            _ => ClientError::Api(response.message),
        },
        other => ClientError::Api(other.to_string()),
    }
}

fn namespace_of(meta_namespace: Option<String>, name: &str) -> ClientResult<String> {
    meta_namespace.ok_or_else(|| ClientError::Api(format!("object {name} has no namespace")))
}

/// Control-plane cluster access through a kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Create a new KubeCluster wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn templates(&self, namespace: &str) -> Api<ModuleTemplate> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn manifests(&self, namespace: &str) -> Api<Manifest> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn kymas(&self, namespace: &str) -> Api<Kyma> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl TemplateReader for KubeCluster {
    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClientResult<Option<ModuleTemplate>> {
        self.templates(namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn get_release_meta(
        &self,
        namespace: &str,
        module: &str,
    ) -> ClientResult<Option<ModuleReleaseMeta>> {
        Api::<ModuleReleaseMeta>::namespaced(self.client.clone(), namespace)
            .get_opt(module)
            .await
            .map_err(map_kube_error)
    }

    async fn list_templates(&self) -> ClientResult<Vec<ModuleTemplate>> {
        let list = Api::<ModuleTemplate>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }
}

#[async_trait]
impl TemplateWriter for KubeCluster {
    async fn update_template(&self, template: &ModuleTemplate) -> ClientResult<()> {
        let name = template.name_any();
        let namespace = namespace_of(template.namespace(), &name)?;
        self.templates(&namespace)
            .replace(&name, &PostParams::default(), template)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }
}

#[async_trait]
impl ManifestApplier for KubeCluster {
    async fn get_manifest(&self, namespace: &str, name: &str) -> ClientResult<Option<Manifest>> {
        self.manifests(namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn apply_manifest(&self, manifest: &Manifest, field_owner: &str) -> ClientResult<Manifest> {
        let name = manifest.name_any();
        let namespace = namespace_of(manifest.namespace(), &name)?;

        // Apply configurations must not carry server-managed bookkeeping
        let mut desired = manifest.clone();
        desired.metadata.managed_fields = None;
        desired.metadata.resource_version = None;
        desired.status = None;

        debug!(manifest = %name, owner = %field_owner, "server-side apply");
        self.manifests(&namespace)
            .patch(
                &name,
                &PatchParams::apply(field_owner).force(),
                &Patch::Apply(&desired),
            )
            .await
            .map_err(map_kube_error)
    }

    async fn update_manifest(&self, manifest: &Manifest) -> ClientResult<Manifest> {
        let name = manifest.name_any();
        let namespace = namespace_of(manifest.namespace(), &name)?;
        self.manifests(&namespace)
            .replace(&name, &PostParams::default(), manifest)
            .await
            .map_err(map_kube_error)
    }

    async fn delete_manifest(&self, namespace: &str, name: &str) -> ClientResult<()> {
        self.manifests(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn list_manifests_for_kyma(
        &self,
        namespace: &str,
        kyma_name: &str,
    ) -> ClientResult<Vec<Manifest>> {
        let selector = format!("{}={}", labels::KYMA_NAME, kyma_name);
        let list = self
            .manifests(namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }
}

#[async_trait]
impl KymaStore for KubeCluster {
    async fn get_kyma(&self, namespace: &str, name: &str) -> ClientResult<Option<Kyma>> {
        self.kymas(namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn update_kyma(&self, kyma: &Kyma) -> ClientResult<Kyma> {
        let name = kyma.name_any();
        let namespace = namespace_of(kyma.namespace(), &name)?;
        self.kymas(&namespace)
            .replace(&name, &PostParams::default(), kyma)
            .await
            .map_err(map_kube_error)
    }

    async fn update_kyma_status(&self, kyma: &Kyma) -> ClientResult<Kyma> {
        let name = kyma.name_any();
        let namespace = namespace_of(kyma.namespace(), &name)?;

        let status_patch = json!({
            "status": kyma.status,
        });

        self.kymas(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await
            .map_err(map_kube_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_map_kube_error() {
        assert!(matches!(map_kube_error(api_error(404)), ClientError::NotFound(_)));
        assert!(matches!(map_kube_error(api_error(409)), ClientError::Conflict(_)));
        assert!(matches!(map_kube_error(api_error(401)), ClientError::Unauthorized(_)));
        assert!(matches!(map_kube_error(api_error(500)), ClientError::Api(_)));
    }

    #[test]
    fn test_namespace_required() {
        assert!(namespace_of(None, "k1").is_err());
        assert_eq!(namespace_of(Some("kcp-system".to_string()), "k1").unwrap(), "kcp-system");
    }
}
