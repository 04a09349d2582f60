//! Decoded component descriptor referenced by a module template
//!
//! Only the parts the assembler reads are modelled: identity, repository
//! context and the resource list. Unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};

/// Decoded component descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Fully-qualified component name, e.g. `kyma-project.io/module/serverless`
    pub name: String,

    /// Component version
    pub version: String,

    /// Repository contexts, the last one is effective
    #[serde(default)]
    pub repository_contexts: Vec<RepositoryContext>,

    /// Resources (layers and images) of the component
    #[serde(default)]
    pub resources: Vec<DescriptorResource>,
}

/// Raw descriptors wrap the component in a `component` key
#[derive(Deserialize)]
struct Envelope {
    component: Descriptor,
}

impl Descriptor {
    /// Decode a raw descriptor, with or without the `component` envelope
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if raw.get("component").is_some() {
            let envelope: Envelope = serde_json::from_value(raw.clone())?;
            Ok(envelope.component)
        } else {
            serde_json::from_value(raw.clone())
        }
    }

    /// Repository context the component was last transported to
    pub fn effective_repository_context(&self) -> Option<&RepositoryContext> {
        self.repository_contexts.last()
    }
}

/// OCI registry holding the component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    pub base_url: String,
    #[serde(default)]
    pub sub_path: String,
    #[serde(default)]
    pub component_name_mapping: ComponentNameMapping,
}

impl RepositoryContext {
    /// Base url joined with the optional sub path
    pub fn base(&self) -> String {
        if self.sub_path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, self.sub_path)
        }
    }
}

/// How component names map onto registry paths
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComponentNameMapping {
    #[default]
    #[serde(rename = "urlPath")]
    UrlPath,
    #[serde(rename = "sha256-digest")]
    Sha256Digest,
    #[serde(other)]
    Unsupported,
}

/// A resource of the component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorResource {
    /// Layer name, e.g. `raw-manifest`
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type", default)]
    pub resource_type: String,
    pub access: AccessSpec,
}

/// Access specification of a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpec {
    #[serde(rename = "type")]
    pub access_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
}

/// Broad classification of access types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Blob stored next to the component descriptor
    LocalBlob,
    /// Standalone OCI artifact (container image)
    OciArtifact,
    /// Anything this operator cannot interpret
    Unsupported,
}

impl AccessSpec {
    pub fn kind(&self) -> AccessKind {
        match self.access_type.as_str() {
            "localBlob" | "localBlob/v1" | "localOciBlob" | "localOciBlob/v1" => {
                AccessKind::LocalBlob
            }
            "ociArtifact" | "ociArtifact/v1" | "ociRegistry" | "ociRegistry/v1" => {
                AccessKind::OciArtifact
            }
            _ => AccessKind::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_enveloped_descriptor() {
        let raw = json!({
            "component": {
                "name": "kyma-project.io/module/m1",
                "version": "2.0.0",
                "repositoryContexts": [
                    {"baseUrl": "old.example", "componentNameMapping": "urlPath"},
                    {"baseUrl": "registry.example", "subPath": "prod", "componentNameMapping": "sha256-digest"}
                ],
                "resources": [{
                    "name": "raw-manifest",
                    "access": {"type": "localBlob", "localReference": "sha256:aa", "mediaType": "application/x-tar"}
                }]
            }
        });

        let descriptor = Descriptor::from_raw(&raw).unwrap();
        assert_eq!(descriptor.name, "kyma-project.io/module/m1");
        let ctx = descriptor.effective_repository_context().unwrap();
        assert_eq!(ctx.base(), "registry.example/prod");
        assert_eq!(ctx.component_name_mapping, ComponentNameMapping::Sha256Digest);
        assert_eq!(descriptor.resources[0].access.kind(), AccessKind::LocalBlob);
    }

    #[test]
    fn test_unknown_mapping_and_access_type() {
        let ctx: RepositoryContext =
            serde_json::from_value(json!({"baseUrl": "r", "componentNameMapping": "weird"})).unwrap();
        assert_eq!(ctx.component_name_mapping, ComponentNameMapping::Unsupported);

        let access = AccessSpec {
            access_type: "s3".to_string(),
            ..Default::default()
        };
        assert_eq!(access.kind(), AccessKind::Unsupported);
    }
}
