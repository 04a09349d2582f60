//! The Kyma resource: declared modules, channel and the observed module states

use crate::conditions::{
    set_condition, ConditionStatus, KymaCondition, KymaConditionType, CONDITION_REASON,
};
use crate::labels;
use crate::State;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Kyma
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Kyma",
    namespaced,
    status = "KymaStatus",
    shortname = "kyma"
)]
#[serde(rename_all = "camelCase")]
pub struct KymaSpec {
    /// Release channel applied to every module without an override
    #[serde(default)]
    pub channel: String,

    /// Declared modules
    #[serde(default)]
    pub modules: Vec<Module>,

    /// Apply downtime-requiring updates immediately instead of waiting for a window
    #[serde(default)]
    pub skip_maintenance_windows: bool,
}

/// A module declared in `spec.modules`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Module name, unique within the Kyma
    pub name: String,

    /// Per-module channel override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Whether the default custom resource is created alongside the module
    #[serde(default)]
    pub custom_resource_policy: CustomResourcePolicy,

    /// `false` hands the module over to the user
    #[serde(default = "default_managed")]
    pub managed: bool,
}

fn default_managed() -> bool {
    true
}

impl Module {
    /// Create a managed module following the Kyma channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: None,
            custom_resource_policy: CustomResourcePolicy::default(),
            managed: true,
        }
    }

    /// Override the channel of this module
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// Handling of the module's default custom resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum CustomResourcePolicy {
    #[default]
    CreateAndDelete,
    Ignore,
}

/// Observed state of a Kyma
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KymaStatus {
    /// Aggregate lifecycle state
    #[serde(default)]
    pub state: State,

    /// Status conditions, keyed by type
    #[serde(default)]
    pub conditions: Vec<KymaCondition>,

    /// One entry per module, including modules still being removed
    #[serde(default)]
    pub modules: Vec<ModuleStatus>,

    /// Channel active at the last successful pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_channel: Option<String>,

    /// Last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
}

/// Message and time of the most recent status write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    pub operation: String,
    pub last_update_time: String,
}

/// Status entry for a single module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    /// Module name as declared
    pub name: String,

    /// Fully-qualified component name
    #[serde(default)]
    pub fqdn: String,

    /// Channel the installed version was resolved from
    #[serde(default)]
    pub channel: String,

    /// Installed version
    #[serde(default)]
    pub version: String,

    /// Module state, mirrors the manifest state
    #[serde(default)]
    pub state: State,

    /// Error or progress message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Manifest applied for this module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<TrackingObject>,

    /// Template the manifest was assembled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TrackingObject>,

    /// Default custom resource installed with the module
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<TrackingObject>,
}

/// Name, namespace and generation of a tracked object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartialMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub generation: i64,
}

/// Reference to another object by partial metadata, never a live pointer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingObject {
    #[serde(flatten)]
    pub meta: PartialMeta,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
}

impl TrackingObject {
    pub fn new(
        kind: impl Into<String>,
        api_version: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        generation: i64,
    ) -> Self {
        Self {
            meta: PartialMeta {
                name: name.into(),
                namespace: namespace.into(),
                generation,
            },
            kind: kind.into(),
            api_version: api_version.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn namespace(&self) -> &str {
        &self.meta.namespace
    }

    pub fn generation(&self) -> i64 {
        self.meta.generation
    }
}

impl Kyma {
    fn label_value(&self, key: &str) -> Option<&str> {
        self.labels().get(key).map(String::as_str)
    }

    fn label_enabled(&self, key: &str) -> bool {
        self.label_value(key).map(labels::is_enabled).unwrap_or(false)
    }

    /// Status of the Kyma, defaulting when unset
    pub fn status(&self) -> KymaStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut KymaStatus {
        self.status.get_or_insert_with(KymaStatus::default)
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Status entry for a module
    pub fn module_status(&self, name: &str) -> Option<&ModuleStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.modules.iter().find(|m| m.name == name))
    }

    /// Status entries whose module is no longer declared in `spec.modules`
    pub fn no_longer_declared_module_statuses(&self) -> Vec<&ModuleStatus> {
        let Some(status) = self.status.as_ref() else {
            return Vec::new();
        };
        status
            .modules
            .iter()
            .filter(|m| !self.spec.modules.iter().any(|d| d.name == m.name))
            .collect()
    }

    /// Aggregate state: worst module state first, then conditions
    pub fn determine_state(&self) -> State {
        let status = self.status();

        let has = |state: State| status.modules.iter().any(|m| m.state == state);
        if has(State::Error) {
            return State::Error;
        }
        if has(State::Warning) {
            return State::Warning;
        }
        if has(State::Processing) {
            return State::Processing;
        }

        if status
            .conditions
            .iter()
            .any(|c| c.status != ConditionStatus::True)
        {
            return State::Processing;
        }

        State::Ready
    }

    /// True when every module is ready or handed over to the user
    pub fn all_modules_ready(&self) -> bool {
        self.status().modules.iter().all(|m| {
            matches!(m.state, State::Ready | State::Unmanaged)
        })
    }

    pub fn skip_reconciliation(&self) -> bool {
        self.label_enabled(labels::SKIP_RECONCILIATION)
    }

    pub fn is_internal(&self) -> bool {
        self.label_enabled(labels::INTERNAL)
    }

    pub fn is_beta(&self) -> bool {
        self.label_enabled(labels::BETA)
    }

    /// Sync into the runtime cluster is on unless explicitly disabled
    pub fn has_sync_label_enabled(&self) -> bool {
        match self.label_value(labels::SYNC) {
            Some(value) => labels::is_enabled(value),
            None => true,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn global_account_id(&self) -> &str {
        self.label_value(labels::GLOBAL_ACCOUNT_ID).unwrap_or_default()
    }

    pub fn region(&self) -> &str {
        self.label_value(labels::REGION).unwrap_or_default()
    }

    pub fn platform_region(&self) -> &str {
        self.label_value(labels::PLATFORM_REGION).unwrap_or_default()
    }

    pub fn plan(&self) -> &str {
        self.label_value(labels::PLAN).unwrap_or_default()
    }

    /// Field owner for server-side apply of this Kyma's manifests
    pub fn field_owner(&self) -> String {
        self.label_value(labels::MANAGED_BY)
            .unwrap_or(labels::OPERATOR_NAME)
            .to_string()
    }

    /// Add the finalizer and managed-by label. Returns true if metadata changed.
    ///
    /// Objects already in foreground deletion are left alone.
    pub fn ensure_labels_and_finalizers(&mut self) -> bool {
        if self.finalizers().iter().any(|f| f == labels::FOREGROUND_DELETION) {
            return false;
        }

        let mut changed = false;
        if !self.is_deleting() && !self.finalizers().iter().any(|f| f == labels::KYMA_FINALIZER) {
            self.finalizers_mut().push(labels::KYMA_FINALIZER.to_string());
            changed = true;
        }

        if !self.labels().contains_key(labels::MANAGED_BY) {
            self.labels_mut()
                .insert(labels::MANAGED_BY.to_string(), labels::OPERATOR_NAME.to_string());
            changed = true;
        }
        changed
    }

    /// Remove one finalizer. Returns true if it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers().len();
        self.finalizers_mut().retain(|f| f != finalizer);
        before != self.finalizers().len()
    }

    /// Record a condition outcome for the current generation
    pub fn update_condition(&mut self, condition_type: KymaConditionType, status: ConditionStatus) {
        let generation = self.metadata.generation;
        let condition = KymaCondition {
            type_: condition_type.to_string(),
            status,
            reason: CONDITION_REASON.to_string(),
            message: condition_type.message(status).to_string(),
            observed_generation: generation,
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        };
        set_condition(&mut self.status_mut().conditions, condition);
    }

    /// Seed `Unknown` conditions for everything this pass will evaluate
    pub fn init_conditions(&mut self, sync_enabled: bool, watcher_enabled: bool) {
        let mut wanted = vec![KymaConditionType::Modules];
        if sync_enabled {
            wanted.push(KymaConditionType::ModuleCatalog);
        }
        if watcher_enabled {
            wanted.push(KymaConditionType::SkrWebhook);
        }
        let status = self.status_mut();
        status
            .conditions
            .retain(|c| wanted.iter().any(|w| w.as_str() == c.type_));
        for condition_type in wanted {
            if !self.contains_condition(condition_type, None) {
                self.update_condition(condition_type, ConditionStatus::Unknown);
            }
        }
    }

    /// Whether a condition exists, optionally with a given status
    pub fn contains_condition(
        &self,
        condition_type: KymaConditionType,
        status: Option<ConditionStatus>,
    ) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions.iter().any(|c| {
                c.type_ == condition_type.as_str() && status.map_or(true, |st| c.status == st)
            })
        })
    }

    /// Set state and last operation in one go.
    ///
    /// Moves the transition table forbids leave the status untouched.
    pub fn set_state(
        &mut self,
        state: State,
        message: impl Into<String>,
    ) -> crate::error::Result<()> {
        let next = self.state().transition_to(state)?;
        let status = self.status_mut();
        status.state = next;
        status.last_operation = Some(LastOperation {
            operation: message.into(),
            last_update_time: chrono::Utc::now().to_rfc3339(),
        });
        Ok(())
    }

    /// Force every module entry into `Error`, used when the runtime cluster is unreachable
    pub fn set_module_statuses_to_error(&mut self, message: &str) {
        for module in self.status_mut().modules.iter_mut() {
            module.state = State::Error;
            if !message.is_empty() {
                module.message = message.to_string();
            }
        }
    }
}
