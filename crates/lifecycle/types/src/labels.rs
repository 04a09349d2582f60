//! Label, annotation and finalizer keys used as contracts between components

/// Marks the operator that owns a resource; its value doubles as field owner
pub const MANAGED_BY: &str = "operator.kyma-project.io/managed-by";

/// Value written into [`MANAGED_BY`] by this operator
pub const OPERATOR_NAME: &str = "lifecycle-manager";

/// Channel a manifest was resolved from
pub const CHANNEL: &str = "operator.kyma-project.io/channel";

/// Present on module templates that are installed on every Kyma
pub const IS_MANDATORY_MODULE: &str = "operator.kyma-project.io/mandatory-module";

/// Manifest annotation marking a module the operator no longer manages
pub const UNMANAGED: &str = "operator.kyma-project.io/is-unmanaged";

/// Fully-qualified component name of a manifest
pub const FQDN: &str = "operator.kyma-project.io/fqdn";

/// Opt-in for beta modules (on Kyma) / beta marker (on templates)
pub const BETA: &str = "operator.kyma-project.io/beta";

/// Opt-in for internal modules (on Kyma) / internal marker (on templates)
pub const INTERNAL: &str = "operator.kyma-project.io/internal";

/// Stops all reconciliation of a Kyma
pub const SKIP_RECONCILIATION: &str = "operator.kyma-project.io/skip-reconciliation";

/// Owning Kyma of a manifest
pub const KYMA_NAME: &str = "operator.kyma-project.io/kyma-name";

/// Module a manifest was generated for
pub const MODULE_NAME: &str = "operator.kyma-project.io/module-name";

/// Enables synchronisation of the Kyma into the runtime cluster
pub const SYNC: &str = "operator.kyma-project.io/sync";

/// Runtime attributes consulted by maintenance-window policies
pub const GLOBAL_ACCOUNT_ID: &str = "kyma-project.io/global-account-id";
pub const REGION: &str = "kyma-project.io/region";
pub const PLATFORM_REGION: &str = "kyma-project.io/platform-region";
pub const PLAN: &str = "kyma-project.io/broker-plan-name";

/// Generation of the Kyma CRD in the runtime cluster
pub const SKR_CRD_GENERATION: &str = "kyma-skr-crd-generation";

/// Generation of the Kyma CRD in the control-plane cluster
pub const KCP_CRD_GENERATION: &str = "kyma-kcp-crd-generation";

/// Finalizer holding a Kyma until its manifests are gone
pub const KYMA_FINALIZER: &str = "operator.kyma-project.io/Kyma";

/// Kubernetes foreground-deletion finalizer
pub const FOREGROUND_DELETION: &str = "foregroundDeletion";

/// Canonical truthy label value
pub const ENABLED: &str = "true";

/// Truthiness check for label values, case-insensitive
pub fn is_enabled(value: &str) -> bool {
    value.eq_ignore_ascii_case(ENABLED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_enabled() {
        assert!(is_enabled("true"));
        assert!(is_enabled("TRUE"));
        assert!(!is_enabled("false"));
        assert!(!is_enabled(""));
    }
}
