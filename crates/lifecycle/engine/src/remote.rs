//! Helpers for the Kyma copy in the runtime cluster

use crate::client::CrdGenerations;
use lifecycle_types::{labels, Kyma};

/// Take declared modules and channel from the remote copy; the runtime cluster owns them
pub fn replace_spec(control_plane: &mut Kyma, remote: &Kyma) {
    control_plane.spec.modules = remote.spec.modules.clone();
    control_plane.spec.channel = remote.spec.channel.clone();
}

/// Record CRD generations of both clusters. Returns true when an annotation changed.
pub fn apply_crd_generations(kyma: &mut Kyma, generations: CrdGenerations) -> bool {
    let annotations = kyma.metadata.annotations.get_or_insert_with(Default::default);
    let mut changed = false;
    for (key, generation) in [
        (labels::SKR_CRD_GENERATION, generations.skr),
        (labels::KCP_CRD_GENERATION, generations.kcp),
    ] {
        let value = generation.to_string();
        if annotations.get(key) != Some(&value) {
            annotations.insert(key.to_string(), value);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;
    use lifecycle_types::{KymaSpec, Module};

    #[test]
    fn test_crd_generations_are_recorded_per_cluster() {
        let mut kyma = Kyma::new("k1", KymaSpec::default());
        let generations = CrdGenerations { kcp: 4, skr: 2 };

        assert!(apply_crd_generations(&mut kyma, generations));
        assert_eq!(kyma.annotations()[labels::SKR_CRD_GENERATION], "2");
        assert_eq!(kyma.annotations()[labels::KCP_CRD_GENERATION], "4");
        assert!(!apply_crd_generations(&mut kyma, generations));
    }

    #[test]
    fn test_replace_spec_keeps_local_settings() {
        let mut kcp = Kyma::new(
            "k1",
            KymaSpec {
                channel: "regular".to_string(),
                skip_maintenance_windows: true,
                ..Default::default()
            },
        );
        let remote = Kyma::new(
            "k1",
            KymaSpec {
                channel: "fast".to_string(),
                modules: vec![Module::new("m1")],
                ..Default::default()
            },
        );
        replace_spec(&mut kcp, &remote);
        assert_eq!(kcp.spec.channel, "fast");
        assert_eq!(kcp.spec.modules.len(), 1);
        assert!(kcp.spec.skip_maintenance_windows);
    }
}
