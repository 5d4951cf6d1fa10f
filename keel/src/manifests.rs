//! Manifests compiled into the binary.

use std::borrow::Cow;

/// A named multi-document YAML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub name: Cow<'static, str>,
    pub data: Cow<'static, [u8]>,
}

impl Manifest {
    pub const fn embedded(name: &'static str, data: &'static [u8]) -> Self {
        Manifest {
            name: Cow::Borrowed(name),
            data: Cow::Borrowed(data),
        }
    }

    pub fn owned(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Manifest {
            name: Cow::Owned(name.into()),
            data: Cow::Owned(data.into()),
        }
    }
}

const OLM_CRDS: Manifest =
    Manifest::embedded("olm/crds.yaml", include_bytes!("../data/olm/crds.yaml"));
const OLM_CORE: Manifest =
    Manifest::embedded("olm/olm.yaml", include_bytes!("../data/olm/olm.yaml"));
const CATALOG: Manifest =
    Manifest::embedded("olm/catalog.yaml", include_bytes!("../data/olm/catalog.yaml"));

// applied in this order
const MONITORING: [Manifest; 9] = [
    Manifest::embedded(
        "monitoring/vmagent_rbac.yaml",
        include_bytes!("../data/monitoring/vmagent_rbac.yaml"),
    ),
    Manifest::embedded(
        "monitoring/vmnodescrape.yaml",
        include_bytes!("../data/monitoring/vmnodescrape.yaml"),
    ),
    Manifest::embedded(
        "monitoring/vmpodscrape.yaml",
        include_bytes!("../data/monitoring/vmpodscrape.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics/service-account.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics/service-account.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics/cluster-role.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics/cluster-role.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics/cluster-role-binding.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics/cluster-role-binding.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics/deployment.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics/deployment.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics/service.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics/service.yaml"),
    ),
    Manifest::embedded(
        "monitoring/kube-state-metrics.yaml",
        include_bytes!("../data/monitoring/kube-state-metrics.yaml"),
    ),
];

/// OLM CRDs followed by the OLM core components.
pub fn olm_manifests() -> Vec<Manifest> {
    vec![OLM_CRDS, OLM_CORE]
}

pub fn catalog_manifest() -> Manifest {
    CATALOG
}

pub fn monitoring_manifests() -> Vec<Manifest> {
    MONITORING.to_vec()
}
