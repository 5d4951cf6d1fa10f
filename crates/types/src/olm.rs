use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub const OLM_GROUP: &str = "operators.coreos.com";

pub const CSV_PHASE_SUCCEEDED: &str = "Succeeded";
pub const CSV_PHASE_FAILED: &str = "Failed";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Approval {
    #[default]
    Manual,
    Automatic,
}

// --- Subscription ---

#[skip_serializing_none]
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "Subscription",
    namespaced
)]
#[kube(status = "SubscriptionStatus")]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    pub source: String,              // catalog source name
    pub source_namespace: String,    // namespace of the catalog source
    pub name: String,                // package name inside the catalog
    pub channel: Option<String>,
    #[serde(rename = "startingCSV")]
    pub starting_csv: Option<String>,
    pub install_plan_approval: Option<Approval>,
    pub config: Option<SubscriptionConfig>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value: Option<String>,
    // secret/configmap/field references are carried through untouched
    pub value_from: Option<serde_json::Value>,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        EnvVar {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub state: Option<String>,
    pub install_plan_ref: Option<ObjectRef>,
    // legacy handle, still populated by OLM next to installPlanRef
    pub installplan: Option<InstallPlanHandle>,
    #[serde(rename = "currentCSV")]
    pub current_csv: Option<String>,
    #[serde(rename = "installedCSV")]
    pub installed_csv: Option<String>,
}

impl SubscriptionStatus {
    /// Name of the install plan OLM resolved for this subscription, if any.
    pub fn install_plan_name(&self) -> Option<&str> {
        self.install_plan_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .or_else(|| self.installplan.as_ref().map(|h| h.name.as_str()))
            .filter(|name| !name.is_empty())
    }
}

impl Subscription {
    pub fn install_plan_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.install_plan_name())
    }

    pub fn installed_csv(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.installed_csv.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    pub namespace: Option<String>,
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanHandle {
    pub name: String,
    pub api_version: Option<String>,
    pub kind: Option<String>,
    pub uuid: Option<String>,
}

// --- InstallPlan ---

#[skip_serializing_none]
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "InstallPlan",
    namespaced
)]
#[kube(status = "InstallPlanStatus")]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
    pub approval: Approval,
    pub approved: bool,
    #[serde(default)]
    pub cluster_service_version_names: Vec<String>,
    pub generation: Option<i64>,
    pub source: Option<String>,
    pub source_namespace: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanStatus {
    pub phase: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub plan: Vec<InstallPlanStep>, // resources the plan creates once approved
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanStep {
    pub resolving: String,
    pub resource: StepResource,
    pub status: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub source_name: Option<String>,
    pub source_namespace: Option<String>,
}

impl InstallPlan {
    pub fn is_approved(&self) -> bool {
        self.spec.approved
    }
}

// --- OperatorGroup ---

#[skip_serializing_none]
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1",
    kind = "OperatorGroup",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroupSpec {
    // empty means the group watches every namespace
    pub target_namespaces: Option<Vec<String>>,
}

// --- ClusterServiceVersion ---

#[skip_serializing_none]
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "ClusterServiceVersion",
    namespaced
)]
#[kube(status = "ClusterServiceVersionStatus")]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    pub display_name: Option<String>,
    pub version: Option<String>,
    pub replaces: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionStatus {
    pub phase: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ClusterServiceVersion {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    pub fn is_succeeded(&self) -> bool {
        self.phase() == Some(CSV_PHASE_SUCCEEDED)
    }

    pub fn is_failed(&self) -> bool {
        self.phase() == Some(CSV_PHASE_FAILED)
    }
}

// --- CatalogSource ---

#[skip_serializing_none]
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "CatalogSource",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSourceSpec {
    pub source_type: String,
    pub image: Option<String>,
    pub display_name: Option<String>,
    pub publisher: Option<String>,
}

// --- PackageManifest (served by packageserver, read only) ---

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "packages.operators.coreos.com",
    version = "v1",
    kind = "PackageManifest",
    namespaced
)]
#[kube(status = "PackageManifestStatus")]
pub struct PackageManifestSpec {}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifestStatus {
    pub catalog_source: Option<String>,
    pub catalog_source_namespace: Option<String>,
    pub package_name: Option<String>,
    pub default_channel: Option<String>,
    #[serde(default)]
    pub channels: Vec<PackageChannel>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageChannel {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current_csv: String,
}
