use std::collections::BTreeMap;
use std::fmt;

use olm::Approval;

pub mod olm;

pub const OLM_NAMESPACE: &str = "olm";
pub const OLM_OPERATOR_DEPLOYMENT: &str = "olm-operator";
pub const CATALOG_OPERATOR_DEPLOYMENT: &str = "catalog-operator";
pub const PACKAGESERVER_DEPLOYMENT: &str = "packageserver";

pub const CATALOG_SOURCE: &str = "keel-catalog";
pub const OPERATOR_GROUP: &str = "keel-databases";
pub const MONITORING_OPERATOR_GROUP: &str = "keel-monitoring";
pub const SYSTEM_OPERATOR_GROUP: &str = "keel-system";

pub const PLATFORM_OPERATOR: &str = "keel-operator";
pub const PLATFORM_OPERATOR_DEPLOYMENT: &str = "keel-operator-controller-manager";
pub const PLATFORM_OPERATOR_CHANNEL: &str = "stable-v0";

pub const METRICS_AGENT_OPERATOR: &str = "victoriametrics-operator";
pub const METRICS_AGENT_CHANNEL: &str = "stable-v0";

pub const DEFAULT_NAMESPACE: &str = "keel";
/// Namespace of the platform operator, which manages every DB namespace.
pub const SYSTEM_NAMESPACE: &str = "keel-system";
pub const MONITORING_NAMESPACE: &str = "keel-monitoring";

/// Env var passed to every operator subscription to opt out of telemetry.
pub const DISABLE_TELEMETRY_ENV: &str = "DISABLE_TELEMETRY";

/// namespace/name pair identifying a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        NamespacedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Database engine operators that can be installed next to the platform operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Engine {
    Mysql,
    Mongodb,
    Postgresql,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Mysql, Engine::Mongodb, Engine::Postgresql];

    /// OLM package (and subscription) name of the engine operator
    pub fn package(&self) -> &'static str {
        match self {
            Engine::Mysql => "percona-xtradb-cluster-operator",
            Engine::Mongodb => "percona-server-mongodb-operator",
            Engine::Postgresql => "percona-postgresql-operator",
        }
    }

    /// name of the controller deployment the engine's CSV creates
    pub fn deployment(&self) -> &'static str {
        match self {
            Engine::Mysql => "percona-xtradb-cluster-operator",
            Engine::Mongodb => "percona-server-mongodb-operator",
            Engine::Postgresql => "percona-postgresql-operator",
        }
    }

    pub fn default_channel(&self) -> &'static str {
        match self {
            Engine::Mysql => "stable-v1",
            Engine::Mongodb => "stable-v1",
            Engine::Postgresql => "stable-v2",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Engine::Mysql => "MySQL",
            Engine::Mongodb => "MongoDB",
            Engine::Postgresql => "PostgreSQL",
        };
        f.write_str(name)
    }
}

/// Deployment names of every known engine controller.
pub fn engine_deployment_names() -> Vec<String> {
    Engine::ALL.iter().map(|e| e.deployment().to_string()).collect()
}

/// Input of a single operator install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub namespace: String,
    pub name: String,
    pub operator_group: String,
    pub catalog_source: String,
    pub catalog_source_namespace: String,
    pub channel: String,
    pub starting_csv: Option<String>,
    // always Manual towards OLM; the approval engine approves the plan itself
    pub install_plan_approval: Approval,
    pub target_namespaces: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl InstallRequest {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        InstallRequest {
            namespace: namespace.into(),
            name: name.into(),
            operator_group: OPERATOR_GROUP.to_string(),
            catalog_source: CATALOG_SOURCE.to_string(),
            catalog_source_namespace: OLM_NAMESPACE.to_string(),
            channel: channel.into(),
            starting_csv: None,
            install_plan_approval: Approval::Manual,
            target_namespaces: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_operator_group(mut self, operator_group: impl Into<String>) -> Self {
        self.operator_group = operator_group.into();
        self
    }

    pub fn with_starting_csv(mut self, starting_csv: impl Into<String>) -> Self {
        self.starting_csv = Some(starting_csv.into());
        self
    }

    pub fn with_target_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.target_namespaces = namespaces;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_request_defaults_to_manual_approval() {
        let req = InstallRequest::new("db", "engine-a", "stable");

        assert_eq!(req.install_plan_approval, Approval::Manual);
        assert_eq!(req.catalog_source, CATALOG_SOURCE);
        assert_eq!(req.catalog_source_namespace, OLM_NAMESPACE);
        assert_eq!(req.key().to_string(), "db/engine-a");
    }

    #[test]
    fn engine_deployments_cover_every_engine() {
        let names = engine_deployment_names();
        assert_eq!(names.len(), Engine::ALL.len());
        assert!(names.contains(&"percona-postgresql-operator".to_string()));
    }
}
