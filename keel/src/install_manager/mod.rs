pub mod approval;
pub mod coordinator;
pub mod group;

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use types::{InstallRequest, DISABLE_TELEMETRY_ENV, PLATFORM_OPERATOR, SYSTEM_OPERATOR_GROUP};

use crate::config::InstallerConfig;
use crate::error::{InstallError, Stage};
use crate::k8s_manager::KubeGateway;
use crate::monitoring_manager::MonitoringProvisioner;
use crate::olm_manager::OlmBootstrapper;

pub use approval::{ApprovalEngine, InstallState};
pub use coordinator::{BatchReport, InstallCoordinator};

pub const MONITORING_NAMESPACE_ENV: &str = "MONITORING_NAMESPACE";
pub const DB_NAMESPACES_ENV: &str = "DB_NAMESPACES";

/// Drives a full install: OLM, catalog, monitoring and the operators.
pub struct InstallManager {
    gateway: Arc<dyn KubeGateway>,
    config: InstallerConfig,
}

impl InstallManager {
    pub fn new(gateway: Arc<dyn KubeGateway>, config: InstallerConfig) -> Self {
        InstallManager { gateway, config }
    }

    pub fn approval_engine(&self) -> ApprovalEngine {
        ApprovalEngine::new(
            self.gateway.clone(),
            self.config.poll,
            self.config.completion,
        )
    }

    /// Returns one report per DB namespace, in configuration order.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Vec<BatchReport>, InstallError> {
        let bootstrapper = OlmBootstrapper::new(self.gateway.clone(), self.config.bootstrap.clone());
        if self.config.install_olm {
            bootstrapper.install_olm(cancel).await?;
        } else {
            info!("Skipping OLM installation");
        }
        bootstrapper.install_catalog(cancel).await?;

        if self.config.monitoring {
            self.provision_monitoring(cancel).await?;
        }

        self.ensure_namespace(cancel, &self.config.system_namespace)
            .await?;

        let coordinator = InstallCoordinator::new(
            self.gateway.clone(),
            self.approval_engine(),
            self.config.concurrency,
        );
        let platform = self.platform_request();
        let mut reports = Vec::with_capacity(self.config.namespaces.len());
        for namespace in &self.config.namespaces {
            self.ensure_namespace(cancel, namespace).await?;
            info!("Installing operators into {} namespace", namespace);
            let report = coordinator
                .install_batch(
                    cancel,
                    namespace,
                    self.engine_requests(namespace),
                    platform.clone(),
                )
                .await?;
            info!("Installed {} in {}", report.installed.join(", "), namespace);
            reports.push(report);
        }
        Ok(reports)
    }

    pub async fn provision_monitoring(&self, cancel: &CancellationToken) -> Result<(), InstallError> {
        MonitoringProvisioner::new(
            self.gateway.clone(),
            self.approval_engine(),
            self.config.monitoring_config.clone(),
        )
        .provision(cancel)
        .await
    }

    async fn ensure_namespace(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<(), InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(namespace, Stage::ManifestApply));
        }
        self.gateway
            .ensure_namespace(namespace)
            .await
            .map_err(|e| InstallError::from_k8s(namespace, Stage::ManifestApply, e))
    }

    pub fn engine_requests(&self, namespace: &str) -> Vec<InstallRequest> {
        self.config
            .engines
            .iter()
            .map(|sel| {
                InstallRequest::new(namespace, sel.engine.package(), &sel.channel)
                    .with_target_namespaces(vec![namespace.to_string()])
                    .with_env(DISABLE_TELEMETRY_ENV, self.telemetry_flag())
            })
            .collect()
    }

    /// The platform operator lives in the system namespace and watches every
    /// DB namespace.
    pub fn platform_request(&self) -> InstallRequest {
        InstallRequest::new(
            &self.config.system_namespace,
            PLATFORM_OPERATOR,
            &self.config.platform_channel,
        )
        .with_operator_group(SYSTEM_OPERATOR_GROUP)
        .with_target_namespaces(self.config.namespaces.clone())
        .with_env(DISABLE_TELEMETRY_ENV, self.telemetry_flag())
        .with_env(MONITORING_NAMESPACE_ENV, &self.config.monitoring_config.namespace)
        .with_env(DB_NAMESPACES_ENV, self.config.namespaces.join(","))
    }

    fn telemetry_flag(&self) -> &'static str {
        if self.config.disable_telemetry {
            "true"
        } else {
            "false"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSelection;
    use types::Engine;

    #[test]
    fn platform_request_carries_environment() {
        let config = InstallerConfig {
            namespaces: vec!["dbs".into(), "analytics".into()],
            disable_telemetry: true,
            ..Default::default()
        };
        let gw = Arc::new(crate::k8s_manager::memory::MemoryGateway::new());
        let manager = InstallManager::new(gw, config);

        let req = manager.platform_request();
        assert_eq!(req.namespace, "keel-system");
        assert_eq!(req.operator_group, SYSTEM_OPERATOR_GROUP);
        assert_eq!(req.channel, "stable-v0");
        assert_eq!(
            req.target_namespaces,
            vec!["dbs".to_string(), "analytics".to_string()]
        );
        assert_eq!(
            req.env.get(DB_NAMESPACES_ENV).map(String::as_str),
            Some("dbs,analytics")
        );
        assert_eq!(req.env.get(DISABLE_TELEMETRY_ENV).map(String::as_str), Some("true"));
        assert_eq!(
            req.env.get(MONITORING_NAMESPACE_ENV).map(String::as_str),
            Some("keel-monitoring")
        );
    }

    #[test]
    fn engine_requests_follow_selection() {
        let config = InstallerConfig {
            engines: vec![EngineSelection {
                engine: Engine::Postgresql,
                channel: "fast-v2".into(),
            }],
            ..Default::default()
        };
        let gw = Arc::new(crate::k8s_manager::memory::MemoryGateway::new());
        let reqs = InstallManager::new(gw, config).engine_requests("analytics");

        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].namespace, "analytics");
        assert_eq!(reqs[0].operator_group, types::OPERATOR_GROUP);
        assert_eq!(reqs[0].target_namespaces, vec!["analytics".to_string()]);
        assert_eq!(reqs[0].name, "percona-postgresql-operator");
        assert_eq!(reqs[0].channel, "fast-v2");
        assert_eq!(reqs[0].env.get(DISABLE_TELEMETRY_ENV).map(String::as_str), Some("false"));
    }
}
