use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use types::{InstallRequest, PLATFORM_OPERATOR_DEPLOYMENT};

use super::approval::ApprovalEngine;
use super::group::TaskGroup;
use crate::error::{with_cancel, InstallError, Stage};
use crate::k8s_manager::KubeGateway;

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub namespace: String,
    pub installed: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub restarted: bool,
}

/// Installs a set of engine operators next to the platform operator.
pub struct InstallCoordinator {
    gateway: Arc<dyn KubeGateway>,
    engine: ApprovalEngine,
    concurrency: usize,
}

impl InstallCoordinator {
    pub fn new(gateway: Arc<dyn KubeGateway>, engine: ApprovalEngine, concurrency: usize) -> Self {
        InstallCoordinator {
            gateway,
            engine,
            concurrency,
        }
    }

    /// Runs the engine requests of `namespace` through a bounded task group,
    /// then installs the platform operator. When the set of engine deployments
    /// changed on a namespace that already had some, the platform operator is
    /// restarted in its own namespace so it picks the new engines up.
    pub async fn install_batch(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        engines: Vec<InstallRequest>,
        platform: InstallRequest,
    ) -> Result<BatchReport, InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(namespace, Stage::Snapshot));
        }
        let before = self.snapshot(cancel, namespace).await?;

        let mut installed: Vec<String> = engines.iter().map(|r| r.name.clone()).collect();
        let mut group: TaskGroup<InstallError> = TaskGroup::new(cancel, self.concurrency);
        for req in engines {
            let engine = self.engine.clone();
            group.spawn(move |token| async move {
                info!("Installing {} operator", req.name);
                engine.install_operator(&token, &req).await?;
                info!("{} operator has been installed", req.name);
                Ok::<(), InstallError>(())
            });
        }
        group.wait().await?;

        info!("Installing {} operator", platform.name);
        self.engine.install_operator(cancel, &platform).await?;
        installed.push(platform.name.clone());

        let after = self.snapshot(cancel, namespace).await?;
        let restarted = !before.is_empty() && before.len() != after.len();
        if restarted {
            if cancel.is_cancelled() {
                return Err(InstallError::cancelled(namespace, Stage::Restart));
            }
            info!(
                "Engine deployments in {} changed ({:?} -> {:?}), restarting {}",
                namespace, before, after, PLATFORM_OPERATOR_DEPLOYMENT
            );
            self.gateway
                .restart_deployment(PLATFORM_OPERATOR_DEPLOYMENT, &platform.namespace)
                .await
                .map_err(|e| InstallError::from_k8s(PLATFORM_OPERATOR_DEPLOYMENT, Stage::Restart, e))?;
        }

        Ok(BatchReport {
            namespace: namespace.to_string(),
            installed,
            before,
            after,
            restarted,
        })
    }

    async fn snapshot(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<String>, InstallError> {
        with_cancel(
            cancel,
            namespace,
            Stage::Snapshot,
            self.gateway.list_engine_deployment_names(namespace),
        )
        .await
    }
}
