use std::sync::Arc;

use anyhow::Result;
use log::{debug, info};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use helpers::k8s_helpers::manifest;
use helpers::wait::sleep_or_cancel;
use types::{InstallRequest, METRICS_AGENT_OPERATOR, MONITORING_OPERATOR_GROUP};

use crate::config::MonitoringConfig;
use crate::error::{InstallError, Stage};
use crate::install_manager::approval::ApprovalEngine;
use crate::k8s_manager::{K8sError, KubeGateway};

const MONITORING: &str = "monitoring";

/// Installs the metrics agent operator and the scrape configuration it runs.
pub struct MonitoringProvisioner {
    gateway: Arc<dyn KubeGateway>,
    engine: ApprovalEngine,
    config: MonitoringConfig,
}

impl MonitoringProvisioner {
    pub fn new(gateway: Arc<dyn KubeGateway>, engine: ApprovalEngine, config: MonitoringConfig) -> Self {
        MonitoringProvisioner {
            gateway,
            engine,
            config,
        }
    }

    pub async fn provision(&self, cancel: &CancellationToken) -> Result<(), InstallError> {
        let namespace = self.config.namespace.as_str();
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(MONITORING, Stage::ManifestApply));
        }

        info!("Preparing k8s cluster for monitoring");
        self.gateway
            .ensure_namespace(namespace)
            .await
            .map_err(|e| InstallError::from_k8s(MONITORING, Stage::ManifestApply, e))?;

        let req = InstallRequest::new(namespace, METRICS_AGENT_OPERATOR, &self.config.channel)
            .with_operator_group(MONITORING_OPERATOR_GROUP);
        info!("Installing {} operator", METRICS_AGENT_OPERATOR);
        self.engine.install_operator(cancel, &req).await?;
        info!("{} operator has been installed", METRICS_AGENT_OPERATOR);

        for m in &self.config.manifests {
            let data = render_manifest(&m.data, namespace).map_err(|e| InstallError::Manifest {
                subject: MONITORING.to_string(),
                message: format!("{}: {:#}", m.name, e),
            })?;
            self.apply_with_retries(cancel, &m.name, &data).await?;
        }

        info!("K8s cluster monitoring has been provisioned successfully");
        Ok(())
    }

    // the operator's CRDs may not be served yet right after install
    async fn apply_with_retries(
        &self,
        cancel: &CancellationToken,
        name: &str,
        data: &[u8],
    ) -> Result<(), InstallError> {
        let attempts = self.config.retries.max(1);
        let mut last: Option<K8sError> = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(InstallError::cancelled(MONITORING, Stage::ManifestApply));
            }
            debug!("Applying file {}", name);
            match self.gateway.apply_file(data).await {
                Ok(()) => return Ok(()),
                Err(e @ K8sError::Manifest(_)) => {
                    return Err(InstallError::from_k8s(MONITORING, Stage::ManifestApply, e))
                }
                Err(e) => {
                    debug!("{}: retrying after error: {}", name, e);
                    last = Some(e);
                }
            }
            if attempt < attempts && !sleep_or_cancel(cancel, self.config.backoff).await {
                return Err(InstallError::cancelled(MONITORING, Stage::ManifestApply));
            }
        }

        Err(match last {
            Some(e) => InstallError::from_k8s(MONITORING, Stage::ManifestApply, e),
            None => InstallError::timeout(MONITORING, Stage::ManifestApply),
        })
    }
}

/// Moves every document of a manifest into `namespace`: namespaced objects get
/// `metadata.namespace`, cluster role bindings get it on each subject.
pub fn render_manifest(data: &[u8], namespace: &str) -> Result<Vec<u8>> {
    let mut docs = manifest::decode_manifests(data)?;
    for doc in docs.iter_mut() {
        let kind = manifest::kind(doc).unwrap_or_default().to_string();
        if !manifest::is_cluster_scoped(&kind) {
            if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("namespace".to_string(), Value::from(namespace));
            }
        }
        if kind == "ClusterRoleBinding" {
            let subjects = doc
                .get_mut("subjects")
                .and_then(Value::as_array_mut)
                .into_iter()
                .flatten();
            for subject in subjects.filter_map(Value::as_object_mut) {
                subject.insert("namespace".to_string(), Value::from(namespace));
            }
        }
    }
    manifest::encode_manifests(&docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use helpers::k8s_helpers::manifest::decode_manifests;
    use helpers::wait::PollPolicy;

    use crate::config::CompletionPolicy;
    use crate::k8s_manager::memory::{MemoryGateway, Op};
    use crate::manifests::Manifest;

    const BINDING: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: vmagent
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: vmagent
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: vmagent
subjects:
  - kind: ServiceAccount
    name: vmagent
    namespace: default
  - kind: ServiceAccount
    name: other
"#;

    #[test]
    fn render_sets_namespaces() {
        let out = render_manifest(BINDING.as_bytes(), "keel-monitoring").unwrap();
        let docs = decode_manifests(&out).unwrap();

        assert_eq!(manifest::namespace(&docs[0]), Some("keel-monitoring"));
        assert_eq!(manifest::namespace(&docs[1]), None);
        let subjects = docs[1]["subjects"].as_array().unwrap();
        assert!(subjects.iter().all(|s| s["namespace"] == "keel-monitoring"));
    }

    fn provisioner(gw: &Arc<MemoryGateway>, manifests: Vec<Manifest>) -> MonitoringProvisioner {
        let engine = ApprovalEngine::new(
            gw.clone(),
            PollPolicy::new(Duration::from_millis(10), Duration::from_millis(500)),
            CompletionPolicy::PlanApproved,
        );
        let config = MonitoringConfig {
            backoff: Duration::from_millis(10),
            manifests,
            ..Default::default()
        };
        MonitoringProvisioner::new(gw.clone(), engine, config)
    }

    #[tokio::test]
    async fn installs_agent_and_applies_manifests_in_namespace() {
        let gw = Arc::new(MemoryGateway::new());
        provisioner(&gw, vec![Manifest::owned("rbac.yaml", BINDING)])
            .provision(&CancellationToken::new())
            .await
            .unwrap();

        let sub = gw
            .subscription("keel-monitoring", METRICS_AGENT_OPERATOR)
            .unwrap();
        assert_eq!(sub.spec.channel.as_deref(), Some("stable-v0"));
        assert_eq!(gw.count(Op::UpdateInstallPlan), 1);
        assert_eq!(gw.calls_of(Op::CreateOperatorGroup)[0].key, "keel-monitoring/keel-monitoring");

        let applied = gw.applied_documents();
        let sa = applied
            .iter()
            .find(|d| manifest::kind(d) == Some("ServiceAccount"))
            .unwrap();
        assert_eq!(manifest::namespace(sa), Some("keel-monitoring"));
    }

    #[tokio::test]
    async fn retries_each_file_three_times() {
        let gw = Arc::new(MemoryGateway::new());
        let p = provisioner(&gw, vec![]);
        let before = gw.count(Op::ApplyFile);
        p.apply_with_retries(&CancellationToken::new(), "rbac.yaml", BINDING.as_bytes())
            .await
            .unwrap();
        assert_eq!(gw.count(Op::ApplyFile), before + 1);

        gw.fail_applies(2);
        p.apply_with_retries(&CancellationToken::new(), "rbac.yaml", BINDING.as_bytes())
            .await
            .unwrap();
        assert_eq!(gw.count(Op::ApplyFile), before + 4);

        gw.fail_applies(3);
        let err = p
            .apply_with_retries(&CancellationToken::new(), "rbac.yaml", BINDING.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Kube { stage: Stage::ManifestApply, .. }));
        assert_eq!(gw.count(Op::ApplyFile), before + 7);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff() {
        let gw = Arc::new(MemoryGateway::new());
        let mut p = provisioner(&gw, vec![]);
        p.config.backoff = Duration::from_secs(3600);
        gw.fail_applies(3);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = p
            .apply_with_retries(&cancel, "rbac.yaml", BINDING.as_bytes())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(gw.count(Op::ApplyFile), 1);
    }
}
