use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use helpers::k8s_helpers::manifest;
use helpers::wait::{poll_until, PollError, PollPolicy};
use types::{
    olm::OLM_GROUP, NamespacedName, CATALOG_OPERATOR_DEPLOYMENT, OLM_NAMESPACE,
    OLM_OPERATOR_DEPLOYMENT, PACKAGESERVER_DEPLOYMENT, PLATFORM_OPERATOR,
};

use crate::config::BootstrapConfig;
use crate::error::{with_cancel, InstallError, Stage};
use crate::k8s_manager::{K8sError, KubeGateway};
use crate::manifests::Manifest;

const OLM: &str = "olm";
const CATALOG: &str = "catalog";

/// Brings up OLM and the package catalog.
pub struct OlmBootstrapper {
    gateway: Arc<dyn KubeGateway>,
    config: BootstrapConfig,
}

impl OlmBootstrapper {
    pub fn new(gateway: Arc<dyn KubeGateway>, config: BootstrapConfig) -> Self {
        OlmBootstrapper { gateway, config }
    }

    /// Installs OLM unless its operator deployment already exists.
    /// Returns false when nothing had to be done.
    pub async fn install_olm(&self, cancel: &CancellationToken) -> Result<bool, InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(OLM, Stage::Lookup));
        }

        match self
            .gateway
            .get_deployment(OLM_OPERATOR_DEPLOYMENT, OLM_NAMESPACE)
            .await
        {
            Ok(_) => {
                info!("OLM operator is already installed");
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(InstallError::from_k8s(OLM, Stage::Lookup, e)),
        }

        info!("Installing OLM");
        let mut resources = Vec::new();
        for m in &self.config.olm_manifests {
            self.apply_manifest(cancel, OLM, m).await?;
            let docs = manifest::decode_manifests(&m.data).map_err(|e| InstallError::Manifest {
                subject: OLM.to_string(),
                message: format!("{}: {:#}", m.name, e),
            })?;
            resources.extend(docs);
        }

        for deployment in [OLM_OPERATOR_DEPLOYMENT, CATALOG_OPERATOR_DEPLOYMENT] {
            self.wait_rollout(cancel, deployment).await?;
        }

        let subscriptions = resources
            .iter()
            .filter(|doc| manifest::is_kind(doc, OLM_GROUP, "Subscription"))
            .filter_map(|doc| {
                let name = manifest::name(doc)?;
                Some(NamespacedName::new(
                    manifest::namespace(doc).unwrap_or(OLM_NAMESPACE),
                    name,
                ))
            });
        for key in subscriptions {
            info!("Waiting for subscription/{} to install CSV", key.name);
            let csv = with_cancel(
                cancel,
                OLM,
                Stage::CsvSucceeded,
                self.gateway
                    .get_subscription_csv(&key, self.config.csv_timeout),
            )
            .await?;
            info!(
                "Waiting for clusterserviceversion/{} to reach 'Succeeded' phase",
                csv.name
            );
            with_cancel(
                cancel,
                OLM,
                Stage::CsvSucceeded,
                self.gateway.do_csv_wait(&csv, self.config.csv_timeout),
            )
            .await?;
        }

        self.wait_rollout(cancel, PACKAGESERVER_DEPLOYMENT).await?;
        info!("OLM has been installed");
        Ok(true)
    }

    /// Applies the catalog source and waits until the platform operator
    /// package can be resolved from it.
    pub async fn install_catalog(&self, cancel: &CancellationToken) -> Result<(), InstallError> {
        info!("Installing catalog");
        self.apply_manifest(cancel, CATALOG, &self.config.catalog_manifest)
            .await?;

        with_cancel(
            cancel,
            CATALOG,
            Stage::PackageSync,
            self.gateway.do_package_wait(
                OLM_NAMESPACE,
                PLATFORM_OPERATOR,
                self.config.package_timeout,
            ),
        )
        .await?;
        info!("Catalog has been installed");
        Ok(())
    }

    async fn wait_rollout(
        &self,
        cancel: &CancellationToken,
        deployment: &str,
    ) -> Result<(), InstallError> {
        let key = NamespacedName::new(OLM_NAMESPACE, deployment);
        with_cancel(
            cancel,
            OLM,
            Stage::Rollout,
            self.gateway.do_rollout_wait(&key, self.config.rollout_timeout),
        )
        .await
    }

    // apply is retried, the API server may still be digesting the CRDs
    async fn apply_manifest(
        &self,
        cancel: &CancellationToken,
        subject: &str,
        m: &Manifest,
    ) -> Result<(), InstallError> {
        debug!("applying {}", m.name);
        let last_error: Mutex<Option<K8sError>> = Mutex::new(None);
        let (gateway, slot) = (&self.gateway, &last_error);
        let policy = PollPolicy::new(self.config.apply_interval, self.config.apply_timeout);

        let res = poll_until(cancel, policy, move || async move {
            match gateway.apply_file(&m.data).await {
                Ok(()) => Ok(true),
                Err(K8sError::Manifest(msg)) => Err(K8sError::Manifest(msg)),
                Err(e) => {
                    warn!("cannot apply {}: {}, retrying", m.name, e);
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(e);
                    }
                    Ok(false)
                }
            }
        })
        .await;

        match res {
            Ok(()) => Ok(()),
            Err(PollError::Cancelled) => Err(InstallError::cancelled(subject, Stage::ManifestApply)),
            Err(PollError::Aborted(e)) => Err(InstallError::from_k8s(subject, Stage::ManifestApply, e)),
            Err(PollError::Timeout(_)) => {
                match last_error.into_inner().ok().flatten() {
                    Some(e) => Err(InstallError::from_k8s(subject, Stage::ManifestApply, e)),
                    None => Err(InstallError::timeout(subject, Stage::ManifestApply)),
                }
            }
        }
    }
}
