use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    runtime::wait::{await_condition, Condition},
};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use helpers::wait::{poll_until, PollError, PollPolicy};
use types::{
    olm::{ClusterServiceVersion, PackageManifest, Subscription},
    NamespacedName,
};

use super::error::K8sError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Same rules as `kubectl rollout status`: the controller observed the latest
/// generation, every replica is updated, no old replica is left and all of
/// them are available.
pub fn deployment_rolled_out(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let wanted = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    observed >= generation && updated >= wanted && total <= updated && available >= updated
}

pub fn is_deployment_rolled_out() -> impl Condition<Deployment> {
    |obj: Option<&Deployment>| obj.map(deployment_rolled_out).unwrap_or(false)
}

pub async fn wait_for_rollout(
    api: Api<Deployment>,
    key: &NamespacedName,
    timeout: Duration,
) -> Result<(), K8sError> {
    info!("waiting for deployment/{} to roll out", key);
    let res = tokio::time::timeout(timeout, await_condition(api, &key.name, is_deployment_rolled_out()))
        .await
        .map_err(|_| K8sError::Timeout(format!("deployment/{} rollout", key)))?;

    match res {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(K8sError::NotFound(format!("deployment/{}", key))),
        Err(e) => Err(K8sError::Failed(format!("watching deployment/{}: {}", key, e))),
    }
}

/// Polls the subscription until OLM records the CSV it installed.
pub async fn wait_for_subscription_csv(
    api: Api<Subscription>,
    key: &NamespacedName,
    timeout: Duration,
) -> Result<NamespacedName, K8sError> {
    let installed: Mutex<Option<String>> = Mutex::new(None);
    let (api, slot) = (&api, &installed);
    let res = poll_until(
        &CancellationToken::new(),
        PollPolicy::new(WAIT_POLL_INTERVAL, timeout),
        move || async move {
            match api.get(&key.name).await {
                Ok(sub) => {
                    let csv = sub.installed_csv().map(str::to_string);
                    let found = csv.is_some();
                    if let Ok(mut slot) = slot.lock() {
                        *slot = csv;
                    }
                    Ok(found)
                }
                Err(e) => {
                    let err = K8sError::from(e);
                    if err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(err)
                    }
                }
            }
        },
    )
    .await;

    let installed = installed.into_inner().ok().flatten();
    match res {
        Ok(()) => installed
            .map(|csv| NamespacedName::new(&key.namespace, csv))
            .ok_or_else(|| K8sError::Failed(format!("subscription/{} has no installed CSV", key))),
        Err(PollError::Aborted(e)) => Err(e),
        Err(_) => Err(K8sError::Timeout(format!("subscription/{} to install a CSV", key))),
    }
}

pub async fn wait_for_csv(
    api: Api<ClusterServiceVersion>,
    key: &NamespacedName,
    timeout: Duration,
) -> Result<(), K8sError> {
    info!("waiting for clusterserviceversion/{} to reach 'Succeeded' phase", key);
    let api = &api;
    let res = poll_until(
        &CancellationToken::new(),
        PollPolicy::new(WAIT_POLL_INTERVAL, timeout),
        move || async move {
            match api.get(&key.name).await {
                Ok(csv) if csv.is_failed() => {
                    let reason = csv
                        .status
                        .as_ref()
                        .and_then(|s| s.message.clone())
                        .unwrap_or_default();
                    Err(K8sError::Failed(format!(
                        "clusterserviceversion/{} failed: {}",
                        key, reason
                    )))
                }
                Ok(csv) => Ok(csv.is_succeeded()),
                Err(e) => {
                    let err = K8sError::from(e);
                    if err.is_not_found() {
                        Ok(false)
                    } else {
                        Err(err)
                    }
                }
            }
        },
    )
    .await;

    match res {
        Ok(()) => Ok(()),
        Err(PollError::Aborted(e)) => Err(e),
        Err(_) => Err(K8sError::Timeout(format!(
            "clusterserviceversion/{} to reach 'Succeeded' phase",
            key
        ))),
    }
}

/// Waits until packageserver lists `package`. Errors are expected while the
/// catalog pod starts, so they only delay the wait.
pub async fn wait_for_package(
    api: Api<PackageManifest>,
    package: &str,
    timeout: Duration,
) -> Result<(), K8sError> {
    info!("waiting for package {} to be available", package);
    let api = &api;
    let res: Result<(), PollError<K8sError>> = poll_until(
        &CancellationToken::new(),
        PollPolicy::new(WAIT_POLL_INTERVAL, timeout),
        move || async move {
            match api.get(package).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    debug!("package {} not available yet: {}", package, e);
                    Ok(false)
                }
            }
        },
    )
    .await;

    res.map_err(|_| K8sError::Timeout(format!("package {}", package)))
}
