use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use log::debug;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use helpers::k8s_helpers::manifest;
use helpers::wait::{poll_until, PollError, PollPolicy};
use types::{
    engine_deployment_names,
    olm::{
        Approval, ClusterServiceVersion, ClusterServiceVersionSpec, ClusterServiceVersionStatus,
        InstallPlan, InstallPlanSpec, ObjectRef, OperatorGroup, OperatorGroupSpec, Subscription,
        SubscriptionStatus, CSV_PHASE_FAILED, CSV_PHASE_SUCCEEDED, OLM_GROUP,
    },
    InstallRequest, NamespacedName,
};

use super::{subscription_for, K8sError, KubeGateway};

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ApplyFile,
    GetDeployment,
    GetOperatorGroup,
    CreateOperatorGroup,
    CreateSubscription,
    GetSubscription,
    GetInstallPlan,
    UpdateInstallPlan,
    GetSubscriptionCsv,
    RolloutWait,
    PackageWait,
    CsvWait,
    ListEngineDeployments,
    RestartDeployment,
}

/// One recorded gateway call. `key` is the object the call was about, empty
/// for whole-file applies.
#[derive(Debug, Clone)]
pub struct GatewayCall {
    pub seq: u64,
    pub op: Op,
    pub key: String,
    pub at: Instant,
}

/// In-memory cluster that behaves like OLM closely enough to drive the
/// installer end to end.
///
/// A new subscription gets an unapproved install plan which becomes visible on
/// the subscription after `plan_delay` polls. Approving the plan creates the
/// CSV (Succeeded, or Failed for operators marked with [`fail_csv`]), records
/// it as installed on the subscription and creates any deployment registered
/// with [`deploy_on_approval`].
///
/// [`fail_csv`]: MemoryGateway::fail_csv
/// [`deploy_on_approval`]: MemoryGateway::deploy_on_approval
pub struct MemoryGateway {
    deployments: DashMap<NamespacedName, Deployment>,
    operator_groups: DashMap<NamespacedName, OperatorGroup>,
    subscriptions: DashMap<NamespacedName, Subscription>,
    install_plans: DashMap<NamespacedName, InstallPlan>,
    // install plan -> owning subscription name
    plan_owners: DashMap<NamespacedName, String>,
    csvs: DashMap<NamespacedName, ClusterServiceVersion>,
    packages: DashSet<NamespacedName>,
    subscription_polls: DashMap<NamespacedName, u32>,
    conflicts: DashMap<NamespacedName, u32>,
    approval_deployments: DashMap<String, String>,
    failing_csvs: DashSet<String>,
    applied: Mutex<Vec<Value>>,
    calls: Mutex<Vec<GatewayCall>>,

    catalog_packages: Vec<String>,
    engine_deployments: Vec<String>,
    plan_delay: u32,
    failing_applies: AtomicU32,
    unreachable: AtomicBool,
    resource_version: AtomicU64,
    seq: AtomicU64,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        MemoryGateway::new()
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        MemoryGateway {
            deployments: DashMap::new(),
            operator_groups: DashMap::new(),
            subscriptions: DashMap::new(),
            install_plans: DashMap::new(),
            plan_owners: DashMap::new(),
            csvs: DashMap::new(),
            packages: DashSet::new(),
            subscription_polls: DashMap::new(),
            conflicts: DashMap::new(),
            approval_deployments: DashMap::new(),
            failing_csvs: DashSet::new(),
            applied: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            catalog_packages: Vec::new(),
            engine_deployments: engine_deployment_names(),
            plan_delay: 0,
            failing_applies: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
            resource_version: AtomicU64::new(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of subscription polls that return no install plan reference.
    pub fn with_plan_delay(mut self, polls: u32) -> Self {
        self.plan_delay = polls;
        self
    }

    /// Packages that become visible once a CatalogSource is applied.
    pub fn with_catalog_packages<S: Into<String>>(mut self, packages: Vec<S>) -> Self {
        self.catalog_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_deployment(&self, namespace: &str, name: &str) {
        let mut deployment = Deployment::default();
        deployment.metadata.name = Some(name.to_string());
        deployment.metadata.namespace = Some(namespace.to_string());
        deployment.metadata.resource_version = Some(self.next_resource_version());
        self.deployments
            .insert(NamespacedName::new(namespace, name), deployment);
    }

    pub fn add_package(&self, namespace: &str, package: &str) {
        self.packages.insert(NamespacedName::new(namespace, package));
    }

    /// Creates `deployment` in the subscription's namespace when the install
    /// plan of `operator` gets approved.
    pub fn deploy_on_approval(&self, operator: &str, deployment: &str) {
        self.approval_deployments
            .insert(operator.to_string(), deployment.to_string());
    }

    /// The next `count` updates of the plan fail with `Conflict`, each one
    /// bumping the stored resourceVersion like a concurrent writer would.
    pub fn inject_conflicts(&self, namespace: &str, plan: &str, count: u32) {
        self.conflicts
            .insert(NamespacedName::new(namespace, plan), count);
    }

    pub fn fail_applies(&self, count: u32) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    /// CSVs installed for `operator` end up in the Failed phase.
    pub fn fail_csv(&self, operator: &str) {
        self.failing_csvs.insert(operator.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Points an existing subscription at a fresh, unapproved plan for `csv`,
    /// the way OLM does when a newer version shows up in the channel.
    pub fn stage_upgrade(&self, namespace: &str, subscription: &str, csv: &str) -> String {
        let plan_name = format!("upgrade-{}", csv);
        self.insert_plan(namespace, subscription, &plan_name, csv);
        let key = NamespacedName::new(namespace, subscription);
        if let Some(mut sub) = self.subscriptions.get_mut(&key) {
            let status = sub.status.get_or_insert_with(SubscriptionStatus::default);
            status.install_plan_ref = Some(plan_ref(namespace, &plan_name));
            status.current_csv = Some(csv.to_string());
            status.state = Some("UpgradePending".to_string());
        }
        plan_name
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_of(&self, op: Op) -> Vec<GatewayCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls_of(op).len()
    }

    pub fn applied_documents(&self) -> Vec<Value> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn install_plan(&self, namespace: &str, name: &str) -> Option<InstallPlan> {
        self.install_plans
            .get(&NamespacedName::new(namespace, name))
            .map(|p| p.clone())
    }

    pub fn subscription(&self, namespace: &str, name: &str) -> Option<Subscription> {
        self.subscriptions
            .get(&NamespacedName::new(namespace, name))
            .map(|s| s.clone())
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments
            .get(&NamespacedName::new(namespace, name))
            .map(|d| d.clone())
    }

    fn record(&self, op: Op, key: impl Into<String>) -> Result<(), K8sError> {
        let call = GatewayCall {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            op,
            key: key.into(),
            at: Instant::now(),
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(K8sError::Connection(
                "dial tcp 127.0.0.1:6443: connect: connection refused".to_string(),
            ));
        }
        Ok(())
    }

    fn next_resource_version(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn insert_plan(&self, namespace: &str, subscription: &str, plan_name: &str, csv: &str) {
        let mut plan = InstallPlan::new(
            plan_name,
            InstallPlanSpec {
                approval: Approval::Manual,
                approved: false,
                cluster_service_version_names: vec![csv.to_string()],
                generation: Some(1),
                ..Default::default()
            },
        );
        plan.metadata.namespace = Some(namespace.to_string());
        plan.metadata.resource_version = Some(self.next_resource_version());

        let key = NamespacedName::new(namespace, plan_name);
        self.install_plans.insert(key.clone(), plan);
        self.plan_owners.insert(key, subscription.to_string());
    }

    fn insert_csv(&self, namespace: &str, name: &str, phase: &str) {
        let mut csv = ClusterServiceVersion::new(name, ClusterServiceVersionSpec::default());
        csv.metadata.namespace = Some(namespace.to_string());
        csv.status = Some(ClusterServiceVersionStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        self.csvs.insert(NamespacedName::new(namespace, name), csv);
    }

    // what OLM does once a plan is approved
    fn complete_plan(&self, namespace: &str, plan: &InstallPlan) {
        let plan_key = NamespacedName::new(namespace, plan.name_any());
        let Some(owner) = self.plan_owners.get(&plan_key).map(|o| o.clone()) else {
            return;
        };

        let phase = if self.failing_csvs.contains(&owner) {
            CSV_PHASE_FAILED
        } else {
            CSV_PHASE_SUCCEEDED
        };
        for csv in &plan.spec.cluster_service_version_names {
            self.insert_csv(namespace, csv, phase);
        }

        if let Some(mut sub) = self
            .subscriptions
            .get_mut(&NamespacedName::new(namespace, &owner))
        {
            let status = sub.status.get_or_insert_with(SubscriptionStatus::default);
            status.installed_csv = plan.spec.cluster_service_version_names.first().cloned();
            status.state = Some("AtLatestKnown".to_string());
        }

        let deployment = self.approval_deployments.get(&owner).map(|d| d.clone());
        if let Some(deployment) = deployment {
            self.add_deployment(namespace, &deployment);
        }
    }

    fn store_applied(&self, doc: &Value) -> Result<(), K8sError> {
        let name = manifest::name(doc).unwrap_or_default().to_string();
        let namespace = manifest::namespace(doc).unwrap_or("default").to_string();

        match manifest::kind(doc) {
            Some("Deployment") => self.add_deployment(&namespace, &name),
            Some("Subscription") if manifest::is_kind(doc, OLM_GROUP, "Subscription") => {
                let mut sub: Subscription = serde_json::from_value(doc.clone())
                    .map_err(|e| K8sError::Manifest(e.to_string()))?;
                let csv = sub
                    .spec
                    .starting_csv
                    .clone()
                    .unwrap_or_else(|| format!("{}.v0.0.0", sub.spec.name));
                sub.metadata.namespace = Some(namespace.clone());
                sub.status = Some(SubscriptionStatus {
                    installed_csv: Some(csv.clone()),
                    current_csv: Some(csv.clone()),
                    ..Default::default()
                });
                self.insert_csv(&namespace, &csv, CSV_PHASE_SUCCEEDED);
                self.subscriptions
                    .insert(NamespacedName::new(&namespace, &name), sub);
            }
            Some("ClusterServiceVersion") => {
                self.insert_csv(&namespace, &name, CSV_PHASE_SUCCEEDED);
                let deployments = doc
                    .pointer("/spec/install/spec/deployments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for d in deployments {
                    if let Some(d) = d.get("name").and_then(Value::as_str) {
                        self.add_deployment(&namespace, d);
                    }
                }
            }
            Some("CatalogSource") => {
                for package in &self.catalog_packages {
                    self.add_package(&namespace, package);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn wait_for<F>(&self, what: String, timeout: Duration, check: F) -> Result<(), K8sError>
    where
        F: Fn() -> Result<bool, K8sError> + Send + Sync,
    {
        let res = poll_until(
            &CancellationToken::new(),
            PollPolicy::new(MEMORY_POLL_INTERVAL, timeout),
            || std::future::ready(check()),
        )
        .await;
        match res {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(e)) => Err(e),
            Err(_) => Err(K8sError::Timeout(what)),
        }
    }
}

fn plan_ref(namespace: &str, name: &str) -> ObjectRef {
    ObjectRef {
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        api_version: Some(format!("{}/v1alpha1", OLM_GROUP)),
        kind: Some("InstallPlan".to_string()),
        ..Default::default()
    }
}

fn not_found(resource: &str, name: &str) -> K8sError {
    K8sError::NotFound(format!("{} \"{}\" not found", resource, name))
}

#[async_trait]
impl KubeGateway for MemoryGateway {
    async fn apply_file(&self, data: &[u8]) -> Result<(), K8sError> {
        self.record(Op::ApplyFile, "")?;
        let failing = self
            .failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(K8sError::Api {
                code: 500,
                reason: "InternalError".to_string(),
                message: "simulated apply failure".to_string(),
            });
        }

        let docs =
            manifest::decode_manifests(data).map_err(|e| K8sError::Manifest(format!("{:#}", e)))?;
        for doc in &docs {
            self.store_applied(doc)?;
        }
        if let Ok(mut applied) = self.applied.lock() {
            applied.extend(docs);
        }
        Ok(())
    }

    async fn get_deployment(&self, name: &str, namespace: &str) -> Result<Deployment, K8sError> {
        self.record(Op::GetDeployment, format!("{}/{}", namespace, name))?;
        self.deployment(namespace, name)
            .ok_or_else(|| not_found("deployments.apps", name))
    }

    async fn get_operator_group(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<OperatorGroup, K8sError> {
        self.record(Op::GetOperatorGroup, format!("{}/{}", namespace, name))?;
        self.operator_groups
            .get(&NamespacedName::new(namespace, name))
            .map(|og| og.clone())
            .ok_or_else(|| not_found("operatorgroups.operators.coreos.com", name))
    }

    async fn create_operator_group(
        &self,
        namespace: &str,
        name: &str,
        target_namespaces: &[String],
    ) -> Result<OperatorGroup, K8sError> {
        self.record(Op::CreateOperatorGroup, format!("{}/{}", namespace, name))?;
        let key = NamespacedName::new(namespace, name);
        if self.operator_groups.contains_key(&key) {
            return Err(K8sError::AlreadyExists(format!(
                "operatorgroups.operators.coreos.com \"{}\" already exists",
                name
            )));
        }
        let mut og = OperatorGroup::new(
            name,
            OperatorGroupSpec {
                target_namespaces: (!target_namespaces.is_empty())
                    .then(|| target_namespaces.to_vec()),
            },
        );
        og.metadata.namespace = Some(namespace.to_string());
        og.metadata.resource_version = Some(self.next_resource_version());
        self.operator_groups.insert(key, og.clone());
        Ok(og)
    }

    async fn create_subscription_for_catalog(
        &self,
        req: &InstallRequest,
    ) -> Result<Subscription, K8sError> {
        self.record(Op::CreateSubscription, req.key().to_string())?;
        let key = req.key();
        if self.subscriptions.contains_key(&key) {
            return Err(K8sError::AlreadyExists(format!(
                "subscriptions.operators.coreos.com \"{}\" already exists",
                req.name
            )));
        }

        let mut sub = subscription_for(req);
        sub.metadata.resource_version = Some(self.next_resource_version());
        self.subscriptions.insert(key, sub.clone());

        let csv = req
            .starting_csv
            .clone()
            .unwrap_or_else(|| format!("{}.v1.0.0", req.name));
        let plan_name = format!("install-{}", req.name);
        self.insert_plan(&req.namespace, &req.name, &plan_name, &csv);
        debug!("memory: {} resolves to {}", req.key(), plan_name);
        Ok(sub)
    }

    async fn get_subscription(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Subscription, K8sError> {
        self.record(Op::GetSubscription, format!("{}/{}", namespace, name))?;
        let key = NamespacedName::new(namespace, name);
        let polls = {
            let mut polls = self.subscription_polls.entry(key.clone()).or_insert(0);
            *polls += 1;
            *polls
        };

        let mut sub = self
            .subscriptions
            .get_mut(&key)
            .ok_or_else(|| not_found("subscriptions.operators.coreos.com", name))?;
        let has_ref = sub.install_plan_name().is_some();
        if !has_ref && polls > self.plan_delay {
            let plan = self
                .plan_owners
                .iter()
                .find(|e| e.key().namespace == namespace && e.value() == name)
                .map(|e| e.key().name.clone());
            if let Some(plan) = plan {
                let status = sub.status.get_or_insert_with(SubscriptionStatus::default);
                status.install_plan_ref = Some(plan_ref(namespace, &plan));
                status.state = Some("UpgradePending".to_string());
            }
        }
        Ok(sub.clone())
    }

    async fn get_install_plan(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<InstallPlan, K8sError> {
        self.record(Op::GetInstallPlan, format!("{}/{}", namespace, name))?;
        self.install_plan(namespace, name)
            .ok_or_else(|| not_found("installplans.operators.coreos.com", name))
    }

    async fn update_install_plan(
        &self,
        namespace: &str,
        plan: &InstallPlan,
    ) -> Result<InstallPlan, K8sError> {
        let name = plan.name_any();
        self.record(Op::UpdateInstallPlan, format!("{}/{}", namespace, name))?;
        let key = NamespacedName::new(namespace, &name);

        let was_approved = {
            let mut stored = self
                .install_plans
                .get_mut(&key)
                .ok_or_else(|| not_found("installplans.operators.coreos.com", &name))?;

            let injected = self
                .conflicts
                .get_mut(&key)
                .map(|mut left| {
                    if *left > 0 {
                        *left -= 1;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if injected {
                stored.metadata.resource_version = Some(self.next_resource_version());
            }
            if injected || stored.metadata.resource_version != plan.metadata.resource_version {
                return Err(K8sError::Conflict(format!(
                    "Operation cannot be fulfilled on installplans.operators.coreos.com \"{}\": \
                     the object has been modified; please apply your changes to the latest version and try again",
                    name
                )));
            }

            let was_approved = stored.spec.approved;
            let mut updated = plan.clone();
            updated.metadata.resource_version = Some(self.next_resource_version());
            *stored = updated;
            was_approved
        };

        let updated = self
            .install_plan(namespace, &name)
            .ok_or_else(|| not_found("installplans.operators.coreos.com", &name))?;
        if !was_approved && updated.spec.approved {
            self.complete_plan(namespace, &updated);
        }
        Ok(updated)
    }

    async fn get_subscription_csv(
        &self,
        subscription: &NamespacedName,
        timeout: Duration,
    ) -> Result<NamespacedName, K8sError> {
        self.record(Op::GetSubscriptionCsv, subscription.to_string())?;
        let installed = || {
            self.subscriptions
                .get(subscription)
                .and_then(|s| s.installed_csv().map(str::to_string))
        };
        self.wait_for(
            format!("subscription/{} to install a CSV", subscription),
            timeout,
            || Ok(installed().is_some()),
        )
        .await?;
        installed()
            .map(|csv| NamespacedName::new(&subscription.namespace, csv))
            .ok_or_else(|| not_found("subscriptions.operators.coreos.com", &subscription.name))
    }

    async fn do_rollout_wait(
        &self,
        key: &NamespacedName,
        timeout: Duration,
    ) -> Result<(), K8sError> {
        self.record(Op::RolloutWait, key.to_string())?;
        self.wait_for(format!("deployment/{} rollout", key), timeout, || {
            Ok(self.deployments.contains_key(key))
        })
        .await
    }

    async fn do_package_wait(
        &self,
        namespace: &str,
        package: &str,
        timeout: Duration,
    ) -> Result<(), K8sError> {
        self.record(Op::PackageWait, format!("{}/{}", namespace, package))?;
        let key = NamespacedName::new(namespace, package);
        self.wait_for(format!("package {}", package), timeout, || {
            Ok(self.packages.contains(&key))
        })
        .await
    }

    async fn do_csv_wait(&self, key: &NamespacedName, timeout: Duration) -> Result<(), K8sError> {
        self.record(Op::CsvWait, key.to_string())?;
        self.wait_for(
            format!("clusterserviceversion/{} to reach 'Succeeded' phase", key),
            timeout,
            || match self.csvs.get(key) {
                Some(csv) if csv.is_failed() => Err(K8sError::Failed(format!(
                    "clusterserviceversion/{} failed",
                    key
                ))),
                Some(csv) => Ok(csv.is_succeeded()),
                None => Ok(false),
            },
        )
        .await
    }

    async fn list_engine_deployment_names(
        &self,
        namespace: &str,
    ) -> Result<Vec<String>, K8sError> {
        self.record(Op::ListEngineDeployments, namespace)?;
        let mut names: Vec<String> = self
            .deployments
            .iter()
            .filter(|e| e.key().namespace == namespace)
            .map(|e| e.key().name.clone())
            .filter(|name| self.engine_deployments.contains(name))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn restart_deployment(&self, name: &str, namespace: &str) -> Result<(), K8sError> {
        self.record(Op::RestartDeployment, format!("{}/{}", namespace, name))?;
        let mut deployment = self
            .deployments
            .get_mut(&NamespacedName::new(namespace, name))
            .ok_or_else(|| not_found("deployments.apps", name))?;

        let annotations: &mut BTreeMap<String, String> = deployment
            .spec
            .get_or_insert_with(Default::default)
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new);
        let restarts = annotations
            .get("keel.io/restarts")
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        annotations.insert("keel.io/restarts".to_string(), (restarts + 1).to_string());
        Ok(())
    }
}
