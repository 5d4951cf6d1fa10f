use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use helpers::wait::{poll_until, PollError, PollPolicy};
use types::{InstallRequest, NamespacedName};

use crate::config::CompletionPolicy;
use crate::error::{with_cancel, InstallError, Stage};
use crate::k8s_manager::{K8sError, KubeGateway};

/// Point at which an operator install returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallState {
    PlanApproved,
    CsvSucceeded,
}

/// Subscribes to an operator and approves the install plan OLM resolves for it.
#[derive(Clone)]
pub struct ApprovalEngine {
    gateway: Arc<dyn KubeGateway>,
    poll: PollPolicy,
    completion: CompletionPolicy,
}

impl ApprovalEngine {
    pub fn new(gateway: Arc<dyn KubeGateway>, poll: PollPolicy, completion: CompletionPolicy) -> Self {
        ApprovalEngine {
            gateway,
            poll,
            completion,
        }
    }

    pub async fn install_operator(
        &self,
        cancel: &CancellationToken,
        req: &InstallRequest,
    ) -> Result<InstallState, InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(&req.name, Stage::OperatorGroup));
        }

        self.ensure_operator_group(req).await?;
        self.ensure_subscription(req).await?;

        info!("Waiting for install plan of {}", req.name);
        self.approve_install_plan(cancel, &req.namespace, &req.name)
            .await?;

        match self.completion {
            CompletionPolicy::PlanApproved => Ok(InstallState::PlanApproved),
            CompletionPolicy::CsvSucceeded { timeout } => {
                let csv = with_cancel(
                    cancel,
                    &req.name,
                    Stage::CsvSucceeded,
                    self.gateway.get_subscription_csv(&req.key(), timeout),
                )
                .await?;
                info!(
                    "Waiting for clusterserviceversion/{} to reach 'Succeeded' phase",
                    csv.name
                );
                with_cancel(
                    cancel,
                    &req.name,
                    Stage::CsvSucceeded,
                    self.gateway.do_csv_wait(&csv, timeout),
                )
                .await?;
                Ok(InstallState::CsvSucceeded)
            }
        }
    }

    /// Approves a pending upgrade plan of an installed operator. Returns false
    /// when the plan the subscription points at is already approved.
    pub async fn upgrade_operator(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<bool, InstallError> {
        if cancel.is_cancelled() {
            return Err(InstallError::cancelled(name, Stage::InstallPlanApproval));
        }
        info!("Looking for an upgrade of {}", NamespacedName::new(namespace, name));
        let approved = self.approve_install_plan(cancel, namespace, name).await?;
        if !approved {
            info!("{} is up to date", name);
        }
        Ok(approved)
    }

    async fn ensure_operator_group(&self, req: &InstallRequest) -> Result<(), InstallError> {
        let subject = req.name.as_str();
        match self
            .gateway
            .get_operator_group(&req.namespace, &req.operator_group)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(InstallError::from_k8s(subject, Stage::OperatorGroup, e)),
        }

        info!(
            "Creating operator group {}/{}",
            req.namespace, req.operator_group
        );
        match self
            .gateway
            .create_operator_group(&req.namespace, &req.operator_group, &req.target_namespaces)
            .await
        {
            Ok(_) => Ok(()),
            // another install created it in between
            Err(K8sError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(InstallError::from_k8s(subject, Stage::OperatorGroup, e)),
        }
    }

    async fn ensure_subscription(&self, req: &InstallRequest) -> Result<(), InstallError> {
        match self.gateway.create_subscription_for_catalog(req).await {
            Ok(_) => {
                info!("Subscribed to {} ({})", req.name, req.channel);
                Ok(())
            }
            Err(K8sError::AlreadyExists(_)) => {
                info!("Subscription {} already exists", req.key());
                Ok(())
            }
            Err(e) => Err(InstallError::from_k8s(&req.name, Stage::Subscription, e)),
        }
    }

    // Returns whether this call approved the plan. A conflicting update is
    // retried on the next tick with a freshly fetched plan.
    async fn approve_install_plan(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<bool, InstallError> {
        let approved_here = AtomicBool::new(false);
        let (gateway, flag) = (&self.gateway, &approved_here);

        let res = poll_until(cancel, self.poll, move || async move {
            let sub = match gateway.get_subscription(namespace, name).await {
                Ok(sub) => sub,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            let Some(plan_name) = sub.install_plan_name() else {
                debug!("subscription {}/{} has no install plan yet", namespace, name);
                return Ok(false);
            };

            let mut plan = match gateway.get_install_plan(namespace, plan_name).await {
                Ok(plan) => plan,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            if plan.is_approved() {
                return Ok(true);
            }

            info!("Approving install plan {}/{}", namespace, plan_name);
            plan.spec.approved = true;
            match gateway.update_install_plan(namespace, &plan).await {
                Ok(_) => {
                    flag.store(true, Ordering::SeqCst);
                    Ok(true)
                }
                Err(e) if e.is_conflict() => {
                    debug!("install plan {} changed underneath us: {}", plan_name, e);
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
        .await;

        match res {
            Ok(()) => Ok(approved_here.load(Ordering::SeqCst)),
            Err(PollError::Cancelled) => {
                Err(InstallError::cancelled(name, Stage::InstallPlanApproval))
            }
            Err(PollError::Timeout(_)) => Err(InstallError::timeout(name, Stage::InstallPlanApproval)),
            Err(PollError::Aborted(e)) => {
                Err(InstallError::from_k8s(name, Stage::InstallPlanApproval, e))
            }
        }
    }
}
