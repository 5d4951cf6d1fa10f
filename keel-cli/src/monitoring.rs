use std::sync::Arc;

use anyhow::Result;
use helpers::k8s_helpers::kubernetes::validate_namespace;
use helpers::wait::PollPolicy;
use tokio_util::sync::CancellationToken;

use keel::config::MonitoringConfig;
use keel::monitoring_manager::MonitoringProvisioner;
use keel::{ApprovalEngine, CompletionPolicy, KubeGateway};

use crate::{connect, GlobalArgs, MonitoringArgs};

pub async fn monitoring(
    global: &GlobalArgs,
    args: &MonitoringArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_namespace(&args.namespace, &[])?;
    let gateway: Arc<dyn KubeGateway> = connect(global).await?;

    let engine = ApprovalEngine::new(
        gateway.clone(),
        PollPolicy::default(),
        CompletionPolicy::PlanApproved,
    );
    let config = MonitoringConfig {
        namespace: args.namespace.clone(),
        channel: args.channel.clone(),
        ..Default::default()
    };
    MonitoringProvisioner::new(gateway, engine, config)
        .provision(cancel)
        .await?;

    println!("Monitoring has been provisioned in namespace {}", args.namespace);
    Ok(())
}
