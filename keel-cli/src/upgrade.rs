use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helpers::wait::{PollPolicy, DEFAULT_POLL_INTERVAL};
use tokio_util::sync::CancellationToken;

use keel::{ApprovalEngine, CompletionPolicy, KubeGateway};

use crate::{connect, GlobalArgs, UpgradeArgs};

pub async fn upgrade(global: &GlobalArgs, args: &UpgradeArgs, cancel: &CancellationToken) -> Result<()> {
    let gateway: Arc<dyn KubeGateway> = connect(global).await?;
    let engine = ApprovalEngine::new(
        gateway,
        PollPolicy::new(DEFAULT_POLL_INTERVAL, Duration::from_secs(args.timeout)),
        CompletionPolicy::PlanApproved,
    );

    if engine
        .upgrade_operator(cancel, &args.namespace, &args.operator)
        .await?
    {
        println!("Upgrade of {} approved", args.operator);
    } else {
        println!("{} has no pending upgrade", args.operator);
    }
    Ok(())
}
