use anyhow::{Context, Result};

use helpers::k8s_helpers::kubernetes::cluster_type_from_provisioners;
use keel::KubeGateway;
use types::{OLM_NAMESPACE, OLM_OPERATOR_DEPLOYMENT};

use crate::{connect, GlobalArgs};

/// Checks that the API server answers and whether OLM is already there, so the
/// user knows if `install --skip-olm` is an option.
pub async fn check_environment(global: &GlobalArgs) -> Result<()> {
    let client = connect(global).await?;

    let version = client.apiserver_version().await.context(
        "Kubernetes is not reachable. Make sure Kubernetes is running and is accessible from this computer/server",
    )?;
    println!("Kubernetes API server {} is reachable", version);

    match client.storage_provisioners().await {
        Ok(provisioners) => println!(
            "cluster type: {}",
            cluster_type_from_provisioners(&provisioners)
        ),
        Err(e) => println!("could not detect the cluster type: {}", e),
    }

    match client
        .get_deployment(OLM_OPERATOR_DEPLOYMENT, OLM_NAMESPACE)
        .await
    {
        Ok(_) => println!("OLM is installed"),
        Err(e) if e.is_not_found() => println!("OLM is not installed, `keel install` will install it"),
        Err(e) => return Err(e).context("could not check for OLM"),
    }
    Ok(())
}
