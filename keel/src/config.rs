use std::time::Duration;

use helpers::wait::PollPolicy;
use types::{
    Engine, DEFAULT_NAMESPACE, METRICS_AGENT_CHANNEL, MONITORING_NAMESPACE,
    PLATFORM_OPERATOR_CHANNEL, SYSTEM_NAMESPACE,
};

use crate::manifests::{self, Manifest};

/// When an operator install counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// done once the install plan is approved
    #[default]
    PlanApproved,
    /// additionally wait for the installed CSV to reach `Succeeded`
    CsvSucceeded { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub apply_interval: Duration,
    pub apply_timeout: Duration,
    pub rollout_timeout: Duration,
    pub csv_timeout: Duration,
    pub package_timeout: Duration,
    pub olm_manifests: Vec<Manifest>,
    pub catalog_manifest: Manifest,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            apply_interval: Duration::from_secs(1),
            apply_timeout: Duration::from_secs(30),
            rollout_timeout: Duration::from_secs(300),
            csv_timeout: Duration::from_secs(300),
            package_timeout: Duration::from_secs(300),
            olm_manifests: manifests::olm_manifests(),
            catalog_manifest: manifests::catalog_manifest(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub namespace: String,
    pub channel: String,
    pub retries: u32,
    pub backoff: Duration,
    pub manifests: Vec<Manifest>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            namespace: MONITORING_NAMESPACE.to_string(),
            channel: METRICS_AGENT_CHANNEL.to_string(),
            retries: 3,
            backoff: Duration::from_secs(10),
            manifests: manifests::monitoring_manifests(),
        }
    }
}

/// Engine operator selected for install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSelection {
    pub engine: Engine,
    pub channel: String,
}

impl EngineSelection {
    pub fn new(engine: Engine) -> Self {
        EngineSelection {
            engine,
            channel: engine.default_channel().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// DB namespaces; each gets the selected engine operators
    pub namespaces: Vec<String>,
    /// where the platform operator runs
    pub system_namespace: String,
    pub engines: Vec<EngineSelection>,
    pub platform_channel: String,
    pub install_olm: bool,
    pub monitoring: bool,
    pub disable_telemetry: bool,
    pub concurrency: usize,
    pub completion: CompletionPolicy,
    pub poll: PollPolicy,
    pub bootstrap: BootstrapConfig,
    pub monitoring_config: MonitoringConfig,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        InstallerConfig {
            namespaces: vec![DEFAULT_NAMESPACE.to_string()],
            system_namespace: SYSTEM_NAMESPACE.to_string(),
            engines: Engine::ALL.iter().copied().map(EngineSelection::new).collect(),
            platform_channel: PLATFORM_OPERATOR_CHANNEL.to_string(),
            install_olm: true,
            monitoring: false,
            disable_telemetry: false,
            concurrency: 1,
            completion: CompletionPolicy::default(),
            poll: PollPolicy::default(),
            bootstrap: BootstrapConfig::default(),
            monitoring_config: MonitoringConfig::default(),
        }
    }
}
