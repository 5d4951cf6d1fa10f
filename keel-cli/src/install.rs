use std::time::Duration;

use anyhow::{bail, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use helpers::k8s_helpers::kubernetes::validate_namespaces;
use helpers::wait::{PollPolicy, DEFAULT_POLL_INTERVAL};
use keel::config::{EngineSelection, InstallerConfig, MonitoringConfig};
use keel::{CompletionPolicy, InstallManager, KubeGateway};
use types::{Engine, DISABLE_TELEMETRY_ENV, MONITORING_NAMESPACE, OLM_NAMESPACE, SYSTEM_NAMESPACE};

use crate::{connect, GlobalArgs, InstallArgs};

/// namespaces the installer owns and never installs engines into
pub const RESERVED_NAMESPACES: [&str; 4] = [
    SYSTEM_NAMESPACE,
    OLM_NAMESPACE,
    MONITORING_NAMESPACE,
    "kube-system",
];

/// Only the literal `true` opts out; any other value keeps telemetry on.
fn telemetry_disabled(flag: bool, env: Option<&str>) -> bool {
    flag || env == Some("true")
}

/// `telemetry_env` is the value of `DISABLE_TELEMETRY`, if set.
pub fn installer_config(args: &InstallArgs, telemetry_env: Option<&str>) -> Result<InstallerConfig> {
    let namespaces = validate_namespaces(&args.namespaces, &RESERVED_NAMESPACES)?;
    if args.concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let mut engines = Vec::new();
    for (enabled, engine, channel) in [
        (args.operator_mysql, Engine::Mysql, &args.channel_mysql),
        (args.operator_mongodb, Engine::Mongodb, &args.channel_mongodb),
        (args.operator_postgresql, Engine::Postgresql, &args.channel_postgresql),
    ] {
        if enabled {
            engines.push(EngineSelection {
                engine,
                channel: channel.clone(),
            });
        }
    }
    if engines.is_empty() {
        bail!("at least one database operator must be selected");
    }

    let timeout = Duration::from_secs(args.timeout);
    let completion = if args.wait_for_csv {
        CompletionPolicy::CsvSucceeded { timeout }
    } else {
        CompletionPolicy::PlanApproved
    };

    Ok(InstallerConfig {
        namespaces,
        engines,
        platform_channel: args.channel_platform.clone(),
        install_olm: !args.skip_olm,
        monitoring: args.monitoring,
        disable_telemetry: telemetry_disabled(args.disable_telemetry, telemetry_env),
        concurrency: args.concurrency,
        completion,
        poll: PollPolicy::new(DEFAULT_POLL_INTERVAL, timeout),
        monitoring_config: MonitoringConfig {
            channel: args.channel_monitoring.clone(),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub async fn install(global: &GlobalArgs, args: &InstallArgs, cancel: &CancellationToken) -> Result<()> {
    let telemetry_env = std::env::var(DISABLE_TELEMETRY_ENV).ok();
    let config = installer_config(args, telemetry_env.as_deref())?;
    let gateway: std::sync::Arc<dyn KubeGateway> = connect(global).await?;

    let engines: Vec<String> = config.engines.iter().map(|e| e.engine.to_string()).collect();
    info!(
        "Installing {} into namespaces {}",
        engines.join(", "),
        config.namespaces.join(", ")
    );

    let reports = InstallManager::new(gateway, config).run(cancel).await?;

    for report in &reports {
        println!(
            "Installed operators in {}: {}",
            report.namespace,
            report.installed.join(", ")
        );
    }
    if reports.iter().any(|r| r.restarted) {
        println!("Restarted the platform operator to pick up new database engines");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: InstallArgs,
    }

    fn parse(extra: &[&str]) -> InstallArgs {
        let argv = std::iter::once("install").chain(extra.iter().copied());
        Wrapper::parse_from(argv).args
    }

    #[test]
    fn rejects_reserved_and_invalid_namespaces() {
        assert!(installer_config(&parse(&["--namespaces", "olm"]), None).is_err());
        assert!(installer_config(&parse(&["--namespaces", "dbs,keel-system"]), None).is_err());
        assert!(installer_config(&parse(&["--namespaces", "Bad_Name"]), None).is_err());
        assert!(installer_config(&parse(&["--namespaces", "dbs"]), None).is_ok());
    }

    #[test]
    fn takes_a_namespace_list() {
        let config = installer_config(&parse(&["--namespaces", "dbs, analytics,dbs"]), None).unwrap();
        assert_eq!(config.namespaces, vec!["dbs", "analytics"]);
        assert_eq!(config.system_namespace, SYSTEM_NAMESPACE);
    }

    #[test]
    fn only_literal_true_disables_telemetry() {
        let args = parse(&[]);
        for value in ["1", "yes", "", "TRUE"] {
            let config = installer_config(&args, Some(value)).unwrap();
            assert!(!config.disable_telemetry, "{:?} should keep telemetry", value);
        }
        assert!(installer_config(&args, Some("true")).unwrap().disable_telemetry);
        assert!(!installer_config(&args, None).unwrap().disable_telemetry);
        assert!(installer_config(&parse(&["--disable-telemetry"]), None).unwrap().disable_telemetry);
    }

    #[test]
    fn needs_one_engine() {
        let args = parse(&[
            "--operator-mysql=false",
            "--operator-mongodb=false",
            "--operator-postgresql=false",
        ]);
        assert!(installer_config(&args, None).is_err());
    }

    #[test]
    fn maps_flags_onto_config() {
        let args = parse(&[
            "--operator-mysql=false",
            "--skip-olm",
            "--wait-for-csv",
            "--timeout",
            "30",
        ]);
        let config = installer_config(&args, None).unwrap();

        assert!(!config.install_olm);
        assert_eq!(config.engines.len(), 2);
        assert_eq!(
            config.completion,
            CompletionPolicy::CsvSucceeded {
                timeout: Duration::from_secs(30)
            }
        );
        assert_eq!(config.poll.timeout, Duration::from_secs(30));
    }
}
