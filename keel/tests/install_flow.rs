use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use helpers::wait::PollPolicy;
use keel::config::{BootstrapConfig, EngineSelection, InstallerConfig};
use keel::k8s_manager::memory::{MemoryGateway, Op};
use keel::{
    ApprovalEngine, CompletionPolicy, InstallCoordinator, InstallError, InstallManager, Stage,
};
use helpers::k8s_helpers::manifest;
use types::{
    Engine, InstallRequest, OLM_NAMESPACE, PLATFORM_OPERATOR, PLATFORM_OPERATOR_CHANNEL,
    PLATFORM_OPERATOR_DEPLOYMENT, SYSTEM_NAMESPACE,
};

const NS: &str = "dbs";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_poll() -> PollPolicy {
    PollPolicy::new(Duration::from_millis(10), Duration::from_secs(2))
}

fn engine(gw: &Arc<MemoryGateway>, completion: CompletionPolicy) -> ApprovalEngine {
    ApprovalEngine::new(gw.clone(), fast_poll(), completion)
}

fn coordinator(gw: &Arc<MemoryGateway>, concurrency: usize) -> InstallCoordinator {
    InstallCoordinator::new(
        gw.clone(),
        engine(gw, CompletionPolicy::PlanApproved),
        concurrency,
    )
}

fn engine_request(e: Engine) -> InstallRequest {
    InstallRequest::new(NS, e.package(), e.default_channel())
}

fn platform_request() -> InstallRequest {
    InstallRequest::new(NS, PLATFORM_OPERATOR, PLATFORM_OPERATOR_CHANNEL)
}

fn all_engines() -> Vec<InstallRequest> {
    Engine::ALL.iter().copied().map(engine_request).collect()
}

/// Gateway where approving an engine's plan brings up its controller.
fn cluster_gateway() -> MemoryGateway {
    let gw = MemoryGateway::new().with_plan_delay(1);
    for e in Engine::ALL {
        gw.deploy_on_approval(e.package(), e.deployment());
    }
    gw.deploy_on_approval(PLATFORM_OPERATOR, PLATFORM_OPERATOR_DEPLOYMENT);
    gw
}

fn cluster() -> Arc<MemoryGateway> {
    Arc::new(cluster_gateway())
}

#[tokio::test]
async fn fresh_namespace_approves_each_plan_once_without_restart() {
    init_logger();
    let gw = cluster();

    let report = coordinator(&gw, 1)
        .install_batch(
            &CancellationToken::new(),
            NS,
            vec![engine_request(Engine::Mysql)],
            platform_request(),
        )
        .await
        .unwrap();

    assert_eq!(
        report.installed,
        vec!["percona-xtradb-cluster-operator", PLATFORM_OPERATOR]
    );
    assert!(report.before.is_empty());
    assert_eq!(report.after, vec!["percona-xtradb-cluster-operator"]);
    assert!(!report.restarted);

    let updates: Vec<String> = gw
        .calls_of(Op::UpdateInstallPlan)
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(
        updates,
        vec![
            "dbs/install-percona-xtradb-cluster-operator".to_string(),
            format!("dbs/install-{}", PLATFORM_OPERATOR),
        ]
    );
    assert_eq!(gw.count(Op::RestartDeployment), 0);
}

#[tokio::test]
async fn conflicting_update_is_retried_on_a_fresh_plan() {
    init_logger();
    let gw = cluster();
    gw.inject_conflicts(NS, "install-percona-server-mongodb-operator", 1);

    coordinator(&gw, 1)
        .install_batch(
            &CancellationToken::new(),
            NS,
            vec![engine_request(Engine::Mongodb)],
            platform_request(),
        )
        .await
        .unwrap();

    let plan_calls: Vec<Op> = gw
        .calls()
        .into_iter()
        .filter(|c| c.key.ends_with("install-percona-server-mongodb-operator"))
        .map(|c| c.op)
        .collect();
    assert_eq!(
        plan_calls,
        vec![
            Op::GetInstallPlan,
            Op::UpdateInstallPlan,
            Op::GetInstallPlan,
            Op::UpdateInstallPlan
        ]
    );
    assert!(gw
        .install_plan(NS, "install-percona-server-mongodb-operator")
        .unwrap()
        .spec
        .approved);
}

#[tokio::test]
async fn new_engine_next_to_existing_ones_restarts_platform_once() {
    init_logger();
    let gw = cluster();
    gw.add_deployment(NS, Engine::Mysql.deployment());
    gw.add_deployment(NS, PLATFORM_OPERATOR_DEPLOYMENT);

    let report = coordinator(&gw, 1)
        .install_batch(
            &CancellationToken::new(),
            NS,
            vec![engine_request(Engine::Postgresql)],
            platform_request(),
        )
        .await
        .unwrap();

    assert_eq!(report.before, vec!["percona-xtradb-cluster-operator"]);
    assert_eq!(
        report.after,
        vec!["percona-postgresql-operator", "percona-xtradb-cluster-operator"]
    );
    assert!(report.restarted);

    let restarts = gw.calls_of(Op::RestartDeployment);
    assert_eq!(restarts.len(), 1);
    assert_eq!(restarts[0].key, format!("{}/{}", NS, PLATFORM_OPERATOR_DEPLOYMENT));
}

#[tokio::test]
async fn unchanged_engines_do_not_restart() {
    let gw = cluster();
    gw.add_deployment(NS, Engine::Mysql.deployment());

    let report = coordinator(&gw, 1)
        .install_batch(
            &CancellationToken::new(),
            NS,
            vec![engine_request(Engine::Mysql)],
            platform_request(),
        )
        .await
        .unwrap();

    assert_eq!(report.before, report.after);
    assert!(!report.restarted);
    assert_eq!(gw.count(Op::RestartDeployment), 0);
}

#[tokio::test]
async fn cancelled_batch_makes_no_calls() {
    let gw = cluster();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = coordinator(&gw, 1)
        .install_batch(&cancel, NS, all_engines(), platform_request())
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn limit_one_never_overlaps_approval_cycles() {
    init_logger();
    let gw = Arc::new(MemoryGateway::new().with_plan_delay(3));

    coordinator(&gw, 1)
        .install_batch(&CancellationToken::new(), NS, all_engines(), platform_request())
        .await
        .unwrap();

    let calls = gw.calls();
    let mut spans: Vec<(u64, u64)> = Engine::ALL
        .iter()
        .map(|e| {
            let seqs: Vec<u64> = calls
                .iter()
                .filter(|c| c.key.contains(e.package()))
                .map(|c| c.seq)
                .collect();
            (seqs[0], seqs[seqs.len() - 1])
        })
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 < pair[1].0,
            "approval cycles overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(gw.count(Op::UpdateInstallPlan), 4);
}

#[tokio::test]
async fn wider_limit_installs_everything() {
    let gw = cluster();

    let report = coordinator(&gw, 3)
        .install_batch(&CancellationToken::new(), NS, all_engines(), platform_request())
        .await
        .unwrap();

    assert_eq!(report.installed.len(), 4);
    assert_eq!(report.after.len(), 3);
    assert_eq!(gw.count(Op::UpdateInstallPlan), 4);
}

#[tokio::test]
async fn first_failure_cancels_the_remaining_engines() {
    init_logger();
    let gw = cluster();
    gw.fail_csv(Engine::Mysql.package());
    let coordinator = InstallCoordinator::new(
        gw.clone(),
        engine(
            &gw,
            CompletionPolicy::CsvSucceeded {
                timeout: Duration::from_millis(200),
            },
        ),
        1,
    );

    let err = coordinator
        .install_batch(&CancellationToken::new(), NS, all_engines(), platform_request())
        .await
        .unwrap_err();

    assert_eq!(err.subject(), Engine::Mysql.package());
    assert!(matches!(
        err,
        InstallError::Kube {
            stage: Stage::CsvSucceeded,
            ..
        }
    ));
    assert!(gw.subscription(NS, Engine::Mongodb.package()).is_none());
    assert!(gw.subscription(NS, Engine::Postgresql.package()).is_none());
    assert!(gw.subscription(NS, PLATFORM_OPERATOR).is_none());
}

#[tokio::test]
async fn unreachable_cluster_reports_connection_error() {
    let gw = cluster();
    gw.set_unreachable(true);

    let err = coordinator(&gw, 1)
        .install_batch(&CancellationToken::new(), NS, all_engines(), platform_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        InstallError::Connection {
            stage: Stage::Snapshot,
            ..
        }
    ));
    assert!(err.to_string().contains("Make sure Kubernetes is running"));
}

fn manager_config() -> InstallerConfig {
    InstallerConfig {
        namespaces: vec![NS.to_string()],
        engines: vec![
            EngineSelection::new(Engine::Mysql),
            EngineSelection::new(Engine::Postgresql),
        ],
        monitoring: true,
        poll: fast_poll(),
        bootstrap: BootstrapConfig {
            apply_interval: Duration::from_millis(10),
            apply_timeout: Duration::from_millis(200),
            rollout_timeout: Duration::from_millis(200),
            csv_timeout: Duration::from_millis(200),
            package_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn full_install_bootstraps_olm_catalog_monitoring_and_operators() {
    init_logger();
    let gw = Arc::new(
        MemoryGateway::new()
            .with_plan_delay(1)
            .with_catalog_packages(vec![PLATFORM_OPERATOR]),
    );

    let reports = InstallManager::new(gw.clone(), manager_config())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].namespace, NS);
    assert_eq!(
        reports[0].installed,
        vec![
            "percona-xtradb-cluster-operator",
            "percona-postgresql-operator",
            PLATFORM_OPERATOR
        ]
    );
    assert!(gw.deployment(OLM_NAMESPACE, "packageserver").is_some());
    assert!(gw
        .subscription("keel-monitoring", types::METRICS_AGENT_OPERATOR)
        .is_some());

    let platform = gw.subscription(SYSTEM_NAMESPACE, PLATFORM_OPERATOR).unwrap();
    let env = platform.spec.config.unwrap().env;
    assert!(env
        .iter()
        .any(|v| v.name == "DISABLE_TELEMETRY" && v.value.as_deref() == Some("false")));

    // OLM bootstrap happens before any subscription
    let calls = gw.calls();
    let first_sub = calls
        .iter()
        .position(|c| c.op == Op::CreateSubscription)
        .unwrap();
    let last_rollout = calls
        .iter()
        .rposition(|c| c.op == Op::RolloutWait)
        .unwrap();
    assert!(last_rollout < first_sub);
}

#[tokio::test]
async fn second_full_install_is_idempotent() {
    let gw = Arc::new(MemoryGateway::new().with_catalog_packages(vec![PLATFORM_OPERATOR]));
    let mut config = manager_config();
    config.monitoring = false;
    let manager = InstallManager::new(gw.clone(), config);

    manager.run(&CancellationToken::new()).await.unwrap();
    let applies = gw.count(Op::ApplyFile);
    manager.run(&CancellationToken::new()).await.unwrap();

    // OLM is detected and skipped, only catalog and namespaces are re-applied
    assert_eq!(gw.count(Op::ApplyFile), applies + 3);
    assert_eq!(gw.count(Op::UpdateInstallPlan), 3);
    assert_eq!(gw.count(Op::CreateOperatorGroup), 2);
}

#[tokio::test]
async fn every_db_namespace_gets_its_engines_and_one_platform_operator() {
    init_logger();
    let gw = Arc::new(cluster_gateway().with_catalog_packages(vec![PLATFORM_OPERATOR]));
    let mut config = manager_config();
    config.namespaces = vec!["dbs".to_string(), "analytics".to_string()];
    config.engines = vec![EngineSelection::new(Engine::Mysql)];
    config.install_olm = false;
    config.monitoring = false;

    let reports = InstallManager::new(gw.clone(), config)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let namespaces: Vec<&str> = reports.iter().map(|r| r.namespace.as_str()).collect();
    assert_eq!(namespaces, vec!["dbs", "analytics"]);
    for report in &reports {
        assert_eq!(report.after, vec!["percona-xtradb-cluster-operator"]);
        assert!(!report.restarted);
    }
    assert!(gw.subscription("dbs", Engine::Mysql.package()).is_some());
    assert!(gw.subscription("analytics", Engine::Mysql.package()).is_some());

    let groups: Vec<String> = gw
        .calls_of(Op::CreateOperatorGroup)
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(
        groups,
        vec![
            "dbs/keel-databases".to_string(),
            "keel-system/keel-system".to_string(),
            "analytics/keel-databases".to_string(),
        ]
    );

    // the platform operator is approved once and watches both namespaces
    assert_eq!(
        gw.calls_of(Op::UpdateInstallPlan)
            .iter()
            .filter(|c| c.key.ends_with(PLATFORM_OPERATOR))
            .count(),
        1
    );
    assert!(gw.subscription("dbs", PLATFORM_OPERATOR).is_none());
    let platform = gw.subscription(SYSTEM_NAMESPACE, PLATFORM_OPERATOR).unwrap();
    let env = platform.spec.config.unwrap().env;
    assert!(env
        .iter()
        .any(|v| v.name == "DB_NAMESPACES" && v.value.as_deref() == Some("dbs,analytics")));

    let created: Vec<String> = gw
        .applied_documents()
        .iter()
        .filter(|d| manifest::kind(d) == Some("Namespace"))
        .filter_map(|d| manifest::name(d).map(str::to_string))
        .collect();
    assert_eq!(created, vec![SYSTEM_NAMESPACE, "dbs", "analytics"]);
}

#[tokio::test]
async fn skip_olm_goes_straight_to_the_catalog() {
    let gw = Arc::new(MemoryGateway::new().with_catalog_packages(vec![PLATFORM_OPERATOR]));
    let mut config = manager_config();
    config.install_olm = false;
    config.monitoring = false;

    InstallManager::new(gw.clone(), config)
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(gw.count(Op::GetDeployment), 0);
    assert_eq!(gw.count(Op::RolloutWait), 0);
}
