//! In-process clusters talking over real TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use cairn_core::{
    BoxError, PluginDescriptor, PluginError, Provided, Service, ServiceInterface, setup_fn,
    sync_setup,
};
use cairn_framework::PluginCatalog;
use cairn_runtime::{
    CairnConfig, Cluster, ClusterPlan, ClusterState, ContainerConfig, InProcessLauncher,
    RuntimeError,
};

struct Calculator;

#[async_trait]
impl ServiceInterface for Calculator {
    fn operations(&self) -> Vec<String> {
        vec!["add".into()]
    }

    async fn invoke(&self, operation: &str, args: Vec<Value>) -> Result<Value, BoxError> {
        match operation {
            "add" => Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())),
            other => Err(format!("unsupported operation {other}").into()),
        }
    }
}

/// Remembers the calculator stub it was given.
struct Client {
    calc: Service,
}

fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(
            PluginDescriptor::new("calculator")
                .provides(["calc"])
                .with_setup(sync_setup(|_ctx| {
                    Ok(Provided::new().service("calc", Service::with_interface(Calculator)))
                })),
        )
        .with(
            PluginDescriptor::new("client")
                .consumes(["calc"])
                .provides(["client"])
                .with_setup(sync_setup(|ctx| {
                    let calc = ctx.imports().require("calc")?.clone();
                    Ok(Provided::new().service("client", Service::new(Client { calc })))
                })),
        )
        .with(
            PluginDescriptor::new("broken")
                .consumes(["calc"])
                .provides(["broken"])
                .with_setup(sync_setup(|_ctx| Err("boom".into()))),
        )
        .with(
            PluginDescriptor::new("stalled")
                .provides(["stalled"])
                .with_setup(setup_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, BoxError>(Provided::new())
                })),
        )
        .with(
            PluginDescriptor::new("plain")
                .provides(["db"])
                .with_setup(sync_setup(|_ctx| {
                    Ok(Provided::new().service("db", Service::new(42_u32)))
                })),
        )
        .with(
            PluginDescriptor::new("db-user")
                .consumes(["db"])
                .with_setup(sync_setup(|_ctx| Ok(Provided::new()))),
        )
        .with(
            PluginDescriptor::new("calculator-copy")
                .provides(["calc"])
                .with_setup(sync_setup(|_ctx| {
                    Ok(Provided::new().service("calc", Service::with_interface(Calculator)))
                })),
        )
}

fn config(containers: &[(&str, &[&str])]) -> CairnConfig {
    let mut config = CairnConfig {
        containers: containers
            .iter()
            .map(|(name, plugins)| ContainerConfig {
                name: name.to_string(),
                plugins: plugins.iter().map(|p| (*p).into()).collect(),
            })
            .collect(),
        ..Default::default()
    };
    config.engine.ready_timeout_ms = Some(10_000);
    config
}

async fn launch(config: &CairnConfig) -> Cluster {
    let catalog = catalog();
    let plan = ClusterPlan::new(config, &catalog).unwrap();
    let launcher = InProcessLauncher::new(catalog);
    Cluster::launch(plan, &launcher, &launcher).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_call_across_containers() {
    let cluster = launch(&config(&[("front", &["client"]), ("math", &["calculator"])])).await;
    cluster.wait_ready().await.unwrap();
    assert!(matches!(cluster.state(), ClusterState::Ready));
    assert!(cluster.pending().is_empty());

    let front = cluster.master_app().unwrap();
    let client = front.get_service_as::<Client>("client").unwrap();
    assert!(client.calc.is_remote());
    assert_eq!(client.calc.operations(), vec!["add".to_string()]);

    let sum = client
        .calc
        .call("add", vec![json!(40), json!(2)])
        .await
        .unwrap();
    assert_eq!(sum, json!(42));

    // Unknown operations fail without a round trip.
    let err = client.calc.call("divide", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("unknown operation"));

    let math = cluster.app("math").unwrap().clone();
    assert!(math.get_service("calc").is_ok());
    assert!(math.get_service("client").is_err());

    cluster.shutdown().await;
    assert_eq!(math.state(), cairn_framework::SystemState::Destroyed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn container_failure_fails_cluster() {
    let cluster = launch(&config(&[("front", &["broken"]), ("math", &["calculator"])])).await;

    let err = cluster.wait_ready().await.unwrap_err();
    match err.as_ref() {
        PluginError::ContainerFailed { container, reason } => {
            assert_eq!(container, "front");
            assert!(reason.contains("boom"));
        }
        other => panic!("unexpected error: {other}"),
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_service_consumed_across_containers_fails_cluster() {
    let cluster = launch(&config(&[("front", &["db-user"]), ("back", &["plain"])])).await;

    let err = cluster.wait_ready().await.unwrap_err();
    match err.as_ref() {
        PluginError::ContainerFailed { container, reason } => {
            assert_eq!(container, "front");
            assert!(reason.contains("db"));
            assert!(reason.contains("no interface in container 'back'"));
        }
        other => panic!("unexpected error: {other}"),
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_timeout_names_pending_containers() {
    let mut config = config(&[("front", &["stalled"]), ("math", &["calculator"])]);
    config.engine.ready_timeout_ms = Some(200);

    let catalog = catalog();
    let plan = ClusterPlan::new(&config, &catalog).unwrap();
    assert_eq!(plan.ready_timeout(), Some(Duration::from_millis(200)));
    let launcher = InProcessLauncher::new(catalog);
    let cluster = Cluster::launch(plan, &launcher, &launcher).await.unwrap();

    let err = cluster.wait_ready().await.unwrap_err();
    match err.as_ref() {
        PluginError::ReadinessTimeout { pending, .. } => {
            assert!(pending.contains(&"front".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    cluster.shutdown().await;
}

#[test]
fn preflight_reports_missing_service() {
    let err = ClusterPlan::new(&config(&[("front", &["client"])]), &catalog()).unwrap_err();
    assert!(err.to_string().contains("Missing services: calc"));
}

#[test]
fn preflight_rejects_duplicate_provider() {
    let err = ClusterPlan::new(
        &config(&[("a", &["calculator"]), ("b", &["calculator-copy"])]),
        &catalog(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Plugin(ref e) if matches!(e.as_ref(), PluginError::DuplicateService { .. })
    ));
}

#[test]
fn plugin_errors_convert_into_runtime_errors() {
    let err: Arc<PluginError> = Arc::new(PluginError::Destroyed);
    let runtime: RuntimeError = err.clone().into();
    assert_eq!(runtime.to_string(), err.to_string());
}
