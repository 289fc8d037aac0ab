//! Cluster Registry Tests
//! Tests for kubeconfig discovery, database reconciliation and the connection lifecycle

mod common;

use common::{kubeconfig_yaml, write_kubeconfig, FakeClusterApi, FakeResourceClient, SERVER_VERSION};
use kubepatrol_api::db::{self, Database};
use kubepatrol_api::registry::{ClusterRegistry, K8sError, ScanReport, WatchHandle, IN_CLUSTER_ID};
use kubepatrol_common::{AwsCredentials, ClusterSource, ConnectStatus, KubeConfigRow};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const DEV_SERVER: &str = "https://dev.example.com:6443";
const PROD_SERVER: &str = "https://prod.example.com:6443";

fn setup(client: &Arc<FakeResourceClient>) -> (TempDir, ClusterRegistry) {
    let dir = TempDir::new().unwrap();
    write_kubeconfig(dir.path(), "config", &[("dev", DEV_SERVER), ("team/prod", PROD_SERVER)]);
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config"));
    (dir, registry)
}

fn fake_client() -> Arc<FakeResourceClient> {
    Arc::new(FakeResourceClient::new(FakeClusterApi::with_pods(&["web-0"])))
}

// ============== Discovery ==============

#[tokio::test]
async fn test_scan_registers_every_context() {
    let client = fake_client();
    let (dir, registry) = setup(&client);
    std::fs::write(dir.path().join("notes.txt"), "not: [valid").unwrap();

    let report = registry.scan().await;
    assert_eq!(report.from_files, 2);

    let mut ids: Vec<String> = registry.all_clusters().await.iter().map(|c| c.id()).collect();
    ids.sort();
    assert_eq!(ids, vec!["config/dev", "config/team/prod"]);

    for entry in registry.all_clusters().await {
        assert_eq!(entry.status().await, ConnectStatus::Disconnected);
        assert_eq!(entry.source, ClusterSource::File);
    }
}

#[tokio::test]
async fn test_rescan_is_idempotent() {
    let client = fake_client();
    let (dir, registry) = setup(&client);

    registry.scan().await;
    assert_eq!(registry.scan().await, ScanReport::default());
    assert_eq!(registry.all_clusters().await.len(), 2);

    // A new file shows up on the next sweep
    write_kubeconfig(dir.path(), "staging", &[("stage", "https://stage.example.com:6443")]);
    assert_eq!(registry.scan().await.from_files, 1);
    assert!(registry.get_cluster_by_id("staging/stage").await.is_some());
}

#[tokio::test]
async fn test_context_name_with_slash() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;

    let entry = registry.get_cluster_by_id("config/team/prod").await.unwrap();
    assert_eq!(entry.file_name, "config");
    assert_eq!(entry.context_name, "team/prod");
    assert_eq!(entry.server, PROD_SERVER);

    assert!(registry.get_cluster_by_id("config").await.is_none());
    assert!(registry.get_cluster_by_id("other/dev").await.is_none());
}

// ============== Connection lifecycle ==============

#[tokio::test]
async fn test_connect_records_version_and_registers() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;

    registry.connect("config/team/prod").await.unwrap();

    let state = registry.get_cluster_by_id("config/team/prod").await.unwrap().state().await;
    assert_eq!(state.status, ConnectStatus::Connected);
    assert_eq!(state.server_version.as_deref(), Some(SERVER_VERSION));
    assert!(state.error.is_none());

    let rest = client.registered_config("config/team/prod").unwrap();
    assert_eq!(rest.host, PROD_SERVER);
    assert_eq!(rest.context.as_deref(), Some("team/prod"));
    assert!(registry.handle("config/team/prod").is_some());
    assert!(registry.handle("config/dev").is_none());
}

#[tokio::test]
async fn test_connect_when_connected_is_ignored() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;

    registry.connect("config/dev").await.unwrap();
    registry.connect("config/dev").await.unwrap();
    assert_eq!(client.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_cluster_fails_then_recovers() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;

    client.set_unreachable(DEV_SERVER, true);
    let err = registry.connect("config/dev").await.unwrap_err();
    assert!(matches!(err, K8sError::Connection(_)));

    let state = registry.get_cluster_by_id("config/dev").await.unwrap().state().await;
    assert_eq!(state.status, ConnectStatus::Failed);
    assert!(state.error.unwrap().contains("unreachable"));
    assert!(registry.handle("config/dev").is_none());

    // Failed entries may be retried
    client.set_unreachable(DEV_SERVER, false);
    registry.connect("config/dev").await.unwrap();
    assert!(registry.is_connected("config/dev").await);
    let state = registry.get_cluster_by_id("config/dev").await.unwrap().state().await;
    assert!(state.error.is_none());
}

#[tokio::test]
async fn test_connect_unknown_cluster() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);

    let err = registry.connect("missing/ctx").await.unwrap_err();
    assert!(matches!(err, K8sError::ClusterNotFound(_)));

    // Unknown IDs are ignored on disconnect
    registry.disconnect("missing/ctx").await;
}

#[tokio::test]
async fn test_disconnect_stops_watches() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;
    registry.connect("config/dev").await.unwrap();

    let entry = registry.get_cluster_by_id("config/dev").await.unwrap();
    let watch = tokio::spawn(std::future::pending::<()>());
    entry.set_watch_started("pod", Some(WatchHandle::from_task(&watch))).await;
    entry.set_watch_started("event", None).await;

    registry.disconnect("config/dev").await;

    let state = entry.state().await;
    assert_eq!(state.status, ConnectStatus::Disconnected);
    assert!(state.server_version.is_none());
    assert!(state.rest_config.is_none());
    assert!(entry.watch_types().await.is_empty());
    assert!(client.registered_ids().is_empty());
    assert!(watch.await.unwrap_err().is_cancelled());

    // Still known to the registry and reconnectable
    registry.connect("config/dev").await.unwrap();
    assert!(registry.is_connected("config/dev").await);
}

#[tokio::test]
async fn test_connected_callback_runs_once_per_connect() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    registry.scan().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry
        .set_on_connected(Arc::new(move |_entry| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await;

    registry.connect("config/dev").await.unwrap();
    registry.connect("config/dev").await.unwrap();
    registry.connect("config/team/prod").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.connected_clusters().await.len(), 2);
}

// ============== Database reconciliation ==============

fn ops_row(display_name: Option<&str>) -> KubeConfigRow {
    KubeConfigRow {
        server: "https://ops.example.com:6443".to_string(),
        user: "user-0".to_string(),
        cluster: "cluster-0".to_string(),
        content: kubeconfig_yaml(&[("ops", "https://ops.example.com:6443")]),
        display_name: display_name.map(String::from),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_database_rows_are_reconciled() {
    let client = fake_client();
    let db = Database::in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config")).with_database(db.clone());

    let row_id = db::kube_configs::create(db.pool(), &ops_row(Some("ops-cluster"))).await.unwrap();
    let anonymous_id = db::kube_configs::create(db.pool(), &ops_row(None)).await.unwrap();

    let report = registry.scan().await;
    assert_eq!(report.from_files, 0);
    assert_eq!(report.from_database, 2);

    let named = registry.get_cluster_by_id("ops-cluster/ops").await.unwrap();
    assert_eq!(named.source, ClusterSource::Db);
    let fallback = format!("{}-ops/ops", anonymous_id);
    assert!(registry.get_cluster_by_id(&fallback).await.is_some());

    registry.connect("ops-cluster/ops").await.unwrap();

    // Both rows share one (server, user, cluster) triple; dropping them
    // both removes the entries and tears down the connection
    db::kube_configs::delete(db.pool(), row_id).await.unwrap();
    db::kube_configs::delete(db.pool(), anonymous_id).await.unwrap();

    let report = registry.scan().await;
    assert_eq!(report.removed, 2);
    assert!(registry.get_cluster_by_id("ops-cluster/ops").await.is_none());
    assert!(client.registered_ids().is_empty());
}

#[tokio::test]
async fn test_aws_rows_use_fixed_file_name() {
    let client = fake_client();
    let db = Database::in_memory().await.unwrap();
    let dir = TempDir::new().unwrap();
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config")).with_database(db.clone());

    let mut row = ops_row(Some("ignored"));
    row.is_aws = true;
    row.access_key = Some("AKIA".to_string());
    row.secret_access_key = Some("secret".to_string());
    row.region = Some("us-east-1".to_string());
    row.eks_cluster_name = Some("ops".to_string());
    db::kube_configs::create(db.pool(), &row).await.unwrap();

    registry.scan().await;
    let entry = registry.get_cluster_by_id("AWS/ops").await.unwrap();
    assert_eq!(entry.source, ClusterSource::Aws);
    assert_eq!(entry.aws.as_ref().unwrap().region, "us-east-1");

    // AWS connects skip the version probe
    registry.connect("AWS/ops").await.unwrap();
    let state = entry.state().await;
    assert_eq!(state.status, ConnectStatus::Connected);
    assert!(state.server_version.is_none());
    assert_eq!(client.probes.load(Ordering::SeqCst), 0);
}

// ============== Explicit registration ==============

#[tokio::test]
async fn test_register_aws_eks_cluster() {
    let client = fake_client();
    let (_dir, registry) = setup(&client);
    let kubeconfig = kubeconfig_yaml(&[("eks", "https://eks.example.com")]);

    let incomplete = AwsCredentials {
        access_key: "AKIA".to_string(),
        ..Default::default()
    };
    assert!(registry
        .register_aws_eks_cluster(incomplete, kubeconfig.as_bytes())
        .await
        .is_err());
    assert!(registry.get_cluster_by_id("AWS/eks").await.is_none());

    let credentials = AwsCredentials {
        access_key: "AKIA".to_string(),
        secret_access_key: "secret".to_string(),
        region: "eu-west-1".to_string(),
        cluster_name: "eks".to_string(),
    };
    let id = registry
        .register_aws_eks_cluster(credentials, kubeconfig.as_bytes())
        .await
        .unwrap();
    assert_eq!(id, "AWS/eks");
    assert!(registry.is_connected("AWS/eks").await);
}

#[tokio::test]
async fn test_register_clusters_by_path_uses_current_context() {
    let client = fake_client();
    let dir = TempDir::new().unwrap();
    let path = write_kubeconfig(dir.path(), "single", &[("blue", DEV_SERVER), ("green", PROD_SERVER)]);
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config"));

    let id = registry.register_clusters_by_path(&path).await.unwrap();
    assert_eq!(id, "single/blue");
    assert!(registry.is_connected("single/blue").await);
    assert!(registry.get_cluster_by_id("single/green").await.is_none());
}

#[tokio::test]
async fn test_in_cluster_registration() {
    let client = Arc::new(
        FakeResourceClient::new(FakeClusterApi::new()).with_in_cluster("https://10.96.0.1:443"),
    );
    let dir = TempDir::new().unwrap();
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config")).with_in_cluster(true);

    registry.register_in_cluster().await.unwrap();
    assert!(registry.is_connected(IN_CLUSTER_ID).await);
    assert_eq!(registry.first_cluster_id().await.as_deref(), Some(IN_CLUSTER_ID));

    let snapshot = registry.get_cluster_by_id(IN_CLUSTER_ID).await.unwrap().snapshot().await;
    assert_eq!(snapshot.server, "https://10.96.0.1:443");
    assert_eq!(snapshot.server_version.as_deref(), Some(SERVER_VERSION));
}

#[tokio::test]
async fn test_in_cluster_failure_disables_mode() {
    let client = fake_client();
    let dir = TempDir::new().unwrap();
    let registry = ClusterRegistry::new(client.clone(), dir.path().join("config")).with_in_cluster(true);

    assert!(registry.register_in_cluster().await.is_err());
    assert!(!registry.in_cluster_enabled());
    assert!(registry.get_cluster_by_id(IN_CLUSTER_ID).await.is_none());

    // Disabled mode is a no-op
    registry.register_in_cluster().await.unwrap();
}
