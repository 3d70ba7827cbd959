//! SelectiveDeployment reconciliation against fake cluster seams.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{
    eventually, geo_node, node, pinned_nodes, sd, synced_store, FakeStatus, FakeWorkloads,
    RecordingNotifier,
};
use edgeplane_controller::cluster::WorkloadRef;
use edgeplane_controller::crd::{
    ControllerKind, ControllerState, PlacementState, SelectiveDeployment, SelectiveDeploymentSpec,
    TargetController,
};
use edgeplane_controller::handlers::{
    inventory_trigger, release_trigger, NodeChanges, SdChanges, SelectiveDeploymentHandler,
};
use edgeplane_controller::notify::{NotificationKind, CONTACT_ANNOTATION};
use edgeplane_geo::{Operator, RegionType, SelectorClause};
use edgeplane_reconcile::{
    Engine, EngineConfig, Handler, ObjectKey, Operation, ReconcileEvent, Store, WatchEvent,
};
use k8s_openapi::api::core::v1::Node;
use kube::Resource;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

const NS: &str = "edge";
const PARIS: &str = "[[2.2,48.8],[2.5,48.8],[2.5,48.9],[2.2,48.9]]";

fn web() -> TargetController {
    TargetController::new(ControllerKind::Deployment, "web")
}

fn workload(c: &TargetController) -> WorkloadRef {
    WorkloadRef::new(NS, c.kind, &c.name)
}

fn europe_nodes() -> Vec<Node> {
    vec![
        geo_node("paris-1", "Paris", "FR", 2.35, 48.86),
        geo_node("paris-2", "Paris", "FR", 2.29, 48.85),
        geo_node("berlin-1", "Berlin", "DE", 13.40, 52.52),
        node("fresh", BTreeMap::new()),
    ]
}

fn polygon_spec(controllers: Vec<TargetController>) -> SelectiveDeploymentSpec {
    SelectiveDeploymentSpec {
        controllers,
        region_type: RegionType::Polygon,
        selector: vec![SelectorClause::new(PARIS, Operator::In, 0)],
    }
}

struct Fixture {
    handler: SelectiveDeploymentHandler,
    workloads: Arc<FakeWorkloads>,
    status: Arc<FakeStatus>,
    notifier: Arc<RecordingNotifier>,
    _nodes: Store<Node>,
    _sds: Store<SelectiveDeployment>,
}

fn fixture(nodes: Vec<Node>, sds: Vec<SelectiveDeployment>) -> Fixture {
    let (node_store, node_reader) = synced_store(nodes);
    let (sd_store, sd_reader) = synced_store(sds);
    let workloads = Arc::new(FakeWorkloads::default());
    let status = Arc::new(FakeStatus::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let handler = SelectiveDeploymentHandler::new(
        node_reader,
        sd_reader,
        workloads.clone(),
        status.clone(),
        notifier.clone(),
    );

    Fixture {
        handler,
        workloads,
        status,
        notifier,
        _nodes: node_store,
        _sds: sd_store,
    }
}

#[tokio::test]
async fn test_paris_polygon_pins_paris_nodes() {
    let obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj)).await.unwrap();

    let placement = f.workloads.placement(&workload(&web())).unwrap();
    assert_eq!(placement.owner.as_deref(), Some("web-paris"));
    assert_eq!(
        pinned_nodes(placement.affinity.as_ref()),
        Some(vec!["paris-1".to_string(), "paris-2".to_string()])
    );

    let status = f.status.last().unwrap();
    assert_eq!(status.state, PlacementState::Success);
    assert!(status.ready);
    assert_eq!(status.nodes, ["paris-1", "paris-2"]);
    assert_eq!(status.controllers[0].state, ControllerState::Applied);
    assert!(f.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_named_region_with_count() {
    let spec = SelectiveDeploymentSpec {
        controllers: vec![web()],
        region_type: RegionType::Country,
        selector: vec![SelectorClause::new("fr", Operator::In, 1)],
    };
    let obj = sd(NS, "one-in-france", spec);
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj)).await.unwrap();

    assert_eq!(f.status.last().unwrap().nodes, ["paris-1"]);
}

#[tokio::test]
async fn test_unchanged_status_is_not_rewritten() {
    let mut obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj.clone())).await.unwrap();
    assert_eq!(f.status.writes().len(), 1);

    // The cache now holds the written status.
    obj.status = f.status.last();
    f.handler
        .on_update(Arc::new(obj), SdChanges::inventory())
        .await
        .unwrap();

    assert_eq!(f.status.writes().len(), 1);
    assert_eq!(f.workloads.writes().len(), 1);
}

#[tokio::test]
async fn test_missing_controller_fails_and_notifies_once() {
    let mut obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CONTACT_ANNOTATION.to_string(), "ops@example.com".to_string());
    let f = fixture(europe_nodes(), vec![obj.clone()]);

    f.handler.on_create(Arc::new(obj.clone())).await.unwrap();

    let status = f.status.last().unwrap();
    assert_eq!(status.state, PlacementState::Failure);
    assert!(!status.ready);
    assert_eq!(status.controllers[0].state, ControllerState::Missing);

    let sent = f.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, NotificationKind::PlacementFailed);
    assert_eq!(sent[0].1.contact.as_deref(), Some("ops@example.com"));

    obj.status = Some(status);
    f.handler
        .on_update(Arc::new(obj), SdChanges::inventory())
        .await
        .unwrap();
    assert_eq!(f.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_invalid_clause_is_reported_and_others_apply() {
    let spec = SelectiveDeploymentSpec {
        controllers: vec![web()],
        region_type: RegionType::Polygon,
        selector: vec![
            SelectorClause::new("[[2.2,48.8],[2.5", Operator::In, 0),
            SelectorClause::new(PARIS, Operator::In, 1),
        ],
    };
    let obj = sd(NS, "web-paris", spec);
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj)).await.unwrap();

    let status = f.status.last().unwrap();
    assert_eq!(status.state, PlacementState::Partial);
    assert_eq!(status.nodes, ["paris-1"]);
    assert!(status.message[0].starts_with("selector[0]:"));
    assert_eq!(f.notifier.sent()[0].0, NotificationKind::PlacementPartial);
}

#[tokio::test]
async fn test_unknown_operator_is_reported_and_others_apply() {
    let spec: SelectiveDeploymentSpec = serde_json::from_value(serde_json::json!({
        "controllers": [{"kind": "Deployment", "name": "web"}],
        "type": "City",
        "selector": [
            {"value": "Paris", "operator": "In"},
            {"value": "Lyon", "operator": "Near"},
        ],
    }))
    .unwrap();
    let obj = sd(NS, "web-paris", spec);
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj)).await.unwrap();

    let status = f.status.last().unwrap();
    assert_eq!(status.state, PlacementState::Partial);
    assert_eq!(status.nodes, ["paris-1", "paris-2"]);
    assert!(status.message[0].starts_with("selector[1]:"));
    assert_eq!(
        pinned_nodes(f.workloads.placement(&workload(&web())).unwrap().affinity.as_ref()),
        Some(vec!["paris-1".to_string(), "paris-2".to_string()])
    );
}

#[tokio::test]
async fn test_unknown_region_type_fails_the_object() {
    let spec: SelectiveDeploymentSpec = serde_json::from_value(serde_json::json!({
        "controllers": [{"kind": "Deployment", "name": "web"}],
        "type": "Galaxy",
        "selector": [{"value": "Paris", "operator": "In"}],
    }))
    .unwrap();
    assert_eq!(spec.region_type, RegionType::Unsupported);
    let obj = sd(NS, "web-galaxy", spec);
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);

    f.handler.on_create(Arc::new(obj)).await.unwrap();

    let status = f.status.last().unwrap();
    assert_eq!(status.state, PlacementState::Failure);
    assert!(status.nodes.is_empty());
    assert_eq!(status.message[0], "unsupported region type");
    assert_eq!(f.notifier.sent()[0].0, NotificationKind::PlacementFailed);
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);
    f.workloads
        .fail_writes([edgeplane_controller::cluster::ApiError::Transient("503".to_string())]);

    let err = f.handler.on_create(Arc::new(obj.clone())).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(f.status.last().unwrap().controllers[0].state, ControllerState::Failed);

    f.handler.on_create(Arc::new(obj)).await.unwrap();
    assert_eq!(f.status.last().unwrap().state, PlacementState::Success);
}

#[tokio::test]
async fn test_dropped_controller_is_released() {
    let api = TargetController::new(ControllerKind::StatefulSet, "api");
    let obj = sd(NS, "web-paris", polygon_spec(vec![web(), api.clone()]));
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);
    f.workloads.insert(workload(&api), None, None);

    f.handler.on_create(Arc::new(obj.clone())).await.unwrap();
    assert_eq!(f.handler.owned_workloads(NS, "web-paris").len(), 2);

    let mut updated = obj;
    updated.spec.controllers = vec![web()];
    f.handler
        .on_update(
            Arc::new(updated),
            SdChanges {
                controllers: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let released = f.workloads.placement(&workload(&api)).unwrap();
    assert_eq!(released.owner, None);
    assert_eq!(released.affinity, None);
    assert!(f.workloads.placement(&workload(&web())).unwrap().affinity.is_some());
    assert_eq!(f.handler.owned_workloads(NS, "web-paris"), vec![workload(&web())]);
}

#[tokio::test]
async fn test_delete_releases_owned_workloads_only() {
    let db = TargetController::new(ControllerKind::StatefulSet, "db");
    let obj = sd(NS, "web-paris", polygon_spec(vec![web(), db.clone()]));
    let f = fixture(europe_nodes(), vec![obj.clone()]);
    f.workloads.insert(workload(&web()), None, None);
    f.workloads.insert(workload(&db), Some("someone-else"), None);

    f.handler.on_create(Arc::new(obj.clone())).await.unwrap();
    assert_eq!(f.status.last().unwrap().controllers[1].state, ControllerState::Applied);

    // Another SelectiveDeployment claims `db` while ours still exists.
    f.workloads.insert(workload(&db), Some("someone-else"), None);

    f.handler.on_delete(Arc::new(obj)).await.unwrap();

    let web_placement = f.workloads.placement(&workload(&web())).unwrap();
    assert_eq!(web_placement.owner, None);
    assert_eq!(web_placement.affinity, None);
    assert_eq!(
        f.workloads.placement(&workload(&db)).unwrap().owner.as_deref(),
        Some("someone-else")
    );
    assert!(f.handler.owned_workloads(NS, "web-paris").is_empty());
}

#[tokio::test]
async fn test_delete_after_restart_uses_last_known_spec() {
    let obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    let f = fixture(europe_nodes(), Vec::new());
    f.workloads.insert(workload(&web()), Some("web-paris"), None);

    f.handler.on_delete(Arc::new(obj)).await.unwrap();

    assert_eq!(f.workloads.placement(&workload(&web())).unwrap().owner, None);
}

#[tokio::test]
async fn test_node_inventory_change_repins() {
    let obj = sd(NS, "web-paris", polygon_spec(vec![web()]));
    let (mut node_store, node_reader) =
        synced_store(vec![geo_node("paris-1", "Paris", "FR", 2.35, 48.86)]);
    let sd_store = Store::new();
    let sd_reader = sd_store.reader();

    let workloads = Arc::new(FakeWorkloads::default());
    workloads.insert(workload(&web()), None, None);
    let handler = SelectiveDeploymentHandler::new(
        node_reader,
        sd_reader.clone(),
        workloads.clone(),
        Arc::new(FakeStatus::default()),
        Arc::new(RecordingNotifier::default()),
    );
    let engine = Engine::with_store(EngineConfig::new("sd-test"), sd_store, Arc::new(handler));
    let trigger = inventory_trigger(sd_reader, engine.queue());

    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(engine.run(UnboundedReceiverStream::new(rx), shutdown_rx));
    tx.send(WatchEvent::Applied(obj)).unwrap();
    tx.send(WatchEvent::Synced).unwrap();

    let pinned = |expected: &[&str]| {
        pinned_nodes(
            workloads
                .placement(&workload(&web()))
                .and_then(|p| p.affinity)
                .as_ref(),
        ) == Some(expected.iter().map(|s| s.to_string()).collect())
    };
    eventually(|| pinned(&["paris-1"])).await;

    let paris_2 = geo_node("paris-2", "Paris", "FR", 2.29, 48.85);
    node_store.apply(WatchEvent::Applied(paris_2));
    trigger(&ReconcileEvent::<Node, NodeChanges>::new(
        ObjectKey::cluster("paris-2"),
        Operation::Created,
    ));

    eventually(|| pinned(&["paris-1", "paris-2"])).await;

    // Address-only node updates do not touch SelectiveDeployments.
    let writes = workloads.writes().len();
    trigger(&ReconcileEvent::<Node, NodeChanges>::new(
        ObjectKey::cluster("paris-2"),
        Operation::Updated(NodeChanges {
            addresses: true,
            ..Default::default()
        }),
    ));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(workloads.writes().len(), writes);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_deleted_owner_hands_workload_to_waiting_deployment() {
    let winner = sd(NS, "a", polygon_spec(vec![web()]));
    let waiting = sd(NS, "b", polygon_spec(vec![web()]));
    let (_node_store, node_reader) = synced_store(europe_nodes());
    let sd_store = Store::new();
    let sd_reader = sd_store.reader();

    let workloads = Arc::new(FakeWorkloads::default());
    workloads.insert(workload(&web()), Some("a"), None);
    let status = Arc::new(FakeStatus::default());
    let handler = SelectiveDeploymentHandler::new(
        node_reader,
        sd_reader.clone(),
        workloads.clone(),
        status.clone(),
        Arc::new(RecordingNotifier::default()),
    );
    let mut engine =
        Engine::with_store(EngineConfig::new("sd-test"), sd_store, Arc::new(handler));
    let queue = engine.queue();
    engine.on_event(release_trigger(sd_reader, queue));

    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(engine.run(UnboundedReceiverStream::new(rx), shutdown_rx));
    tx.send(WatchEvent::Applied(winner.clone())).unwrap();
    tx.send(WatchEvent::Applied(waiting)).unwrap();
    tx.send(WatchEvent::Synced).unwrap();

    eventually(|| {
        status.writes().iter().any(|(_, name, s)| {
            name == "b" && s.controllers[0].state == ControllerState::Conflict
        })
    })
    .await;
    assert_eq!(
        workloads.placement(&workload(&web())).unwrap().owner.as_deref(),
        Some("a")
    );

    tx.send(WatchEvent::Deleted(winner)).unwrap();

    eventually(|| {
        workloads
            .placement(&workload(&web()))
            .is_some_and(|p| p.owner.as_deref() == Some("b"))
    })
    .await;
    let placement = workloads.placement(&workload(&web())).unwrap();
    assert_eq!(
        pinned_nodes(placement.affinity.as_ref()),
        Some(vec!["paris-1".to_string(), "paris-2".to_string()])
    );

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}
