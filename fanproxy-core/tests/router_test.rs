use fake_node::{Behavior, FakeCluster, FakeNode, credentials, hostname};
use fanproxy_core::config::AggregationConfig;
use fanproxy_core::fanout::TargetErrorKind;
use fanproxy_core::methods::MethodTable;
use fanproxy_core::prost_reflect::DynamicMessage;
use fanproxy_core::router::{Aggregated, Dispatch, Forward, PROXY_ERRORS_KEY, ProxyRouter};
use fanproxy_core::target::{PROXY_FROM_KEY, Target, outgoing_metadata};
use fanproxy_core::tonic::Code;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

mod fake_node;

fn router(cluster: FakeCluster) -> ProxyRouter<FakeCluster> {
    let methods = MethodTable::build(&node_service::descriptor_pool(), &AggregationConfig::default());
    ProxyRouter::new(methods, cluster)
}

fn forward(targets: &[&str]) -> Forward {
    Forward {
        targets: targets.iter().copied().map(Target::from).collect(),
        credentials: credentials(),
        outgoing: outgoing_metadata("cp-1"),
    }
}

fn version_request() -> DynamicMessage {
    let pool = node_service::descriptor_pool();
    DynamicMessage::new(pool.get_message_by_name("node.VersionRequest").unwrap())
}

async fn version(router: &ProxyRouter<FakeCluster>, targets: &[&str]) -> Aggregated {
    match router
        .unary(node_service::VERSION_PATH, forward(targets), version_request())
        .await
    {
        Dispatch::Matched(aggregated) => aggregated,
        Dispatch::Unmatched => panic!("Version must be routable"),
    }
}

fn sorted_hostnames(aggregated: &Aggregated) -> Vec<String> {
    let items = match aggregated.response.get_field_by_name("response") {
        Some(list) => list
            .as_list()
            .map(|items| items.to_vec())
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let mut hostnames: Vec<String> = items
        .iter()
        .filter_map(|item| item.as_message().map(hostname))
        .collect();
    hostnames.sort();
    hostnames
}

fn sorted_error_targets(aggregated: &Aggregated) -> Vec<String> {
    let mut targets: Vec<String> = aggregated
        .errors
        .iter()
        .flat_map(|composite| composite.errors())
        .map(|err| err.target.to_string())
        .collect();
    targets.sort();
    targets
}

#[tokio::test]
async fn test_every_target_is_stamped() {
    let cluster = FakeCluster::new()
        .with_node(FakeNode::new("n1"))
        .with_node(FakeNode::new("n2"))
        .with_node(FakeNode::new("n3"));
    let router = router(cluster);

    let aggregated = version(&router, &["n1", "n2", "n3"]).await;

    assert_eq!(aggregated.delivered, 3);
    assert!(aggregated.errors.is_none());
    assert_eq!(sorted_hostnames(&aggregated), vec!["n1", "n2", "n3"]);
}

#[tokio::test]
async fn test_only_the_first_sub_response_is_kept() {
    let router = router(FakeCluster::new().with_node(FakeNode::new("n1")));

    let aggregated = version(&router, &["n1"]).await;
    let response = aggregated.into_response().unwrap().into_inner();

    let items = response.get_field_by_name("response").unwrap();
    let items = items.as_list().unwrap();
    assert_eq!(items.len(), 1);

    let item = items[0].as_message().unwrap();
    assert_eq!(item.get_field_by_name("tag").unwrap().as_str(), Some("n1-v1"));
    let metadata = item.get_field_by_name("metadata").unwrap();
    let metadata = metadata.as_message().unwrap();
    assert_eq!(metadata.get_field_by_name("hostname").unwrap().as_str(), Some("n1"));
    assert_eq!(metadata.get_field_by_name("error").unwrap().as_str(), Some("none"));
}

#[tokio::test]
async fn test_outcomes_are_partitioned() {
    let cluster = FakeCluster::new()
        .with_node(FakeNode::new("n1"))
        .with_node(FakeNode::with_behavior("n2", Behavior::Fail(Code::Unavailable)))
        .with_node(FakeNode::with_behavior("n4", Behavior::Empty));
    let router = router(cluster);

    // n3 cannot be dialed.
    let aggregated = version(&router, &["n1", "n2", "n3", "n4"]).await;

    assert_eq!(aggregated.delivered, 1);
    assert_eq!(sorted_hostnames(&aggregated), vec!["n1"]);
    assert_eq!(sorted_error_targets(&aggregated), vec!["n2", "n3", "n4"]);

    let errors = aggregated.errors.as_ref().unwrap();
    for err in errors.errors() {
        match (err.target.as_str(), &err.kind) {
            ("n2", TargetErrorKind::Call(status)) => assert_eq!(status.code(), Code::Unavailable),
            ("n3", TargetErrorKind::Dial(_)) => {}
            ("n4", TargetErrorKind::Call(status)) => assert_eq!(status.code(), Code::Internal),
            (target, kind) => panic!("unexpected error for {target}: {kind}"),
        }
    }

    let response = aggregated.into_response().unwrap();
    let summary = response.metadata().get(PROXY_ERRORS_KEY).unwrap().to_str().unwrap();
    assert!(summary.contains("n2: "));
    assert!(summary.contains("n3: "));
}

#[tokio::test]
async fn test_no_targets_is_an_empty_reply() {
    let cluster = FakeCluster::new();
    let router = router(cluster.clone());

    let aggregated = version(&router, &[]).await;

    assert_eq!(aggregated.delivered, 0);
    assert!(aggregated.errors.is_none());
    assert!(cluster.dialed().is_empty());

    let response = aggregated.into_response().unwrap().into_inner();
    let items = response.get_field_by_name("response").unwrap();
    assert!(items.as_list().unwrap().is_empty());
}

#[tokio::test]
async fn test_all_dial_failures() {
    let router = router(FakeCluster::new());

    let aggregated = version(&router, &["n1", "n2"]).await;

    assert_eq!(aggregated.delivered, 0);
    assert!(sorted_hostnames(&aggregated).is_empty());
    assert_eq!(sorted_error_targets(&aggregated), vec!["n1", "n2"]);

    let status = aggregated.into_response().unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert!(status.message().starts_with("2 errors occurred:"));
}

#[tokio::test]
async fn test_single_failure_keeps_its_status() {
    let cluster =
        FakeCluster::new().with_node(FakeNode::with_behavior("n1", Behavior::Fail(Code::PermissionDenied)));
    let router = router(cluster);

    let status = version(&router, &["n1"]).await.into_response().unwrap_err();

    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "n1 failed");
}

#[tokio::test]
async fn test_panicking_target_is_an_error() {
    let cluster = FakeCluster::new()
        .with_node(FakeNode::new("n1"))
        .with_node(FakeNode::with_behavior("n2", Behavior::Panic));
    let router = router(cluster);

    let aggregated = version(&router, &["n1", "n2"]).await;

    assert_eq!(aggregated.delivered, 1);
    let errors = aggregated.errors.as_ref().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors()[0].target.as_str(), "n2");
    assert!(matches!(errors.errors()[0].kind, TargetErrorKind::Panicked(_)));
}

#[tokio::test]
async fn test_calls_run_concurrently() {
    // Every node waits until all of them were called, a sequential executor would hang.
    let barrier = Arc::new(Barrier::new(3));
    let cluster = FakeCluster::new()
        .with_node(FakeNode::new("n1").with_barrier(barrier.clone()))
        .with_node(FakeNode::new("n2").with_barrier(barrier.clone()))
        .with_node(FakeNode::new("n3").with_barrier(barrier));
    let router = router(cluster);

    let aggregated = tokio::time::timeout(Duration::from_secs(5), version(&router, &["n1", "n2", "n3"]))
        .await
        .expect("fan-out did not run the calls concurrently");

    assert_eq!(aggregated.delivered, 3);
}

#[tokio::test]
async fn test_concurrency_limit_still_reaches_every_target() {
    let cluster = FakeCluster::new()
        .with_node(FakeNode::new("n1"))
        .with_node(FakeNode::new("n2"))
        .with_node(FakeNode::new("n3"));
    let router = router(cluster).with_max_concurrency(Some(1));

    let aggregated = version(&router, &["n1", "n2", "n3"]).await;

    assert_eq!(aggregated.delivered, 3);
    assert_eq!(sorted_hostnames(&aggregated), vec!["n1", "n2", "n3"]);
}

#[tokio::test]
async fn test_forwarded_calls_carry_only_the_marker() {
    let node = FakeNode::new("n1");
    let router = router(FakeCluster::new().with_node(node.clone()));

    version(&router, &["n1"]).await;

    let seen = node.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get(PROXY_FROM_KEY).unwrap().to_str().unwrap(), "cp-1");
    assert!(seen[0].get("targets").is_none());
}

#[tokio::test]
async fn test_unroutable_methods_are_unmatched() {
    let cluster = FakeCluster::new().with_node(FakeNode::new("n1"));
    let router = router(cluster.clone());

    for path in [
        node_service::LEGACY_VERSION_PATH,
        node_service::PING_PATH,
        "/node.NodeService/Missing",
        // A streaming method is never fanned out as unary.
        node_service::LOGS_PATH,
    ] {
        let dispatch = router.unary(path, forward(&["n1"]), version_request()).await;
        assert!(matches!(dispatch, Dispatch::Unmatched), "{path} should be unmatched");
    }

    assert!(cluster.dialed().is_empty());
}
