use crate::*;

/// No agents registered: every path answers 503 with the fixed message.
#[tokio::test]
async fn test_no_agents_is_503() {
    let store = Arc::new(MemoryStore::new());
    let router = RouterNode::start(store, 0).await.unwrap();

    for path in ["/", "/find-build-agent", "/anything/else"] {
        let (status, body) = find_agent(&router, path).await.unwrap();
        assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE, "{path}");
        assert_eq!(body["error"], "No running build agents");
    }

    let health = reqwest::get(format!("{}/health-check", router.url)).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
}

/// The router hands out the agent with the fewest jobs per core.
#[tokio::test]
async fn test_routes_to_least_loaded_agent() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let router = RouterNode::start(store.clone(), 0).await.unwrap();

    let small = BuilderNode::start(store.clone(), &relay, 2).await.unwrap();
    let large = BuilderNode::start(store.clone(), &relay, 8).await.unwrap();
    small.entry.update_job_count(2).await.unwrap();
    large.entry.update_job_count(2).await.unwrap();
    router.catalog.invalidate();

    let (status, body) = find_agent(&router, "/find-build-agent").await.unwrap();
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["endpoint"], endpoint_of(&large));
}

/// A leaving agent disappears from routing without waiting for the
/// catalog's freshness window.
#[tokio::test]
async fn test_leave_is_seen_immediately() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let router = RouterNode::start(store.clone(), 0).await.unwrap();

    let a = BuilderNode::start(store.clone(), &relay, 4).await.unwrap();
    let b = BuilderNode::start(store.clone(), &relay, 4).await.unwrap();
    a.entry.update_job_count(3).await.unwrap();
    router.catalog.invalidate();

    let (_, body) = find_agent(&router, "/").await.unwrap();
    assert_eq!(body["endpoint"], endpoint_of(&b));

    b.entry.leave().await.unwrap();
    assert!(eventually(|| !router.catalog.is_cached()).await);

    let (_, body) = find_agent(&router, "/").await.unwrap();
    assert_eq!(body["endpoint"], endpoint_of(&a));

    a.entry.leave().await.unwrap();
    assert!(eventually(|| !router.catalog.is_cached()).await);
    let (status, _) = find_agent(&router, "/").await.unwrap();
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

/// A newly joined agent is routable on the next request.
#[tokio::test]
async fn test_join_is_seen_immediately() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let router = RouterNode::start(store.clone(), 0).await.unwrap();

    let (status, _) = find_agent(&router, "/").await.unwrap();
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);

    let node = BuilderNode::start(store.clone(), &relay, 1).await.unwrap();
    assert!(eventually(|| !router.catalog.is_cached()).await);

    let (status, body) = find_agent(&router, "/").await.unwrap();
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["endpoint"], endpoint_of(&node));
}

/// With the overload guard on, a saturated farm answers 503.
#[tokio::test]
async fn test_overloaded_farm_is_503() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let router = RouterNode::start(store.clone(), 16).await.unwrap();

    let node = BuilderNode::start(store.clone(), &relay, 1).await.unwrap();
    node.entry.update_job_count(17).await.unwrap();
    router.catalog.invalidate();

    let (status, body) = find_agent(&router, "/").await.unwrap();
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "all build agents are overloaded");
}
