use crate::*;

async fn post_build(node: &BuilderNode, headers: &[(&str, &str)]) -> (reqwest::StatusCode, serde_json::Value) {
    let client = reqwest::Client::new();
    let mut req = client.post(format!("{}/v1/build", node.url));
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

/// Upload → id → added/started/files events → download → acknowledge.
#[tokio::test]
async fn test_build_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();
    let archive = node.stage_archive("upload-1");
    let archive_str = archive.to_string_lossy().into_owned();

    let (status, body) = post_build(
        &node,
        &[
            ("x-targets", r#"[{"name":"deb","arch":"x64"}]"#),
            ("x-platform", "linux"),
            ("x-file", &archive_str),
        ],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK, "{body}");
    let id = body["id"].as_str().unwrap().to_string();

    let events = relay.wait_terminal(&id).await;
    assert_eq!(events[0], BuildEvent::added());
    assert_eq!(events[1], BuildEvent::started());
    let BuildEvent::Completed { files } = &events[2] else {
        panic!("expected files, got {events:?}");
    };
    assert_eq!(files[0].file, "app-linux.bin");
    assert_eq!(files[0].target.as_deref(), Some("deb"));
    assert_eq!(events.len(), 3);

    // archive is consumed by the job
    assert!(eventually(|| !archive.exists()).await);
    assert!(eventually(|| node.controller.live_jobs() == 0).await);

    let download = reqwest::get(format!("{}/v1/download/{}/app-linux.bin", node.url, id))
        .await
        .unwrap();
    assert_eq!(download.status(), reqwest::StatusCode::OK);
    assert_eq!(&download.bytes().await.unwrap()[..], b"artifact");

    let client = reqwest::Client::new();
    let ack = client
        .delete(format!("{}/v1/build/{}", node.url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(ack.status(), reqwest::StatusCode::NO_CONTENT);
    let dirs = node.job_dirs(&id);
    assert!(!dirs.project.exists());
    assert!(!dirs.temp.exists());

    let again = client
        .delete(format!("{}/v1/build/{}", node.url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

/// A packager failure becomes the job's single terminal event.
#[tokio::test]
async fn test_failed_build_reports_error_event() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();
    let archive = node.stage_archive("upload-broken");

    let (status, body) = post_build(
        &node,
        &[
            ("x-targets", "deb"),
            ("x-platform", "broken"),
            ("x-file", &archive.to_string_lossy()),
        ],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let events = relay.wait_terminal(&id).await;
    assert_eq!(events.last(), Some(&BuildEvent::failed("Cannot find icon")));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

/// Bad headers are a 400 with a JSON error, and the staged upload is removed.
#[tokio::test]
async fn test_bad_request_removes_upload() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();

    let archive = node.stage_archive("upload-bad");
    let (status, body) = post_build(
        &node,
        &[("x-platform", "linux"), ("x-file", &archive.to_string_lossy())],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Header x-targets is not specified");
    assert!(!archive.exists());

    let archive = node.stage_archive("upload-malformed");
    let (status, _) = post_build(
        &node,
        &[
            ("x-targets", r#"[{"name":"#),
            ("x-platform", "linux"),
            ("x-file", &archive.to_string_lossy()),
        ],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert!(!archive.exists());
}

/// An upload the proxy never staged, whether the header or the file is
/// missing, is a 500 rather than a 400.
#[tokio::test]
async fn test_missing_archive_is_500() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();

    let (status, body) = post_build(&node, &[("x-targets", "deb"), ("x-platform", "linux")]).await;
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("x-file"));

    let unstaged = node.root.join("never-staged.zst");
    let (status, _) = post_build(
        &node,
        &[
            ("x-targets", "deb"),
            ("x-platform", "linux"),
            ("x-file", &unstaged.to_string_lossy()),
        ],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(node.controller.live_jobs(), 0);
    assert_eq!(node.controller.tracked_jobs(), 0);
}

/// Ids and paths that could escape the job directory are refused.
#[tokio::test]
async fn test_download_refuses_traversal() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();

    let missing = reqwest::get(format!("{}/v1/download/0-abcdefgh/app.bin", node.url))
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let bad_id = reqwest::get(format!("{}/v1/download/ABC/app.bin", node.url))
        .await
        .unwrap();
    assert_eq!(bad_id.status(), reqwest::StatusCode::BAD_REQUEST);

    let bad_path = reqwest::get(format!("{}/v1/download/0-abcdefgh/..%2F..%2Fsecret", node.url))
        .await
        .unwrap();
    assert_eq!(bad_path.status(), reqwest::StatusCode::BAD_REQUEST);
}

/// Both upload routes are served, and the agent answers health checks.
#[tokio::test]
async fn test_upload_alias_and_health() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start(store, &relay, 2).await.unwrap();
    let archive = node.stage_archive("upload-alias");

    let resp = reqwest::Client::new()
        .post(format!("{}/v1/upload", node.url))
        .header("x-targets", "deb")
        .header("x-platform", "linux")
        .header("x-file", archive.to_string_lossy().as_ref())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    relay.wait_terminal(body["id"].as_str().unwrap()).await;

    let health = reqwest::get(format!("{}/health-check", node.url)).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.unwrap(), "OK");
}

/// Admitting and settling a job moves the agent's stored job count with
/// no help from the caller.
#[tokio::test]
async fn test_load_is_visible_in_registry() {
    let store = Arc::new(MemoryStore::new());
    let relay = Relay::start().await.unwrap();
    let node = BuilderNode::start_with_delay(store.clone(), &relay, 2, Duration::from_secs(1))
        .await
        .unwrap();
    let job_count = || ServiceRecord::parse(store.get(node.entry.key()).as_deref()).map(|r| r.job_count);
    assert_eq!(job_count(), Some(0));

    let archive = node.stage_archive("upload-load");
    let (status, body) = post_build(
        &node,
        &[
            ("x-targets", "deb"),
            ("x-platform", "linux"),
            ("x-file", &archive.to_string_lossy()),
        ],
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(eventually(|| job_count() == Some(1)).await);

    relay.wait_terminal(body["id"].as_str().unwrap()).await;
    assert!(eventually(|| job_count() == Some(0)).await);
}
