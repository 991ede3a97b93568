#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use axum::routing::get;
use loadfleet_coordinator::*;
use loadfleet_core::{
    collection_topic, CollectionId, EngineDataConfig, LoadfleetError, LoadfleetResult,
    PlanEnginesConfig, PlanId, PlanKind, ProjectId, Verb,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const API_KEY: &str = "secret";
const PROJECT: ProjectId = 1;

/// Endpoint source returning a fixed set of groups, each fully replicated.
#[derive(Default)]
struct StaticSource {
    groups: Vec<EndpointGroup>,
}

#[async_trait]
impl EndpointSource for StaticSource {
    async fn list_endpoints(&self, _project_id: ProjectId) -> LoadfleetResult<Vec<EndpointGroup>> {
        Ok(self.groups.clone())
    }

    async fn plan_replicas(
        &self,
        _project_id: ProjectId,
        collection_id: CollectionId,
        plan_id: PlanId,
    ) -> LoadfleetResult<usize> {
        self.groups
            .iter()
            .find(|g| g.collection_id == collection_id && g.plan_id == plan_id)
            .map(|g| g.addresses.len())
            .ok_or_else(|| LoadfleetError::Inventory("no such plan".into()))
    }
}

fn executor_group(collection_id: CollectionId, plan_id: PlanId, names: &[&str], port: u16) -> EndpointGroup {
    EndpointGroup {
        collection_id,
        plan_id,
        kind: "executor".into(),
        addresses: names
            .iter()
            .map(|name| EndpointAddress {
                ip: "127.0.0.1".into(),
                name: (*name).to_string(),
            })
            .collect(),
        port: Some(port),
    }
}

/// Helper: start a coordinator on a random port, returning its base URL.
async fn start_coordinator(
    source: StaticSource,
) -> (String, Arc<AppState>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let options = CoordinatorOptions {
        project_id: PROJECT,
        api_key: API_KEY.into(),
        files_root: tmp.path().to_path_buf(),
        inventory_interval: Duration::from_secs(3),
    };
    let progress = Arc::new(PlanProgress::with_timing(
        Duration::from_secs(2),
        Duration::from_millis(100),
    ));
    let coordinator = Coordinator::with_progress(options, Arc::new(source), progress).unwrap();
    coordinator
        .state()
        .inventory
        .refresh_cycle(PROJECT)
        .await
        .unwrap();
    let app = coordinator.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), coordinator.state().clone(), tmp)
}

async fn wait_for_subscribers(state: &AppState, collection_id: CollectionId, n: usize) {
    let topic = collection_topic(collection_id);
    for _ in 0..100 {
        if state.broker.subscriber_count(&topic).await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {n} subscribers on {topic}");
}

async fn next_payload(sub: &mut BrokerSubscriber) -> loadfleet_core::Payload {
    tokio::time::timeout(Duration::from_secs(5), sub.next_payload())
        .await
        .expect("payload in time")
        .expect("stream open")
        .expect("valid payload")
}

fn plan_configs(plan_id: PlanId, engines: u32) -> BTreeMap<PlanId, PlanEnginesConfig> {
    let pec = PlanEnginesConfig {
        kind: PlanKind::Locust,
        name: "browse".into(),
        duration: 2,
        concurrency: 20,
        rampup: 5,
        engines_config: (0..engines)
            .map(|engine_id| EngineDataConfig {
                engine_data: BTreeMap::new(),
                run_id: 77,
                engine_id,
            })
            .collect(),
    };
    [(plan_id, pec)].into_iter().collect()
}

fn locust_upload(plan_id: PlanId) -> UploadedFile {
    UploadedFile {
        key: FormFileKey::Test(plan_id),
        filename: "locustfile.py".into(),
        content: b"from locust import HttpUser\n".to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Full lifecycle: mismatch, trigger, progress, stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_trigger_progress_and_stop_lifecycle() {
    let (base, state, _tmp) = start_coordinator(StaticSource::default()).await;
    let client = CoordinatorClient::new().unwrap();
    let ro = ReqOpts::new(&base, API_KEY);

    let mut engine0 = BrokerSubscriber::connect(&base, API_KEY, 1).await.unwrap();
    wait_for_subscribers(&state, 1, 1).await;

    let err = client
        .trigger_collection(&ro, 1, &plan_configs(10, 2), vec![locust_upload(10)])
        .await
        .unwrap_err();
    assert!(err.is_precondition());
    assert!(err
        .to_string()
        .contains("engine number mismatch, connected 1, required 2"));
    assert!(state.progress.get(1, 10).is_none());

    let mut engine1 = BrokerSubscriber::connect(&base, API_KEY, 1).await.unwrap();
    wait_for_subscribers(&state, 1, 2).await;
    client
        .trigger_collection(&ro, 1, &plan_configs(10, 2), vec![locust_upload(10)])
        .await
        .unwrap();

    for engine in [&mut engine0, &mut engine1] {
        let payload = next_payload(engine).await;
        assert_eq!(payload.verb, Verb::Start);
        let msg = payload.for_plan(10).unwrap();
        assert_eq!(msg.run_id, 77);
        assert_eq!(msg.test_file, "locustfile.py");
        assert!(msg.data_files.is_empty());
    }
    let progress = state.progress.get(1, 10).unwrap();
    assert_eq!(progress.len(), 2);
    assert!(!progress.any_running());

    assert!(!client.progress_check(&ro, 1, 10, 2).await.unwrap());
    client.report_progress(&ro, 1, 10, 0, true).await.unwrap();
    assert!(!client.progress_check(&ro, 1, 10, 2).await.unwrap());
    client.report_progress(&ro, 1, 10, 1, true).await.unwrap();
    assert!(client.progress_check(&ro, 1, 10, 2).await.unwrap());
    assert!(!client.progress_check(&ro, 1, 10, 3).await.unwrap());

    let conf = client
        .fetch_file(&ro, "collection/1/plan/10/locust.conf")
        .await
        .unwrap();
    assert!(String::from_utf8(conf).unwrap().contains("users = 20"));

    client.term_collection(&ro, 1, &[10]).await.unwrap();
    for engine in [&mut engine0, &mut engine1] {
        let payload = next_payload(engine).await;
        assert_eq!(payload.verb, Verb::Stop);
        assert!(payload.for_plan(10).is_some());
    }

    // One engine acknowledges, the other never does.
    client.report_progress(&ro, 1, 10, 0, false).await.unwrap();
    let mut gone = false;
    for _ in 0..50 {
        if state.progress.get(1, 10).is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "progress record should be removed after the timeout");

    engine0.close().await.unwrap();
    wait_for_subscribers(&state, 1, 1).await;
}

// ---------------------------------------------------------------------------
// Health check compares subscribers and inventory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_healthcheck_requires_subscribers_and_endpoints() {
    let source = StaticSource {
        groups: vec![executor_group(5, 50, &["engine-5-50-0", "engine-5-50-1"], 9)],
    };
    let (base, state, _tmp) = start_coordinator(source).await;
    let client = CoordinatorClient::new().unwrap();
    let ro = ReqOpts::new(&base, API_KEY);

    assert!(!client.healthcheck(&ro, 5, 2).await.unwrap());
    let _a = BrokerSubscriber::connect(&base, API_KEY, 5).await.unwrap();
    let _b = BrokerSubscriber::connect(&base, API_KEY, 5).await.unwrap();
    wait_for_subscribers(&state, 5, 2).await;
    assert!(client.healthcheck(&ro, 5, 2).await.unwrap());
    assert!(!client.healthcheck(&ro, 5, 3).await.unwrap());
}

// ---------------------------------------------------------------------------
// Single-plan termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_term_plan_broadcasts_scoped_stop() {
    let (base, state, _tmp) = start_coordinator(StaticSource::default()).await;
    let client = CoordinatorClient::new().unwrap();
    let ro = ReqOpts::new(&base, API_KEY);
    let mut engine = BrokerSubscriber::connect(&base, API_KEY, 3).await.unwrap();
    wait_for_subscribers(&state, 3, 1).await;

    client.term_plan(&ro, 3, 31).await.unwrap();
    let payload = next_payload(&mut engine).await;
    assert_eq!(payload.verb, Verb::Stop);
    assert_eq!(payload.plan_message.keys().copied().collect::<Vec<_>>(), vec![31]);
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auth_required_except_health() {
    let (base, _state, _tmp) = start_coordinator(StaticSource::default()).await;
    let http = reqwest::Client::new();

    let resp = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = http
        .get(format!("{base}/api/collections/1?engines=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .get(format!("{base}/api/collections/1?engines=0"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .get(format!("{base}/api/collections/1?engines=0"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    assert!(BrokerSubscriber::connect(&base, "wrong", 1).await.is_err());
}

#[tokio::test]
async fn test_bad_requests() {
    let (base, _state, _tmp) = start_coordinator(StaticSource::default()).await;
    let http = reqwest::Client::new();

    let resp = http
        .delete(format!("{base}/api/collections/1?plans=1,x"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = http
        .post(format!("{base}/api/collections/1"))
        .bearer_auth(API_KEY)
        .multipart(reqwest::multipart::Form::new().text("other", "x"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

// ---------------------------------------------------------------------------
// Stream proxy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_proxy_forwards_to_engine() {
    let upstream = axum::Router::new()
        .route("/stream", get(|| async { "line-1\nline-2\n" }))
        .route("/stream/raw", get(|| async { "raw" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let source = StaticSource {
        groups: vec![executor_group(2, 20, &["engine-a"], engine_port)],
    };
    let (base, _state, _tmp) = start_coordinator(source).await;
    let http = reqwest::Client::new();

    let body = http
        .get(format!("{base}/engine-a/stream"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "line-1\nline-2\n");

    let body = http
        .get(format!("{base}/engine-a/stream/raw"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "raw");

    let resp = http
        .get(format!("{base}/engine-b/stream"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let resp = http
        .get(format!("{base}/engine-a/other"))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
