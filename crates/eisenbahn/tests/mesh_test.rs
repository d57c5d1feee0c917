//! Two processes' worth of nodes talking through a real broker.
//!
//! Each test runs its own `EventBroker` on TCP and joins it with two
//! `ZmqMesh` instances, standing in for two worker processes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use dendrite_core::{
    Broker, Dendrite, DendriteError, DendriteHandle, HelpOutcome, HelpQuery, NodeConfig,
    NodePhase, TaskContext, TaskOptions, TaskProcessor,
};
use dendrite_eisenbahn::{BrokerConfig, EventBroker, MeshConfig, ZmqMesh};

const TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(300);

struct SlowProcessor {
    delay: Duration,
    helper_results: Mutex<Vec<String>>,
}

impl SlowProcessor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            helper_results: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TaskProcessor for SlowProcessor {
    async fn process_task(&self, payload: Value, ctx: TaskContext) -> Result<Value, String> {
        sleep(self.delay).await;
        Ok(json!({ "task_id": ctx.task_id, "input": payload }))
    }

    fn process_helper_result(&self, _task_id: &str, _result: &Value, from: &str) {
        self.helper_results.lock().unwrap().push(from.to_string());
    }
}

/// Broker plus two meshes on `base_port..base_port + 2`.
async fn start_mesh(base_port: u16) -> (Arc<EventBroker>, Arc<ZmqMesh>, Arc<ZmqMesh>) {
    let config = MeshConfig::tcp("127.0.0.1", base_port);
    let broker = Arc::new(EventBroker::new(BrokerConfig::from_mesh(&config).unwrap()));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    sleep(SETTLE).await;

    let a = Arc::new(ZmqMesh::connect(&config).await.unwrap());
    let b = Arc::new(ZmqMesh::connect(&config).await.unwrap());
    (broker, a, b)
}

async fn spawn(
    mesh: &Arc<ZmqMesh>,
    name: &str,
    capability: &str,
    max_concurrent: usize,
    processor: Arc<SlowProcessor>,
) -> DendriteHandle {
    let mut config = NodeConfig::named(name);
    config.capability = capability.into();
    config.max_concurrent = max_concurrent;
    config.max_queue = 10;
    Dendrite::builder(config)
        .processor(processor)
        .broker(mesh.clone())
        .spawn()
        .await
        .unwrap()
}

fn query() -> HelpQuery {
    HelpQuery {
        reason: "manual".into(),
        load: 1.0,
        queue_size: 10,
        needed_clones: 1,
        task_type: "scraper".into(),
        capabilities: vec![],
    }
}

#[tokio::test]
async fn help_query_reaches_peers_of_the_same_capability() {
    let (broker, mesh_a, mesh_b) = start_mesh(16100).await;
    spawn(&mesh_a, "origin", "scraper", 1, SlowProcessor::new(Duration::ZERO)).await;
    spawn(&mesh_b, "helper", "scraper", 4, SlowProcessor::new(Duration::ZERO)).await;
    spawn(&mesh_b, "indexer", "indexer", 4, SlowProcessor::new(Duration::ZERO)).await;
    sleep(SETTLE).await;

    let replies = mesh_a.request_help("origin", "scraper", query()).await.unwrap();
    assert_eq!(replies.len(), 1, "only the other scraper answers: {replies:?}");
    assert_eq!(replies[0].from, "helper");
    assert!(replies[0].res.success);
    assert_eq!(replies[0].res.available_slots, 4);

    let none = mesh_a.request_help("origin", "crawler", query()).await.unwrap();
    assert!(none.is_empty());

    broker.shutdown();
}

#[tokio::test]
async fn overloaded_node_offloads_backlog_across_processes() {
    let (broker, mesh_a, mesh_b) = start_mesh(16110).await;
    let origin_proc = SlowProcessor::new(Duration::from_millis(200));
    let origin = spawn(&mesh_a, "origin", "scraper", 1, origin_proc.clone()).await;
    let helper = spawn(&mesh_b, "helper", "scraper", 5, SlowProcessor::new(Duration::from_millis(20))).await;
    sleep(SETTLE).await;

    for i in 0..10 {
        let outcome = origin
            .add_task(json!(i), TaskOptions::default().with_id(format!("t{i}")))
            .await
            .unwrap();
        assert!(outcome.is_accepted());
    }

    let outcome = origin.request_help("manual").await.unwrap();
    assert_eq!(
        outcome,
        HelpOutcome::Requested {
            helpers: vec!["helper".into()]
        }
    );

    let finished = timeout(TIMEOUT, async {
        loop {
            let status = origin.status().await.unwrap();
            if status.state.total_processed == 10 {
                return status;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("backlog not finished in time");

    assert_eq!(finished.state.outstanding_offloads, 0);
    assert_eq!(finished.phase, NodePhase::Helped);

    let offloaded = origin_proc.helper_results.lock().unwrap().clone();
    assert!(!offloaded.is_empty());
    assert!(offloaded.iter().all(|from| from == "helper"));
    let helper_status = helper.status().await.unwrap();
    assert_eq!(helper_status.state.total_processed as usize, offloaded.len());

    broker.shutdown();
}

#[tokio::test]
async fn subscribe_requires_a_registered_node() {
    let (broker, mesh_a, _mesh_b) = start_mesh(16120).await;
    spawn(&mesh_a, "origin", "scraper", 1, SlowProcessor::new(Duration::ZERO)).await;
    assert_eq!(mesh_a.node_names().await, ["origin"]);

    assert!(matches!(
        mesh_a.subscribe("ghost", "task_batch").await,
        Err(DendriteError::UnknownNode(_))
    ));
    mesh_a.subscribe("origin", "crawl_hint").await.unwrap();

    mesh_a.close().await;
    assert!(mesh_a.node_names().await.is_empty());
    broker.shutdown();
}
