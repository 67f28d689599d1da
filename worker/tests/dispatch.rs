//! Dispatch loop against two live brokers: jobs from both must get
//! processed, and rotation must not let the fuller broker starve the other.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker::broker::store::{LocalStore, Store};
use broker::broker::Broker;
use broker::filestore::DirStore;
use broker::server::Server;
use futures::future::BoxFuture;
use protocol::JobSpec;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use worker::config::{Config, ProcessorConfig};
use worker::worker::pipeline::{JobContext, Processor, Registry};
use worker::worker::DispatchLoop;

async fn start_broker(name: &str, dir: &tempfile::TempDir) -> (SocketAddr, Broker) {
    let engine = Broker::new(name.into(), Store::Local(LocalStore::new()));
    let files = DirStore::new(dir.path().to_path_buf(), "http://files.test".into());
    let server = Server::new(engine.clone(), files, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_text(listener));
    (addr, engine)
}

fn spec(destination: &str) -> JobSpec {
    JobSpec {
        ty: "render".into(),
        destination: destination.into(),
        description: json!({}),
        prerequisites: vec![],
        expiry_secs: 60,
    }
}

struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Processor for Recorder {
    fn run(&self, ctx: JobContext) -> BoxFuture<'static, anyhow::Result<Vec<PathBuf>>> {
        let log = self.log.clone();
        let destination = ctx.assignment.spec.destination.clone();
        Box::pin(async move {
            log.lock().unwrap().push(destination);
            Ok(vec![])
        })
    }
}

#[tokio::test]
async fn jobs_from_both_brokers_interleave() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (addr_a, engine_a) = start_broker("net-a", &dir_a).await;
    let (addr_b, engine_b) = start_broker("net-b", &dir_b).await;

    // broker A has a backlog, broker B a single job
    for i in 0..3 {
        engine_a.submit(spec(&format!("a-{i}"))).await.unwrap();
    }
    engine_b.submit(spec("b-0")).await.unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry.register("render", Arc::new(Recorder { log: log.clone() }));

    let workdir = tempfile::tempdir().unwrap();
    let config = Config {
        name: "w1".into(),
        owner: "lab".into(),
        brokers: vec![addr_a.to_string(), addr_b.to_string()],
        shared_secret: None,
        poll_interval_secs: 1,
        max_jobs: 1,
        workdir: workdir.path().to_path_buf(),
        processors: Vec::<ProcessorConfig>::new(),
        logger: Default::default(),
    };
    let dispatch = DispatchLoop::new(&config, Arc::new(registry));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let driver = tokio::spawn(dispatch.run(async {
        let _ = stop_rx.await;
    }));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if log.lock().unwrap().len() == 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "processed so far: {:?}",
            log.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = stop_tx.send(());
    let _ = driver.await;

    let processed = log.lock().unwrap().clone();
    assert_eq!(processed.len(), 4);
    for expected in ["a-0", "a-1", "a-2", "b-0"] {
        assert!(processed.contains(&expected.to_string()), "{processed:?}");
    }
    // rotation: after the first lease from A the cursor moves on, so B's
    // only job is picked up no later than the second acquisition
    let b_pos = processed.iter().position(|d| d == "b-0").unwrap();
    assert!(b_pos <= 1, "b-0 was starved: {processed:?}");
}
