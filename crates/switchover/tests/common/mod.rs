use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchover::bus::{Broadcast, Message};
use switchover::{App, Connector, CutoverMarker, DeadlineConfig, Handler, State};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// In-memory database with a cutover marker.
#[derive(Clone)]
pub struct FakeDatabase {
    pub name: &'static str,
    pub marker: Arc<Mutex<CutoverMarker>>,
}

impl FakeDatabase {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            marker: Arc::new(Mutex::new(CutoverMarker::Idle)),
        }
    }

    pub fn set_marker(&self, marker: CutoverMarker) {
        *self.marker.lock().unwrap() = marker;
    }
}

pub struct FakeConnection {
    pub database: &'static str,
}

#[async_trait::async_trait]
impl Connector for FakeDatabase {
    type Connection = FakeConnection;

    async fn connect(&self) -> anyhow::Result<FakeConnection> {
        Ok(FakeConnection {
            database: self.name,
        })
    }

    async fn ping(&self, _conn: &mut FakeConnection) -> anyhow::Result<()> {
        Ok(())
    }

    async fn lock_marker(&self, _conn: &mut FakeConnection) -> anyhow::Result<CutoverMarker> {
        let marker = *self.marker.lock().unwrap();
        Ok(marker)
    }

    async fn unlock_marker(&self, _conn: &mut FakeConnection) -> anyhow::Result<()> {
        Ok(())
    }

    async fn db_id(&self, _conn: &mut FakeConnection) -> anyhow::Result<String> {
        Ok(format!("{}-id", self.name))
    }

    async fn clock_offset(&self, _conn: &mut FakeConnection) -> anyhow::Result<chrono::Duration> {
        Ok(chrono::Duration::zero())
    }
}

/// Application which becomes ready on request and tracks whether it's paused.
#[derive(Default)]
pub struct FakeApp {
    pub ready: AtomicBool,
    pub fail_pause: AtomicBool,
    pub paused: AtomicBool,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl FakeApp {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl App for FakeApp {
    async fn pause(&self, _ctx: &CancellationToken, _cfg: &DeadlineConfig) -> anyhow::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        if self.fail_pause.load(Ordering::SeqCst) {
            anyhow::bail!("app refused to pause");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> lifecycle::Status {
        if self.ready.load(Ordering::SeqCst) {
            lifecycle::Status::Ready
        } else {
            lifecycle::Status::Starting
        }
    }
}

pub struct Node {
    pub handler: Handler<FakeDatabase>,
    pub app: Arc<FakeApp>,
}

impl Node {
    pub fn set_ready(&self) {
        self.app.ready.store(true, Ordering::SeqCst);
    }
}

/// Start a node whose application is not yet ready.
pub async fn start_node(
    bus: &Arc<dyn Broadcast>,
    old: &FakeDatabase,
    new: &FakeDatabase,
    id: &str,
) -> Node {
    let app = Arc::new(FakeApp::default());
    let handler = Handler::start(
        id.to_string(),
        old.clone(),
        new.clone(),
        bus.clone(),
        app.clone(),
        4,
    )
    .await
    .unwrap();
    Node { handler, app }
}

/// Start `ids.len()` nodes sharing one pair of databases. Applications become
/// ready only once every node has subscribed, so that no node misses the
/// announcement of another.
pub async fn start_fleet(
    bus: &Arc<dyn Broadcast>,
    old: &FakeDatabase,
    new: &FakeDatabase,
    ids: &[&str],
) -> Vec<Node> {
    let mut nodes = Vec::new();
    for id in ids {
        nodes.push(start_node(bus, old, new, id).await);
    }
    for node in &nodes {
        node.set_ready();
    }
    nodes
}

/// Broadcast whose subscriptions all close once `kill` is cancelled,
/// as if the bus connection were lost for good.
pub struct KillableBroadcast {
    pub inner: Arc<dyn Broadcast>,
    pub kill: CancellationToken,
}

#[async_trait::async_trait]
impl Broadcast for KillableBroadcast {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<Message>> {
        let mut upstream = self.inner.subscribe().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let kill = self.kill.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = kill.cancelled() => return,
                    message = upstream.recv() => message,
                };
                match message {
                    Some(message) => {
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        });
        Ok(rx)
    }
}

/// Short deadlines for in-process scenarios.
pub fn quick_deadlines() -> DeadlineConfig {
    DeadlineConfig {
        consensus_timeout: Duration::from_millis(1000),
        pause_delay: Duration::from_millis(1500),
        pause_timeout: Duration::from_millis(1000),
        max_pause: Duration::from_millis(2500),
        ..Default::default()
    }
}

/// Wait for the node to reach `state`, failing after `timeout`.
pub async fn wait_state(node: &Node, state: State, timeout: Duration) {
    let mut rx = node.handler.watch();
    let reached = matches!(
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await,
        Ok(Ok(_))
    );
    assert!(
        reached,
        "node {} did not reach {state} (at {})",
        node.handler.node_id(),
        node.handler.state(),
    );
}
