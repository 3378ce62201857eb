use super::bus::Broadcast;
use super::deadline::instant_of;
use super::{marker, DeadlineConfig, ParseError, State, Status, CONTROL_CHANNEL, STATE_CHANNEL};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::task::AbortOnDropHandle;

/// Seconds after which a node's status is reported as stale.
const STALE_AFTER_SECS: i64 = 5;

/// Message of the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The switchover finished without a cutover observed by the node.
    Done,
    Abort,
    /// Abort, forget all peers, and start over.
    Reset,
    /// Begin a switchover with the given deadlines.
    Arm(DeadlineConfig),
}

impl ControlMessage {
    pub fn serialize(&self, offset: chrono::Duration) -> String {
        match self {
            Self::Done => "done".to_string(),
            Self::Abort => "abort".to_string(),
            Self::Reset => "reset".to_string(),
            Self::Arm(cfg) => cfg.serialize(offset),
        }
    }

    pub fn parse(payload: &str, offset: chrono::Duration) -> Result<Self, ParseError> {
        Ok(match payload {
            "done" => Self::Done,
            "abort" => Self::Abort,
            "reset" => Self::Reset,
            _ => Self::Arm(DeadlineConfig::parse(payload, offset)?),
        })
    }
}

/// Controller is the operator's view of the fleet. It tracks the latest
/// status of every node, and issues control messages.
pub struct Controller {
    bus: Arc<dyn Broadcast>,
    offset: chrono::Duration,
    nodes: Arc<Mutex<BTreeMap<String, Status>>>,
    updates: watch::Receiver<u64>,
    _listener: AbortOnDropHandle<()>,
}

impl Controller {
    /// Subscribe to the bus. `offset` is the operator's own clock offset
    /// from the old database.
    pub async fn new(bus: Arc<dyn Broadcast>, offset: chrono::Duration) -> anyhow::Result<Self> {
        let mut messages = bus.subscribe().await.context("subscribing to switchover bus")?;
        let nodes = Arc::new(Mutex::new(BTreeMap::new()));
        let (updates_tx, updates) = watch::channel(0u64);

        let listener = {
            let nodes = nodes.clone();
            tokio::spawn(async move {
                while let Some(message) = messages.recv().await {
                    if message.channel != STATE_CHANNEL {
                        continue;
                    }
                    let status = match Status::parse(&message.payload) {
                        Ok(status) => status,
                        Err(err) => {
                            tracing::warn!(?err, "discarding malformed status");
                            continue;
                        }
                    };
                    nodes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(status.node_id.clone(), status);
                    updates_tx.send_modify(|n| *n += 1);
                }
            })
        };

        Ok(Self {
            bus,
            offset,
            nodes,
            updates,
            _listener: AbortOnDropHandle::new(listener),
        })
    }

    /// Latest status of every known node, ordered by node ID.
    pub fn node_status(&self) -> Vec<Status> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Returns true if at least one node is known and all are Ready.
    pub fn ready(&self) -> bool {
        let nodes = self.node_status();
        !nodes.is_empty() && nodes.iter().all(|s| s.state == State::Ready)
    }

    /// Nodes which haven't announced their status recently.
    pub fn stale(&self) -> Vec<String> {
        let horizon = Utc::now() - chrono::Duration::seconds(STALE_AFTER_SECS);
        self.node_status()
            .into_iter()
            .filter(|s| s.at < horizon)
            .map(|s| s.node_id)
            .collect()
    }

    /// Wait until `expected` nodes are all in one of `states`. Fails if any
    /// node aborts, if the number of nodes changes, or if `deadline` passes.
    pub async fn wait_for(
        &self,
        expected: usize,
        states: &[State],
        deadline: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut updates = self.updates.clone();
        let sleep = tokio::time::sleep_until(instant_of(deadline));
        tokio::pin!(sleep);

        loop {
            let nodes = self.node_status();
            if let Some(aborted) = nodes.iter().find(|s| s.state == State::Abort) {
                anyhow::bail!("node {} aborted", aborted.node_id);
            }
            if nodes.len() > expected {
                anyhow::bail!("node count changed (expected {expected}, got {})", nodes.len());
            }
            if nodes.len() == expected && nodes.iter().all(|s| s.state.one_of(states)) {
                return Ok(());
            }

            tokio::select! {
                changed = updates.changed() => changed.context("controller listener stopped")?,
                () = &mut sleep => anyhow::bail!(
                    "timed out waiting for nodes to reach {states:?} ({})",
                    summarize(&nodes),
                ),
            }
        }
    }

    /// Arm every node for a switchover with the given deadlines.
    pub async fn arm(&self, cfg: &DeadlineConfig) -> anyhow::Result<()> {
        self.send(ControlMessage::Arm(cfg.clone())).await
    }

    pub async fn abort(&self) -> anyhow::Result<()> {
        self.send(ControlMessage::Abort).await
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        self.send(ControlMessage::Reset).await
    }

    pub async fn done(&self) -> anyhow::Result<()> {
        self.send(ControlMessage::Done).await
    }

    async fn send(&self, message: ControlMessage) -> anyhow::Result<()> {
        self.bus
            .publish(CONTROL_CHANNEL, &message.serialize(self.offset))
            .await
    }

    /// Mark a switchover of the old database as in progress. From here on,
    /// new connections of the fleet hold the shared switchover lock until
    /// they close, and the marker may be flipped.
    pub async fn enable(&self, conn: &mut sqlx::PgConnection) -> anyhow::Result<()> {
        marker::enable(conn).await
    }

    /// Return the cutover marker of the old database to idle.
    pub async fn disable(&self, conn: &mut sqlx::PgConnection) -> anyhow::Result<()> {
        marker::disable(conn).await
    }

    /// Flip the cutover marker of the old database, leaving at least a
    /// second before the fleet's absolute deadline.
    pub async fn flip(
        &self,
        conn: &mut sqlx::PgConnection,
        cfg: &DeadlineConfig,
    ) -> anyhow::Result<()> {
        let remaining = (cfg.absolute_deadline() - Utc::now() - chrono::Duration::seconds(1))
            .to_std()
            .unwrap_or_default();
        marker::flip_to_next(conn, remaining).await
    }
}

fn summarize(nodes: &[Status]) -> String {
    nodes
        .iter()
        .map(|s| format!("{}={}", s.node_id, s.state))
        .collect::<Vec<_>>()
        .join(", ")
}
