//! Best-effort broadcast of switchover messages.
//!
//! The protocol only requires that messages are usually delivered to every
//! node, including the sender. Ordering and exactly-once delivery are not
//! required, as each node periodically re-announces its status.
use super::{CONTROL_CHANNEL, STATE_CHANNEL};
use anyhow::Context;
use sqlx::postgres::PgListener;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Initial delay before retrying a failed LISTEN stream.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Maximum delay between retries of a failed LISTEN stream.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Message received from a channel of the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

#[async_trait::async_trait]
pub trait Broadcast: Send + Sync {
    /// Publish a payload to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()>;

    /// Subscribe to the state and control channels.
    /// The returned receiver closes only if the subscription is lost for good.
    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<Message>>;
}

/// PgBroadcast implements Broadcast with Postgres LISTEN / NOTIFY.
#[derive(Clone)]
pub struct PgBroadcast {
    pool: sqlx::PgPool,
}

impl PgBroadcast {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Broadcast for PgBroadcast {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        sqlx::query("select pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("notifying channel {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<Message>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("connecting listener")?;
        listener
            .listen_all([STATE_CHANNEL, CONTROL_CHANNEL])
            .await
            .context("listening to switchover channels")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_notifications(listener, tx));
        Ok(rx)
    }
}

#[tracing::instrument(skip_all)]
async fn forward_notifications(mut listener: PgListener, tx: mpsc::UnboundedSender<Message>) {
    let mut backoff = BACKOFF_BASE;

    loop {
        // try_recv returns None when the connection is lost,
        // and reconnects on the next call.
        let item = tokio::select! {
            () = tx.closed() => return, // Subscriber is gone.
            item = listener.try_recv() => item,
        };
        let item = match item {
            Ok(item) => {
                backoff = BACKOFF_BASE;
                item
            }
            Err(err) => {
                tracing::error!(?err, retry_in = ?backoff, "switchover LISTEN stream failed");
                tokio::select! {
                    () = tx.closed() => return,
                    () = tokio::time::sleep(backoff) => (),
                }
                backoff = backoff.saturating_mul(2).min(BACKOFF_MAX);
                continue;
            }
        };

        let Some(item) = item else {
            tracing::warn!("LISTEN/NOTIFY stream from postgres lost, attempting to reconnect");
            continue;
        };

        let message = Message {
            channel: item.channel().to_string(),
            payload: item.payload().to_string(),
        };
        if tx.send(message).is_err() {
            return; // Subscriber is gone.
        }
    }
}

/// MemoryBroadcast is an in-process Broadcast, which delivers every
/// published message to every live subscriber.
#[derive(Clone, Default)]
pub struct MemoryBroadcast {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Message>>>>,
}

impl MemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Broadcast for MemoryBroadcast {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<()> {
        let message = Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }
}
