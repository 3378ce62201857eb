use super::mainloop::Command;
use super::{marker, offset, CutoverMarker};
use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, PgConnection};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connector opens connections to one database, and exposes the queries
/// which the switchover needs to make of it.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;

    /// Health-check a pooled connection.
    async fn ping(&self, conn: &mut Self::Connection) -> anyhow::Result<()>;

    /// Take the shared switchover lock, and read the cutover marker under it.
    async fn lock_marker(&self, conn: &mut Self::Connection) -> anyhow::Result<CutoverMarker>;

    async fn unlock_marker(&self, conn: &mut Self::Connection) -> anyhow::Result<()>;

    /// Identity of the connected database.
    async fn db_id(&self, conn: &mut Self::Connection) -> anyhow::Result<String>;

    /// Clock offset of the database relative to the local clock.
    async fn clock_offset(&self, conn: &mut Self::Connection) -> anyhow::Result<chrono::Duration>;
}

/// PgConnector connects to a Postgres database.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(url: &url::Url, ca: Option<&str>, application_name: &str) -> anyhow::Result<Self> {
        let mut options = url
            .as_str()
            .parse::<PgConnectOptions>()
            .context("parsing database URL")?
            .application_name(application_name);

        // If a database CA was provided, require that we use TLS with full cert verification.
        if let Some(ca) = ca {
            options = options.ssl_mode(PgSslMode::VerifyFull).ssl_root_cert(ca);
        } else {
            // Otherwise, prefer TLS but don't require it.
            options = options.ssl_mode(PgSslMode::Prefer);
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait::async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> anyhow::Result<PgConnection> {
        Ok(PgConnection::connect_with(&self.options).await?)
    }

    async fn ping(&self, conn: &mut PgConnection) -> anyhow::Result<()> {
        Ok(conn.ping().await?)
    }

    async fn lock_marker(&self, conn: &mut PgConnection) -> anyhow::Result<CutoverMarker> {
        marker::lock_shared(conn).await
    }

    async fn unlock_marker(&self, conn: &mut PgConnection) -> anyhow::Result<()> {
        marker::unlock_shared(conn).await
    }

    async fn db_id(&self, conn: &mut PgConnection) -> anyhow::Result<String> {
        marker::db_id(conn).await
    }

    async fn clock_offset(&self, conn: &mut PgConnection) -> anyhow::Result<chrono::Duration> {
        offset::calc_db_offset(conn).await
    }
}

/// Database targeted by a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Old,
    New,
}

/// SwitchoverConn is a pooled connection which knows its target database.
pub struct SwitchoverConn<T> {
    conn: T,
    target: Target,
    // Whether the connection holds the shared switchover lock.
    locked: bool,
}

impl<T> SwitchoverConn<T> {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn into_inner(self) -> T {
        self.conn
    }
}

impl<T> Deref for SwitchoverConn<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> DerefMut for SwitchoverConn<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

/// SwitchoverManager is a pool manager which intercepts the creation of every
/// connection to consult the cutover marker of the old database. Once the
/// marker is flipped, new connections are opened to the next database and
/// connections to the old database are no longer recycled.
///
/// Old connections which don't hold the shared switchover lock consult the
/// marker again as they're recycled, as the flip may have happened while they
/// sat in the pool. While `draining` is set, old connections are not recycled
/// at all.
pub struct SwitchoverManager<C: Connector> {
    old: C,
    new: C,
    use_next: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl<C: Connector> SwitchoverManager<C> {
    pub(crate) fn new(
        old: C,
        new: C,
        use_next: Arc<AtomicBool>,
        draining: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            old,
            new,
            use_next,
            draining,
            commands,
        }
    }

    // Note that the marker was flipped. Only the first observer reports it.
    fn observe_flip(&self) {
        if !self.use_next.swap(true, Ordering::SeqCst) {
            tracing::info!("cutover marker observed, switching to next database");
            if self.commands.send(Command::Complete).is_err() {
                tracing::warn!("switchover loop is gone, not reporting cutover");
            }
        }
    }

    async fn connect_next(&self) -> anyhow::Result<SwitchoverConn<C::Connection>> {
        let conn = self
            .new
            .connect()
            .await
            .context("connecting to next database")?;

        Ok(SwitchoverConn {
            conn,
            target: Target::New,
            locked: false,
        })
    }
}

impl<C: Connector> deadpool::managed::Manager for SwitchoverManager<C> {
    type Type = SwitchoverConn<C::Connection>;
    type Error = anyhow::Error;

    async fn create(&self) -> Result<Self::Type, anyhow::Error> {
        if self.use_next.load(Ordering::SeqCst) {
            return self.connect_next().await;
        }

        let mut conn = self
            .old
            .connect()
            .await
            .context("connecting to old database")?;

        match self.old.lock_marker(&mut conn).await? {
            CutoverMarker::UseNextDb => {
                std::mem::drop(conn);
                self.observe_flip();
                self.connect_next().await
            }
            // The shared lock is held for the connection's lifetime.
            CutoverMarker::InProgress => Ok(SwitchoverConn {
                conn,
                target: Target::Old,
                locked: true,
            }),
            CutoverMarker::Idle => {
                self.old.unlock_marker(&mut conn).await?;
                Ok(SwitchoverConn {
                    conn,
                    target: Target::Old,
                    locked: false,
                })
            }
        }
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &deadpool::managed::Metrics,
    ) -> deadpool::managed::RecycleResult<anyhow::Error> {
        if conn.target == Target::New {
            return self.new.ping(&mut conn.conn).await.map_err(|e| {
                tracing::warn!(err=?e, database=?conn.target, "connection failed healthcheck");
                deadpool::managed::RecycleError::Backend(e)
            });
        }
        if self.use_next.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            return Err(deadpool::managed::RecycleError::Message(
                "connection targets the old database".into(),
            ));
        }
        // A lock holder blocks the flip, so its marker can't have changed.
        if conn.locked {
            return self.old.ping(&mut conn.conn).await.map_err(|e| {
                tracing::warn!(err=?e, database=?conn.target, "connection failed healthcheck");
                deadpool::managed::RecycleError::Backend(e)
            });
        }

        let marker = self.old.lock_marker(&mut conn.conn).await.map_err(|e| {
            tracing::warn!(err=?e, "failed to read cutover marker of pooled connection");
            deadpool::managed::RecycleError::Backend(e)
        })?;

        match marker {
            CutoverMarker::UseNextDb => {
                self.observe_flip();
                Err(deadpool::managed::RecycleError::Message(
                    "cutover marker was flipped".into(),
                ))
            }
            CutoverMarker::InProgress => {
                conn.locked = true;
                Ok(())
            }
            CutoverMarker::Idle => self
                .old
                .unlock_marker(&mut conn.conn)
                .await
                .map_err(deadpool::managed::RecycleError::Backend),
        }
    }
}
