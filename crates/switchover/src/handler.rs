use super::bus::{Broadcast, PgBroadcast};
use super::mainloop::{Command, Identity, MainLoop};
use super::{marker, App, Connector, HandlerArgs, PgConnector, State, Status, SwitchoverManager};
use anyhow::Context;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

/// Pool of connections which are transparently cut over to the next database.
pub type Pool<C> = deadpool::managed::Pool<SwitchoverManager<C>>;

/// Handler participates in switchovers on behalf of one process.
///
/// Applications acquire database connections through [`Handler::get`]. Once
/// the fleet has paused and the cutover marker of the old database is
/// flipped, connections are opened to the next database instead.
pub struct Handler<C: Connector> {
    id: Identity,
    app: Arc<dyn App>,
    pool: Pool<C>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<State>,
    shutdown: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl Handler<PgConnector> {
    /// Build a Handler from command-line arguments, using Postgres
    /// LISTEN / NOTIFY of the old database as the broadcast bus.
    pub async fn from_args(args: &HandlerArgs, app: Arc<dyn App>) -> anyhow::Result<Self> {
        let ca = args.database_ca.as_deref();
        let old = PgConnector::new(&args.database_url, ca, &args.application_name)
            .context("configuring old database")?;
        let new = PgConnector::new(&args.database_next_url, ca, &args.application_name)
            .context("configuring next database")?;

        let bus_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect_with(old.options().clone())
            .await
            .context("connecting to old database for switchover bus")?;

        let node_id = args
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let handler = Self::start(
            node_id,
            old,
            new,
            Arc::new(PgBroadcast::new(bus_pool)),
            app,
            args.max_connections,
        )
        .await?;

        handler.ensure_not_stale().await?;
        Ok(handler)
    }

    /// Fail if the pool would hand out connections to a database which
    /// the fleet has already moved away from. Once the cutover marker is
    /// flipped the pool connects to the next database, so this only fails
    /// if the databases are misconfigured.
    pub async fn ensure_not_stale(&self) -> anyhow::Result<()> {
        let mut conn = self.get().await?;
        marker::ensure_not_stale(&mut conn).await
    }
}

impl<C: Connector> Handler<C> {
    /// Start a Handler. Fails if either database can't be reached or the bus
    /// can't be subscribed to, in which case the process should not serve.
    #[tracing::instrument(skip(old, new, bus, app))]
    pub async fn start(
        node_id: String,
        old: C,
        new: C,
        bus: Arc<dyn Broadcast>,
        app: Arc<dyn App>,
        max_connections: usize,
    ) -> anyhow::Result<Self> {
        let mut conn = old.connect().await.context("connecting to old database")?;
        let offset = old
            .clock_offset(&mut conn)
            .await
            .context("measuring database clock offset")?;
        let db_id = old
            .db_id(&mut conn)
            .await
            .context("reading old database identity")?;
        std::mem::drop(conn);

        let mut conn = new.connect().await.context("connecting to next database")?;
        let db_next_id = new
            .db_id(&mut conn)
            .await
            .context("reading next database identity")?;
        std::mem::drop(conn);

        let messages = bus.subscribe().await.context("subscribing to switchover bus")?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(State::Starting);

        let draining = Arc::new(AtomicBool::new(false));
        let manager = SwitchoverManager::new(
            old,
            new,
            Arc::new(AtomicBool::new(false)),
            draining.clone(),
            commands_tx.clone(),
        );
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .context("building connection pool")?;

        let id = Identity {
            node_id,
            db_id,
            db_next_id,
            offset,
        };
        tracing::info!(
            db_id = %id.db_id,
            db_next_id = %id.db_next_id,
            "switchover handler started"
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            MainLoop::new(id.clone(), app.clone(), bus, pool.clone(), draining, state_tx).run(
                messages,
                commands_rx,
                shutdown.clone(),
            ),
        );

        Ok(Self {
            id,
            app,
            pool,
            commands: commands_tx,
            state: state_rx,
            shutdown,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// Acquire a pooled connection.
    pub async fn get(&self) -> anyhow::Result<deadpool::managed::Object<SwitchoverManager<C>>> {
        match self.pool.get().await {
            Ok(conn) => Ok(conn),
            Err(deadpool::managed::PoolError::Backend(e)) => Err(e),
            Err(e) => anyhow::bail!(e),
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn node_id(&self) -> &str {
        &self.id.node_id
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Watch for changes of the local switchover state.
    pub fn watch(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// Current status of this node, as announced to peers.
    pub fn status(&self) -> Status {
        self.id.status(self.state(), self.app.as_ref())
    }

    /// Abort any in-progress switchover and resume the application.
    pub fn abort(&self) {
        if self.commands.send(Command::Abort).is_err() {
            tracing::warn!("switchover loop is gone, dropping abort");
        }
    }

    /// Abort, forget all known peers, and start over.
    pub fn reset(&self) {
        if self.commands.send(Command::Reset).is_err() {
            tracing::warn!("switchover loop is gone, dropping reset");
        }
    }

    /// Stop participating in switchovers. The pool remains usable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
