use super::bus::{Broadcast, Message};
use super::control::ControlMessage;
use super::deadline::instant_of;
use super::{
    App, Connector, DeadlineConfig, Pool, State, Status, Target, CONTROL_CHANNEL, STATE_CHANNEL,
    STATUS_INTERVAL,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Commands sent to the loop from within the local process.
pub(crate) enum Command {
    Abort,
    Reset,
    /// The cutover marker was observed as flipped.
    Complete,
}

/// Identity of this node, as announced to peers.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub node_id: String,
    pub db_id: String,
    pub db_next_id: String,
    pub offset: chrono::Duration,
}

impl Identity {
    pub fn status(&self, state: State, app: &dyn App) -> Status {
        Status {
            node_id: self.node_id.clone(),
            state,
            offset: self.offset,
            db_id: self.db_id.clone(),
            db_next_id: self.db_next_id.clone(),
            active_requests: app.active_requests(),
            at: Utc::now(),
        }
    }
}

struct Deadline {
    name: &'static str,
    at: DateTime<Utc>,
}

struct PendingPause {
    generation: u64,
    cancel: CancellationToken,
}

type PauseResult = (u64, anyhow::Result<()>);

/// MainLoop owns all switchover state of one node. Every input is funneled
/// into its single task, so transitions are applied one at a time.
pub(crate) struct MainLoop<C: Connector> {
    id: Identity,
    app: Arc<dyn App>,
    bus: Arc<dyn Broadcast>,
    pool: Pool<C>,
    // Set while paused, so old connections returned to the pool are discarded.
    draining: Arc<AtomicBool>,

    state: State,
    state_tx: watch::Sender<State>,
    nodes: BTreeMap<String, Status>,
    cfg: Option<DeadlineConfig>,
    deadline: Option<Deadline>,

    pause: Option<PendingPause>,
    generation: u64,
    pause_tx: mpsc::UnboundedSender<PauseResult>,
    pause_rx: mpsc::UnboundedReceiver<PauseResult>,
}

impl<C: Connector> MainLoop<C> {
    pub fn new(
        id: Identity,
        app: Arc<dyn App>,
        bus: Arc<dyn Broadcast>,
        pool: Pool<C>,
        draining: Arc<AtomicBool>,
        state_tx: watch::Sender<State>,
    ) -> Self {
        let (pause_tx, pause_rx) = mpsc::unbounded_channel();

        Self {
            id,
            app,
            bus,
            pool,
            draining,
            state: State::Starting,
            state_tx,
            nodes: BTreeMap::new(),
            cfg: None,
            deadline: None,
            pause: None,
            generation: 0,
            pause_tx,
            pause_rx,
        }
    }

    #[tracing::instrument(name = "switchover", skip_all, fields(node_id = %self.id.node_id))]
    pub async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<Message>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut subscribed = true;

        loop {
            let deadline = self.deadline.as_ref().map(|d| instant_of(d.at));
            let sleep =
                tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now));

            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("switchover loop stopped");
                    return;
                }
                Some((generation, result)) = self.pause_rx.recv() => {
                    self.on_pause_done(generation, result).await;
                }
                () = sleep, if deadline.is_some() => self.on_deadline().await,
                Some(command) = commands.recv() => self.on_command(command).await,
                message = messages.recv(), if subscribed => match message {
                    Some(message) => self.on_message(message).await,
                    None => {
                        // Peers can no longer be observed, so no switchover can proceed.
                        tracing::error!("switchover bus subscription closed, aborting");
                        subscribed = false;
                        self.abort().await;
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }
    }

    fn status(&self) -> Status {
        self.id.status(self.state, self.app.as_ref())
    }

    async fn publish_status(&self) {
        let payload = self.status().serialize();
        if let Err(err) = self.bus.publish(STATE_CHANNEL, &payload).await {
            tracing::error!(error = format!("{err:#}"), "failed to publish status");
        }
    }

    async fn set_state(&mut self, next: State) {
        if !matches!(next, State::Pausing | State::Paused | State::PauseWait) {
            if let Err(err) = self.app.resume().await {
                tracing::error!(error = format!("{err:#}"), "failed to resume application");
            }
        }
        if self.state == State::Complete && next != State::Starting {
            return;
        }
        if next == State::Abort && !self.state.is_active() {
            return; // Already aborted.
        }
        if next == self.state {
            return;
        }

        tracing::info!(from = %self.state, to = %next, "switchover state changed");
        self.draining.store(
            matches!(next, State::Pausing | State::Paused | State::PauseWait),
            Ordering::SeqCst,
        );
        self.state = next;
        self.state_tx.send_replace(next);
        self.publish_status().await;
    }

    async fn abort(&mut self) {
        if let Some(pause) = self.pause.take() {
            pause.cancel.cancel();
        }
        self.deadline = None;
        self.set_state(State::Abort).await;
    }

    fn arm_deadline(&mut self, name: &'static str, at: DateTime<Utc>) {
        self.deadline = Some(Deadline { name, at });
    }

    async fn on_pause_done(&mut self, generation: u64, result: anyhow::Result<()>) {
        match &self.pause {
            Some(pause) if pause.generation == generation => (),
            _ => return, // Superseded by an abort.
        }
        self.pause = None;

        if let Err(err) = result {
            tracing::error!(error = format!("{err:#}"), "pause application failed, aborting");
            return self.abort().await;
        }
        if self.state != State::Pausing {
            return;
        }
        if let Some(at) = self.cfg.as_ref().map(DeadlineConfig::absolute_deadline) {
            self.arm_deadline("switchover", at);
        }

        // Idle connections to the old database hold the shared switchover
        // lock, and would block the cutover for as long as they remain open.
        let _ = self.pool.retain(|conn, _| conn.target() == Target::New);

        self.set_state(State::Paused).await;
    }

    async fn on_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };

        match self.state {
            State::Complete => (),
            State::ArmWait => self.begin_pause().await,
            _ => {
                tracing::warn!(deadline = deadline.name, "switchover deadline reached, aborting");
                self.abort().await;
            }
        }
    }

    async fn begin_pause(&mut self) {
        let Some(cfg) = self.cfg.clone() else {
            return self.abort().await;
        };

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.pause = Some(PendingPause {
            generation,
            cancel: cancel.clone(),
        });
        self.arm_deadline("pause", cfg.pause_deadline());

        let app = self.app.clone();
        let tx = self.pause_tx.clone();
        tokio::spawn(async move {
            let result = app.pause(&cancel, &cfg).await;
            let _ = tx.send((generation, result));
        });

        self.set_state(State::Pausing).await;
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Abort => {
                tracing::info!("abort requested");
                self.abort().await;
            }
            Command::Reset => self.reset().await,
            Command::Complete => self.set_state(State::Complete).await,
        }
    }

    async fn reset(&mut self) {
        tracing::info!("got reset signal");
        self.abort().await;
        self.nodes.clear();
        self.cfg = None;
        self.set_state(State::Starting).await;
    }

    async fn on_message(&mut self, message: Message) {
        match message.channel.as_str() {
            STATE_CHANNEL => match Status::parse(&message.payload) {
                Ok(status) => self.on_status(status).await,
                Err(err) => {
                    tracing::warn!(?err, payload = %message.payload, "discarding malformed status")
                }
            },
            CONTROL_CHANNEL => match ControlMessage::parse(&message.payload, self.id.offset) {
                Ok(control) => self.on_control(control).await,
                Err(err) => tracing::warn!(
                    ?err,
                    payload = %message.payload,
                    "discarding malformed control message"
                ),
            },
            channel => tracing::debug!(channel, "ignoring message of unknown channel"),
        }
    }

    async fn on_control(&mut self, control: ControlMessage) {
        let cfg = match control {
            ControlMessage::Abort => {
                tracing::info!("got abort signal");
                return self.abort().await;
            }
            ControlMessage::Reset => return self.reset().await,
            ControlMessage::Done => {
                tracing::info!("got done signal");
                return self.set_state(State::Complete).await;
            }
            ControlMessage::Arm(cfg) => cfg,
        };

        if self.state != State::Ready {
            tracing::warn!(state = %self.state, "control received but not ready, aborting");
            return self.abort().await;
        }

        tracing::info!(
            begin_at = %cfg.begin_at,
            consensus_deadline = %cfg.consensus_deadline(),
            pause_at = %cfg.pause_at(),
            pause_deadline = %cfg.pause_deadline(),
            absolute_deadline = %cfg.absolute_deadline(),
            pause_in = ?(cfg.pause_at() - Utc::now()).to_std().unwrap_or_default(),
            "switchover armed"
        );

        self.arm_deadline("consensus", cfg.consensus_deadline());
        self.cfg = Some(cfg);
        self.set_state(State::Armed).await;
    }

    async fn on_tick(&mut self) {
        if self.state == State::Starting && self.app.status() == lifecycle::Status::Ready {
            return self.set_state(State::Ready).await;
        }
        self.publish_status().await;
    }

    async fn on_status(&mut self, status: Status) {
        if !self.update_node_status(status).await {
            return;
        }
        let Some((begin_at, pause_at)) = self.cfg.as_ref().map(|cfg| (cfg.begin_at, cfg.pause_at()))
        else {
            return;
        };

        match self.state {
            State::Armed if self.all_nodes(&[State::Armed, State::ArmWait]) => {
                tracing::info!(after = ?elapsed_since(begin_at), "consensus reached");
                self.arm_deadline("pause-at", pause_at);
                self.set_state(State::ArmWait).await;
            }
            State::Paused if self.all_nodes(&[State::Paused, State::PauseWait]) => {
                tracing::info!(after = ?elapsed_since(pause_at), "world paused");
                self.set_state(State::PauseWait).await;
            }
            _ => (),
        }
    }

    // Record a peer's status, returning true if its state changed.
    async fn update_node_status(&mut self, status: Status) -> bool {
        if !status.same_databases(&self.status()) {
            tracing::warn!(node_id = %status.node_id, "node has mismatched databases, aborting");
            self.abort().await;
        }

        let node_id = status.node_id.clone();
        let state = status.state;
        let previous = self.nodes.insert(node_id.clone(), status).map(|s| s.state);

        if previous == Some(state) {
            return false;
        }
        let joined = previous.is_none();
        if joined {
            tracing::info!(%node_id, "node joined");
        }
        tracing::info!(nodes = %self.tally(), "switchover node states");

        if joined && !matches!(self.state, State::Starting | State::Ready) {
            tracing::warn!(%node_id, "node joined during switchover, aborting");
            self.abort().await;
        }
        true
    }

    fn all_nodes(&self, states: &[State]) -> bool {
        self.nodes.values().all(|s| s.state.one_of(states))
    }

    // Summarize node states, as "armed 2/3, ready 1/3".
    fn tally(&self) -> String {
        let mut counts = BTreeMap::<&'static str, usize>::new();
        for status in self.nodes.values() {
            *counts.entry(status.state.into_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(state, n)| format!("{state} {n}/{}", self.nodes.len()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn elapsed_since(at: DateTime<Utc>) -> std::time::Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}
