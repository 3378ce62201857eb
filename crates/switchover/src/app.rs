use super::DeadlineConfig;
use tokio_util::sync::CancellationToken;

/// App is the process being switched over.
#[async_trait::async_trait]
pub trait App: Send + Sync {
    /// Pause all side-effecting work of the process, returning once it's
    /// fully paused. `ctx` is cancelled if the switchover is aborted.
    async fn pause(&self, ctx: &CancellationToken, cfg: &DeadlineConfig) -> anyhow::Result<()>;

    /// Resume normal operation. Called on every transition out of a paused
    /// state, so it must be a cheap no-op when the app isn't paused.
    async fn resume(&self) -> anyhow::Result<()>;

    fn status(&self) -> lifecycle::Status;

    /// Number of requests currently in flight, reported to peers.
    fn active_requests(&self) -> u64 {
        0
    }
}

#[async_trait::async_trait]
impl App for lifecycle::Manager {
    async fn pause(&self, ctx: &CancellationToken, _cfg: &DeadlineConfig) -> anyhow::Result<()> {
        Ok(lifecycle::Manager::pause(self, ctx).await?)
    }

    async fn resume(&self) -> anyhow::Result<()> {
        match lifecycle::Manager::resume(self, &CancellationToken::new()).await {
            // Nothing was ever paused.
            Err(lifecycle::Error::PauseUnsupported) => Ok(()),
            result => Ok(result?),
        }
    }

    fn status(&self) -> lifecycle::Status {
        lifecycle::Manager::status(self)
    }
}
