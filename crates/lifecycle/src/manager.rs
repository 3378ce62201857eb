use super::{Error, Pausable, PauseResumer};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Status of a lifecycle Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Starting,
    Ready,
    Pausing,
    Paused,
    // Terminal: no other status follows Shutdown.
    Shutdown,
}

type Hook = Box<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

// Returns an already-fired token.
fn fired() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Manager wraps the startup, run, and shutdown functions of a process with
/// strong guarantees:
///
/// * Run may be called at most once, and never after Shutdown.
/// * Shutdown is idempotent, interrupts a pending startup or pause, cancels
///   the run function, and waits for it to return.
/// * Pause either fully succeeds or leaves the process running, and Resume
///   always returns the process to Ready (unless it's shutting down).
///
/// Every mutation happens while holding the `inner` lock, which is never
/// held across an await point. Operations which must wait on one another
/// instead wait on signals, racing them against their caller's cancellation.
/// Futures returned by Manager methods should be driven to completion:
/// cancel an operation through its `ctx` rather than by dropping it.
pub struct Manager {
    run_fn: Hook,
    shutdown_fn: Hook,
    inner: Mutex<Inner>,

    startup_done: CancellationToken,
    run_done: CancellationToken,
    shutdown_done: CancellationToken,
}

struct Inner {
    status: Status,
    startup_fn: Option<Hook>,
    pause_resume: Option<Arc<dyn PauseResumer>>,

    startup_cancel: CancellationToken,
    startup_err: Option<Error>,
    run_cancel: CancellationToken,
    shutdown_cancel: CancellationToken,
    shutdown_err: Option<Error>,

    // Cancels the pending pause, if any.
    pause_cancel: CancellationToken,
    // Fired once the pending pause has settled.
    pause_done: CancellationToken,
    // Fired the instant a pause begins. Replaced whenever the process
    // returns to Ready, so it fires at most once per pause.
    pause_start: CancellationToken,
    is_pausing: bool,
    // Present while a resume is being applied.
    resuming: Option<CancellationToken>,
}

impl Manager {
    /// Build a Manager wrapping the given run and shutdown functions.
    /// Each receives a token which is cancelled when it should return.
    pub fn new<R, RF, S, SF>(run: R, shutdown: S) -> Self
    where
        R: Fn(CancellationToken) -> RF + Send + Sync + 'static,
        RF: Future<Output = anyhow::Result<()>> + Send + 'static,
        S: Fn(CancellationToken) -> SF + Send + Sync + 'static,
        SF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            run_fn: hook(run),
            shutdown_fn: hook(shutdown),
            inner: Mutex::new(Inner {
                status: Status::Unknown,
                startup_fn: None,
                pause_resume: None,
                startup_cancel: CancellationToken::new(),
                startup_err: None,
                run_cancel: CancellationToken::new(),
                shutdown_cancel: CancellationToken::new(),
                shutdown_err: None,
                pause_cancel: CancellationToken::new(),
                pause_done: fired(),
                pause_start: CancellationToken::new(),
                is_pausing: false,
                resuming: None,
            }),
            startup_done: CancellationToken::new(),
            run_done: CancellationToken::new(),
            shutdown_done: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set an optional startup function which is run before the run function.
    pub fn set_startup_fn<F, Fut>(&self, startup: F) -> Result<(), Error>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut inner = self.lock();
        match inner.status {
            Status::Shutdown => Err(Error::Shutdown),
            Status::Unknown => {
                inner.startup_fn = Some(hook(startup));
                Ok(())
            }
            _ => Err(Error::AlreadyStarted),
        }
    }

    /// Set the PauseResumer used by `pause` and `resume`.
    pub fn set_pause_resumer(&self, pause_resume: Arc<dyn PauseResumer>) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.is_pausing
            || inner.resuming.is_some()
            || matches!(inner.status, Status::Pausing | Status::Paused)
        {
            return Err(Error::PauseInProgress);
        }
        inner.pause_resume = Some(pause_resume);
        Ok(())
    }

    /// Current status. Never blocks on a pending operation.
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Wait for startup to complete, whether it succeeded, failed, or was
    /// pre-empted by shutdown.
    pub async fn wait_for_startup(&self, ctx: &CancellationToken) -> Result<(), Error> {
        tokio::select! {
            () = ctx.cancelled() => Err(Error::Cancelled),
            () = self.startup_done.cancelled() => {
                let startup_err = self.lock().startup_err.clone();
                startup_err.map_or(Ok(()), Err)
            }
        }
    }

    /// Run the startup function, if any, and then the run function.
    /// Blocks until the run function returns. If Shutdown is called
    /// concurrently, Run also waits for the shutdown to complete.
    pub async fn run(&self, ctx: &CancellationToken) -> Result<(), Error> {
        let (startup_fn, startup_ctx) = {
            let mut inner = self.lock();
            match inner.status {
                Status::Shutdown => return Err(Error::Shutdown),
                Status::Unknown => (),
                _ => return Err(Error::AlreadyStarted),
            }
            let startup_ctx = ctx.child_token();
            inner.startup_cancel = startup_ctx.clone();
            inner.status = Status::Starting;
            (inner.startup_fn.take(), startup_ctx)
        };

        let startup_err = match startup_fn {
            Some(startup) => startup(startup_ctx.clone()).await.err().map(Error::failed),
            None => None,
        };
        startup_ctx.cancel();

        let run_ctx = {
            let mut inner = self.lock();
            match inner.status {
                Status::Shutdown => {
                    // Not an error to be shut down while starting.
                    inner.startup_err = Some(Error::Shutdown);
                    self.startup_done.cancel();
                    return Ok(());
                }
                Status::Starting => (),
                status => panic!("invariant violated: lifecycle status {status:?} after startup"),
            }
            inner.startup_err = startup_err.clone();

            if let Some(err) = startup_err {
                self.startup_done.cancel();
                return Err(err);
            }

            let run_ctx = ctx.child_token();
            inner.run_cancel = run_ctx.clone();
            inner.status = Status::Ready;
            self.startup_done.cancel();
            run_ctx
        };

        let result = (self.run_fn)(run_ctx).await;
        self.run_done.cancel();

        if self.status() == Status::Shutdown {
            self.shutdown_done.cancelled().await;
        }
        result.map_err(Error::failed)
    }

    /// Shut down the process. Safe to call many times and from many tasks:
    /// every caller observes the result of the one shutdown sequence.
    ///
    /// If `ctx` is cancelled, the shutdown function's own context is
    /// cancelled to hurry it along, but the sequence still runs to completion
    /// before Shutdown returns.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), Error> {
        enum Step {
            Await(CancellationToken),
            Existing(CancellationToken),
            Begin {
                shutdown_ctx: CancellationToken,
                run_cancel: Option<CancellationToken>,
                await_startup: bool,
                await_pause: Option<CancellationToken>,
            },
        }

        let (shutdown_ctx, run_cancel) = loop {
            let step = {
                let mut inner = self.lock();

                if let Some(resuming) = &inner.resuming {
                    Step::Await(resuming.clone())
                } else {
                    let mut run_cancel = None;
                    let mut await_startup = false;
                    let mut await_pause = None;

                    match inner.status {
                        Status::Shutdown => {
                            Step::Existing(inner.shutdown_cancel.clone())
                        }
                        Status::Unknown => {
                            inner.status = Status::Shutdown;
                            inner.startup_err = Some(Error::Shutdown);
                            inner.pause_start.cancel();
                            inner.pause_cancel.cancel();
                            self.startup_done.cancel();
                            self.shutdown_done.cancel();
                            return Ok(());
                        }
                        status => {
                            match status {
                                Status::Starting => {
                                    inner.startup_cancel.cancel();
                                    inner.pause_start.cancel();
                                    // A pause queued behind startup observes the shutdown.
                                    inner.pause_cancel.cancel();
                                    await_startup = true;
                                }
                                Status::Pausing => {
                                    inner.pause_cancel.cancel();
                                    await_pause = Some(inner.pause_done.clone());
                                    run_cancel = Some(inner.run_cancel.clone());
                                }
                                Status::Ready => {
                                    inner.pause_start.cancel();
                                    run_cancel = Some(inner.run_cancel.clone());
                                }
                                Status::Paused => {
                                    run_cancel = Some(inner.run_cancel.clone());
                                }
                                Status::Unknown | Status::Shutdown => unreachable!(),
                            }
                            let shutdown_ctx = CancellationToken::new();
                            inner.shutdown_cancel = shutdown_ctx.clone();
                            inner.status = Status::Shutdown;

                            Step::Begin {
                                shutdown_ctx,
                                run_cancel,
                                await_startup,
                                await_pause,
                            }
                        }
                    }
                }
            };

            match step {
                Step::Await(resuming) => resuming.cancelled().await,
                Step::Existing(shutdown_cancel) => {
                    tokio::select! {
                        () = self.shutdown_done.cancelled() => (),
                        () = ctx.cancelled() => {
                            shutdown_cancel.cancel();
                            self.shutdown_done.cancelled().await;
                        }
                    }
                    let shutdown_err = self.lock().shutdown_err.clone();
                    return shutdown_err.map_or(Ok(()), Err);
                }
                Step::Begin {
                    shutdown_ctx,
                    run_cancel,
                    await_startup,
                    await_pause,
                } => {
                    if await_startup {
                        self.startup_done.cancelled().await;
                    }
                    if let Some(pause_done) = await_pause {
                        pause_done.cancelled().await;
                    }
                    break (shutdown_ctx, run_cancel);
                }
            }
        };

        tracing::debug!("running shutdown function");

        let mut shutdown = (self.shutdown_fn)(shutdown_ctx.clone());
        let result = tokio::select! {
            result = &mut shutdown => result,
            () = ctx.cancelled() => {
                shutdown_ctx.cancel();
                shutdown.await
            }
        };

        if let Some(run_cancel) = run_cancel {
            run_cancel.cancel();
            self.run_done.cancelled().await;
        }

        let err = result.err().map(Error::failed);
        self.lock().shutdown_err = err.clone();
        shutdown_ctx.cancel();
        self.shutdown_done.cancel();

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pause the process using the registered PauseResumer.
    ///
    /// Pause is atomic: it returns Ok only once the process is Paused, and
    /// otherwise leaves it running normally. Calling Pause while Paused
    /// returns Ok immediately. A Pause requested before startup completes
    /// waits for startup and then pauses.
    pub async fn pause(&self, ctx: &CancellationToken) -> Result<(), Error> {
        enum Step {
            Await(CancellationToken),
            Begin {
                pause_resume: Arc<dyn PauseResumer>,
                pause_ctx: CancellationToken,
                pause_done: CancellationToken,
                is_ready: bool,
            },
        }

        loop {
            let step = {
                let mut inner = self.lock();
                let Some(pause_resume) = inner.pause_resume.clone() else {
                    return Err(Error::PauseUnsupported);
                };

                if let Some(resuming) = &inner.resuming {
                    Step::Await(resuming.clone())
                } else {
                    match inner.status {
                        Status::Shutdown => return Err(Error::Shutdown),
                        Status::Paused => return Ok(()),
                        _ if inner.is_pausing => Step::Await(inner.pause_done.clone()),
                        Status::Ready if self.run_done.is_cancelled() => {
                            return Err(Error::NotStarted)
                        }
                        status => {
                            let pause_ctx = ctx.child_token();
                            let pause_done = CancellationToken::new();
                            inner.pause_cancel = pause_ctx.clone();
                            inner.pause_done = pause_done.clone();
                            inner.is_pausing = true;

                            let is_ready = status == Status::Ready;
                            if is_ready {
                                inner.pause_start.cancel();
                                inner.status = Status::Pausing;
                            }
                            Step::Begin {
                                pause_resume,
                                pause_ctx,
                                pause_done,
                                is_ready,
                            }
                        }
                    }
                }
            };

            match step {
                Step::Await(done) => {
                    tokio::select! {
                        () = ctx.cancelled() => return Err(Error::Cancelled),
                        () = done.cancelled() => continue,
                    }
                }
                Step::Begin {
                    pause_resume,
                    pause_ctx,
                    pause_done,
                    is_ready,
                } => {
                    let _guard = PauseGuard {
                        manager: self,
                        pause_ctx: pause_ctx.clone(),
                        pause_done,
                    };
                    return self
                        .apply_pause(pause_resume.as_ref(), &pause_ctx, is_ready)
                        .await;
                }
            }
        }
    }

    async fn apply_pause(
        &self,
        pause_resume: &dyn PauseResumer,
        pause_ctx: &CancellationToken,
        is_ready: bool,
    ) -> Result<(), Error> {
        if !is_ready {
            tokio::select! {
                () = pause_ctx.cancelled() => {
                    let mut inner = self.lock();
                    inner.is_pausing = false;
                    return Err(if inner.status == Status::Shutdown {
                        Error::Shutdown
                    } else {
                        Error::Cancelled
                    });
                }
                () = self.startup_done.cancelled() => (),
            }

            let mut inner = self.lock();
            match inner.status {
                Status::Ready => {
                    inner.pause_start.cancel();
                    inner.status = Status::Pausing;
                }
                Status::Shutdown => {
                    inner.is_pausing = false;
                    return Err(Error::Shutdown);
                }
                // Startup failed.
                Status::Starting => {
                    inner.is_pausing = false;
                    return Err(Error::NotStarted);
                }
                status => panic!("invariant violated: lifecycle status {status:?} after startup"),
            }
        }

        let result = pause_resume.pause(pause_ctx).await;
        pause_ctx.cancel();

        let mut inner = self.lock();
        inner.is_pausing = false;

        match inner.status {
            Status::Shutdown => return Err(Error::Shutdown),
            Status::Pausing => (),
            status => panic!("invariant violated: lifecycle status {status:?} while pausing"),
        }

        match result {
            Ok(()) => {
                inner.status = Status::Paused;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    error = format!("{err:#}"),
                    "pause failed, resuming normal operation"
                );
                inner.pause_start = CancellationToken::new();
                inner.status = Status::Ready;
                Err(Error::failed(err))
            }
        }
    }

    /// Resume normal operation. Resume always results in a Ready status
    /// (unless shutdown has begun), even if the PauseResumer fails to resume,
    /// in which case the error is still returned.
    pub async fn resume(&self, ctx: &CancellationToken) -> Result<(), Error> {
        enum Step {
            Await(CancellationToken),
            Begin(Arc<dyn PauseResumer>, CancellationToken),
        }

        loop {
            let step = {
                let mut inner = self.lock();
                let Some(pause_resume) = inner.pause_resume.clone() else {
                    return Err(Error::PauseUnsupported);
                };

                if let Some(resuming) = &inner.resuming {
                    Step::Await(resuming.clone())
                } else if inner.status == Status::Shutdown {
                    return Err(Error::Shutdown);
                } else if inner.is_pausing {
                    // Abandon the pending pause and wait for it to settle.
                    inner.pause_cancel.cancel();
                    Step::Await(inner.pause_done.clone())
                } else if inner.status != Status::Paused {
                    return Ok(());
                } else {
                    let resuming = CancellationToken::new();
                    inner.resuming = Some(resuming.clone());
                    inner.pause_start = CancellationToken::new();
                    Step::Begin(pause_resume, resuming)
                }
            };

            match step {
                Step::Await(done) => done.cancelled().await,
                Step::Begin(pause_resume, resuming) => {
                    let _guard = ResumeGuard {
                        manager: self,
                        resuming,
                    };
                    return pause_resume.resume(ctx).await.map_err(Error::failed);
                }
            }
        }
    }

    /// Returns true if the process is paused, pausing, or shutting down.
    pub fn is_pausing(&self) -> bool {
        let inner = self.lock();
        match inner.status {
            Status::Pausing | Status::Paused | Status::Shutdown => true,
            _ => inner.is_pausing,
        }
    }

    /// Returns a future which resolves once a pause begins (or shutdown).
    pub fn pause_wait(&self) -> BoxFuture<'static, ()> {
        let pause_start = self.lock().pause_start.clone();
        Box::pin(async move { pause_start.cancelled().await })
    }
}

// PauseGuard settles a pending pause however its operation exits,
// including if the operation's future is dropped.
struct PauseGuard<'m> {
    manager: &'m Manager,
    pause_ctx: CancellationToken,
    pause_done: CancellationToken,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.pause_ctx.cancel();
        {
            let mut inner = self.manager.lock();
            if inner.is_pausing {
                inner.is_pausing = false;
                if inner.status == Status::Pausing {
                    inner.pause_start = CancellationToken::new();
                    inner.status = Status::Ready;
                }
            }
        }
        self.pause_done.cancel();
    }
}

struct ResumeGuard<'m> {
    manager: &'m Manager,
    resuming: CancellationToken,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        {
            let mut inner = self.manager.lock();
            inner.resuming = None;
            if inner.status == Status::Paused {
                inner.status = Status::Ready;
            }
        }
        self.resuming.cancel();
    }
}

#[async_trait::async_trait]
impl PauseResumer for Manager {
    async fn pause(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        Ok(Manager::pause(self, ctx).await?)
    }

    async fn resume(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        Ok(Manager::resume(self, ctx).await?)
    }
}

impl Pausable for Manager {
    fn is_pausing(&self) -> bool {
        Manager::is_pausing(self)
    }

    fn pause_wait(&self) -> BoxFuture<'static, ()> {
        Manager::pause_wait(self)
    }
}
