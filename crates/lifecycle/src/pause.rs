use super::MultiError;
use anyhow::Context;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// PauseResumer is implemented by subsystems which can atomically freeze and
/// unfreeze their side-effecting work.
#[async_trait::async_trait]
pub trait PauseResumer: Send + Sync {
    /// Pause either fully pauses the subsystem and returns Ok, or leaves it
    /// running normally and returns an error. Implementations should return
    /// promptly once `ctx` is cancelled.
    async fn pause(&self, ctx: &CancellationToken) -> anyhow::Result<()>;

    /// Resume returns the subsystem to normal operation.
    async fn resume(&self, ctx: &CancellationToken) -> anyhow::Result<()>;
}

/// Pausable is a read-only view of pause state, for subsystems which need to
/// react to an imminent pause without being composed into it.
pub trait Pausable {
    /// Returns true while a pause is pending or held.
    fn is_pausing(&self) -> bool;

    /// Returns a future which resolves the instant a pause begins.
    fn pause_wait(&self) -> BoxFuture<'static, ()>;
}

/// FnPauseResumer adapts a pair of async closures into a PauseResumer.
pub struct FnPauseResumer<P, R> {
    pause: P,
    resume: R,
}

impl<P, R> FnPauseResumer<P, R> {
    pub fn new(pause: P, resume: R) -> Self {
        Self { pause, resume }
    }
}

#[async_trait::async_trait]
impl<P, PF, R, RF> PauseResumer for FnPauseResumer<P, R>
where
    P: Fn(CancellationToken) -> PF + Send + Sync,
    PF: Future<Output = anyhow::Result<()>> + Send + 'static,
    R: Fn(CancellationToken) -> RF + Send + Sync,
    RF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn pause(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        (self.pause)(ctx.clone()).await
    }

    async fn resume(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        (self.resume)(ctx.clone()).await
    }
}

/// MultiPauseResume composes many PauseResumers into one atomic unit.
///
/// Pause is applied to all members concurrently. If any member fails, or
/// the caller's context is cancelled, the remaining pauses are cancelled and
/// every member which did pause is resumed before the error is returned:
/// the composition is never left partially paused.
///
/// Resume is always applied to every member, regardless of failures.
#[derive(Clone, Default)]
pub struct MultiPauseResume(Vec<Arc<dyn PauseResumer>>);

impl MultiPauseResume {
    pub fn new(members: Vec<Arc<dyn PauseResumer>>) -> Self {
        Self(members)
    }

    pub fn push(&mut self, member: Arc<dyn PauseResumer>) {
        self.0.push(member);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait::async_trait]
impl PauseResumer for MultiPauseResume {
    async fn pause(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        let pause_ctx = ctx.child_token();

        let mut pending: FuturesUnordered<_> = self
            .0
            .iter()
            .enumerate()
            .map(|(index, member)| {
                let pause_ctx = pause_ctx.clone();
                async move { (index, member.pause(&pause_ctx).await) }
            })
            .collect();

        let mut paused = Vec::with_capacity(self.0.len());
        let mut errors = Vec::new();
        let mut failed = false;

        loop {
            let next = tokio::select! {
                next = pending.next() => next,
                () = ctx.cancelled(), if !failed => {
                    failed = true;
                    pause_ctx.cancel();
                    continue;
                }
            };
            let Some((index, result)) = next else {
                break;
            };

            match result {
                Ok(()) => paused.push(index),
                Err(err) => {
                    if !failed {
                        failed = true;
                        pause_ctx.cancel();
                    }
                    errors.push(err.context(format!("pause member {index}")));
                }
            }
        }
        std::mem::drop(pending);

        if !failed {
            return Ok(());
        }
        if errors.is_empty() {
            errors.push(anyhow::anyhow!("pause cancelled"));
        }
        tracing::warn!(
            paused = paused.len(),
            failed = errors.len(),
            "pause failed, resuming paused members"
        );

        // Rolling back must not be cut short by the caller's cancellation.
        let resume_ctx = CancellationToken::new();
        let rollback = futures::future::join_all(paused.into_iter().map(|index| {
            let resume_ctx = &resume_ctx;
            async move {
                self.0[index]
                    .resume(resume_ctx)
                    .await
                    .with_context(|| format!("resume member {index}"))
            }
        }))
        .await;
        errors.extend(rollback.into_iter().filter_map(Result::err));

        Err(MultiError(errors).into())
    }

    async fn resume(&self, ctx: &CancellationToken) -> anyhow::Result<()> {
        let results = futures::future::join_all(self.0.iter().enumerate().map(
            |(index, member)| async move {
                member
                    .resume(ctx)
                    .await
                    .with_context(|| format!("resume member {index}"))
            },
        ))
        .await;

        let errors: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError(errors).into())
        }
    }
}
