//! Handler chain traversal and abort control flow.
//!
//! Handlers return a [`Flow`]. `Ok(())` hands control back to the executor,
//! which moves on to the next handler. `Err(Abort)` is produced by
//! [`Context::abort`] and propagated with `?` up to the top of the request.
//! The abort is also recorded on the context, so a middleware that inspects
//! the result of [`Context::next`] and returns `Ok(())` still cannot resume
//! the chain, and the pending [`Exit`] runs once the chain unwinds. Panics
//! are not caught here: they are defects and travel to the runtime like any
//! other panic.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use super::Context;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of running a handler.
pub type Flow = Result<(), Abort>;

/// Ordered handlers matched for one request.
pub type Chain = Arc<[Arc<dyn Handler>]>;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut Context) -> Flow;
}

#[async_trait]
impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Flow> + Send + Sync,
{
    async fn call(&self, ctx: &mut Context) -> Flow {
        (self)(ctx).await
    }
}

/// Wraps a closure returning a boxed future as a handler.
///
/// ```rust,ignore
/// let hello = handler_fn(|ctx| Box::pin(async move {
///     ctx.text("hello");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn chain<I>(handlers: I) -> Chain
where
    I: IntoIterator<Item = Arc<dyn Handler>>,
{
    handlers.into_iter().collect()
}

/// What runs once an aborted request has unwound to the top.
#[async_trait]
pub trait Exit: Send + Sync {
    async fn exit(&self, ctx: &mut Context);
}

#[async_trait]
impl<F> Exit for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync,
{
    async fn exit(&self, ctx: &mut Context) {
        (self)(ctx).await
    }
}

pub fn exit_fn<F>(f: F) -> Arc<dyn Exit>
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Default exit: leaves the response as the handlers built it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExit;

#[async_trait]
impl Exit for NoopExit {
    async fn exit(&self, _ctx: &mut Context) {}
}

/// Early-termination signal carrying the exit to run.
#[must_use = "an abort only takes effect when returned from the handler"]
pub struct Abort {
    exit: Arc<dyn Exit>,
}

impl Abort {
    pub fn exit(&self) -> &Arc<dyn Exit> {
        &self.exit
    }
}

impl fmt::Debug for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abort").finish_non_exhaustive()
    }
}

impl Context {
    /// Runs the remaining handlers in order.
    ///
    /// Calling this from inside a handler runs everything downstream before
    /// returning, which is how middleware wraps the rest of the chain. The
    /// cursor never moves past `len + 1`, so the outer loop simply stops
    /// once a nested call has drained the chain. Once the request has been
    /// aborted this returns the abort without running anything else.
    pub async fn next(&mut self) -> Flow {
        self.check_aborted()?;
        let end = self.chain.len() + 1;
        self.index = (self.index + 1).min(end);

        while let Some(handler) = self.chain.get(self.index - 1).cloned() {
            let outer = self.active.replace(self.index - 1);
            let flow = handler.call(self).await;
            self.active = outer;
            flow?;
            self.check_aborted()?;
            self.index = (self.index + 1).min(end);
        }
        Ok(())
    }

    fn check_aborted(&self) -> Flow {
        match &self.pending_exit {
            Some(exit) => Err(Abort {
                exit: Arc::clone(exit),
            }),
            None => Ok(()),
        }
    }

    /// Stops the chain with the request's configured exit.
    ///
    /// ```rust,ignore
    /// if !authorized {
    ///     ctx.set_status(StatusCode::UNAUTHORIZED);
    ///     return ctx.abort();
    /// }
    /// ```
    pub fn abort(&mut self) -> Flow {
        let exit = Arc::clone(&self.exit);
        self.abort_with(exit)
    }

    /// Stops the chain and runs `exit` instead of the configured one.
    ///
    /// The recorded position is the handler currently executing, even when
    /// it aborts after a nested [`Context::next`] has drained the chain. The
    /// latest exit wins when a request aborts more than once.
    pub fn abort_with(&mut self, exit: Arc<dyn Exit>) -> Flow {
        if self.abort_index.is_none() {
            let last = self.chain.len().saturating_sub(1);
            let position = self
                .active
                .unwrap_or_else(|| self.index.saturating_sub(1).min(last));
            self.abort_index = Some(position);
        }
        self.pending_exit = Some(Arc::clone(&exit));
        Err(Abort { exit })
    }

    /// Replaces the exit used by [`Context::abort`] for this request.
    pub fn set_abort(&mut self, exit: Arc<dyn Exit>) {
        self.exit = exit;
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_index.is_some()
    }

    /// Zero-based chain position of the handler that aborted.
    pub fn abort_index(&self) -> Option<usize> {
        self.abort_index
    }

    /// The handler that aborted, for drivers that run a final handler.
    pub fn abort_handler(&self) -> Option<Arc<dyn Handler>> {
        self.chain.get(self.abort_index?).cloned()
    }

    /// One-based cursor into the chain; `len + 1` once the chain is done.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub(crate) async fn start(&mut self) {
        if let Err(abort) = self.next().await {
            self.pending_exit = Some(abort.exit);
        }
        if let Some(exit) = self.pending_exit.take() {
            debug!(abort_index = ?self.abort_index, "request aborted");
            exit.exit(self).await;
        }
    }
}
