//! Request execution engine.
//!
//! The [`Engine`] owns the defaults every context starts from, a pool of
//! reusable contexts and the engine counters. It drives one request at a
//! time through [`Engine::serve`]: acquire a context, bind it to the request,
//! run the chain, turn the context into a response and hand it back to the
//! pool. [`Engine::route`] and [`Engine::fallback`] adapt that to axum.
//!
//! ```rust,ignore
//! let engine = Engine::builder().max_body_bytes(1 << 20).build();
//! let app = Router::new()
//!     .route("/users/{id}", engine.route(chain([auth, show_user])))
//!     .fallback_service(engine.fallback(chain([not_found])));
//! ```

use axum::extract::rejection::RawPathParamsRejection;
use axum::extract::{RawPathParams, Request};
use axum::response::Response;
use axum::routing::{MethodRouter, any};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::{Chain, Context, Exit, NoopExit};
use crate::observability::{EngineMetrics, MetricsSnapshot};
use crate::parser::{Parser, Parsers};
use crate::pool::Pool;
use crate::storage::{FileStorage, StorageClient, StorageError};
use crate::validate::{NoopValidator, Validator};

const DEFAULT_MULTIPART_MEMORY: u64 = 32 << 20;
const DEFAULT_MAX_BODY_BYTES: u64 = 32 << 20;
const DEFAULT_POOL_MAX_IDLE: usize = 1024;

/// Settings every context is initialized with and reset back to.
pub struct Defaults {
    pub(crate) parsers: Parsers,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) file_storage: Option<Arc<dyn FileStorage>>,
    pub(crate) multipart_memory: u64,
    pub(crate) max_body_bytes: u64,
    pub(crate) exit: Arc<dyn Exit>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            parsers: Parsers::defaults(),
            validator: Arc::new(NoopValidator),
            file_storage: None,
            multipart_memory: DEFAULT_MULTIPART_MEMORY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            exit: Arc::new(NoopExit),
        }
    }
}

pub struct EngineBuilder {
    defaults: Defaults,
    pool_max_idle: usize,
}

impl EngineBuilder {
    /// Builder preloaded with limits and upload storage from `config`.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let storage = StorageClient::from_config(&config.storage)?;
        Ok(Engine::builder()
            .multipart_memory(config.engine.multipart_memory.as_u64())
            .max_body_bytes(config.engine.max_body_bytes.as_u64())
            .pool_max_idle(config.engine.pool_max_idle)
            .file_storage(Arc::new(storage)))
    }

    /// Replaces the default parser table.
    pub fn parsers(mut self, parsers: Parsers) -> Self {
        self.defaults.parsers = parsers;
        self
    }

    /// Appends a parser to the default table.
    pub fn parser(mut self, parser: impl Parser + 'static) -> Self {
        self.defaults.parsers.push(Arc::new(parser));
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.defaults.validator = validator;
        self
    }

    pub fn file_storage(mut self, storage: Arc<dyn FileStorage>) -> Self {
        self.defaults.file_storage = Some(storage);
        self
    }

    pub fn multipart_memory(mut self, bytes: u64) -> Self {
        self.defaults.multipart_memory = bytes;
        self
    }

    pub fn max_body_bytes(mut self, bytes: u64) -> Self {
        self.defaults.max_body_bytes = bytes;
        self
    }

    /// Exit run when a handler aborts without naming its own.
    pub fn abort(mut self, exit: Arc<dyn Exit>) -> Self {
        self.defaults.exit = exit;
        self
    }

    pub fn pool_max_idle(mut self, max_idle: usize) -> Self {
        self.pool_max_idle = max_idle;
        self
    }

    pub fn build(self) -> Engine {
        let defaults = Arc::new(self.defaults);
        let factory_defaults = Arc::clone(&defaults);
        let pool = Pool::new(self.pool_max_idle, move || {
            Box::new(Context::new(Arc::clone(&factory_defaults)))
        });

        Engine {
            inner: Arc::new(EngineInner {
                defaults,
                pool,
                metrics: EngineMetrics::new(),
            }),
        }
    }
}

struct EngineInner {
    defaults: Arc<Defaults>,
    pool: Pool<Box<Context>>,
    metrics: EngineMetrics,
}

/// Cheap to clone; clones share the pool and counters.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            defaults: Defaults::default(),
            pool_max_idle: DEFAULT_POOL_MAX_IDLE,
        }
    }

    /// Engine with limits and upload storage taken from `config`.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        Ok(EngineBuilder::from_config(config)?.build())
    }

    pub fn multipart_memory(&self) -> u64 {
        self.inner.defaults.multipart_memory
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.inner.defaults.max_body_bytes
    }

    /// A context in its reset state, reused from the pool when possible.
    pub fn acquire(&self) -> Box<Context> {
        let pool = &self.inner.pool;
        let (ctx, reused) = match pool.try_acquire() {
            Some(ctx) => (ctx, true),
            None => (pool.create(), false),
        };
        self.inner.metrics.context_acquired(reused);
        ctx
    }

    /// Runs the context's chain to completion or abort.
    pub async fn run(&self, ctx: &mut Context) {
        self.inner.metrics.request_started();
        debug!(
            method = %ctx.method(),
            path = ctx.uri().path(),
            chain_len = ctx.chain().len(),
            "running chain"
        );

        ctx.start().await;

        if ctx.is_aborted() {
            self.inner.metrics.request_aborted();
        }
        debug!(status = %ctx.status(), aborted = ctx.is_aborted(), "chain finished");
    }

    /// Returns a context to the pool unless it escaped.
    pub fn release(&self, ctx: Box<Context>) {
        if ctx.is_escaped() {
            warn!(path = ctx.uri().path(), "context escaped, not returning it to the pool");
            self.inner.metrics.context_escaped();
            return;
        }
        self.inner.pool.release(ctx);
    }

    /// Serves one request with `handlers`.
    pub async fn serve(
        &self,
        request: Request,
        params: Vec<(String, String)>,
        handlers: Chain,
        matched: bool,
    ) -> Response {
        let (parts, body) = request.into_parts();
        let mut ctx = self.acquire();
        ctx.init(parts, body, params, handlers, matched);

        self.run(&mut ctx).await;

        let response = ctx.take_response();
        self.release(ctx);
        response
    }

    /// Axum endpoint running `handlers` for a matched route, with the
    /// route's path parameters.
    pub fn route(&self, handlers: Chain) -> MethodRouter {
        self.endpoint(handlers, true)
    }

    /// Axum endpoint for requests no route matched.
    pub fn fallback(&self, handlers: Chain) -> MethodRouter {
        self.endpoint(handlers, false)
    }

    fn endpoint(&self, handlers: Chain, matched: bool) -> MethodRouter {
        let engine = self.clone();
        any(
            move |params: Result<RawPathParams, RawPathParamsRejection>, request: Request| {
                let engine = engine.clone();
                let handlers = Arc::clone(&handlers);
                async move {
                    let params = params
                        .map(|params| {
                            params
                                .iter()
                                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                                .collect()
                        })
                        .unwrap_or_default();
                    engine.serve(request, params, handlers, matched).await
                }
            },
        )
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Contexts currently idle in the pool.
    pub fn pool_idle(&self) -> usize {
        self.inner.pool.idle()
    }

    /// Contexts built since the engine started.
    pub fn pool_created(&self) -> u64 {
        self.inner.pool.created()
    }
}
