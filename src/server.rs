use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{error, info};

use trellis::config::Config;
use trellis::context::{BoxFuture, Context, DataError, Flow, Handler, chain, handler_fn};
use trellis::engine::{Engine, EngineBuilder};
use trellis::storage::StorageError;
use trellis::validate::{TypedValidator, ValidationError};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(address: SocketAddr, config: Config) -> Result<(), AnyError> {
    info!(
        provider = ?config.storage.provider,
        max_body_bytes = %config.engine.max_body_bytes,
        "Building engine"
    );
    let engine = EngineBuilder::from_config(&config)?
        .validator(Arc::new(TypedValidator::<Message, _>::new(validate_message)))
        .build();

    let app = router(&engine)
        // Automatically decompress gzip request bodies
        .layer(RequestDecompressionLayer::new());

    let listener = TcpListener::bind(address).await?;
    info!(%address, "trellis server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(engine: &Engine) -> Router {
    Router::new()
        .route("/health", engine.route(chain([handler_fn(health)])))
        .route(
            "/metrics",
            engine.route(chain([Arc::new(Metrics(engine.clone())) as Arc<dyn Handler>])),
        )
        .route(
            "/echo",
            engine.route(chain([handler_fn(log_request), handler_fn(echo)])),
        )
        .route(
            "/upload/{field}",
            engine.route(chain([handler_fn(log_request), handler_fn(upload)])),
        )
        .fallback_service(engine.fallback(chain([
            handler_fn(log_request),
            handler_fn(not_found),
        ])))
}

#[derive(Debug, Deserialize, Serialize)]
struct Message {
    name: String,
    #[serde(default)]
    text: String,
}

fn validate_message(message: &Message) -> Result<(), ValidationError> {
    if message.name.trim().is_empty() {
        return Err(ValidationError::field("name", "must not be empty"));
    }
    Ok(())
}

fn health(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        ctx.text("ok");
        Ok(())
    })
}

/// Logs every request once the rest of the chain has run.
fn log_request(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let started = Instant::now();
        let result = ctx.next().await;
        info!(
            method = %ctx.method(),
            path = ctx.uri().path(),
            status = ctx.status().as_u16(),
            aborted = ctx.is_aborted(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request handled"
        );
        result
    })
}

fn echo(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let message = match ctx.data::<Message>().await {
            Ok(message) => message,
            Err(err) => return reject(ctx, data_error_status(&err), err.to_string()),
        };
        if let Err(err) = ctx.json(&message) {
            return reject(ctx, StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
        Ok(())
    })
}

fn upload(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let field = ctx.param("field").unwrap_or("file").to_owned();
        match ctx.save_upload_file(&field).await {
            Ok(key) => {
                ctx.set_status(StatusCode::CREATED);
                if let Err(err) = ctx.json(&json!({ "key": key })) {
                    return reject(ctx, StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
                }
                Ok(())
            }
            Err(StorageError::MissingFile(name)) => reject(
                ctx,
                StatusCode::BAD_REQUEST,
                format!("no file uploaded as '{name}'"),
            ),
            Err(StorageError::Form(err)) => reject(ctx, data_error_status(&err), err.to_string()),
            Err(err) => {
                error!(error = %err, "Failed to store upload");
                reject(ctx, StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    })
}

fn not_found(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let path = ctx.uri().path().to_owned();
        reject(ctx, StatusCode::NOT_FOUND, format!("no route for {path}"))
    })
}

struct Metrics(Engine);

#[async_trait]
impl Handler for Metrics {
    async fn call(&self, ctx: &mut Context) -> Flow {
        let snapshot = self.0.metrics();
        if let Err(err) = ctx.json(&snapshot) {
            return reject(ctx, StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
        Ok(())
    }
}

fn reject(ctx: &mut Context, status: StatusCode, message: String) -> Flow {
    ctx.set_status(status);
    ctx.abort_with_json(&json!({ "error": message }))
}

fn data_error_status(err: &DataError) -> StatusCode {
    match err {
        DataError::Parse(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        DataError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        DataError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DataError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        DataError::Body(_) | DataError::Decode(_) | DataError::Multipart(_) => {
            StatusCode::BAD_REQUEST
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
