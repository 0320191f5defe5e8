use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use trellis::context::{BoxFuture, Context, Flow, Handler, chain, exit_fn, handler_fn};
use trellis::engine::Engine;
use trellis::parser::QueryParser;

async fn read_body(response: axum::response::Response) -> String {
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .expect("Failed to read body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("Body is not UTF-8")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("Failed to build request")
}

/// Rejects requests without an `x-token` header using the engine's exit.
fn require_token(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        if ctx.header("x-token").is_none() {
            ctx.set_status(StatusCode::UNAUTHORIZED);
            return ctx.abort();
        }
        ctx.context_value().insert("user", "token-user".to_string());
        Ok(())
    })
}

fn whoami(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let user = ctx
            .context_value()
            .get::<String>("user")
            .map(|user| user.as_str().to_owned())
            .unwrap_or_default();
        ctx.text(user);
        Ok(())
    })
}

fn show_param(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let id = ctx.param("id").unwrap_or_default().to_owned();
        let matched = ctx.is_matched();
        ctx.text(format!("id={id} matched={matched}"));
        Ok(())
    })
}

fn report_unmatched(ctx: &mut Context) -> BoxFuture<'_, Flow> {
    Box::pin(async move {
        let report = format!("matched={} params={}", ctx.is_matched(), ctx.params().len());
        ctx.set_status(StatusCode::NOT_FOUND);
        ctx.text(report);
        Ok(())
    })
}

fn build_app(engine: &Engine) -> Router {
    Router::new()
        .route("/users/{id}", engine.route(chain([handler_fn(show_param)])))
        .route(
            "/me",
            engine.route(chain([handler_fn(require_token), handler_fn(whoami)])),
        )
        .fallback_service(engine.fallback(chain([handler_fn(report_unmatched)])))
}

fn unauthorized_exit() -> Arc<dyn trellis::Exit> {
    exit_fn(|ctx| {
        Box::pin(async move {
            let _ = ctx.json(&json!({ "error": "unauthorized" }));
        })
    })
}

#[tokio::test]
async fn test_path_params_reach_handlers() {
    let engine = Engine::default();
    let response = build_app(&engine).oneshot(get("/users/42")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, "id=42 matched=true");
}

#[tokio::test]
async fn test_fallback_is_unmatched() {
    let engine = Engine::default();
    let response = build_app(&engine).oneshot(get("/nowhere")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_body(response).await, "matched=false params=0");
}

#[tokio::test]
async fn test_abort_runs_engine_exit() {
    let engine = Engine::builder().abort(unauthorized_exit()).build();
    let response = build_app(&engine).oneshot(get("/me")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(read_body(response).await, r#"{"error":"unauthorized"}"#);
    assert_eq!(engine.metrics().aborted, 1);
}

#[tokio::test]
async fn test_context_values_flow_between_handlers() {
    let engine = Engine::default();
    let request = Request::builder()
        .uri("/me")
        .header("x-token", "secret")
        .body(Body::empty())
        .unwrap();

    let response = build_app(&engine).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, "token-user");
}

#[derive(Debug, Deserialize)]
struct Search {
    q: String,
    #[serde(default)]
    page: u32,
}

#[tokio::test]
async fn test_query_binding_through_parser() {
    let engine = Engine::builder().parser(QueryParser).build();
    let search = handler_fn(|ctx| {
        Box::pin(async move {
            match ctx.data::<Search>().await {
                Ok(search) => ctx.text(format!("{}:{}", search.q, search.page)),
                Err(err) => {
                    ctx.set_status(StatusCode::BAD_REQUEST);
                    ctx.text(err.to_string());
                }
            }
            Ok(())
        })
    });
    let app = Router::new().route("/search", engine.route(chain([search])));

    let response = app.oneshot(get("/search?q=rust&page=3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_body(response).await, "rust:3");
}

#[tokio::test]
async fn test_body_limit_surfaces_to_handler() {
    let engine = Engine::builder().max_body_bytes(8).build();
    let handler = handler_fn(|ctx| {
        Box::pin(async move {
            if let Err(err) = ctx.body_bytes().await {
                ctx.set_status(StatusCode::PAYLOAD_TOO_LARGE);
                return ctx.abort_with_text(err.to_string());
            }
            Ok(())
        })
    });
    let app = Router::new().route("/ingest", engine.route(chain([handler])));

    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"too":"large for eight bytes"}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(read_body(response).await, "request body exceeds 8 bytes");
}

/// Hands the request store to a background task and keeps the context out
/// of the pool.
struct Detach {
    done: tokio::sync::mpsc::Sender<Option<u32>>,
}

#[async_trait::async_trait]
impl Handler for Detach {
    async fn call(&self, ctx: &mut Context) -> Flow {
        let values = ctx.context_value();
        values.insert("job", 7u32);
        ctx.escape();

        let done = self.done.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let job = values.get::<u32>("job").map(|job| *job);
            let _ = done.send(job).await;
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_escaped_context_keeps_values_for_background_work() {
    let engine = Engine::builder().pool_max_idle(4).build();
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let app = Router::new().route(
        "/detach",
        engine.route(chain([Arc::new(Detach { done: tx }) as Arc<dyn Handler>])),
    );

    let response = app.oneshot(get("/detach")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(rx.recv().await, Some(Some(7)));
    assert_eq!(engine.pool_idle(), 0);
    assert_eq!(engine.metrics().escaped, 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_pool() {
    let engine = Engine::builder().pool_max_idle(16).build();
    let app = build_app(&engine);

    let requests: Vec<_> = (0..32)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app.oneshot(get(&format!("/users/{i}"))).await.unwrap();
                read_body(response).await
            })
        })
        .collect();

    for (i, handle) in requests.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), format!("id={i} matched=true"));
    }

    let metrics = engine.metrics();
    assert_eq!(metrics.requests, 32);
    assert_eq!(metrics.reused + metrics.allocated, 32);
    assert!(engine.pool_idle() <= 16);
    assert_eq!(engine.pool_created(), metrics.allocated);
}
