use axum::body::Body;
use axum::http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;
use tracing::warn;

use super::{Context, Flow};

const TEXT_HTML_UTF_8: &str = "text/html; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

impl Context {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    /// Sets a response header, replacing any previous value.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    /// Appends raw bytes to the response body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.response_body.extend_from_slice(data.as_ref());
    }

    /// Writes `text` as an HTML/text body.
    pub fn text(&mut self, text: impl AsRef<str>) {
        self.default_content_type(TEXT_HTML_UTF_8);
        self.write(text.as_ref());
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, data: &T) -> Result<(), serde_json::Error> {
        let encoded = serde_json::to_vec(data)?;
        self.default_content_type(APPLICATION_JSON);
        self.write(encoded);
        Ok(())
    }

    /// Writes `data` as JSON and aborts the chain.
    pub fn abort_with_json<T: Serialize + ?Sized>(&mut self, data: &T) -> Flow {
        if let Err(err) = self.json(data) {
            warn!(error = %err, "failed to encode abort body");
        }
        self.abort()
    }

    pub fn abort_with_text(&mut self, text: impl AsRef<str>) -> Flow {
        self.text(text);
        self.abort()
    }

    /// Whether the request asks for a websocket upgrade.
    pub fn is_websocket(&self) -> bool {
        let connection_upgrade = self
            .header(CONNECTION)
            .is_some_and(|value| value.to_ascii_lowercase().contains("upgrade"));
        let upgrade_websocket = self
            .header(UPGRADE)
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
        connection_upgrade && upgrade_websocket
    }

    fn default_content_type(&mut self, value: &'static str) {
        self.response_headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(value));
    }

    /// Moves the written response out, leaving an empty 200 behind.
    pub(crate) fn take_response(&mut self) -> Response {
        let body = Bytes::from(std::mem::take(&mut self.response_body));
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = std::mem::replace(&mut self.status, StatusCode::OK);
        *response.headers_mut() = std::mem::take(&mut self.response_headers);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{context_for_chain, context_with};
    use crate::context::chain;
    use axum::http::Method;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn take_response_collects_writes() {
        let mut ctx = context_for_chain(chain([]));
        ctx.set_status(StatusCode::CREATED);
        ctx.set_header(
            HeaderName::from_static("x-request"),
            HeaderValue::from_static("1"),
        );
        ctx.write("hello ");
        ctx.write(b"world");

        let response = ctx.take_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-request"], "1");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"hello world"));

        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.response_headers().is_empty());
    }

    #[test]
    fn json_sets_content_type_once() {
        let mut ctx = context_for_chain(chain([]));
        ctx.json(&serde_json::json!({ "ok": true })).unwrap();

        assert_eq!(ctx.response_headers()[CONTENT_TYPE], "application/json");
        assert_eq!(&ctx.response_body[..], br#"{"ok":true}"#);
    }

    #[test]
    fn explicit_content_type_wins() {
        let mut ctx = context_for_chain(chain([]));
        ctx.set_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        ctx.text("plain");

        assert_eq!(ctx.response_headers()[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn abort_with_text_writes_then_aborts() {
        let mut ctx = context_for_chain(chain([]));
        assert!(ctx.abort_with_text("denied").is_err());
        assert!(ctx.is_aborted());
        assert_eq!(&ctx.response_body[..], b"denied");
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut ctx = context_with(Method::GET, "/ws", None, "");
        assert!(!ctx.is_websocket());

        let headers = &mut ctx.request_mut().headers;
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(ctx.is_websocket());
    }
}
