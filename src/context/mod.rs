//! Request-scoped state.
//!
//! A [`Context`] is handed to every handler of a chain. It owns the incoming
//! request, the response being built, the chain cursor and abort bookkeeping,
//! memoized query/form values and an optional [`ValueMap`] for data that
//! handlers pass to each other.
//!
//! Contexts are pooled by the engine. Everything a request puts into a
//! context is cleared by [`Reset`] before the context is reused.

mod chain;
mod error;
mod response;
mod store;
mod values;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{AsHeaderName, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::engine::Defaults;
use crate::parser::{
    FormParser, JsonParser, MultipartForm, MultipartParser, Parser, Parsers, QueryParser,
};
use crate::pool::Reset;
use crate::storage::{FileStorage, StorageError};
use crate::validate::Validator;

pub use chain::{
    Abort, BoxFuture, Chain, Exit, Flow, Handler, NoopExit, chain, exit_fn, handler_fn,
};
pub use error::DataError;
pub use store::ValueMap;
pub use values::{Value, Values};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const MULTIPART_FORM_DATA: &str = "multipart/form-data";

pub struct Context {
    defaults: Arc<Defaults>,

    request: Parts,
    body: Body,
    params: Vec<(String, String)>,

    chain: Chain,
    index: usize,
    active: Option<usize>,
    abort_index: Option<usize>,
    pending_exit: Option<Arc<dyn Exit>>,
    exit: Arc<dyn Exit>,
    matched: bool,
    escaped: bool,

    parsers: Parsers,
    validator: Arc<dyn Validator>,
    file_storage: Option<Arc<dyn FileStorage>>,
    multipart_memory: u64,
    max_body_bytes: u64,

    values: Option<Arc<ValueMap>>,
    query_cache: Option<Values>,
    form_cache: Option<Values>,
    body_cache: Option<Bytes>,
    multipart_cache: Option<MultipartForm>,

    status: StatusCode,
    response_headers: HeaderMap,
    response_body: BytesMut,
}

fn blank_parts() -> Parts {
    Request::new(()).into_parts().0
}

fn empty_chain() -> Chain {
    Arc::from(Vec::new())
}

impl Context {
    pub(crate) fn new(defaults: Arc<Defaults>) -> Self {
        Self {
            request: blank_parts(),
            body: Body::empty(),
            params: Vec::new(),
            chain: empty_chain(),
            index: 0,
            active: None,
            abort_index: None,
            pending_exit: None,
            exit: Arc::clone(&defaults.exit),
            matched: false,
            escaped: false,
            parsers: Parsers::new(),
            validator: Arc::clone(&defaults.validator),
            file_storage: defaults.file_storage.clone(),
            multipart_memory: defaults.multipart_memory,
            max_body_bytes: defaults.max_body_bytes,
            values: None,
            query_cache: None,
            form_cache: None,
            body_cache: None,
            multipart_cache: None,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_body: BytesMut::new(),
            defaults,
        }
    }

    /// Binds a fresh or reset context to one request.
    pub(crate) fn init(
        &mut self,
        request: Parts,
        body: Body,
        params: Vec<(String, String)>,
        chain: Chain,
        matched: bool,
    ) {
        self.request = request;
        self.body = body;
        self.params = params;
        self.chain = chain;
        self.matched = matched;
    }

    pub fn request(&self) -> &Parts {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Parts {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn uri(&self) -> &Uri {
        &self.request.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    /// Request header as a string; `None` when absent or not visible ASCII.
    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.request.headers.get(name)?.to_str().ok()
    }

    /// Lower-cased `Content-Type` header, parameters included.
    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE).map(str::to_ascii_lowercase)
    }

    /// Path parameters captured by the router, in pattern order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Whether a route matched, as opposed to the fallback chain running.
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    /// Keeps this context out of the pool once the request completes.
    ///
    /// The context itself is dropped when the request ends, since no
    /// `&mut Context` can outlive its handler. Data meant for work that runs
    /// after the request belongs in [`Context::context_value`], whose handle
    /// stays valid for as long as a task holds it.
    pub fn escape(&mut self) {
        self.escaped = true;
    }

    pub fn is_escaped(&self) -> bool {
        self.escaped
    }

    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    pub fn set_validator(&mut self, validator: Arc<dyn Validator>) {
        self.validator = validator;
    }

    pub fn file_storage(&self) -> Option<&Arc<dyn FileStorage>> {
        self.file_storage.as_ref()
    }

    pub fn set_file_storage(&mut self, storage: Arc<dyn FileStorage>) {
        self.file_storage = Some(storage);
    }

    pub fn multipart_memory(&self) -> u64 {
        self.multipart_memory
    }

    pub fn set_multipart_memory(&mut self, bytes: u64) {
        self.multipart_memory = bytes;
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_bytes
    }

    pub fn set_max_body_bytes(&mut self, bytes: u64) {
        self.max_body_bytes = bytes;
    }

    /// Request-scoped store, acquired from a shared pool on first use.
    ///
    /// The returned handle can be moved into spawned tasks. A store that is
    /// still held elsewhere when the request ends is left to those holders
    /// instead of being recycled.
    pub fn context_value(&mut self) -> Arc<ValueMap> {
        Arc::clone(self.values.get_or_insert_with(|| store::VALUE_MAPS.acquire()))
    }

    /// Decoded URL query, parsed on first call.
    pub fn query(&mut self) -> &Values {
        self.query_cache
            .get_or_insert_with(|| Values::parse(self.request.uri.query().unwrap_or_default()))
    }

    pub fn query_value(&mut self, key: &str) -> Value {
        Value::new(self.query().get(key))
    }

    pub fn query_values(&mut self, key: &str) -> Vec<String> {
        self.query()
            .get_all(key)
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Posted form values, parsed on first call.
    ///
    /// URL-encoded bodies are read for `POST`, `PUT` and `PATCH`; multipart
    /// bodies contribute their text fields. Any other request yields an
    /// empty set.
    pub async fn form(&mut self) -> Result<&Values, DataError> {
        if self.form_cache.is_none() {
            let values = self.read_form().await?;
            self.form_cache = Some(values);
        }
        let values: &Values = self.form_cache.get_or_insert_with(Values::default);
        Ok(values)
    }

    pub async fn form_value(&mut self, key: &str) -> Result<Value, DataError> {
        Ok(Value::new(self.form().await?.get(key)))
    }

    pub async fn form_values(&mut self, key: &str) -> Result<Vec<String>, DataError> {
        let values = self.form().await?;
        Ok(values.get_all(key).into_iter().map(str::to_owned).collect())
    }

    async fn read_form(&mut self) -> Result<Values, DataError> {
        let Some(content_type) = self.content_type() else {
            return Ok(Values::default());
        };

        if content_type.contains(MULTIPART_FORM_DATA) {
            return Ok(self.multipart().await?.values.clone());
        }

        let essence = content_type.split(';').next().unwrap_or_default().trim();
        let has_body = matches!(*self.method(), Method::POST | Method::PUT | Method::PATCH);
        if has_body && essence == FORM_URLENCODED {
            let body = self.body_bytes().await?;
            return Ok(Values::parse_bytes(&body));
        }

        Ok(Values::default())
    }

    /// Whole request body, buffered once and bounded by the body limit.
    pub async fn body_bytes(&mut self) -> Result<Bytes, DataError> {
        if let Some(bytes) = &self.body_cache {
            return Ok(bytes.clone());
        }

        let limit = self.max_body_bytes;
        let body = std::mem::take(&mut self.body);
        let collected = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX))
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    DataError::PayloadTooLarge(limit)
                } else {
                    DataError::Body(err.to_string())
                }
            })?;

        let bytes = collected.to_bytes();
        self.body_cache = Some(bytes.clone());
        Ok(bytes)
    }

    /// Takes the raw body stream. Later body reads see only what was
    /// already buffered.
    pub fn take_body(&mut self) -> Body {
        match &self.body_cache {
            Some(bytes) => Body::from(bytes.clone()),
            None => std::mem::take(&mut self.body),
        }
    }

    /// Decoded multipart body, read on first call within the memory budget.
    pub async fn multipart(&mut self) -> Result<&MultipartForm, DataError> {
        if self.multipart_cache.is_none() {
            let limit = usize::try_from(self.max_body_bytes).unwrap_or(usize::MAX);
            let body = Body::new(Limited::new(self.take_body(), limit));
            let mut request = Request::new(body);
            *request.headers_mut() = self.request.headers.clone();

            let form =
                MultipartForm::read(request, self.multipart_memory, self.max_body_bytes).await?;
            self.multipart_cache = Some(form);
        }
        let form: &MultipartForm = self.multipart_cache.get_or_insert_with(MultipartForm::default);
        Ok(form)
    }

    /// Decodes the body with the first matching parser, then validates it.
    ///
    /// Parsers added with [`Context::add_parser`] are tried before the
    /// engine defaults. Fails with [`DataError::Parse`] when none match.
    pub async fn data<T>(&mut self) -> Result<T, DataError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let parsers = self.parsers.chain(&self.defaults.parsers);
        let value: T = parsers.parse_into(self).await?;
        self.validator.validate(&value)?;
        Ok(value)
    }

    /// Adds parsers ahead of the defaults, for this request only.
    pub fn add_parser(&mut self, parser: Arc<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// Decodes the body with `parser` regardless of content type. No validation.
    pub async fn bind<T: DeserializeOwned>(&mut self, parser: &dyn Parser) -> Result<T, DataError> {
        let payload = parser.parse(self).await?;
        Ok(payload.decode()?)
    }

    pub async fn bind_query<T: DeserializeOwned>(&mut self) -> Result<T, DataError> {
        self.bind(&QueryParser).await
    }

    pub async fn bind_form<T: DeserializeOwned>(&mut self) -> Result<T, DataError> {
        self.bind(&FormParser).await
    }

    pub async fn bind_json<T: DeserializeOwned>(&mut self) -> Result<T, DataError> {
        self.bind(&JsonParser).await
    }

    pub async fn bind_multipart<T: DeserializeOwned>(&mut self) -> Result<T, DataError> {
        self.bind(&MultipartParser).await
    }

    /// Stores the upload under `name` with the context's file storage.
    pub async fn save_upload_file(&mut self, name: &str) -> Result<String, StorageError> {
        let storage = self.file_storage.clone().ok_or(StorageError::NoBackend)?;
        self.save_upload_file_with(storage.as_ref(), name).await
    }

    pub async fn save_upload_file_with(
        &mut self,
        storage: &dyn FileStorage,
        name: &str,
    ) -> Result<String, StorageError> {
        let form = self.multipart().await?;
        let file = form
            .file(name)
            .ok_or_else(|| StorageError::MissingFile(name.to_string()))?;
        storage.save(file).await
    }
}

impl Reset for Context {
    fn reset(&mut self) {
        self.request = blank_parts();
        self.body = Body::empty();
        self.params.clear();

        self.chain = empty_chain();
        self.index = 0;
        self.active = None;
        self.abort_index = None;
        self.pending_exit = None;
        self.exit = Arc::clone(&self.defaults.exit);
        self.matched = false;
        self.escaped = false;

        self.parsers.clear();
        self.validator = Arc::clone(&self.defaults.validator);
        self.file_storage = self.defaults.file_storage.clone();
        self.multipart_memory = self.defaults.multipart_memory;
        self.max_body_bytes = self.defaults.max_body_bytes;

        if let Some(values) = self.values.take() {
            store::reclaim(values);
        }
        self.query_cache = None;
        self.form_cache = None;
        self.body_cache = None;
        self.multipart_cache = None;

        self.status = StatusCode::OK;
        self.response_headers.clear();
        self.response_body.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context_with;
    use super::*;
    use crate::parser::ParseError;
    use crate::parser::multipart_tests::{BOUNDARY, multipart_body};
    use crate::validate::{TypedValidator, ValidationError};
    use async_trait::async_trait;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Named {
        name: String,
    }

    #[tokio::test]
    async fn data_decodes_json() {
        let mut ctx = context_with(
            Method::POST,
            "/",
            Some("application/json"),
            r#"{"name":"a"}"#,
        );
        let named: Named = ctx.data().await.unwrap();
        assert_eq!(named.name, "a");
    }

    #[tokio::test]
    async fn data_rejects_unknown_content_type() {
        let mut ctx = context_with(Method::POST, "/", Some("text/plain"), "a");
        let err = ctx.data::<Named>().await.unwrap_err();
        assert!(matches!(err, DataError::Parse(ParseError)));
        assert!(err.is_parse_error());
    }

    #[tokio::test]
    async fn data_runs_validator_after_decode() {
        let mut ctx = context_with(
            Method::POST,
            "/",
            Some("application/json"),
            r#"{"name":""}"#,
        );
        ctx.set_validator(Arc::new(TypedValidator::new(|named: &Named| {
            if named.name.is_empty() {
                return Err(ValidationError::field("name", "required"));
            }
            Ok(())
        })));

        let err = ctx.data::<Named>().await.unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));
    }

    #[tokio::test]
    async fn data_binds_form_bodies() {
        let mut ctx = context_with(
            Method::POST,
            "/",
            Some("application/x-www-form-urlencoded"),
            "name=from+form",
        );
        let named: Named = ctx.data().await.unwrap();
        assert_eq!(named.name, "from form");
    }

    #[tokio::test]
    async fn data_binds_repeated_form_keys() {
        #[derive(Debug, Deserialize)]
        struct Tags {
            tags: Vec<String>,
        }

        let mut ctx = context_with(
            Method::POST,
            "/",
            Some("application/x-www-form-urlencoded"),
            "tags=a&tags=b",
        );
        let tags: Tags = ctx.data().await.unwrap();
        assert_eq!(tags.tags, vec!["a", "b"]);
        assert_eq!(ctx.form_values("tags").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn data_binds_multipart_text_fields() {
        let body = multipart_body(&[("name", None, "from multipart")]);
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let mut ctx = context_with(Method::POST, "/", Some(&content_type), &body);

        let named: Named = ctx.data().await.unwrap();
        assert_eq!(named.name, "from multipart");
        assert_eq!(ctx.form_value("name").await.unwrap().as_str(), "from multipart");
    }

    struct PlainText;

    #[async_trait]
    impl Parser for PlainText {
        fn matches(&self, ctx: &Context) -> bool {
            ctx.content_type().as_deref() == Some("text/plain")
        }

        async fn parse(&self, ctx: &mut Context) -> Result<crate::parser::Payload, DataError> {
            let body = ctx.body_bytes().await?;
            let text = String::from_utf8_lossy(&body).into_owned();
            Ok(crate::parser::Payload::Value(
                serde_json::json!({ "name": text }),
            ))
        }
    }

    #[tokio::test]
    async fn added_parsers_apply_to_this_request_only() {
        let mut ctx = context_with(Method::POST, "/", Some("text/plain"), "plain");
        ctx.add_parser(Arc::new(PlainText));

        let named: Named = ctx.data().await.unwrap();
        assert_eq!(named.name, "plain");

        ctx.reset();
        assert!(ctx.parsers.is_empty());
    }

    #[tokio::test]
    async fn body_limit_is_enforced() {
        let mut ctx = context_with(Method::POST, "/", Some("application/json"), "0123456789");
        ctx.set_max_body_bytes(4);

        let err = ctx.body_bytes().await.unwrap_err();
        assert!(matches!(err, DataError::PayloadTooLarge(4)));
    }

    #[tokio::test]
    async fn body_is_buffered_once() {
        let mut ctx = context_with(Method::POST, "/", Some("application/json"), "{}");
        let first = ctx.body_bytes().await.unwrap();
        let second = ctx.body_bytes().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Bytes::from_static(b"{}"));
    }

    #[test]
    fn query_is_memoized() {
        let mut ctx = context_with(Method::GET, "/items?page=2&tag=a&tag=b", None, "");
        let first = ctx.query().clone();

        ctx.request_mut().uri = Uri::from_static("/items?page=9");
        assert_eq!(ctx.query(), &first);
        assert_eq!(ctx.query_value("page").as_str(), "2");
        assert_eq!(ctx.query_values("tag"), vec!["a", "b"]);
        assert!(!ctx.query_value("missing").is_present());
    }

    #[tokio::test]
    async fn form_is_memoized() {
        let mut ctx = context_with(
            Method::POST,
            "/",
            Some("application/x-www-form-urlencoded"),
            "a=1&a=2",
        );
        assert_eq!(ctx.form_values("a").await.unwrap(), vec!["1", "2"]);

        ctx.request_mut()
            .headers
            .insert(CONTENT_TYPE, "text/plain".parse().unwrap());
        assert_eq!(ctx.form_value("a").await.unwrap().as_str(), "1");
    }

    #[tokio::test]
    async fn form_ignores_bodies_of_get_requests() {
        let mut ctx = context_with(
            Method::GET,
            "/",
            Some("application/x-www-form-urlencoded"),
            "a=1",
        );
        assert!(ctx.form().await.unwrap().is_empty());
    }

    #[test]
    fn params_lookup() {
        let mut ctx = context_with(Method::GET, "/users/7", None, "");
        ctx.params = vec![("id".into(), "7".into())];
        assert_eq!(ctx.param("id"), Some("7"));
        assert_eq!(ctx.param("other"), None);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let mut ctx = context_with(
            Method::POST,
            "/x?q=1",
            Some("application/x-www-form-urlencoded"),
            "a=1",
        );
        ctx.index = 3;
        ctx.abort_index = Some(1);
        ctx.pending_exit = Some(Arc::new(NoopExit));
        ctx.escape();
        ctx.query();
        ctx.form().await.unwrap();
        ctx.context_value().insert("user", 1u32);
        ctx.set_status(StatusCode::CREATED);
        ctx.write("body");
        ctx.set_max_body_bytes(1);

        ctx.reset();

        assert_eq!(ctx.index(), 0);
        assert!(!ctx.is_aborted());
        assert!(ctx.pending_exit.is_none());
        assert!(!ctx.is_escaped());
        assert!(!ctx.is_matched());
        assert!(ctx.query_cache.is_none());
        assert!(ctx.form_cache.is_none());
        assert!(ctx.body_cache.is_none());
        assert!(ctx.values.is_none());
        assert!(ctx.headers().is_empty());
        assert_eq!(ctx.status(), StatusCode::OK);
        assert!(ctx.response_body.is_empty());
        assert_eq!(ctx.max_body_bytes(), ctx.defaults.max_body_bytes);
        assert!(ctx.context_value().is_empty());
    }
}
