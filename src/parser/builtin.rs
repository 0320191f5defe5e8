use async_trait::async_trait;
use axum::http::Method;

use super::{Parser, Payload};
use crate::context::{Context, DataError};

fn content_type_is(ctx: &Context, expected: &mime::Mime) -> bool {
    ctx.content_type()
        .is_some_and(|ct| ct == expected.essence_str())
}

/// `application/x-www-form-urlencoded`, exact match.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormParser;

#[async_trait]
impl Parser for FormParser {
    fn name(&self) -> &'static str {
        "form"
    }

    fn matches(&self, ctx: &Context) -> bool {
        content_type_is(ctx, &mime::APPLICATION_WWW_FORM_URLENCODED)
    }

    async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError> {
        let values = ctx.form().await?.clone();
        Ok(Payload::Form(values))
    }
}

/// `application/json`, exact match.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

#[async_trait]
impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn matches(&self, ctx: &Context) -> bool {
        content_type_is(ctx, &mime::APPLICATION_JSON)
    }

    async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError> {
        Ok(Payload::Json(ctx.body_bytes().await?))
    }
}

/// Any content type containing `multipart/form-data`. Only the text fields
/// are bound; uploaded files stay on [`Context::multipart`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartParser;

#[async_trait]
impl Parser for MultipartParser {
    fn name(&self) -> &'static str {
        "multipart"
    }

    fn matches(&self, ctx: &Context) -> bool {
        ctx.content_type()
            .is_some_and(|ct| ct.contains(mime::MULTIPART_FORM_DATA.essence_str()))
    }

    async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError> {
        let values = ctx.multipart().await?.values.clone();
        Ok(Payload::Form(values))
    }
}

/// Binds the URL query string. Matches body-less methods only, so it is not
/// part of the default table.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryParser;

#[async_trait]
impl Parser for QueryParser {
    fn name(&self) -> &'static str {
        "query"
    }

    fn matches(&self, ctx: &Context) -> bool {
        matches!(
            *ctx.method(),
            Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
        )
    }

    async fn parse(&self, ctx: &mut Context) -> Result<Payload, DataError> {
        Ok(Payload::Form(ctx.query().clone()))
    }
}
