//! `multipart/form-data` reading with a bounded in-memory budget.
//!
//! Text fields and small files are kept in memory. Once a file part would
//! push the request past its memory budget, that part is streamed to a
//! temporary file instead. Text fields never spill: exceeding the budget with
//! text fails the request.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request};
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tower::{Layer, ServiceExt, service_fn};
use tracing::debug;

use crate::context::{DataError, Values};

/// Decoded multipart body.
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub values: Values,
    files: HashMap<String, Vec<UploadFile>>,
}

impl MultipartForm {
    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&UploadFile> {
        self.files.get(name).and_then(|files| files.first())
    }

    pub fn files(&self, name: &str) -> &[UploadFile] {
        self.files.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn file_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Reads every part of `request`. `max_body` is only used to report an
    /// over-long body; the limit itself is applied to the body stream.
    pub(crate) async fn read(
        request: Request,
        max_memory: u64,
        max_body: u64,
    ) -> Result<Self, DataError> {
        // Size is bounded by the context's own body limit, not axum's default.
        let extract = service_fn(|request: Request| async move {
            <Multipart as FromRequest<()>>::from_request(request, &()).await
        });
        let mut multipart = DefaultBodyLimit::disable()
            .layer(extract)
            .oneshot(request)
            .await
            .map_err(|rejection| DataError::Multipart(rejection.body_text()))?;

        let multipart_error = |err: MultipartError| {
            if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                DataError::PayloadTooLarge(max_body)
            } else {
                DataError::Multipart(err.body_text())
            }
        };
        let mut remaining = max_memory;
        let mut form = MultipartForm::default();

        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };

            let Some(filename) = field.file_name().map(str::to_owned) else {
                let text = field.text().await.map_err(multipart_error)?;
                remaining = remaining
                    .checked_sub(text.len() as u64)
                    .ok_or(DataError::PayloadTooLarge(max_memory))?;
                form.values.append(name, text);
                continue;
            };

            let content_type = field.content_type().map(str::to_owned);
            let (data, size) = read_file(&mut field, &mut remaining)
                .await
                .map_err(|err| match err {
                    ReadError::Multipart(err) => multipart_error(err),
                    ReadError::Io(err) => DataError::Io(err),
                })?;
            debug!(
                field = %name,
                filename = %filename,
                size,
                on_disk = matches!(data, UploadData::Disk(_)),
                "multipart file read"
            );

            form.files.entry(name).or_default().push(UploadFile {
                filename,
                content_type,
                size,
                data,
            });
        }

        Ok(form)
    }
}

enum ReadError {
    Multipart(MultipartError),
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(err: std::io::Error) -> Self {
        ReadError::Io(err)
    }
}

async fn read_file(
    field: &mut Field<'_>,
    remaining: &mut u64,
) -> Result<(UploadData, u64), ReadError> {
    let mut buffer = BytesMut::new();
    let mut spilled: Option<(NamedTempFile, tokio::fs::File)> = None;
    let mut size = 0u64;

    while let Some(chunk) = field.chunk().await.map_err(ReadError::Multipart)? {
        size += chunk.len() as u64;
        match spilled.as_mut() {
            Some((_, file)) => file.write_all(&chunk).await?,
            None if size <= *remaining => buffer.extend_from_slice(&chunk),
            None => {
                let temp = NamedTempFile::new()?;
                let mut file = tokio::fs::File::from_std(temp.reopen()?);
                file.write_all(&buffer).await?;
                file.write_all(&chunk).await?;
                buffer.clear();
                spilled = Some((temp, file));
            }
        }
    }

    match spilled {
        Some((temp, mut file)) => {
            file.flush().await?;
            Ok((UploadData::Disk(temp), size))
        }
        None => {
            *remaining -= size;
            Ok((UploadData::Memory(buffer.freeze()), size))
        }
    }
}

/// Where an uploaded file's content lives.
#[derive(Debug)]
pub enum UploadData {
    Memory(Bytes),
    /// Removed from disk when the owning context is reset.
    Disk(NamedTempFile),
}

#[derive(Debug)]
pub struct UploadFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    data: UploadData,
}

impl UploadFile {
    /// In-memory upload, for callers that build files themselves.
    pub fn from_bytes(
        filename: impl Into<String>,
        content_type: Option<String>,
        data: Bytes,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            size: data.len() as u64,
            data: UploadData::Memory(data),
        }
    }

    pub fn data(&self) -> &UploadData {
        &self.data
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.data, UploadData::Memory(_))
    }

    /// Full file content, read back from disk when spilled.
    pub async fn bytes(&self) -> std::io::Result<Bytes> {
        match &self.data {
            UploadData::Memory(bytes) => Ok(bytes.clone()),
            UploadData::Disk(temp) => tokio::fs::read(temp.path()).await.map(Bytes::from),
        }
    }
}
