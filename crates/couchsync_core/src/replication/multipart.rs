//! `multipart/related` bodies for uploading revisions with attachments.
//!
//! The first part is the revision JSON. Each following part carries one
//! attachment marked `"follows": true` in that JSON, in the same order as
//! the `_attachments` object lists them.

use serde_json::Value;

use crate::error::{Result, SyncError};

const CRLF: &[u8] = b"\r\n";

/// A finished multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartBody {
    boundary: String,
    bytes: Vec<u8>,
}

impl MultipartBody {
    /// Value for the `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/related; boundary=\"{}\"", self.boundary)
    }

    /// Boundary separating the parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Raw body bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Split the body back into its JSON document and attachment parts.
    pub fn parse(&self) -> Result<(Value, Vec<MultipartPart>)> {
        parse_related(&self.boundary, &self.bytes)
    }
}

/// An attachment part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    /// Attachment name from `Content-Disposition`
    pub name: Option<String>,
    /// Part `Content-Type`
    pub content_type: Option<String>,
    /// Part body
    pub data: Vec<u8>,
}

/// Incrementally builds a [`MultipartBody`].
#[derive(Debug)]
pub struct MultipartWriter {
    boundary: String,
    bytes: Vec<u8>,
}

impl MultipartWriter {
    /// Start a body with a random boundary and the revision JSON as first part.
    pub fn new(document: &Value) -> Result<Self> {
        let mut writer = Self {
            boundary: uuid::Uuid::new_v4().simple().to_string(),
            bytes: Vec::new(),
        };
        let json = serde_json::to_vec(document)?;
        writer.write_part(&[("Content-Type", "application/json")], &json);
        Ok(writer)
    }

    /// Append one attachment part. Quotes and line breaks in `name` are
    /// replaced in the header.
    pub fn add_attachment(&mut self, name: &str, content_type: &str, data: &[u8]) {
        let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(name));
        let length = data.len().to_string();
        self.write_part(
            &[
                ("Content-Disposition", disposition.as_str()),
                ("Content-Type", content_type),
                ("Content-Length", length.as_str()),
            ],
            data,
        );
    }

    /// Write the closing delimiter.
    pub fn finish(mut self) -> MultipartBody {
        self.bytes.extend_from_slice(b"--");
        self.bytes.extend_from_slice(self.boundary.as_bytes());
        self.bytes.extend_from_slice(b"--");
        self.bytes.extend_from_slice(CRLF);
        MultipartBody {
            boundary: self.boundary,
            bytes: self.bytes,
        }
    }

    fn write_part(&mut self, headers: &[(&str, &str)], body: &[u8]) {
        self.bytes.extend_from_slice(b"--");
        self.bytes.extend_from_slice(self.boundary.as_bytes());
        self.bytes.extend_from_slice(CRLF);
        for (name, value) in headers {
            self.bytes
                .extend_from_slice(format!("{name}: {value}").as_bytes());
            self.bytes.extend_from_slice(CRLF);
        }
        self.bytes.extend_from_slice(CRLF);
        self.bytes.extend_from_slice(body);
        self.bytes.extend_from_slice(CRLF);
    }
}

fn malformed(e: impl std::fmt::Display) -> SyncError {
    SyncError::InvalidArgument(format!("malformed multipart body: {e}"))
}

/// Replace characters that would break the `Content-Disposition` header.
fn sanitize_filename(name: &str) -> String {
    name.replace('"', "'")
        .replace('\\', "_")
        .replace(['\r', '\n'], "")
}

/// Parse a `multipart/related` body delimited by `boundary`.
///
/// The first part is the JSON document. Attachment parts are named after the
/// `filename` (or `name`) of their `Content-Disposition`, if any.
pub fn parse_related(boundary: &str, bytes: &[u8]) -> Result<(Value, Vec<MultipartPart>)> {
    let body = futures_lite::stream::once(Ok::<_, std::convert::Infallible>(bytes.to_vec()));
    let mut multipart = multer::Multipart::new(body, boundary);

    futures_lite::future::block_on(async move {
        let first = multipart
            .next_field()
            .await
            .map_err(malformed)?
            .ok_or_else(|| malformed("no JSON part"))?;
        let document: Value = serde_json::from_slice(&first.bytes().await.map_err(malformed)?)?;

        let mut parts = Vec::new();
        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let name = field.file_name().or(field.name()).map(str::to_string);
            let content_type = field.content_type().map(|mime| mime.to_string());
            let data = field.bytes().await.map_err(malformed)?.to_vec();
            parts.push(MultipartPart {
                name,
                content_type,
                data,
            });
        }
        Ok((document, parts))
    })
}
