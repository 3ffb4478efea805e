//! `multipart/form-data` uploads.

use crate::error::{ServerError, ServerResult};
use crate::http::Context;
use crate::middleware::{Middleware, MiddlewareResult, Next};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, warn};

/// A file part written to disk by [`Upload`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub field: String,
    /// Name as sent by the client.
    pub file_name: String,
    pub content_type: String,
    /// Where the contents were stored.
    pub path: PathBuf,
    pub size: u64,
}

/// Middleware that stores uploaded files in a directory and exposes them
/// as `req.file` / `req.files`, with the text parts in `req.fields`.
///
/// Requests that are not `multipart/form-data` pass through untouched.
#[derive(Debug, Clone)]
pub struct Upload {
    dir: PathBuf,
    field: Option<String>,
}

struct Part<'a> {
    name: String,
    file_name: Option<String>,
    content_type: String,
    content: &'a [u8],
}

impl Upload {
    /// Accepts files under any field name.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            field: None,
        }
    }

    /// Accepts a single file, sent under `field`.
    pub fn single<P: AsRef<Path>>(dir: P, field: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            field: Some(field.to_string()),
        }
    }

    async fn store(&self, parts: &[Part<'_>]) -> ServerResult<Vec<UploadedFile>> {
        fs::create_dir_all(&self.dir).await?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let mut stored = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            let Some(file_name) = &part.file_name else {
                continue;
            };
            let path = self
                .dir
                .join(format!("{}-{}-{}", stamp, index, sanitize_file_name(file_name)));
            if let Err(e) = fs::write(&path, part.content).await {
                warn!(path = %path.display(), error = %e, "upload write failed");
                discard(&stored).await;
                return Err(e.into());
            }
            stored.push(UploadedFile {
                field: part.name.clone(),
                file_name: file_name.clone(),
                content_type: part.content_type.clone(),
                path,
                size: part.content.len() as u64,
            });
        }
        Ok(stored)
    }
}

impl Middleware for Upload {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        Box::pin(async move {
            let content_type = ctx.req.body.content_type().to_string();
            if !content_type.starts_with("multipart/form-data") {
                return next.run(ctx).await;
            }

            let boundary = extract_boundary(&content_type)?;
            let data = ctx.req.body.bytes().await?;
            let parts = split_parts(data, &boundary)?
                .into_iter()
                .map(parse_part)
                .collect::<ServerResult<Vec<_>>>()?;

            if let Some(expected) = &self.field {
                let files = parts.iter().filter(|p| p.file_name.is_some());
                for part in files.clone() {
                    if &part.name != expected {
                        return Err(malformed(format!("unexpected file field `{}`", part.name)));
                    }
                }
                if files.count() > 1 {
                    return Err(malformed(format!("more than one file in `{expected}`")));
                }
            }

            let mut fields = HashMap::new();
            for part in parts.iter().filter(|p| p.file_name.is_none()) {
                let value = std::str::from_utf8(part.content)
                    .map_err(|_| malformed(format!("field `{}` is not valid UTF-8", part.name)))?;
                fields.insert(part.name.clone(), value.to_string());
            }

            let stored = self.store(&parts).await?;
            debug!(files = stored.len(), fields = fields.len(), "multipart body stored");

            ctx.req.file = stored.first().cloned();
            ctx.req.files = stored;
            ctx.req.fields.extend(fields);
            next.run(ctx).await
        })
    }
}

fn malformed(reason: impl Into<String>) -> ServerError {
    ServerError::BadRequest(format!("malformed multipart body: {}", reason.into()))
}

async fn discard(files: &[UploadedFile]) {
    for file in files {
        let _ = fs::remove_file(&file.path).await;
    }
}

fn extract_boundary(content_type: &str) -> ServerResult<String> {
    content_type
        .split(';')
        .find_map(|s| s.trim().strip_prefix("boundary="))
        .map(|s| s.trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing boundary"))
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> ServerResult<Vec<&'a [u8]>> {
    let delimiter = format!("--{boundary}").into_bytes();
    let separator = [b"\r\n".as_slice(), delimiter.as_slice()].concat();

    let start = find_subsequence(body, &delimiter).ok_or_else(|| malformed("missing opening boundary"))?;
    let mut rest = &body[start + delimiter.len()..];
    let mut parts = Vec::new();
    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| malformed("boundary not followed by CRLF"))?;
        let end = find_subsequence(rest, &separator).ok_or_else(|| malformed("unterminated part"))?;
        parts.push(&rest[..end]);
        rest = &rest[end + separator.len()..];
    }
}

fn parse_part(part: &[u8]) -> ServerResult<Part<'_>> {
    let (headers, content) = split_headers_content(part)?;
    let headers = parse_headers(headers)?;
    let name = headers
        .get("name")
        .cloned()
        .ok_or_else(|| malformed("part without a name"))?;
    // browsers send an empty filename when no file was chosen
    let file_name = headers.get("filename").filter(|f| !f.is_empty()).cloned();
    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(Part {
        name,
        file_name,
        content_type,
        content,
    })
}

fn split_headers_content(part: &[u8]) -> ServerResult<(&[u8], &[u8])> {
    let sep = b"\r\n\r\n";
    find_subsequence(part, sep)
        .map(|pos| (&part[..pos], &part[pos + sep.len()..]))
        .ok_or_else(|| malformed("part without a header block"))
}

/// Header lines of one part; `Content-Disposition` parameters are flattened
/// into the map (`name`, `filename`).
fn parse_headers(headers: &[u8]) -> ServerResult<HashMap<String, String>> {
    let text = std::str::from_utf8(headers).map_err(|_| malformed("part headers are not UTF-8"))?;
    let mut map = HashMap::new();

    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        if key == "content-disposition" {
            for param in value.split(';').skip(1) {
                if let Some((k, v)) = param.trim().split_once('=') {
                    map.insert(k.trim().to_lowercase(), v.trim().trim_matches('"').to_string());
                }
            }
        } else {
            map.insert(key, value.trim().to_string());
        }
    }
    Ok(map)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let clean: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if clean.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        clean
    }
}
