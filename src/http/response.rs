use crate::error::{ServerError, ServerResult};
use crate::http::Method;
use crate::static_files;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

/// Response side of a request context.
///
/// Every writer checks the sent flag first: once a terminal write (`send`,
/// `json`, `redirect`, `send_file`, ...) has happened, any further write
/// fails with [`ServerError::AlreadySent`]. Header names are stored
/// lower-cased, so the last write for a name wins regardless of casing.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    sent: bool,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            sent: false,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_string(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    fn ensure_unsent(&self) -> ServerResult<()> {
        if self.sent {
            Err(ServerError::AlreadySent)
        } else {
            Ok(())
        }
    }

    pub fn status(&mut self, status: u16) -> ServerResult<&mut Self> {
        self.ensure_unsent()?;
        self.status = status;
        Ok(self)
    }

    pub fn header<K: AsRef<str>, V: AsRef<str>>(&mut self, name: K, value: V) -> ServerResult<&mut Self> {
        self.ensure_unsent()?;
        self.headers
            .insert(name.as_ref().to_lowercase(), value.as_ref().to_string());
        Ok(self)
    }

    fn default_header(&mut self, name: &str, value: &str) {
        self.headers
            .entry(name.to_string())
            .or_insert_with(|| value.to_string());
    }

    fn finish(&mut self, body: Vec<u8>) {
        self.body = body;
        self.sent = true;
    }

    /// Terminal write of raw bytes.
    pub fn send<B: AsRef<[u8]>>(&mut self, body: B) -> ServerResult<()> {
        self.ensure_unsent()?;
        self.default_header("content-type", "application/octet-stream");
        self.finish(body.as_ref().to_vec());
        Ok(())
    }

    pub fn text<T: AsRef<str>>(&mut self, content: T) -> ServerResult<()> {
        self.header("Content-Type", "text/plain; charset=utf-8")?;
        self.finish(content.as_ref().as_bytes().to_vec());
        Ok(())
    }

    pub fn html<T: AsRef<str>>(&mut self, content: T) -> ServerResult<()> {
        self.header("Content-Type", "text/html; charset=utf-8")?;
        self.finish(content.as_ref().as_bytes().to_vec());
        Ok(())
    }

    pub fn json<T: Serialize>(&mut self, value: &T) -> ServerResult<()> {
        self.ensure_unsent()?;
        let json = serde_json::to_vec(value)
            .map_err(|e| ServerError::InternalError(format!("JSON serialization error: {}", e)))?;
        self.header("Content-Type", "application/json")?;
        self.finish(json);
        Ok(())
    }

    pub fn redirect(&mut self, location: &str) -> ServerResult<()> {
        self.redirect_with(302, location)
    }

    pub fn permanent_redirect(&mut self, location: &str) -> ServerResult<()> {
        self.redirect_with(301, location)
    }

    pub fn redirect_with(&mut self, status: u16, location: &str) -> ServerResult<()> {
        self.status(status)?.header("Location", location)?;
        self.finish(Vec::new());
        Ok(())
    }

    /// Terminal write with whatever status and headers are staged, no body.
    pub fn end(&mut self) -> ServerResult<()> {
        self.ensure_unsent()?;
        self.finish(Vec::new());
        Ok(())
    }

    /// Terminal write of a file's contents, typed by its extension.
    pub async fn send_file<P: AsRef<Path>>(&mut self, path: P) -> ServerResult<()> {
        self.ensure_unsent()?;
        let file = static_files::load(path.as_ref()).await?;
        for (name, value) in file.headers {
            self.header(name, value)?;
        }
        self.finish(file.contents);
        Ok(())
    }

    /// Copies a response produced by an error responder into this one and
    /// marks it sent. Headers staged earlier survive unless overwritten.
    pub(crate) fn commit(&mut self, other: Response) {
        self.status = other.status;
        self.headers.extend(other.headers);
        self.finish(other.body);
    }

    /// Unsent JSON response describing `err`.
    pub fn error(err: &ServerError) -> Response {
        let status = err.status_code();
        let mut response = Response::new(status);
        let body = serde_json::json!({
            "error": {
                "message": err.to_string(),
                "status": status
            }
        });
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response.body = body.to_string().into_bytes();
        if let ServerError::MethodNotAllowed(allowed) = err {
            response.headers.insert("allow".to_string(), allow_header(allowed));
        }
        response
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::new(200)
    }
}

fn allow_header(allowed: &[Method]) -> String {
    allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_write_fails() {
        let mut res = Response::default();
        res.status(201).unwrap().text("created").unwrap();
        assert!(res.is_sent());
        assert_eq!(res.status_code(), 201);
        assert!(matches!(res.text("again"), Err(ServerError::AlreadySent)));
        assert!(matches!(res.status(500), Err(ServerError::AlreadySent)));
        assert!(matches!(res.header("X-Late", "1"), Err(ServerError::AlreadySent)));
        assert_eq!(res.body_string(), "created");
    }

    #[test]
    fn test_headers_last_write_wins() {
        let mut res = Response::default();
        res.header("X-Trace", "a").unwrap();
        res.header("x-trace", "b").unwrap();
        assert_eq!(res.get_header("X-TRACE"), Some("b"));
        assert_eq!(res.headers().count(), 1);
    }

    #[test]
    fn test_json_and_redirect() {
        let mut res = Response::default();
        res.json(&serde_json::json!({ "ok": true })).unwrap();
        assert_eq!(res.get_header("content-type"), Some("application/json"));
        assert_eq!(res.body_string(), r#"{"ok":true}"#);

        let mut res = Response::default();
        res.redirect("/login").unwrap();
        assert_eq!(res.status_code(), 302);
        assert_eq!(res.get_header("location"), Some("/login"));
    }

    #[test]
    fn test_error_response() {
        let res = Response::error(&ServerError::MethodNotAllowed(vec![Method::GET, Method::POST]));
        assert_eq!(res.status_code(), 405);
        assert_eq!(res.get_header("allow"), Some("GET, POST"));
        assert!(!res.is_sent());

        let mut staged = Response::default();
        staged.header("X-Request-Id", "42").unwrap();
        staged.commit(Response::error(&ServerError::NotFound));
        assert!(staged.is_sent());
        assert_eq!(staged.status_code(), 404);
        assert_eq!(staged.get_header("x-request-id"), Some("42"));
    }
}
