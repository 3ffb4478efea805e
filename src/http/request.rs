use crate::config::DEFAULT_BODY_LIMIT;
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use crate::upload::UploadedFile;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Parameters captured by a path pattern, keyed by parameter name.
pub type Params = HashMap<String, String>;

/// Source the body is read from on first access.
pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Eq, Hash, PartialEq, Copy, Clone, Debug)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::CONNECT => "CONNECT",
            Method::OPTIONS => "OPTIONS",
            Method::TRACE => "TRACE",
            Method::PATCH => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "HEAD" => Ok(Method::HEAD),
            "CONNECT" => Ok(Method::CONNECT),
            "OPTIONS" => Ok(Method::OPTIONS),
            "TRACE" => Ok(Method::TRACE),
            "PATCH" => Ok(Method::PATCH),
            other => Err(ServerError::BadRequest(format!("unsupported method {other}"))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum BodyState {
    Pending(BodyReader),
    Ready(Vec<u8>),
    TooLarge,
    Broken,
}

/// Request payload, read from the transport the first time it is asked for.
///
/// The result is cached, so later calls within the same request never touch
/// the transport again. Bodies whose declared length exceeds the limit are
/// rejected with [`ServerError::PayloadTooLarge`] without being read.
pub struct Body {
    pub(crate) content_type: String,
    content_length: u64,
    limit: usize,
    state: BodyState,
}

impl Body {
    pub fn new() -> Body {
        Body {
            content_type: String::new(),
            content_length: 0,
            limit: DEFAULT_BODY_LIMIT,
            state: BodyState::Ready(Vec::new()),
        }
    }

    /// A body that will be read lazily from `reader`, which must yield
    /// `content_length` bytes.
    pub fn from_reader(reader: BodyReader, content_length: u64, content_type: &str) -> Body {
        Body {
            content_type: content_type.to_string(),
            content_length,
            limit: DEFAULT_BODY_LIMIT,
            state: BodyState::Pending(reader),
        }
    }

    pub fn from_bytes(data: Vec<u8>, content_type: &str) -> Body {
        let length = data.len() as u64;
        Body::from_reader(Box::pin(std::io::Cursor::new(data)), length, content_type)
    }

    pub fn from_string(s: &str) -> Body {
        Body::from_bytes(s.as_bytes().to_vec(), "text/plain")
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_materialized(&self) -> bool {
        !matches!(self.state, BodyState::Pending(_))
    }

    pub async fn bytes(&mut self) -> ServerResult<&[u8]> {
        if let BodyState::Pending(_) = self.state {
            self.materialize().await?;
        }
        match &self.state {
            BodyState::Ready(data) => Ok(data),
            BodyState::TooLarge => Err(ServerError::PayloadTooLarge { limit: self.limit }),
            BodyState::Pending(_) | BodyState::Broken => Err(ServerError::BadRequest(
                "request body could not be read".to_string(),
            )),
        }
    }

    async fn materialize(&mut self) -> ServerResult<()> {
        let reader = match std::mem::replace(&mut self.state, BodyState::Broken) {
            BodyState::Pending(reader) => reader,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        if self.content_length > self.limit as u64 {
            self.state = BodyState::TooLarge;
            return Err(ServerError::PayloadTooLarge { limit: self.limit });
        }

        let mut data = Vec::with_capacity(self.content_length as usize);
        let mut take = reader.take(self.content_length);
        take.read_to_end(&mut data).await?;
        if (data.len() as u64) < self.content_length {
            return Err(ServerError::BadRequest(format!(
                "expected {} body bytes, received {}",
                self.content_length,
                data.len()
            )));
        }

        self.state = BodyState::Ready(data);
        Ok(())
    }

    pub async fn text(&mut self) -> ServerResult<String> {
        let data = self.bytes().await?;
        String::from_utf8(data.to_vec())
            .map_err(|_| ServerError::BadRequest("request body is not valid UTF-8".to_string()))
    }

    pub async fn json<T>(&mut self) -> ServerResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        if !self.content_type.starts_with("application/json") {
            return Err(ServerError::BadRequest(format!(
                "expected application/json, got {}",
                self.content_type
            )));
        }
        let data = self.bytes().await?;
        serde_json::from_slice(data).map_err(|e| ServerError::ParseError(e.to_string()))
    }

    pub async fn form<T>(&mut self) -> ServerResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        if !self.content_type.starts_with("application/x-www-form-urlencoded") {
            return Err(ServerError::BadRequest(format!(
                "expected application/x-www-form-urlencoded, got {}",
                self.content_type
            )));
        }
        let data = self.bytes().await?;
        let value = Self::parse_urlencoded(data)?;
        serde_json::from_value(value).map_err(|e| ServerError::ParseError(e.to_string()))
    }

    fn parse_urlencoded(data: &[u8]) -> ServerResult<Value> {
        let data_str = String::from_utf8_lossy(data);
        let mut json = Map::new();

        for pair in data_str.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            json.insert(decode_component(key)?, Value::String(decode_component(value)?));
        }

        Ok(Value::Object(json))
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::new()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            BodyState::Pending(_) => "pending",
            BodyState::Ready(_) => "ready",
            BodyState::TooLarge => "too-large",
            BodyState::Broken => "broken",
        };
        f.debug_struct("Body")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("limit", &self.limit)
            .field("state", &state)
            .finish()
    }
}

fn decode_component(raw: &str) -> ServerResult<String> {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .map_err(|_| ServerError::BadRequest(format!("invalid percent-encoding in {raw}")))
}

/// Path, base path and params as seen by one chain layer.
pub(crate) struct LayerView {
    path: String,
    base_path: String,
    params: Params,
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Path relative to where the running layer was attached.
    pub path: String,
    /// Path prefix stripped from `path` for the running layer.
    pub base_path: String,
    pub original_path: String,
    pub query: HashMap<String, String>,
    pub params: Params,
    pub headers: HashMap<String, String>,
    pub data: HashMap<String, Value>,
    pub body: Body,
    /// Set by the upload middleware.
    pub file: Option<UploadedFile>,
    pub files: Vec<UploadedFile>,
    pub fields: HashMap<String, String>,
    pub state: AppState,
}

impl Request {
    /// Builds a request for `target`, a path with an optional query string.
    pub fn new(method: Method, target: &str) -> Request {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Self::parse_query(query)),
            None => (target, HashMap::new()),
        };
        let path = if path.is_empty() { "/" } else { path };

        Request {
            method,
            path: path.to_string(),
            base_path: String::new(),
            original_path: path.to_string(),
            query,
            params: Params::new(),
            headers: HashMap::new(),
            data: HashMap::new(),
            body: Body::new(),
            file: None,
            files: Vec::new(),
            fields: HashMap::new(),
            state: AppState::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        if !body.content_type.is_empty() && !self.headers.contains_key("content-type") {
            self.headers.insert("content-type".to_string(), body.content_type.clone());
        }
        self.body = body;
        self
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set_data<T>(&mut self, key: &str, value: T)
    where
        T: serde::Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.data.insert(key.to_string(), value);
        }
    }

    pub fn get_typed_data<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.data
            .get(key)
            .and_then(|value| serde_json::from_value(value.to_owned()).ok())
    }

    pub(crate) fn enter(&mut self, base_segments: usize, params: &Params) -> LayerView {
        let segments: Vec<&str> = self
            .original_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let split = base_segments.min(segments.len());
        let base_path = if split == 0 {
            String::new()
        } else {
            format!("/{}", segments[..split].join("/"))
        };
        let path = format!("/{}", segments[split..].join("/"));

        LayerView {
            path: std::mem::replace(&mut self.path, path),
            base_path: std::mem::replace(&mut self.base_path, base_path),
            params: std::mem::replace(&mut self.params, params.clone()),
        }
    }

    pub(crate) fn restore(&mut self, view: LayerView) {
        self.path = view.path;
        self.base_path = view.base_path;
        self.params = view.params;
    }

    fn parse_query(query: &str) -> HashMap<String, String> {
        query
            .split('&')
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (
                    decode_component(key).unwrap_or_else(|_| key.to_string()),
                    decode_component(value).unwrap_or_else(|_| value.to_string()),
                )
            })
            .collect()
    }
}
