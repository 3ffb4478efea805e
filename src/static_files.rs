//! Static file serving.

use crate::error::{ServerError, ServerResult};
use crate::http::{Context, Method};
use crate::middleware::{Middleware, MiddlewareResult, Next};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::debug;

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

pub(crate) struct LoadedFile {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) contents: Vec<u8>,
}

/// Reads a file along with the headers describing it.
pub(crate) async fn load(path: &Path) -> ServerResult<LoadedFile> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ServerError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let metadata = fs::metadata(path).await?;

    let mut headers = vec![
        ("Content-Type".to_string(), content_type_for(path).to_string()),
        ("Cache-Control".to_string(), "public, max-age=31536000".to_string()),
    ];
    if let Ok(modified) = metadata.modified() {
        headers.push(("Last-Modified".to_string(), httpdate::fmt_http_date(modified)));
        // size and mtime
        let secs = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        headers.push(("ETag".to_string(), format!("\"{}-{}\"", metadata.len(), secs)));
    }

    Ok(LoadedFile { headers, contents })
}

/// Serves files below a root directory.
///
/// The path seen by this layer (so `/assets/app.js` when mounted with
/// `middleware_at("/static", ..)` on `/static/assets/app.js`) is resolved
/// inside the root. Requests that do not name a file inside the root fall
/// through to the next step.
#[derive(Debug, Clone)]
pub struct ServeDir {
    root: PathBuf,
    index: Option<String>,
}

impl ServeDir {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index: Some("index.html".to_string()),
        }
    }

    /// File served for directory requests, `index.html` unless changed.
    pub fn index(mut self, index: Option<&str>) -> Self {
        self.index = index.map(str::to_string);
        self
    }

    async fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = urlencoding::decode(request_path.trim_start_matches('/')).ok()?;
        let root = fs::canonicalize(&self.root).await.ok()?;
        let mut candidate = fs::canonicalize(root.join(relative.as_ref())).await.ok()?;
        if !candidate.starts_with(&root) {
            debug!(path = %request_path, "static path escapes root");
            return None;
        }

        if fs::metadata(&candidate).await.ok()?.is_dir() {
            candidate = candidate.join(self.index.as_deref()?);
        }
        match fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Some(candidate),
            _ => None,
        }
    }
}

impl Middleware for ServeDir {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        Box::pin(async move {
            if !matches!(ctx.req.method, Method::GET | Method::HEAD) {
                return next.run(ctx).await;
            }
            let resolved = self.resolve(&ctx.req.path).await;
            match resolved {
                Some(file) => ctx.res.send_file(file).await,
                None => next.run(ctx).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use crate::http::Request;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("waypoint-static-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a/index.html")), "text/html");
        assert_eq!(content_type_for(Path::new("app.JS")), "application/javascript");
        assert_eq!(content_type_for(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("doc.pdf")), "application/pdf");
        assert_eq!(content_type_for(Path::new("archive.tar.gz")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("README")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_load_sets_headers() {
        let dir = scratch_dir("load");
        let file = dir.join("style.css");
        std::fs::write(&file, "body {}").unwrap();

        let loaded = load(&file).await.unwrap();
        assert_eq!(loaded.contents, b"body {}");
        let names: Vec<&str> = loaded.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"Last-Modified"));
        assert!(names.contains(&"ETag"));
        assert!(matches!(load(&dir.join("missing.css")).await, Err(ServerError::NotFound)));
    }

    #[tokio::test]
    async fn test_serves_under_prefix_and_falls_through() {
        let dir = scratch_dir("serve");
        std::fs::write(dir.join("hello.txt"), "hi there").unwrap();
        std::fs::write(dir.join("index.html"), "<h1>home</h1>").unwrap();

        let mut app = Application::new();
        app.middleware_at("/static", ServeDir::new(&dir)).unwrap();
        app.get("/static/*", |ctx| Box::pin(async move { ctx.res.status(404)?.text("fallback") }))
            .unwrap();
        let dispatcher = app.into_dispatcher();

        let res = dispatcher.handle(Request::new(Method::GET, "/static/hello.txt")).await;
        assert_eq!(res.status_code(), 200);
        assert_eq!(res.body_string(), "hi there");

        let res = dispatcher.handle(Request::new(Method::GET, "/static")).await;
        assert_eq!(res.get_header("content-type"), Some("text/html"));

        let res = dispatcher.handle(Request::new(Method::GET, "/static/nope.txt")).await;
        assert_eq!(res.body_string(), "fallback");

        let res = dispatcher.handle(Request::new(Method::GET, "/static/../secret")).await;
        assert_eq!(res.body_string(), "fallback");
    }
}
