//! Application is the main entry point.
//!
//! An [`Application`] collects configuration, shared state, routes and
//! middlewares. Serving consumes it: the route tree is frozen into a
//! [`Dispatcher`] that every connection task shares.
//!
//! # Examples
//!
//! ```rust,no_run
//! use waypoint::app::Application;
//!
//! let mut app = Application::new();
//! app.get("/", |ctx| Box::pin(async move {
//!     ctx.res.json(&waypoint::json!({ "message": "Hello!" }))
//! }))
//! .unwrap();
//! app.listen("127.0.0.1:3000", |addr| println!("listening on {addr}")).unwrap();
//! ```

use crate::config::AppConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{Handler, HandlerResult};
use crate::http::response::reason_phrase;
use crate::http::{Body, Context, Method, Request, Response};
use crate::middleware::{Chain, ErrorMiddleware, ErrorResponder, Middleware};
use crate::router::{MethodFilter, RouteBuilder, RouteTable, Router, WildcardMode};
use crate::state::AppState;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{self, Poll, Waker};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// The main application struct that represents your web server.
#[derive(Default)]
pub struct Application {
    config: AppConfig,
    router: Router,
    state: AppState,
    on_error: Option<ErrorResponder>,
    not_found: Option<Arc<dyn Handler>>,
}

impl Application {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn max_connections(&mut self, max_connections: usize) -> &mut Self {
        self.config.max_connections = max_connections;
        self
    }

    pub fn body_limit(&mut self, limit: usize) -> &mut Self {
        self.config.body_limit = limit;
        self
    }

    pub fn wildcard_mode(&mut self, mode: WildcardMode) -> &mut Self {
        self.config.wildcard = mode;
        self
    }

    /// Answer 405 with an `Allow` header when only the method is wrong.
    pub fn method_not_allowed(&mut self, enabled: bool) -> &mut Self {
        self.config.method_not_allowed = enabled;
        self
    }

    /// Registers a value every request can read through `req.state`.
    pub fn state<T>(&mut self, value: T) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.state.insert(value);
        self
    }

    /// Replaces the default error responder used when no error middleware
    /// handled an error.
    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(ServerError) -> Response + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Terminal handler for requests no route matched. It runs after the
    /// scoped middlewares that cover the path.
    pub fn not_found<F>(&mut self, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.not_found = Some(Arc::new(handler));
        self
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.get(path, handler)?;
        Ok(self)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.post(path, handler)?;
        Ok(self)
    }

    pub fn put<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.put(path, handler)?;
        Ok(self)
    }

    pub fn patch<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.patch(path, handler)?;
        Ok(self)
    }

    pub fn delete<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.delete(path, handler)?;
        Ok(self)
    }

    pub fn head<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.head(path, handler)?;
        Ok(self)
    }

    pub fn connect<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.connect(path, handler)?;
        Ok(self)
    }

    pub fn options<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.options(path, handler)?;
        Ok(self)
    }

    pub fn trace<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.trace(path, handler)?;
        Ok(self)
    }

    pub fn all<F>(&mut self, path: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.router.all(path, handler)?;
        Ok(self)
    }

    pub fn route(&mut self, method: impl Into<MethodFilter>, path: &str) -> RouteBuilder<'_> {
        self.router.route(method, path)
    }

    pub fn middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.router.middleware(middleware);
        self
    }

    pub fn middleware_at(&mut self, path: &str, middleware: impl Middleware) -> ServerResult<&mut Self> {
        self.router.middleware_at(path, middleware)?;
        Ok(self)
    }

    /// See [`Router::error_handler`]: runs after the route's handler no
    /// matter where it was registered.
    pub fn error_handler(&mut self, handler: impl ErrorMiddleware) -> &mut Self {
        self.router.error_handler(handler);
        self
    }

    pub fn error_handler_at(&mut self, path: &str, handler: impl ErrorMiddleware) -> ServerResult<&mut Self> {
        self.router.error_handler_at(path, handler)?;
        Ok(self)
    }

    pub fn mount(&mut self, path: &str, router: Router) -> ServerResult<&mut Self> {
        self.router.mount(path, router)?;
        Ok(self)
    }

    /// Freezes the application into the request dispatcher.
    pub fn into_dispatcher(self) -> Dispatcher {
        let responder = self
            .on_error
            .unwrap_or_else(|| Arc::new(|err: ServerError| Response::error(&err)));
        Dispatcher {
            table: RouteTable::new(self.router, self.config.wildcard),
            responder,
            not_found: self.not_found,
            config: self.config,
            state: self.state,
        }
    }

    /// Serves on `addr`, blocking the current thread on a fresh runtime.
    pub fn listen<F>(self, addr: &str, on_ready: F) -> ServerResult<()>
    where
        F: FnOnce(SocketAddr) + Send,
    {
        let runtime = Runtime::new()?;
        runtime.block_on(self.run(addr, on_ready))
    }

    /// Serves on `addr` inside an existing runtime. `on_ready` receives the
    /// bound address once the listener accepts connections.
    pub async fn run<F>(self, addr: &str, on_ready: F) -> ServerResult<()>
    where
        F: FnOnce(SocketAddr) + Send,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let dispatcher = Arc::new(self.into_dispatcher());
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, routes = dispatcher.table().len(), "server running");
        on_ready(local);

        loop {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ServerError::InternalError(e.to_string()))?;
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "connection failed");
                    continue;
                }
            };

            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(&dispatcher, stream).await {
                    debug!(%peer, error = %e, "connection error");
                }
                drop(permit);
            });
        }
    }
}

/// Immutable route table plus everything a request needs, shared by all
/// connection tasks.
pub struct Dispatcher {
    table: RouteTable,
    responder: ErrorResponder,
    not_found: Option<Arc<dyn Handler>>,
    config: AppConfig,
    state: AppState,
}

impl Dispatcher {
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs the chain for `ctx`. Exactly one response is committed to
    /// `ctx.res` when this returns.
    pub async fn dispatch(&self, ctx: &mut Context) {
        ctx.req.body.set_limit(self.config.body_limit);
        ctx.req.state = self.state.clone();

        let links = self.table.compose(
            ctx.req.method,
            &ctx.req.original_path,
            self.not_found.as_ref(),
            self.config.method_not_allowed,
        );
        let chain = Chain::new(links, self.responder.clone());
        debug!(
            method = %ctx.req.method,
            path = %ctx.req.original_path,
            steps = chain.len(),
            "dispatching"
        );

        if let Err(panic) = AssertUnwindSafe(chain.run(ctx)).catch_unwind().await {
            let message = panic_message(panic);
            error!(path = %ctx.req.original_path, panic = %message, "handler panicked");
            chain.respond(ServerError::PanicError(message), ctx);
        }

        if !ctx.res.is_sent() {
            warn!(
                method = %ctx.req.method,
                path = %ctx.req.original_path,
                "chain finished without sending a response"
            );
            chain.respond(
                ServerError::InternalError("no response was sent".to_string()),
                ctx,
            );
        }
    }

    pub async fn handle(&self, req: Request) -> Response {
        let mut ctx = Context::new(req);
        self.dispatch(&mut ctx).await;
        ctx.res
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Unknown panic".to_string()
    }
}

async fn handle_connection(dispatcher: &Dispatcher, stream: TcpStream) -> ServerResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        let response = Response::error(&ServerError::BadRequest("invalid request line".to_string()));
        write_response(&mut write_half, &response, true).await?;
        return Ok(());
    };

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.trim().split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let Ok(method) = method.parse::<Method>() else {
        let mut response = Response::new(501);
        response.text(reason_phrase(501))?;
        write_response(&mut write_half, &response, true).await?;
        return Ok(());
    };

    let content_length = match headers.get("content-length").map(|len| len.parse::<u64>()) {
        None => 0,
        Some(Ok(len)) => len,
        Some(Err(_)) => {
            let response = Response::error(&ServerError::BadRequest("invalid content-length".to_string()));
            write_response(&mut write_half, &response, true).await?;
            return Ok(());
        }
    };
    let content_type = headers.get("content-type").cloned().unwrap_or_default();
    let inbound = Inbound::new(reader, content_length);
    let body = Body::from_reader(Box::pin(inbound.clone()), content_length, &content_type);

    let mut request = Request::new(method, target);
    request.headers = headers;
    let request = request.with_body(body);

    // Dropping the dispatch future on peer close stops the chain where it is.
    let response = tokio::select! {
        response = dispatcher.handle(request) => response,
        _ = inbound.closed() => {
            debug!(%method, path = target, "client closed the connection, request abandoned");
            return Ok(());
        }
    };
    write_response(&mut write_half, &response, method != Method::HEAD).await?;
    Ok(())
}

/// Read side of a connection, shared between the request body and the
/// close watcher.
///
/// The watcher only reads once the declared body has been consumed, so it
/// never steals body bytes. A body the chain never reads keeps the watcher
/// parked.
#[derive(Clone)]
struct Inbound {
    shared: Arc<Mutex<InboundState>>,
}

struct InboundState {
    reader: BufReader<OwnedReadHalf>,
    body_left: u64,
    watcher: Option<Waker>,
}

impl Inbound {
    fn new(reader: BufReader<OwnedReadHalf>, content_length: u64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(InboundState {
                reader,
                body_left: content_length,
                watcher: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves when the peer closes its side, or the read fails.
    async fn closed(&self) {
        let mut scratch = [0u8; 512];
        poll_fn(|cx| {
            let mut state = self.lock();
            if state.body_left > 0 {
                state.watcher = Some(cx.waker().clone());
                return Poll::Pending;
            }
            loop {
                let mut buf = ReadBuf::new(&mut scratch);
                match Pin::new(&mut state.reader).poll_read(cx, &mut buf) {
                    Poll::Ready(Ok(())) if buf.filled().is_empty() => return Poll::Ready(()),
                    // pipelined bytes are discarded, every response closes the connection
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(_)) => return Poll::Ready(()),
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await
    }
}

impl AsyncRead for Inbound {
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.lock();
        let before = buf.filled().len();
        let poll = Pin::new(&mut state.reader).poll_read(cx, buf);
        if let Poll::Ready(result) = &poll {
            let read = (buf.filled().len() - before) as u64;
            state.body_left = if result.is_err() || read == 0 {
                0
            } else {
                state.body_left.saturating_sub(read)
            };
            if state.body_left == 0 {
                if let Some(waker) = state.watcher.take() {
                    waker.wake();
                }
            }
        }
        poll
    }
}

async fn write_response<W>(stream: &mut W, response: &Response, include_body: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = response.status_code();
    let mut head = String::new();
    let _ = write!(head, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    for (name, value) in response.headers() {
        if name == "content-length" || name == "connection" {
            continue;
        }
        let _ = write!(head, "{}: {}\r\n", name, value);
    }
    let _ = write!(
        head,
        "content-length: {}\r\nconnection: close\r\n\r\n",
        response.body().len()
    );

    stream.write_all(head.as_bytes()).await?;
    if include_body {
        stream.write_all(response.body()).await?;
    }
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::from_fn;

    #[tokio::test]
    async fn test_body_limit_applies_to_requests() {
        let mut app = Application::new();
        app.body_limit(4);
        app.post("/echo", |ctx| {
            Box::pin(async move {
                let text = ctx.req.body.text().await?;
                ctx.res.text(text)
            })
        })
        .unwrap();
        let dispatcher = app.into_dispatcher();

        let small = Request::new(Method::POST, "/echo").with_body(Body::from_string("ok"));
        assert_eq!(dispatcher.handle(small).await.body_string(), "ok");

        let large = Request::new(Method::POST, "/echo").with_body(Body::from_string("too long"));
        assert_eq!(dispatcher.handle(large).await.status_code(), 413);
    }

    #[tokio::test]
    async fn test_silent_chain_gets_500() {
        let mut app = Application::new();
        app.get("/quiet", |_ctx| Box::pin(async move { Ok(()) })).unwrap();
        let res = app.into_dispatcher().handle(Request::new(Method::GET, "/quiet")).await;
        assert_eq!(res.status_code(), 500);
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let mut app = Application::new();
        app.get("/boom", |ctx| {
            Box::pin(async move {
                if ctx.req.path == "/boom" {
                    panic!("kaboom");
                }
                ctx.res.end()
            })
        })
        .unwrap();
        let res = app.into_dispatcher().handle(Request::new(Method::GET, "/boom")).await;
        assert_eq!(res.status_code(), 500);
        assert!(res.body_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_state_reaches_handlers() {
        struct Greeting(&'static str);

        let mut app = Application::new();
        app.state(Greeting("hi"));
        app.middleware(from_fn(|ctx, next| Box::pin(async move { next.run(ctx).await })));
        app.get("/", |ctx| {
            Box::pin(async move {
                let greeting = ctx.req.state.get::<Greeting>().map(|g| g.0).unwrap_or("none");
                ctx.res.text(greeting)
            })
        })
        .unwrap();
        let res = app.into_dispatcher().handle(Request::new(Method::GET, "/")).await;
        assert_eq!(res.body_string(), "hi");
    }

    #[tokio::test]
    async fn test_custom_error_responder() {
        let mut app = Application::new();
        app.on_error(|err| {
            let mut res = Response::new(err.status_code());
            let _ = res.header("X-Error", "custom");
            res
        });
        let res = app.into_dispatcher().handle(Request::new(Method::GET, "/missing")).await;
        assert_eq!(res.status_code(), 404);
        assert_eq!(res.get_header("x-error"), Some("custom"));
    }
}
