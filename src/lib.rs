//! # Waypoint
//!
//! A minimalist Express-style web framework for Rust.
//!
//! ## Features
//!
//! - Routes with `:param` and trailing `*` wildcard segments, matched in
//!   registration order
//! - Ordered middleware chains with explicit `next` continuation
//! - Error middlewares that catch failures raised further up the chain
//! - Routers mountable under a prefix, with scoped middlewares
//! - Lazy, size-limited request bodies
//! - Static files and `multipart/form-data` uploads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use waypoint::Application;
//!
//! let mut app = Application::new();
//! app.get("/", |ctx| Box::pin(async move {
//!     ctx.res.json(&waypoint::json!({ "message": "Hello, World!" }))
//! }))
//! .unwrap();
//! app.listen("127.0.0.1:3000", |addr| println!("listening on {addr}")).unwrap();
//! ```
//!
//! ## Middleware Usage
//!
//! ```rust,ignore
//! use waypoint::middleware::{from_fn, RequestLogger};
//!
//! app.middleware(RequestLogger);
//! app.middleware_at("/admin", from_fn(|ctx, next| Box::pin(async move {
//!     match ctx.req.get_header("authorization") {
//!         Some(_) => next.run(ctx).await,
//!         None => Err(ServerError::Unauthorized("token required".into())),
//!     }
//! })))?;
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod router;
pub mod state;
pub mod static_files;
pub mod upload;
pub extern crate serde_json;

pub use app::{Application, Dispatcher};
pub use config::AppConfig;
pub use error::{ServerError, ServerResult};
pub use futures::future::BoxFuture;
pub use http::{Body, Context, Method, Request, Response};
pub use middleware::{error_fn, from_fn, ErrorMiddleware, Layer, Middleware, Next, RequestLogger};
pub use router::{PathPattern, Router, WildcardMode};

// Reexport serde_json
pub use serde_json::{json, Value};
