//! Routing demo for Waypoint
//!
//! Shows:
//! - Basic routes
//! - Path parameters and wildcards
//! - Query parameters
//! - JSON bodies
//! - Routers mounted under a prefix

use serde::{Deserialize, Serialize};
use waypoint::{json, Application, Method, Router, ServerResult};

#[derive(Serialize, Deserialize)]
struct User {
    name: String,
    role: String,
}

fn api() -> ServerResult<Router> {
    let mut api = Router::new();
    api.get("/status", |ctx| {
        Box::pin(async move {
            ctx.res.json(&json!({
                "status": "operational",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
    })?;
    api.get("/files/*path", |ctx| {
        Box::pin(async move {
            let path = ctx.req.param("path").unwrap_or_default().to_string();
            ctx.res.text(format!("file: {path}"))
        })
    })?;
    Ok(api)
}

fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut app = Application::new();
    app.method_not_allowed(true);

    app.get("/", |ctx| {
        Box::pin(async move { ctx.res.text("Welcome to the Waypoint API server!") })
    })?;

    // Route with path parameter
    app.get("/users/:id", |ctx| {
        Box::pin(async move {
            let id = ctx.req.param("id").unwrap_or_default().to_string();
            ctx.res.text(format!("User ID: {id}"))
        })
    })?;

    // Query string: /search?q=rust
    app.get("/search", |ctx| {
        Box::pin(async move {
            let q = ctx.req.query.get("q").cloned().unwrap_or_default();
            ctx.res.json(&json!({ "query": q, "results": [] }))
        })
    })?;

    // POST request with JSON body
    app.post("/users", |ctx| {
        Box::pin(async move {
            let user: User = ctx.req.body.json().await?;
            ctx.res.status(201)?.json(&user)
        })
    })?;

    app.route(Method::PUT, "/users/:id")
        .handle(|ctx| Box::pin(async move { ctx.res.status(204)?.end() }))?;

    // Group routes under /api
    app.mount("/api", api()?)?;

    app.listen("127.0.0.1:3000", |addr| println!("Listening on http://{addr}"))
}
