//! Middleware demo for Waypoint
//!
//! Shows:
//! - Request logging
//! - Authentication scoped to a mounted router
//! - Error middleware turning failures into responses
//! - Static files and uploads

use waypoint::middleware::{Middleware, MiddlewareResult};
use waypoint::static_files::ServeDir;
use waypoint::upload::Upload;
use waypoint::{
    error_fn, from_fn, json, Application, Context, Next, RequestLogger, Router, ServerError,
    ServerResult,
};

// Simple auth middleware
struct AuthMiddleware;

impl Middleware for AuthMiddleware {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        Box::pin(async move {
            match ctx.req.get_header("authorization") {
                Some(token) if token.starts_with("Bearer ") => {
                    let token = token.trim_start_matches("Bearer ").to_string();
                    ctx.req.set_data("token", token);
                    next.run(ctx).await
                }
                _ => Err(ServerError::Unauthorized("Authentication required".to_string())),
            }
        })
    }
}

fn protected() -> ServerResult<Router> {
    let mut protected = Router::new();
    protected.middleware(AuthMiddleware);
    protected.get("/profile", |ctx| {
        Box::pin(async move {
            let token: Option<String> = ctx.req.get_typed_data("token");
            ctx.res.json(&json!({
                "name": "User",
                "email": "user@example.com",
                "token": token
            }))
        })
    })?;
    Ok(protected)
}

fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut app = Application::new();
    app.body_limit(10 * 1024 * 1024);

    // Apply logger middleware globally
    app.middleware(RequestLogger);

    app.middleware(from_fn(|ctx, next| {
        Box::pin(async move {
            ctx.res.header("X-Powered-By", "waypoint")?;
            next.run(ctx).await
        })
    }));

    app.middleware_at("/static", ServeDir::new("public"))?;

    // Public route - no auth required
    app.get("/public", |ctx| {
        Box::pin(async move { ctx.res.text("This is a public endpoint") })
    })?;

    app.route(waypoint::Method::POST, "/upload")
        .with(Upload::single("uploads", "file"))
        .handle(|ctx| {
            Box::pin(async move {
                match ctx.req.file.clone() {
                    Some(file) => ctx.res.status(201)?.json(&file),
                    None => Err(ServerError::BadRequest("no file sent".to_string())),
                }
            })
        })?;

    // Protected routes with auth middleware
    app.mount("/api", protected()?)?;

    app.error_handler(error_fn(|err, ctx, _next| {
        Box::pin(async move {
            let status = err.status_code();
            ctx.res
                .status(status)?
                .json(&json!({ "error": err.to_string(), "status": status }))
        })
    }));

    app.listen("127.0.0.1:3000", |addr| println!("Listening on http://{addr}"))
}
