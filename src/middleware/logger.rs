use super::{Middleware, MiddlewareResult, Next};
use crate::http::Context;
use std::time::Instant;
use tracing::info;

/// Logs method, path, final status and latency of every request it sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.req.method;
            let path = ctx.req.original_path.clone();
            let result = next.run(ctx).await;
            info!(
                %method,
                %path,
                status = ctx.res.status_code(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request"
            );
            result
        })
    }
}
