mod chain;
mod logger;

pub use chain::Next;
pub(crate) use chain::{Chain, ErrorResponder, Link, Step};
pub use logger::RequestLogger;

use crate::error::{ServerError, ServerResult};
use crate::http::Context;
use futures::future::BoxFuture;
use std::sync::Arc;

pub type MiddlewareResult<'a> = BoxFuture<'a, ServerResult<()>>;

/// A chain step that may inspect or mutate the context, then either calls
/// `next.run(ctx)` to continue or writes a response and returns to stop
/// the chain. Returning an error diverts to the next [`ErrorMiddleware`].
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a>;
}

/// A chain step that only runs while an error is being handled.
///
/// It can answer the error, resume the normal chain with `next.run(ctx)`,
/// or return an error (the same or another) to pass it further along.
pub trait ErrorMiddleware: Send + Sync + 'static {
    fn call<'a>(&'a self, err: ServerError, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a>;
}

/// A registered middleware, tagged with the kind of step it is.
#[derive(Clone)]
pub enum Layer {
    Normal(Arc<dyn Middleware>),
    ErrorAware(Arc<dyn ErrorMiddleware>),
}

impl Layer {
    pub fn normal(middleware: impl Middleware) -> Self {
        Layer::Normal(Arc::new(middleware))
    }

    pub fn error_aware(middleware: impl ErrorMiddleware) -> Self {
        Layer::ErrorAware(Arc::new(middleware))
    }

    pub fn is_error_aware(&self) -> bool {
        matches!(self, Layer::ErrorAware(_))
    }
}

pub struct FromFn<F>(F);

/// Turns a closure into a [`Middleware`].
///
/// ```rust,ignore
/// app.middleware(from_fn(|ctx, next| Box::pin(async move {
///     ctx.req.set_data("seen", true);
///     next.run(ctx).await
/// })));
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> MiddlewareResult<'a> + Send + Sync + 'static,
{
    FromFn(f)
}

impl<F> Middleware for FromFn<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> MiddlewareResult<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        (self.0)(ctx, next)
    }
}

pub struct ErrorFn<F>(F);

/// Turns a closure into an [`ErrorMiddleware`].
pub fn error_fn<F>(f: F) -> ErrorFn<F>
where
    F: for<'a> Fn(ServerError, &'a mut Context, Next<'a>) -> MiddlewareResult<'a> + Send + Sync + 'static,
{
    ErrorFn(f)
}

impl<F> ErrorMiddleware for ErrorFn<F>
where
    F: for<'a> Fn(ServerError, &'a mut Context, Next<'a>) -> MiddlewareResult<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, err: ServerError, ctx: &'a mut Context, next: Next<'a>) -> MiddlewareResult<'a> {
        (self.0)(err, ctx, next)
    }
}
