use crate::error::ServerResult;
use crate::http::Context;
use futures::future::BoxFuture;

pub type HandlerResult<'a> = BoxFuture<'a, ServerResult<()>>;

/// Terminal step of a chain. Writes the response through `ctx.res`;
/// returning an error diverts to the error-handling middlewares.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerResult<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerResult<'a> {
        (self)(ctx)
    }
}
