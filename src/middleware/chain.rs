//! Chain execution.
//!
//! A [`Chain`] is the flattened, ordered list of steps composed for one
//! request. Steps run one at a time: control reaches step `i + 1` only when
//! step `i` awaits [`Next::run`]. A step that returns without calling `next`
//! ends the chain. A step that fails diverts the error to the next
//! error-aware step; when none is left the default responder writes the
//! response.

use super::{Layer, MiddlewareResult};
use crate::error::ServerError;
use crate::handler::Handler;
use crate::http::{Context, Params, Response};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) type ErrorResponder = Arc<dyn Fn(ServerError) -> Response + Send + Sync>;

pub(crate) enum Step {
    Layer(Layer),
    Handler(Arc<dyn Handler>),
    /// No route matched; carries the methods the path does accept, if the
    /// application answers those with 405.
    Unmatched(Option<Vec<crate::http::Method>>),
}

pub(crate) struct Link {
    pub(crate) step: Step,
    /// Leading path segments hidden from this step.
    pub(crate) base_segments: usize,
    pub(crate) params: Params,
}

impl Link {
    fn is_error_aware(&self) -> bool {
        matches!(self.step, Step::Layer(Layer::ErrorAware(_)))
    }
}

pub(crate) struct Chain {
    links: Vec<Link>,
    responder: ErrorResponder,
}

/// Continuation handed to a middleware.
pub struct Next<'a> {
    chain: &'a Chain,
    index: usize,
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain.
    ///
    /// Errors raised further down are handled inside the chain, so this
    /// returns `Ok` once the downstream steps are done. Calling it after
    /// the response was sent is reported and returns
    /// [`ServerError::AlreadySent`] without running anything.
    pub fn run<'b>(self, ctx: &'b mut Context) -> MiddlewareResult<'b>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if ctx.res.is_sent() {
                error!(
                    path = %ctx.req.original_path,
                    "next called after the response was sent"
                );
                return Err(ServerError::AlreadySent);
            }
            self.chain.run_from(self.index, ctx).await;
            Ok(())
        })
    }
}

impl Chain {
    pub(crate) fn new(links: Vec<Link>, responder: ErrorResponder) -> Self {
        Self { links, responder }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) async fn run(&self, ctx: &mut Context) {
        self.run_from(0, ctx).await;
    }

    fn run_from<'b>(&'b self, from: usize, ctx: &'b mut Context) -> BoxFuture<'b, ()> {
        Box::pin(async move {
            let Some((index, link)) = self
                .links
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, link)| !link.is_error_aware())
            else {
                return;
            };

            let view = ctx.req.enter(link.base_segments, &link.params);
            let result = match &link.step {
                Step::Layer(Layer::Normal(middleware)) => {
                    middleware.call(ctx, Next { chain: self, index: index + 1 }).await
                }
                Step::Handler(handler) => handler.call(ctx).await,
                Step::Unmatched(None) => Err(ServerError::NotFound),
                Step::Unmatched(Some(allowed)) => Err(ServerError::MethodNotAllowed(allowed.clone())),
                Step::Layer(Layer::ErrorAware(_)) => Ok(()),
            };

            match result {
                Err(err) if matches!(link.step, Step::Unmatched(_)) => self.respond(err, ctx),
                Err(err) => self.divert(err, index + 1, ctx).await,
                Ok(()) => {}
            }
            ctx.req.restore(view);
        })
    }

    fn divert<'b>(&'b self, err: ServerError, from: usize, ctx: &'b mut Context) -> BoxFuture<'b, ()> {
        Box::pin(async move {
            if ctx.res.is_sent() {
                error!(
                    path = %ctx.req.original_path,
                    error = %err,
                    "error raised after the response was sent"
                );
                return;
            }

            let found = self
                .links
                .iter()
                .enumerate()
                .skip(from)
                .find_map(|(index, link)| match &link.step {
                    Step::Layer(Layer::ErrorAware(handler)) => Some((index, link, handler)),
                    _ => None,
                });

            let Some((index, link, handler)) = found else {
                self.respond(err, ctx);
                return;
            };

            debug!(error = %err, step = index, "diverting to error middleware");
            let view = ctx.req.enter(link.base_segments, &link.params);
            let result = handler
                .call(err, ctx, Next { chain: self, index: index + 1 })
                .await;
            if let Err(err) = result {
                self.divert(err, index + 1, ctx).await;
            }
            ctx.req.restore(view);
        })
    }

    /// Writes the default response for `err` unless one was already sent.
    pub(crate) fn respond(&self, err: ServerError, ctx: &mut Context) {
        if ctx.res.is_sent() {
            error!(error = %err, "dropping error, response already sent");
            return;
        }
        if err.is_server_error() {
            error!(
                method = %ctx.req.method,
                path = %ctx.req.original_path,
                error = %err,
                "request failed"
            );
        } else {
            debug!(status = err.status_code(), error = %err, "answering with error response");
        }
        let response = (self.responder)(err);
        ctx.res.commit(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request};
    use crate::middleware::{error_fn, from_fn};
    use std::sync::Mutex;

    fn responder() -> ErrorResponder {
        Arc::new(|err: ServerError| Response::error(&err))
    }

    fn link(step: Step) -> Link {
        Link {
            step,
            base_segments: 0,
            params: Params::new(),
        }
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Link {
        let log = log.clone();
        link(Step::Layer(Layer::normal(from_fn(move |ctx, next| {
            log.lock().unwrap().push(name);
            Box::pin(async move { next.run(ctx).await })
        }))))
    }

    fn handler_step<F>(f: F) -> Step
    where
        F: for<'a> Fn(&'a mut Context) -> MiddlewareResult<'a> + Send + Sync + 'static,
    {
        Step::Handler(Arc::new(f))
    }

    fn handler(log: &Arc<Mutex<Vec<&'static str>>>) -> Link {
        let log = log.clone();
        link(handler_step(move |ctx| {
            log.lock().unwrap().push("handler");
            Box::pin(async move { ctx.res.text("done") })
        }))
    }

    fn context() -> Context {
        Context::new(Request::new(Method::GET, "/"))
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(
            vec![recording(&log, "a"), recording(&log, "b"), handler(&log)],
            responder(),
        );
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "handler"]);
        assert_eq!(ctx.res.body_string(), "done");
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stop = link(Step::Layer(Layer::normal(from_fn(|ctx, _next| {
            Box::pin(async move { ctx.res.status(401)?.text("denied") })
        }))));
        let chain = Chain::new(
            vec![recording(&log, "a"), stop, recording(&log, "b"), handler(&log)],
            responder(),
        );
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(ctx.res.status_code(), 401);
    }

    #[tokio::test]
    async fn test_error_skips_to_error_middleware() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fail = link(Step::Layer(Layer::normal(from_fn(|_ctx, _next| {
            Box::pin(async move { Err(ServerError::handler("boom")) })
        }))));
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let recover = link(Step::Layer(Layer::error_aware(error_fn(move |err, ctx, _next| {
            *seen_in.lock().unwrap() = Some(err.to_string());
            Box::pin(async move { ctx.res.status(503)?.text("recovered") })
        }))));
        let chain = Chain::new(
            vec![fail, recording(&log, "skipped"), recover, handler(&log)],
            responder(),
        );
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("Handler error: boom"));
        assert_eq!(ctx.res.status_code(), 503);
    }

    #[tokio::test]
    async fn test_error_middleware_not_run_without_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_in = log.clone();
        let unused = link(Step::Layer(Layer::error_aware(error_fn(move |err, _ctx, _next| {
            log_in.lock().unwrap().push("error");
            Box::pin(async move { Err(err) })
        }))));
        let chain = Chain::new(vec![unused, handler(&log)], responder());
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["handler"]);
    }

    #[tokio::test]
    async fn test_unhandled_error_uses_default_responder() {
        let fail = link(handler_step(|_ctx| {
            Box::pin(async move { Err(ServerError::handler("db down")) })
        }));
        let chain = Chain::new(vec![fail], responder());
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert!(ctx.res.is_sent());
        assert_eq!(ctx.res.status_code(), 500);
        assert!(ctx.res.body_string().contains("db down"));
    }

    #[tokio::test]
    async fn test_next_after_send_is_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outcome = Arc::new(Mutex::new(None));
        let outcome_in = outcome.clone();
        let eager = link(Step::Layer(Layer::normal(from_fn(move |ctx, next| {
            let outcome = outcome_in.clone();
            Box::pin(async move {
                ctx.res.text("early")?;
                let result = next.run(ctx).await;
                *outcome.lock().unwrap() = Some(matches!(result, Err(ServerError::AlreadySent)));
                Ok(())
            })
        }))));
        let chain = Chain::new(vec![eager, handler(&log)], responder());
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert_eq!(*outcome.lock().unwrap(), Some(true));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(ctx.res.body_string(), "early");
    }

    #[tokio::test]
    async fn test_error_handler_can_resume_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fail = link(Step::Layer(Layer::normal(from_fn(|_ctx, _next| {
            Box::pin(async move { Err(ServerError::BadRequest("soft".into())) })
        }))));
        let resume = link(Step::Layer(Layer::error_aware(error_fn(|_err, ctx, next| {
            Box::pin(async move { next.run(ctx).await })
        }))));
        let chain = Chain::new(vec![fail, resume, handler(&log)], responder());
        let mut ctx = context();
        chain.run(&mut ctx).await;

        assert_eq!(*log.lock().unwrap(), vec!["handler"]);
        assert_eq!(ctx.res.status_code(), 200);
    }
}
