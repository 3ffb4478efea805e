mod pattern;
mod table;

pub use pattern::{split_path, PathPattern, Segment, WildcardMode, WILDCARD_KEY};
pub use table::{Resolution, ResolvedRoute, RouteTable};

use crate::error::{ServerError, ServerResult};
use crate::handler::{Handler, HandlerResult};
use crate::http::{Context, Method};
use crate::middleware::{ErrorMiddleware, Layer, Middleware};
use std::sync::Arc;
use tracing::debug;

/// Which request methods a route answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodFilter {
    Only(Method),
    Any,
}

impl MethodFilter {
    /// Exact method match. The `HEAD`-to-`GET` fallback is applied by
    /// [`RouteTable::resolve`], after every exact candidate has been tried.
    pub fn accepts(&self, method: Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Only(m) => *m == method,
        }
    }
}

impl From<Method> for MethodFilter {
    fn from(method: Method) -> Self {
        MethodFilter::Only(method)
    }
}

/// A middleware registered with `middleware`/`middleware_at`, flattened
/// from whichever router it was registered on.
pub(crate) struct ScopedLayer {
    /// Mount path of the owning router, root is empty.
    pub(crate) mount: Vec<usize>,
    pub(crate) prefix: PathPattern,
    pub(crate) layer: Layer,
}

pub(crate) struct RouteEntry {
    pub(crate) method: MethodFilter,
    pub(crate) pattern: PathPattern,
    pub(crate) mount: Vec<usize>,
    /// Segments contributed by mount prefixes, hidden from the route's steps.
    pub(crate) base_segments: usize,
    pub(crate) layers: Vec<Layer>,
    pub(crate) handler: Arc<dyn Handler>,
}

pub(crate) struct MountRecord {
    pub(crate) mount: Vec<usize>,
    pub(crate) prefix: PathPattern,
}

/// Route and middleware registry.
///
/// Routes are matched in registration order, first match wins. Mounting a
/// router moves its routes and middlewares into this one under a prefix,
/// so a composed tree dispatches like one flat table.
#[derive(Default)]
pub struct Router {
    pub(crate) layers: Vec<ScopedLayer>,
    pub(crate) routes: Vec<RouteEntry>,
    pub(crate) mounts: Vec<MountRecord>,
    children: usize,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::GET.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::POST.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::PUT.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::PATCH.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::DELETE.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn head<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::HEAD.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn connect<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::CONNECT.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn options<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::OPTIONS.into(), pattern, Vec::new(), Arc::new(handler))
    }

    pub fn trace<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(Method::TRACE.into(), pattern, Vec::new(), Arc::new(handler))
    }

    /// Registers a handler for every method.
    pub fn all<F>(&mut self, pattern: &str, handler: F) -> ServerResult<&mut Self>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        self.add(MethodFilter::Any, pattern, Vec::new(), Arc::new(handler))
    }

    /// Starts a route that carries its own middlewares.
    ///
    /// ```rust,ignore
    /// router
    ///     .route(Method::GET, "/admin/*")
    ///     .with(RequireToken)
    ///     .handle(|ctx| Box::pin(async move { ctx.res.text("welcome") }))?;
    /// ```
    pub fn route(&mut self, method: impl Into<MethodFilter>, pattern: &str) -> RouteBuilder<'_> {
        RouteBuilder {
            router: self,
            method: method.into(),
            pattern: pattern.to_string(),
            layers: Vec::new(),
        }
    }

    fn add(
        &mut self,
        method: MethodFilter,
        pattern: &str,
        layers: Vec<Layer>,
        handler: Arc<dyn Handler>,
    ) -> ServerResult<&mut Self> {
        let pattern = PathPattern::compile(pattern)?;
        debug!(?method, pattern = pattern.as_str(), "route registered");
        self.routes.push(RouteEntry {
            method,
            pattern,
            mount: Vec::new(),
            base_segments: 0,
            layers,
            handler,
        });
        Ok(self)
    }

    /// Adds a middleware that runs for every request reaching this router.
    pub fn middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.push_layer(PathPattern::root(), Layer::normal(middleware));
        self
    }

    /// Adds a middleware for requests under `path`, compared segment by
    /// segment, so `/task` covers `/task/1` but not `/tasks`.
    pub fn middleware_at(&mut self, path: &str, middleware: impl Middleware) -> ServerResult<&mut Self> {
        let prefix = PathPattern::compile(path)?;
        self.push_layer(prefix, Layer::normal(middleware));
        Ok(self)
    }

    /// Registers an error middleware for every route of this router.
    ///
    /// Registration position is ignored: error middlewares always run after
    /// the route's handler, innermost router first, so one registered before
    /// a failing middleware still receives its error.
    pub fn error_handler(&mut self, handler: impl ErrorMiddleware) -> &mut Self {
        self.push_layer(PathPattern::root(), Layer::error_aware(handler));
        self
    }

    /// Like [`Router::error_handler`], limited to paths under `path`.
    pub fn error_handler_at(&mut self, path: &str, handler: impl ErrorMiddleware) -> ServerResult<&mut Self> {
        let prefix = PathPattern::compile(path)?;
        self.push_layer(prefix, Layer::error_aware(handler));
        Ok(self)
    }

    fn push_layer(&mut self, prefix: PathPattern, layer: Layer) {
        self.layers.push(ScopedLayer {
            mount: Vec::new(),
            prefix,
            layer,
        });
    }

    /// Mounts `router` under `prefix`.
    ///
    /// Its routes become reachable at `prefix + pattern`, its middlewares
    /// only run for requests under `prefix`, and its own registration order
    /// is kept. Fails without changing `self` when a prefix parameter is
    /// also bound by one of the mounted patterns, or when the prefix ends in
    /// a wildcard.
    pub fn mount(&mut self, prefix: &str, router: Router) -> ServerResult<&mut Self> {
        let prefix = PathPattern::compile(prefix)?;
        if prefix.has_wildcard() {
            return Err(ServerError::MountConflict(format!(
                "mount prefix `{}` cannot end in a wildcard",
                prefix.as_str()
            )));
        }

        let id = self.children;
        let rebase = |mount: Vec<usize>| {
            let mut path = Vec::with_capacity(mount.len() + 1);
            path.push(id);
            path.extend(mount);
            path
        };

        let mut routes = Vec::with_capacity(router.routes.len());
        for route in router.routes {
            routes.push(RouteEntry {
                pattern: prefix.join(&route.pattern)?,
                base_segments: route.base_segments + prefix.len(),
                mount: rebase(route.mount),
                method: route.method,
                layers: route.layers,
                handler: route.handler,
            });
        }

        let mut layers = Vec::with_capacity(router.layers.len());
        for scoped in router.layers {
            layers.push(ScopedLayer {
                prefix: prefix.join(&scoped.prefix)?,
                mount: rebase(scoped.mount),
                layer: scoped.layer,
            });
        }

        let mut mounts = vec![MountRecord {
            mount: vec![id],
            prefix: prefix.clone(),
        }];
        for record in router.mounts {
            mounts.push(MountRecord {
                prefix: prefix.join(&record.prefix)?,
                mount: rebase(record.mount),
            });
        }

        debug!(
            prefix = prefix.as_str(),
            routes = routes.len(),
            middlewares = layers.len(),
            "router mounted"
        );
        self.children += 1;
        self.routes.extend(routes);
        self.layers.extend(layers);
        self.mounts.extend(mounts);
        Ok(self)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Route registration with route-specific middlewares, see [`Router::route`].
pub struct RouteBuilder<'r> {
    router: &'r mut Router,
    method: MethodFilter,
    pattern: String,
    layers: Vec<Layer>,
}

impl<'r> RouteBuilder<'r> {
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Layer::normal(middleware));
        self
    }

    pub fn with_error(mut self, handler: impl ErrorMiddleware) -> Self {
        self.layers.push(Layer::error_aware(handler));
        self
    }

    pub fn handle<F>(self, handler: F) -> ServerResult<&'r mut Router>
    where
        F: for<'a> Fn(&'a mut Context) -> HandlerResult<'a> + Send + Sync + 'static,
    {
        let RouteBuilder {
            router,
            method,
            pattern,
            layers,
        } = self;
        router.add(method, &pattern, layers, Arc::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::from_fn;

    fn noop(ctx: &mut Context) -> HandlerResult<'_> {
        Box::pin(async move { ctx.res.end() })
    }

    #[test]
    fn test_method_filter() {
        assert!(!MethodFilter::Only(Method::GET).accepts(Method::HEAD));
        assert!(MethodFilter::Only(Method::HEAD).accepts(Method::HEAD));
        assert!(!MethodFilter::Only(Method::POST).accepts(Method::GET));
        assert!(MethodFilter::Any.accepts(Method::DELETE));
    }

    #[test]
    fn test_registration_rejects_duplicate_params() {
        let mut router = Router::new();
        assert!(matches!(
            router.get("/a/:id/:id", noop),
            Err(ServerError::MountConflict(_))
        ));
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_mount_rewrites_patterns() {
        let mut auth = Router::new();
        auth.get("/login", noop).unwrap();
        auth.middleware(from_fn(|ctx, next| Box::pin(async move { next.run(ctx).await })));

        let mut app = Router::new();
        app.get("/", noop).unwrap();
        app.mount("/auth", auth).unwrap();

        let patterns: Vec<&str> = app.routes.iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["/", "/auth/login"]);
        assert_eq!(app.routes[1].mount, vec![0]);
        assert_eq!(app.routes[1].base_segments, 1);
        assert_eq!(app.layers[0].prefix.as_str(), "/auth");
    }

    #[test]
    fn test_nested_mount_paths() {
        let mut inner = Router::new();
        inner.get("/:post", noop).unwrap();
        let mut middle = Router::new();
        middle.get("/", noop).unwrap();
        middle.mount("/posts", inner).unwrap();

        let mut app = Router::new();
        app.mount("/other", Router::new()).unwrap();
        app.mount("/users/:id", middle).unwrap();

        let nested = &app.routes[1];
        assert_eq!(nested.pattern.as_str(), "/users/:id/posts/:post");
        assert_eq!(nested.mount, vec![1, 0]);
        assert_eq!(nested.base_segments, 3);
        assert_eq!(app.mounts.len(), 3);
    }

    #[test]
    fn test_mount_param_collision() {
        let mut child = Router::new();
        child.get("/:id", noop).unwrap();

        let mut app = Router::new();
        let result = app.mount("/users/:id", child);
        assert!(matches!(result, Err(ServerError::MountConflict(_))));
        assert_eq!(app.route_count(), 0);
        assert!(app.mount("/files/*", Router::new()).is_err());
    }
}
