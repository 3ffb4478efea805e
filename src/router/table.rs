//! Frozen dispatch table.
//!
//! Built once from the root [`Router`] when the application starts serving
//! and never mutated afterwards, so request tasks share it without locks.

use super::pattern::{split_path, WildcardMode};
use super::{MethodFilter, MountRecord, RouteEntry, Router, ScopedLayer};
use crate::handler::Handler;
use crate::http::{Method, Params};
use crate::middleware::{Link, Step};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

pub enum Resolution<'t> {
    Found(ResolvedRoute<'t>),
    /// The path matched, but only routes for these methods.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

impl Resolution<'_> {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }
}

pub struct ResolvedRoute<'t> {
    index: usize,
    route: &'t RouteEntry,
    pub params: Params,
}

impl ResolvedRoute<'_> {
    /// Registration index of the route within the flattened table.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pattern(&self) -> &str {
        self.route.pattern.as_str()
    }

    pub fn method(&self) -> MethodFilter {
        self.route.method
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

pub struct RouteTable {
    layers: Vec<ScopedLayer>,
    routes: Vec<RouteEntry>,
    mounts: Vec<MountRecord>,
}

impl RouteTable {
    pub fn new(router: Router, wildcard: WildcardMode) -> Self {
        let Router {
            mut layers,
            mut routes,
            mut mounts,
            ..
        } = router;
        for route in &mut routes {
            route.pattern.set_wildcard_mode(wildcard);
        }
        for scoped in &mut layers {
            scoped.prefix.set_wildcard_mode(wildcard);
        }
        for record in &mut mounts {
            record.prefix.set_wildcard_mode(wildcard);
        }
        debug!(
            routes = routes.len(),
            middlewares = layers.len(),
            mounts = mounts.len(),
            "route table frozen"
        );
        Self {
            layers,
            routes,
            mounts,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// First route, in registration order, whose method filter and pattern
    /// both accept the request.
    ///
    /// A `HEAD` request is answered by the first matching `GET` route only
    /// when no `HEAD` or catch-all route matches the path.
    pub fn resolve(&self, method: Method, path: &str) -> Resolution<'_> {
        self.resolve_segments(method, &split_path(path))
    }

    fn resolve_segments(&self, method: Method, segments: &[Cow<'_, str>]) -> Resolution<'_> {
        let mut allowed = Vec::new();
        let mut head_fallback = None;
        for (index, route) in self.routes.iter().enumerate() {
            let Some(params) = route.pattern.matches_segments(segments) else {
                continue;
            };
            if route.method.accepts(method) {
                return Resolution::Found(ResolvedRoute {
                    index,
                    route,
                    params,
                });
            }
            if method == Method::HEAD
                && head_fallback.is_none()
                && route.method == MethodFilter::Only(Method::GET)
            {
                head_fallback = Some(ResolvedRoute {
                    index,
                    route,
                    params,
                });
                continue;
            }
            if let MethodFilter::Only(other) = route.method {
                push_allowed(&mut allowed, other);
                if other == Method::GET {
                    push_allowed(&mut allowed, Method::HEAD);
                }
            }
        }

        if let Some(resolved) = head_fallback {
            return Resolution::Found(resolved);
        }
        if allowed.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::MethodNotAllowed(allowed)
        }
    }

    /// Builds the chain for a request: scoped middlewares of the routers
    /// between the root and the matched route (outermost first, each in
    /// registration order), the route's own middlewares, the terminal, then
    /// the scoped error middlewares (innermost router first).
    pub(crate) fn compose(
        &self,
        method: Method,
        path: &str,
        not_found: Option<&Arc<dyn Handler>>,
        method_not_allowed: bool,
    ) -> Vec<Link> {
        let segments = split_path(path);
        let resolution = self.resolve_segments(method, &segments);
        let scope = match &resolution {
            Resolution::Found(resolved) => resolved.route.mount.clone(),
            _ => self.scope_for_unmatched(&segments),
        };
        let (mut links, error_links) = self.scoped_links(&scope, &segments);

        match resolution {
            Resolution::Found(resolved) => {
                let route = resolved.route;
                for layer in &route.layers {
                    links.push(Link {
                        step: Step::Layer(layer.clone()),
                        base_segments: route.base_segments,
                        params: resolved.params.clone(),
                    });
                }
                links.push(Link {
                    step: Step::Handler(route.handler.clone()),
                    base_segments: route.base_segments,
                    params: resolved.params,
                });
            }
            Resolution::MethodNotAllowed(allowed) if method_not_allowed => {
                links.push(Link {
                    step: Step::Unmatched(Some(allowed)),
                    base_segments: 0,
                    params: Params::new(),
                });
            }
            _ => {
                let step = match not_found {
                    Some(handler) => Step::Handler(handler.clone()),
                    None => Step::Unmatched(None),
                };
                links.push(Link {
                    step,
                    base_segments: 0,
                    params: Params::new(),
                });
            }
        }
        links.extend(error_links);
        links
    }

    /// Mount path used when no route matched: at each level, the first
    /// mounted router whose prefix covers the path.
    fn scope_for_unmatched(&self, segments: &[Cow<'_, str>]) -> Vec<usize> {
        let mut scope: Vec<usize> = Vec::new();
        loop {
            let next = self.mounts.iter().find(|record| {
                record.mount.len() == scope.len() + 1
                    && record.mount.starts_with(&scope)
                    && record.prefix.matches_prefix_segments(segments).is_some()
            });
            match next {
                Some(record) => scope = record.mount.clone(),
                None => return scope,
            }
        }
    }

    /// Scoped layers that apply to `segments`, split into normal and
    /// error-aware ones.
    fn scoped_links(&self, scope: &[usize], segments: &[Cow<'_, str>]) -> (Vec<Link>, Vec<Link>) {
        let mut scoped: Vec<&ScopedLayer> = self
            .layers
            .iter()
            .filter(|scoped| scope.starts_with(&scoped.mount))
            .collect();
        scoped.sort_by_key(|scoped| scoped.mount.len());

        let mut normal = Vec::new();
        let mut errors: Vec<(usize, Link)> = Vec::new();
        for scoped in scoped {
            let Some((params, consumed)) = scoped.prefix.matches_prefix_segments(segments) else {
                continue;
            };
            let link = Link {
                step: Step::Layer(scoped.layer.clone()),
                base_segments: consumed,
                params,
            };
            if scoped.layer.is_error_aware() {
                errors.push((scoped.mount.len(), link));
            } else {
                normal.push(link);
            }
        }
        errors.sort_by_key(|(depth, _)| std::cmp::Reverse(*depth));
        (normal, errors.into_iter().map(|(_, link)| link).collect())
    }
}

fn push_allowed(allowed: &mut Vec<Method>, method: Method) {
    if !allowed.contains(&method) {
        allowed.push(method);
    }
}
