//! Exact-path routing with per-route method sets and a default handler.

use ahash::AHashMap;
use http::Method;

use crate::handler::Handler;
use crate::method::MethodSet;
use crate::request::Request;
use crate::response::Response;

#[cfg(feature = "ws")]
use crate::ws::{WsEndpoint, WsNegotiated};

/// Produces one [`WsEndpoint`] per upgraded connection.
#[cfg(feature = "ws")]
pub type WsFactory = Box<dyn Fn(&Request, &WsNegotiated) -> Box<dyn WsEndpoint> + Send + Sync>;

struct Route {
    methods: MethodSet,
    handler: Handler,
}

#[derive(Default)]
pub struct Router {
    routes: AHashMap<String, Route>,
    default: Option<Handler>,
    #[cfg(feature = "ws")]
    ws_routes: AHashMap<String, WsFactory>,
}

pub(crate) enum RouteMatch<'a> {
    Handler(&'a Handler),
    #[cfg(feature = "ws")]
    Websocket(&'a WsFactory),
    MethodNotAllowed,
    NotFound,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every method on `path`.
    pub fn set(&mut self, path: impl Into<String>, handler: Handler) -> &mut Self {
        self.set_with_methods(path, MethodSet::ALL, handler)
    }

    pub fn set_with_methods(
        &mut self,
        path: impl Into<String>,
        methods: MethodSet,
        handler: Handler,
    ) -> &mut Self {
        self.routes.insert(path.into(), Route { methods, handler });
        self
    }

    /// Sugar for a synchronous GET (and HEAD) route.
    pub fn get(
        &mut self,
        path: impl Into<String>,
        f: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) -> &mut Self {
        let methods: MethodSet = [Method::GET, Method::HEAD].into_iter().collect();
        self.set_with_methods(path, methods, Handler::sync(f))
    }

    /// Sugar for a synchronous POST route.
    pub fn post(
        &mut self,
        path: impl Into<String>,
        f: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) -> &mut Self {
        self.set_with_methods(path, MethodSet::single(&Method::POST), Handler::sync(f))
    }

    /// Handler used when no exact path matches.
    pub fn set_default(&mut self, handler: Handler) -> &mut Self {
        self.default = Some(handler);
        self
    }

    /// Register a WebSocket endpoint factory on `path`. Upgrade requests to
    /// this path go through the handshake; everything else falls through to
    /// the regular routes.
    #[cfg(feature = "ws")]
    pub fn websocket(&mut self, path: impl Into<String>, factory: WsFactory) -> &mut Self {
        self.ws_routes.insert(path.into(), factory);
        self
    }

    #[cfg(feature = "ws")]
    pub(crate) fn find_websocket(&self, path: &str) -> Option<&WsFactory> {
        self.ws_routes.get(path)
    }

    pub(crate) fn find(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        if let Some(route) = self.routes.get(path) {
            if route.methods.contains(method) {
                return RouteMatch::Handler(&route.handler);
            }
            return RouteMatch::MethodNotAllowed;
        }
        match &self.default {
            Some(handler) => RouteMatch::Handler(handler),
            None => RouteMatch::NotFound,
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Router");
        dbg.field("routes", &self.routes.len())
            .field("has_default", &self.default.is_some());
        #[cfg(feature = "ws")]
        dbg.field("ws_routes", &self.ws_routes.len());
        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn exact_match_wins_over_default() {
        let mut router = Router::new();
        router.get("/a", |_| Response::ok().with_body("route"));
        router.set_default(Handler::sync(|_| Response::new(StatusCode::NOT_FOUND)));

        match router.find(&Method::GET, "/a") {
            RouteMatch::Handler(_) => {}
            _ => panic!("expected route handler"),
        }
        match router.find(&Method::GET, "/other") {
            RouteMatch::Handler(_) => {}
            _ => panic!("expected default handler"),
        }
    }

    #[test]
    fn method_mismatch_reported() {
        let mut router = Router::new();
        router.post("/submit", |_| Response::ok());
        assert!(matches!(
            router.find(&Method::GET, "/submit"),
            RouteMatch::MethodNotAllowed
        ));
    }

    #[test]
    fn no_default_is_not_found() {
        let router = Router::new();
        assert!(matches!(
            router.find(&Method::GET, "/nope"),
            RouteMatch::NotFound
        ));
    }
}
