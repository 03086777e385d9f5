use crate::http::form::{MultipartBody, MultipartHandler, is_urlencoded, parse_urlencoded};
use crate::http::request::{Headers, Method, Request};
use crate::http::response::Response;
use crate::http::status::StatusCode;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type RouteHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Receives the request and the methods the path does support.
pub type MethodNotAllowedHandler = Arc<dyn Fn(&Request, &[Method]) -> Response + Send + Sync>;

/// Receives a request body as it arrives instead of buffered whole.
///
/// A fresh handler is created for every request, so it may keep
/// per-request state. Bodies delivered this way are not subject to
/// `HttpConfig::max_body_bytes`.
pub trait BodyHandler: Send {
    /// Called once the head is parsed, before any body bytes.
    fn on_head(&mut self, _request: &Request) {}

    /// A slice of the body starting at `offset`.
    fn on_content(&mut self, request: &Request, offset: u64, data: &[u8]);

    /// Called once the whole body has been delivered.
    fn respond(&mut self, request: &Request) -> Response;
}

type BodyHandlerFactory = Arc<dyn Fn() -> Box<dyn BodyHandler> + Send + Sync>;

#[derive(Clone)]
enum Route {
    Buffered(RouteHandler),
    Streaming(BodyHandlerFactory),
}

/// Dispatch table keyed by exact path, then method.
///
/// A path without any route gets the not-found response; a known path with
/// an unregistered method gets the method-not-allowed response, which by
/// default lists the supported methods in `Allow`.
#[derive(Clone)]
pub struct Router {
    routes: HashMap<String, BTreeMap<Method, Route>>,
    not_found: RouteHandler,
    method_not_allowed: MethodNotAllowedHandler,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            not_found: Arc::new(|_: &Request| Response::status_page(StatusCode::NOT_FOUND)),
            method_not_allowed: Arc::new(|_: &Request, allowed: &[Method]| {
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                Response::status_page(StatusCode::METHOD_NOT_ALLOWED).with_header("Allow", allow)
            }),
        }
    }

    /// Registers `handler` for `method` on `path`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn route<F>(&mut self, method: Method, path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.insert(method, path.into(), Route::Buffered(Arc::new(handler)))
    }

    /// Registers a handler for `application/x-www-form-urlencoded` bodies.
    ///
    /// Other content types get `415`, undecodable bodies `400`.
    pub fn route_form<F>(&mut self, method: Method, path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Request, &Headers) -> Response + Send + Sync + 'static,
    {
        let decode = move |request: &Request| {
            if !request.content_type().is_some_and(is_urlencoded) {
                return Response::status_page(StatusCode::UNSUPPORTED_MEDIA_TYPE);
            }
            match parse_urlencoded(&request.body) {
                Ok(fields) => handler(request, &fields),
                Err(err) => Response::status_page(err.status),
            }
        };
        self.insert(method, path.into(), Route::Buffered(Arc::new(decode)))
    }

    /// Registers a route whose body is streamed to a handler from `factory`.
    pub fn route_streaming<F, H>(&mut self, method: Method, path: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: BodyHandler + 'static,
    {
        let factory: BodyHandlerFactory = Arc::new(move || -> Box<dyn BodyHandler> { Box::new(factory()) });
        self.insert(method, path.into(), Route::Streaming(factory))
    }

    /// Registers a streamed `multipart/form-data` route.
    ///
    /// Other content types get `415`, malformed forms `400`.
    pub fn route_multipart<F, H>(&mut self, method: Method, path: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: MultipartHandler + 'static,
    {
        self.route_streaming(method, path, move || MultipartBody::new(factory()))
    }

    fn insert(&mut self, method: Method, path: String, route: Route) -> bool {
        self.routes.entry(path).or_default().insert(method, route).is_some()
    }

    /// Registers one handler for several methods and paths.
    ///
    /// Returns the paths where an existing handler was replaced.
    pub fn route_many<F>(&mut self, methods: &[Method], paths: &[&str], handler: F) -> Vec<String>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let handler: RouteHandler = Arc::new(handler);
        let mut replaced: Vec<String> = Vec::new();
        for path in paths {
            let table = self.routes.entry(path.to_string()).or_default();
            for method in methods {
                if table.insert(*method, Route::Buffered(handler.clone())).is_some() && !replaced.iter().any(|p| p == path) {
                    replaced.push(path.to_string());
                }
            }
        }
        replaced
    }

    pub fn set_not_found<F>(&mut self, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.not_found = Arc::new(handler);
    }

    pub fn set_method_not_allowed<F>(&mut self, handler: F)
    where
        F: Fn(&Request, &[Method]) -> Response + Send + Sync + 'static,
    {
        self.method_not_allowed = Arc::new(handler);
    }

    /// The handler that would serve `method` on `path`, or the fallback.
    pub(crate) fn resolve(&self, method: Method, path: &str) -> Resolved {
        match self.routes.get(path) {
            None => Resolved::NotFound(self.not_found.clone()),
            Some(table) => match table.get(&method) {
                Some(Route::Buffered(handler)) => Resolved::Found(handler.clone()),
                Some(Route::Streaming(factory)) => Resolved::Streaming(factory.clone()),
                None => Resolved::MethodNotAllowed(
                    self.method_not_allowed.clone(),
                    table.keys().copied().collect(),
                ),
            },
        }
    }

    /// Produces the response for `request`.
    pub fn dispatch(&self, request: &Request) -> Response {
        self.resolve(request.method, &request.path).call(request)
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A handler chosen under the router lock, invoked after it is released.
pub(crate) enum Resolved {
    Found(RouteHandler),
    Streaming(BodyHandlerFactory),
    NotFound(RouteHandler),
    MethodNotAllowed(MethodNotAllowedHandler, Vec<Method>),
}

impl Resolved {
    /// Answers a request whose body is already complete.
    pub(crate) fn call(&self, request: &Request) -> Response {
        match self {
            Resolved::Found(handler) | Resolved::NotFound(handler) => handler(request),
            Resolved::Streaming(factory) => {
                let mut handler = factory();
                handler.on_head(request);
                if !request.body.is_empty() {
                    handler.on_content(request, 0, &request.body);
                }
                handler.respond(request)
            }
            Resolved::MethodNotAllowed(handler, allowed) => handler(request, allowed),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort();
        f.debug_struct("Router").field("paths", &paths).finish()
    }
}
