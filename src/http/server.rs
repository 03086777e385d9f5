//! HTTP/1.1 server: one request per connection, answered through a [`Router`].
//!
//! The route is chosen as soon as the request head is parsed. Buffered
//! routes see the complete body; streaming routes get it chunk by chunk.

use crate::config::{HttpConfig, TlsConfig};
use crate::error::{Result, panic_message};
use crate::http::form::MultipartHandler;
use crate::http::request::{Headers, Method, Request, RequestParser};
use crate::http::response::Response;
use crate::http::router::{BodyHandler, Resolved, Router};
use crate::http::status::StatusCode;
use crate::net::{ConnectionHandler, TcpConnection, TcpServer};
use crate::runtime::Handle;

use parking_lot::RwLock;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{error, trace, warn};

enum Phase {
    Head(RequestParser),
    Body(Box<Pending>),
    Done,
}

/// A request whose head has been routed and whose body is still arriving.
struct Pending {
    request: Request,
    remaining: usize,
    offset: u64,
    target: Target,
}

enum Target {
    Buffered(Resolved),
    Streaming(Box<dyn BodyHandler>),
}

struct HttpSession {
    router: Arc<RwLock<Router>>,
    max_body_bytes: usize,
    phase: Phase,
}

fn internal_error() -> Response {
    Response::status_page(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Runs route code, turning a panic into `None`.
fn guarded<R>(request: &Request, stage: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(
                method = %request.method,
                path = %request.path,
                stage,
                panic = %panic_message(payload.as_ref()),
                "route handler panicked"
            );
            None
        }
    }
}

impl HttpSession {
    fn respond(
        &mut self,
        connection: &Arc<TcpConnection>,
        response: Response,
        method: Option<Method>,
    ) -> Result<()> {
        self.phase = Phase::Done;
        let response = response.with_header("Connection", "close");
        connection.send(response.to_bytes(method))?;
        connection.close();
        Ok(())
    }

    fn begin(
        &mut self,
        connection: &Arc<TcpConnection>,
        request: Request,
        length: usize,
        body: &[u8],
    ) -> Result<()> {
        // Route code runs without the router lock held.
        let resolved = self.router.read().resolve(request.method, &request.path);

        let target = match resolved {
            Resolved::Streaming(factory) => {
                let started = guarded(&request, "head", || {
                    let mut handler = factory();
                    handler.on_head(&request);
                    handler
                });
                match started {
                    Some(handler) => Target::Streaming(handler),
                    None => return self.respond(connection, internal_error(), Some(request.method)),
                }
            }
            resolved => {
                if length > self.max_body_bytes {
                    warn!(peer = %connection.peer_addr(), length, "request body exceeds the limit");
                    let response = Response::status_page(StatusCode::PAYLOAD_TOO_LARGE);
                    return self.respond(connection, response, Some(request.method));
                }
                Target::Buffered(resolved)
            }
        };

        let pending = Box::new(Pending {
            request,
            remaining: length,
            offset: 0,
            target,
        });
        self.advance(connection, pending, body)
    }

    fn advance(&mut self, connection: &Arc<TcpConnection>, mut pending: Box<Pending>, data: &[u8]) -> Result<()> {
        // Bytes past the declared body are ignored: one request per connection.
        let chunk = &data[..pending.remaining.min(data.len())];
        if !chunk.is_empty() {
            let Pending {
                request,
                target,
                offset,
                ..
            } = &mut *pending;
            match target {
                Target::Buffered(_) => request.body.extend_from_slice(chunk),
                Target::Streaming(handler) => {
                    let request = &*request;
                    let offset = *offset;
                    if guarded(request, "content", || handler.on_content(request, offset, chunk)).is_none() {
                        return self.respond(connection, internal_error(), Some(request.method));
                    }
                }
            }
            pending.offset += chunk.len() as u64;
            pending.remaining -= chunk.len();
        }

        if pending.remaining > 0 {
            self.phase = Phase::Body(pending);
            return Ok(());
        }

        let Pending { request, target, .. } = *pending;
        let response = match target {
            Target::Buffered(resolved) => guarded(&request, "respond", || resolved.call(&request)),
            Target::Streaming(mut handler) => guarded(&request, "respond", || handler.respond(&request)),
        };
        self.respond(connection, response.unwrap_or_else(internal_error), Some(request.method))
    }
}

impl ConnectionHandler for HttpSession {
    fn on_data(&mut self, connection: &Arc<TcpConnection>, data: &[u8]) -> Result<()> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Head(mut parser) => match parser.feed_head(data) {
                Ok(None) => {
                    self.phase = Phase::Head(parser);
                    Ok(())
                }
                Ok(Some((mut request, length))) => {
                    request.peer_addr = Some(connection.peer_addr());
                    trace!(method = %request.method, uri = %request.uri, peer = %connection.peer_addr(), "request");
                    let body = parser.take_buffered();
                    self.begin(connection, request, length, &body)
                }
                Err(err) => {
                    warn!(peer = %connection.peer_addr(), error = %err, "rejecting malformed request");
                    self.respond(connection, Response::status_page(err.status), None)
                }
            },
            Phase::Body(pending) => self.advance(connection, pending, data),
            Phase::Done => Ok(()),
        }
    }
}

/// HTTP server dispatching every request to a shared [`Router`].
///
/// Routes may be added or replaced while the server runs. Each connection
/// carries exactly one request; the response is sent with
/// `Connection: close`. Malformed requests get the matching 4xx/5xx status
/// page before the connection is closed.
///
/// ```no_run
/// use netcore::http::{HttpServer, Method, Response, Router};
/// use netcore::{Executor, HttpConfig};
///
/// let executor = Executor::new("http", 2)?;
/// let mut router = Router::new();
/// router.route(Method::Get, "/health", |_| Response::ok().with_text("up"));
///
/// let server = HttpServer::bind(
///     executor.handle(),
///     "127.0.0.1:8080".parse().unwrap(),
///     HttpConfig::default(),
///     router,
///     None,
/// )?;
/// # drop(server);
/// # Ok::<(), netcore::Error>(())
/// ```
pub struct HttpServer {
    tcp: TcpServer,
    router: Arc<RwLock<Router>>,
}

impl HttpServer {
    pub fn bind(
        handle: &Handle,
        addr: SocketAddr,
        config: HttpConfig,
        router: Router,
        tls: Option<&TlsConfig>,
    ) -> Result<Self> {
        let router = Arc::new(RwLock::new(router));
        let shared = router.clone();
        let (max_header, max_body) = (config.max_header_bytes, config.max_body_bytes);

        let tcp = TcpServer::bind_with(handle, addr, config.socket, tls, move || HttpSession {
            router: shared.clone(),
            max_body_bytes: max_body,
            phase: Phase::Head(RequestParser::new(max_header, max_body)),
        })?;

        Ok(Self { tcp, router })
    }

    /// Adds or replaces a route on the running server.
    pub fn route<F>(&self, method: Method, path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().route(method, path, handler)
    }

    pub fn route_form<F>(&self, method: Method, path: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&Request, &Headers) -> Response + Send + Sync + 'static,
    {
        self.router.write().route_form(method, path, handler)
    }

    pub fn route_streaming<F, H>(&self, method: Method, path: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: BodyHandler + 'static,
    {
        self.router.write().route_streaming(method, path, factory)
    }

    pub fn route_multipart<F, H>(&self, method: Method, path: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: MultipartHandler + 'static,
    {
        self.router.write().route_multipart(method, path, factory)
    }

    pub fn set_not_found<F>(&self, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().set_not_found(handler);
    }

    pub fn set_method_not_allowed<F>(&self, handler: F)
    where
        F: Fn(&Request, &[Method]) -> Response + Send + Sync + 'static,
    {
        self.router.write().set_method_not_allowed(handler);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.local_addr())
            .field("router", &*self.router.read())
            .finish()
    }
}
