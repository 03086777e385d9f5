//! Minimal HTTP/1.1 serving: request parsing, routing, form bodies and
//! responses.

pub(crate) mod form;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod router;
pub(crate) mod server;
pub(crate) mod status;

pub use form::{
    DEFAULT_MAX_TEXT_BYTES, FileChunk, FormPart, MultipartHandler, MultipartParser, PartHeaders,
    is_urlencoded, multipart_boundary, parse_urlencoded,
};
pub use request::{Headers, Method, ParseError, Request, RequestParser, percent_decode};
pub use response::Response;
pub use router::{BodyHandler, MethodNotAllowedHandler, RouteHandler, Router};
pub use server::HttpServer;
pub use status::StatusCode;
