//! Opening handshake (RFC 6455 section 4): the HTTP upgrade in both roles.

use crate::error::Error;
use crate::http::{Headers, Method, Request, Response, StatusCode};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use thiserror::Error;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a client key.
///
/// ```
/// use netcore::websocket::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
/// );
/// ```
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh random `Sec-WebSocket-Key`.
pub fn generate_client_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("upgrade must use GET, got {0}")]
    InvalidMethod(Method),

    #[error("missing or invalid `{0}` header")]
    MissingHeader(&'static str),

    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,

    #[error("unsupported WebSocket version `{0}`")]
    UnsupportedVersion(String),

    #[error("expected 101 Switching Protocols, got {0}")]
    NotSwitchingProtocols(StatusCode),

    #[error("Sec-WebSocket-Accept mismatch")]
    InvalidAccept,

    #[error("malformed handshake response: {0}")]
    MalformedResponse(&'static str),

    #[error("handshake exceeds {0} bytes")]
    TooLarge(usize),
}

impl HandshakeError {
    /// The status a server answers a rejected upgrade with.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::UnsupportedVersion(_) => StatusCode::UPGRADE_REQUIRED,
            HandshakeError::InvalidMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::protocol(err.to_string())
    }
}

/// Validates an upgrade request and builds the `101` response.
pub fn accept(request: &Request) -> Result<Response, HandshakeError> {
    if request.method != Method::Get {
        return Err(HandshakeError::InvalidMethod(request.method));
    }
    if !request.headers.has_token("Upgrade", "websocket") {
        return Err(HandshakeError::MissingHeader("Upgrade"));
    }
    if !request.headers.has_token("Connection", "upgrade") {
        return Err(HandshakeError::MissingHeader("Connection"));
    }

    let version = request
        .header("Sec-WebSocket-Version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    match STANDARD.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(Response::new(StatusCode::SWITCHING_PROTOCOLS)
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", compute_accept_key(key)))
}

/// The response sent when an upgrade is refused.
pub fn reject(err: &HandshakeError) -> Response {
    let mut response = Response::status_page(err.status()).with_header("Connection", "close");
    if matches!(err, HandshakeError::UnsupportedVersion(_)) {
        response = response.with_header("Sec-WebSocket-Version", "13");
    }
    response
}

/// The client's upgrade request for `path` on `host`.
pub fn client_request(host: &str, path: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Client side of the handshake: waits for and checks the server's answer.
#[derive(Debug)]
pub struct ResponseReader {
    key: String,
    max_bytes: usize,
    buf: Vec<u8>,
}

impl ResponseReader {
    pub fn new(key: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            key: key.into(),
            max_bytes,
            buf: Vec::new(),
        }
    }

    /// Buffers `data`. Once the response head is complete it is validated
    /// and the bytes that followed it are returned.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, HandshakeError> {
        self.buf.extend_from_slice(data);
        let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            if self.buf.len() > self.max_bytes {
                return Err(HandshakeError::TooLarge(self.max_bytes));
            }
            return Ok(None);
        };

        let (status, headers) = parse_response_head(&self.buf[..end])?;
        if status != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::NotSwitchingProtocols(status));
        }
        if !headers.has_token("Upgrade", "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !headers.has_token("Connection", "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }
        if headers.get("Sec-WebSocket-Accept") != Some(compute_accept_key(&self.key).as_str()) {
            return Err(HandshakeError::InvalidAccept);
        }

        Ok(Some(self.buf.split_off(end + 4)))
    }
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, Headers), HandshakeError> {
    let head = std::str::from_utf8(head).map_err(|_| HandshakeError::MalformedResponse("not UTF-8"))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(HandshakeError::MalformedResponse("status line"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::MalformedResponse("version"));
    }
    let status = code
        .parse()
        .ok()
        .and_then(StatusCode::from_u16)
        .ok_or(HandshakeError::MalformedResponse("status code"))?;

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(HandshakeError::MalformedResponse("header line"))?;
        headers.append(name.trim(), value.trim());
    }
    Ok((status, headers))
}
