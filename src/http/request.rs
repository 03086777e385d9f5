//! Requests and the incremental request parser.

use crate::error::Error;
use crate::http::status::StatusCode;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Trace => "TRACE",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    /// Method tokens are case-sensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Method::Connect,
            "DELETE" => Method::Delete,
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "TRACE" => Method::Trace,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header fields with case-insensitive names, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Whether a comma-separated header lists `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Decoded path, without the query string.
    pub path: String,
    /// The request target as sent.
    pub uri: String,
    pub query: HashMap<String, String>,
    /// `HTTP/1.0` or `HTTP/1.1`.
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Set by the server that received the request.
    pub peer_addr: Option<SocketAddr>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A malformed or unsupported request, with the status to answer it with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {reason}")]
pub struct ParseError {
    pub status: StatusCode,
    pub reason: String,
}

impl ParseError {
    pub(crate) fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::protocol(err.to_string())
    }
}

/// Decodes `%XX` escapes, and `+` as space when `plus_as_space` is set.
pub fn percent_decode(input: &str, plus_as_space: bool) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

/// Splits `a=1&b=2` into decoded pairs, in order.
pub(crate) fn parse_pairs(input: &str) -> Result<Vec<(String, String)>, ParseError> {
    let decode = |raw: &str| {
        percent_decode(raw, true).ok_or_else(|| ParseError::bad_request("invalid percent-encoding"))
    };
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode(key)?, decode(value)?))
        })
        .collect()
}

fn parse_query(query: &str) -> Result<HashMap<String, String>, ParseError> {
    Ok(parse_pairs(query)?.into_iter().collect())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

enum Stage {
    Head,
    Body { request: Box<Request>, remaining: usize },
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes are fed as they arrive; a request is returned once its head and
/// `Content-Length` body are complete. Chunked bodies are rejected.
pub struct RequestParser {
    buf: Vec<u8>,
    stage: Stage,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl RequestParser {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            stage: Stage::Head,
            max_header_bytes,
            max_body_bytes,
        }
    }

    /// Appends `data` and returns the next complete request, if any.
    ///
    /// Call again with an empty slice to parse further pipelined requests.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Request>, ParseError> {
        self.buf.extend_from_slice(data);

        loop {
            match &mut self.stage {
                Stage::Head => {
                    let Some((request, length)) = self.next_head()? else {
                        return Ok(None);
                    };
                    if length > self.max_body_bytes {
                        return Err(ParseError::new(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            format!("body of {length} bytes exceeds the limit"),
                        ));
                    }

                    self.stage = Stage::Body {
                        request: Box::new(request),
                        remaining: length,
                    };
                }
                Stage::Body { request, remaining } => {
                    let take = (*remaining).min(self.buf.len());
                    request.body.extend(self.buf.drain(..take));
                    *remaining -= take;
                    if *remaining > 0 {
                        return Ok(None);
                    }

                    let Stage::Body { request, .. } = std::mem::replace(&mut self.stage, Stage::Head) else {
                        unreachable!("stage checked above");
                    };
                    return Ok(Some(*request));
                }
            }
        }
    }

    /// Appends `data` and returns the next request head with its declared
    /// body length. Body bytes stay buffered and the body limit is not
    /// applied; the caller consumes them through [`Self::take_buffered`].
    pub(crate) fn feed_head(&mut self, data: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
        self.buf.extend_from_slice(data);
        self.next_head()
    }

    pub(crate) fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn next_head(&mut self) -> Result<Option<(Request, usize)>, ParseError> {
        let Some(end) = find_head_end(&self.buf) else {
            if self.buf.len() > self.max_header_bytes {
                return Err(ParseError::new(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "request head exceeds the limit",
                ));
            }
            return Ok(None);
        };
        if end + 4 > self.max_header_bytes {
            return Err(ParseError::new(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "request head exceeds the limit",
            ));
        }

        let head: Vec<u8> = self.buf.drain(..end + 4).collect();
        let request = self.parse_head(&head[..end])?;
        let length = content_length(&request.headers)?;
        Ok(Some((request, length)))
    }

    /// Bytes received after the last complete request.
    pub(crate) fn into_remaining(self) -> Vec<u8> {
        self.buf
    }

    fn parse_head(&self, head: &[u8]) -> Result<Request, ParseError> {
        let head = std::str::from_utf8(head)
            .map_err(|_| ParseError::bad_request("request head is not valid UTF-8"))?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::bad_request("malformed request line"));
        };

        let method: Method = method.parse().map_err(|()| {
            ParseError::new(StatusCode::NOT_IMPLEMENTED, format!("unsupported method `{method}`"))
        })?;
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(ParseError::new(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                format!("unsupported version `{version}`"),
            ));
        }
        if uri.is_empty() {
            return Err(ParseError::bad_request("empty request target"));
        }

        let (raw_path, raw_query) = uri.split_once('?').unwrap_or((uri, ""));
        let path = percent_decode(raw_path, false)
            .ok_or_else(|| ParseError::bad_request("invalid path encoding"))?;
        let query = parse_query(raw_query)?;

        let mut headers = Headers::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(ParseError::bad_request("malformed header line"));
            };
            if name.is_empty() || name.ends_with(char::is_whitespace) {
                return Err(ParseError::bad_request("malformed header name"));
            }
            headers.append(name, value.trim());
        }

        if headers.has_token("Transfer-Encoding", "chunked") {
            return Err(ParseError::new(
                StatusCode::NOT_IMPLEMENTED,
                "chunked request bodies are not supported",
            ));
        }

        Ok(Request {
            method,
            path,
            uri: uri.to_string(),
            query,
            version: version.to_string(),
            headers,
            body: Vec::new(),
            peer_addr: None,
        })
    }
}

fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let mut values = headers.get_all("Content-Length");
    let Some(first) = values.next() else {
        return Ok(0);
    };
    if values.any(|other| other != first) {
        return Err(ParseError::bad_request("conflicting Content-Length headers"));
    }
    first
        .parse()
        .map_err(|_| ParseError::bad_request("invalid Content-Length"))
}

impl fmt::Debug for RequestParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestParser")
            .field("buffered", &self.buf.len())
            .field("in_body", &matches!(self.stage, Stage::Body { .. }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RequestParser {
        RequestParser::new(8 * 1024, 1024)
    }

    #[test]
    fn parses_request_fed_in_pieces() {
        let raw = b"POST /items%20x?name=a%2Bb&flag HTTP/1.1\r\nHost: x\r\ncontent-length: 5\r\n\r\nhello";
        let mut parser = parser();

        assert!(parser.feed(&raw[..10]).unwrap().is_none());
        assert!(parser.feed(&raw[10..raw.len() - 2]).unwrap().is_none());
        let request = parser.feed(&raw[raw.len() - 2..]).unwrap().unwrap();

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path, "/items x");
        assert_eq!(request.query("name"), Some("a+b"));
        assert_eq!(request.query("flag"), Some(""));
        assert_eq!(request.header("Content-Length"), Some("5"));
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn pipelined_requests_are_returned_in_order() {
        let mut parser = parser();
        let first = parser
            .feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        let second = parser.feed(&[]).unwrap().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn rejects_malformed_heads() {
        let err = parser().feed(b"GARBAGE\r\n\r\n").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = parser().feed(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);

        let err = parser().feed(b"GET / HTTP/2.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status, StatusCode::HTTP_VERSION_NOT_SUPPORTED);

        let err = parser().feed(b"GET / HTTP/1.1\r\nno-colon\r\n\r\n").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn enforces_limits() {
        let mut small = RequestParser::new(32, 4);
        let err = small.feed(&[b'a'; 64]).unwrap_err();
        assert_eq!(err.status, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);

        let err = RequestParser::new(1024, 4)
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn rejects_chunked_bodies() {
        let err = parser()
            .feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn head_is_returned_before_the_body() {
        let mut parser = RequestParser::new(1024, 4);
        let (request, length) = parser
            .feed_head(b"PUT /upload HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123")
            .unwrap()
            .unwrap();
        assert_eq!(request.path, "/upload");
        assert!(request.body.is_empty());
        assert_eq!(length, 10);
        assert_eq!(parser.take_buffered(), b"0123");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%2Fb+c", true).as_deref(), Some("a/b c"));
        assert_eq!(percent_decode("a+c", false).as_deref(), Some("a+c"));
        assert_eq!(percent_decode("%zz", false), None);
        assert_eq!(percent_decode("%4", false), None);
    }
}
