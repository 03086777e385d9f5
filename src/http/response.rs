use crate::http::request::{Headers, Method};
use crate::http::status::StatusCode;

use std::fmt::Write;

/// An HTTP response under construction.
///
/// ```
/// use netcore::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::CREATED)
///     .with_header("Location", "/items/7")
///     .with_text("created");
/// assert_eq!(response.status, StatusCode::CREATED);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// A `text/plain` response whose body is the status line.
    pub fn status_page(status: StatusCode) -> Self {
        Self::new(status).with_text(status.to_string())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a UTF-8 text body and its content type.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(text.into())
    }

    /// Serializes the response. `Content-Length` is always derived from the
    /// body; HEAD requests get the headers only.
    pub fn to_bytes(&self, method: Option<Method>) -> Vec<u8> {
        let mut head = String::with_capacity(128);
        let _ = write!(head, "HTTP/1.1 {}\r\n", self.status);

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            let _ = write!(head, "{name}: {value}\r\n");
        }

        let with_body = !self.status.forbids_body();
        if with_body {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if with_body && method != Some(Method::Head) {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_content_length() {
        let bytes = Response::ok()
            .with_header("Content-Length", "999")
            .with_text("hi")
            .to_bytes(Some(Method::Get));
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn head_and_no_content_have_no_body() {
        let head = Response::ok().with_text("body").to_bytes(Some(Method::Head));
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 4"));
        assert!(text.ends_with("\r\n\r\n"));

        let empty = Response::new(StatusCode::NO_CONTENT).to_bytes(None);
        assert!(!String::from_utf8(empty).unwrap().contains("Content-Length"));
    }
}
