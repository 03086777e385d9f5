//! Form bodies: `application/x-www-form-urlencoded` and streamed
//! `multipart/form-data`.

use crate::http::request::{Headers, ParseError, Request, parse_pairs};
use crate::http::response::Response;
use crate::http::router::BodyHandler;
use crate::http::status::StatusCode;

use std::fmt;

/// Text fields of a multipart form larger than this are rejected.
pub const DEFAULT_MAX_TEXT_BYTES: usize = 64 * 1024;

const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

fn mime_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

pub fn is_urlencoded(content_type: &str) -> bool {
    mime_type(content_type).eq_ignore_ascii_case("application/x-www-form-urlencoded")
}

/// The boundary parameter of a `multipart/form-data` content type.
///
/// ```
/// use netcore::http::multipart_boundary;
///
/// assert_eq!(multipart_boundary("multipart/form-data; boundary=\"xyz\""), Some("xyz"));
/// assert_eq!(multipart_boundary("text/plain; boundary=xyz"), None);
/// ```
pub fn multipart_boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"'))
        })
        .filter(|boundary| (1..=70).contains(&boundary.len()))
}

/// Decodes an urlencoded form body into fields, in order.
///
/// Lookups through the returned [`Headers`] ignore the case of field names.
pub fn parse_urlencoded(body: &[u8]) -> Result<Headers, ParseError> {
    let body = std::str::from_utf8(body)
        .map_err(|_| ParseError::bad_request("form body is not valid UTF-8"))?;

    let mut fields = Headers::new();
    for (name, value) in parse_pairs(body)? {
        if name.is_empty() {
            return Err(ParseError::bad_request("form field without a name"));
        }
        fields.append(name, value);
    }
    Ok(fields)
}

/// Headers of one multipart part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: String,
    /// Set for file parts; an empty `filename` counts as a text field.
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// A slice of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk<'a> {
    pub part: &'a PartHeaders,
    /// Position of `data` within the file.
    pub offset: u64,
    pub data: &'a [u8],
    /// The file ends with this chunk.
    pub last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormPart<'a> {
    Text { part: &'a PartHeaders, value: &'a str },
    File(FileChunk<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Preamble,
    AfterBoundary,
    Headers,
    Body,
    Done,
}

/// Incremental `multipart/form-data` parser.
///
/// Text fields are reported once complete. File contents are reported in
/// chunks as they arrive, so uploads are never held in memory whole.
pub struct MultipartParser {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    step: Step,
    part: PartHeaders,
    text: Vec<u8>,
    offset: u64,
    max_text_bytes: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str, max_text_bytes: usize) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            // The first boundary has no preceding line break.
            buf: b"\r\n".to_vec(),
            step: Step::Preamble,
            part: PartHeaders::default(),
            text: Vec::new(),
            offset: 0,
            max_text_bytes,
        }
    }

    /// Whether the closing boundary has been seen.
    pub fn is_finished(&self) -> bool {
        self.step == Step::Done
    }

    /// Parses `data`, reporting completed text fields and file chunks.
    pub fn feed<F>(&mut self, data: &[u8], mut on_part: F) -> Result<(), ParseError>
    where
        F: FnMut(FormPart<'_>),
    {
        if self.step == Step::Done {
            return Ok(());
        }
        self.buf.extend_from_slice(data);

        loop {
            match self.step {
                Step::Preamble => match find(&self.buf, &self.delimiter) {
                    Some(at) => {
                        self.buf.drain(..at + self.delimiter.len());
                        self.step = Step::AfterBoundary;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        return Ok(());
                    }
                },
                Step::AfterBoundary => {
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    match &self.buf[..2] {
                        b"\r\n" => {
                            self.buf.drain(..2);
                            self.part = PartHeaders::default();
                            self.step = Step::Headers;
                        }
                        b"--" => {
                            self.buf.clear();
                            self.step = Step::Done;
                            return Ok(());
                        }
                        _ => return Err(ParseError::bad_request("malformed multipart boundary")),
                    }
                }
                Step::Headers => {
                    let Some(end) = find(&self.buf, b"\r\n") else {
                        if self.buf.len() > MAX_PART_HEADER_BYTES {
                            return Err(ParseError::bad_request("multipart part header too long"));
                        }
                        return Ok(());
                    };
                    let line: Vec<u8> = self.buf.drain(..end + 2).collect();
                    if end > 0 {
                        let line = std::str::from_utf8(&line[..end])
                            .map_err(|_| ParseError::bad_request("multipart header is not valid UTF-8"))?;
                        parse_part_header(&mut self.part, line)?;
                        continue;
                    }

                    if self.part.name.is_empty() {
                        return Err(ParseError::bad_request("multipart part without a name"));
                    }
                    self.text.clear();
                    self.offset = 0;
                    self.step = Step::Body;
                }
                Step::Body => match find(&self.buf, &self.delimiter) {
                    Some(at) => {
                        self.emit(at, true, &mut on_part)?;
                        self.buf.drain(..at + self.delimiter.len());
                        self.step = Step::AfterBoundary;
                    }
                    None => {
                        // A delimiter may straddle the next read.
                        let safe = self.buf.len().saturating_sub(self.delimiter.len() - 1);
                        if safe > 0 {
                            self.emit(safe, false, &mut on_part)?;
                            self.buf.drain(..safe);
                        }
                        return Ok(());
                    }
                },
                Step::Done => return Ok(()),
            }
        }
    }

    fn emit<F>(&mut self, len: usize, last: bool, on_part: &mut F) -> Result<(), ParseError>
    where
        F: FnMut(FormPart<'_>),
    {
        let data = &self.buf[..len];

        if self.part.filename.is_some() {
            on_part(FormPart::File(FileChunk {
                part: &self.part,
                offset: self.offset,
                data,
                last,
            }));
            self.offset += len as u64;
            return Ok(());
        }

        if self.text.len() + len > self.max_text_bytes {
            return Err(ParseError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("form field `{}` exceeds {} bytes", self.part.name, self.max_text_bytes),
            ));
        }
        self.text.extend_from_slice(data);
        if last {
            let value = std::str::from_utf8(&self.text)
                .map_err(|_| ParseError::bad_request("form field is not valid UTF-8"))?;
            on_part(FormPart::Text {
                part: &self.part,
                value,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for MultipartParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartParser")
            .field("step", &self.step)
            .field("part", &self.part.name)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_part_header(part: &mut PartHeaders, line: &str) -> Result<(), ParseError> {
    let Some((name, value)) = line.split_once(':') else {
        return Err(ParseError::bad_request("malformed multipart header"));
    };

    if name.trim().eq_ignore_ascii_case("Content-Disposition") {
        let mut params = value.split(';');
        if !params
            .next()
            .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("form-data"))
        {
            return Err(ParseError::bad_request("multipart part is not form-data"));
        }
        for param in params {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.eq_ignore_ascii_case("name") {
                part.name = unquote(raw).to_string();
            } else if key.eq_ignore_ascii_case("filename") {
                part.filename = Some(unquote(raw).to_string()).filter(|name| !name.is_empty());
            }
        }
    } else if name.trim().eq_ignore_ascii_case("Content-Type") {
        part.content_type = Some(value.trim().to_string());
    }
    Ok(())
}

/// Per-request receiver for a `multipart/form-data` route.
///
/// A fresh handler is created for every request.
pub trait MultipartHandler: Send {
    /// The request head was accepted as a multipart form.
    fn on_head(&mut self, _request: &Request) {}

    fn on_text(&mut self, _request: &Request, _part: &PartHeaders, _value: &str) {}

    fn on_file(&mut self, _request: &Request, _chunk: FileChunk<'_>) {}

    /// Called after the closing boundary.
    fn respond(&mut self, request: &Request) -> Response;
}

/// Drives a [`MultipartHandler`] from the body stream.
pub(crate) struct MultipartBody<H> {
    handler: H,
    parser: Option<MultipartParser>,
    error: Option<ParseError>,
}

impl<H> MultipartBody<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            parser: None,
            error: None,
        }
    }
}

impl<H: MultipartHandler> BodyHandler for MultipartBody<H> {
    fn on_head(&mut self, request: &Request) {
        match request.content_type().and_then(multipart_boundary) {
            Some(boundary) => {
                self.parser = Some(MultipartParser::new(boundary, DEFAULT_MAX_TEXT_BYTES));
                self.handler.on_head(request);
            }
            None => {
                self.error = Some(ParseError::new(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "expected multipart/form-data with a boundary",
                ));
            }
        }
    }

    fn on_content(&mut self, request: &Request, _offset: u64, data: &[u8]) {
        if self.error.is_some() {
            return;
        }
        let Some(parser) = &mut self.parser else {
            return;
        };

        let handler = &mut self.handler;
        let result = parser.feed(data, |part| match part {
            FormPart::Text { part, value } => handler.on_text(request, part, value),
            FormPart::File(chunk) => handler.on_file(request, chunk),
        });
        if let Err(err) = result {
            self.error = Some(err);
        }
    }

    fn respond(&mut self, request: &Request) -> Response {
        let finished = self.parser.as_ref().is_some_and(MultipartParser::is_finished);
        if self.error.is_none() && !finished {
            self.error = Some(ParseError::bad_request("multipart body ended before the closing boundary"));
        }
        match &self.error {
            Some(err) => Response::status_page(err.status),
            None => self.handler.respond(request),
        }
    }
}
