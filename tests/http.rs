mod common;

use netcore::http::{
    BodyHandler, FileChunk, HttpServer, Method, MultipartHandler, PartHeaders, Request, Response,
    Router, StatusCode,
};
use netcore::{Executor, HttpConfig};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

fn exchange(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(3))).expect("timeout");
    stream.write_all(raw.as_bytes()).expect("write");

    // The server closes after one response.
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read");
    response
}

fn server(executor: &Executor) -> HttpServer {
    let mut router = Router::new();
    router.route(Method::Get, "/hello", |request| {
        let name = request.query("name").unwrap_or("world");
        Response::ok().with_text(format!("hello {name}"))
    });
    router.route(Method::Post, "/echo", |request| {
        Response::new(StatusCode::CREATED).with_body(request.body.clone())
    });
    router.route(Method::Get, "/panic", |_| panic!("handler bug"));

    HttpServer::bind(executor.handle(), common::localhost(), HttpConfig::default(), router, None)
        .expect("bind")
}

#[test]
fn routes_by_method_and_path() {
    common::init_tracing();
    let executor = Executor::new("http", 2).expect("executor");
    let server = server(&executor);
    let addr = server.local_addr();

    let ok = exchange(addr, "GET /hello?name=r%C3%BCst HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"), "{ok}");
    assert!(ok.contains("Connection: close\r\n"));
    assert!(ok.ends_with("hello rüst"));

    let created = exchange(addr, "POST /echo HTTP/1.1\r\nContent-Length: 4\r\n\r\nping");
    assert!(created.starts_with("HTTP/1.1 201 Created\r\n"));
    assert!(created.ends_with("\r\n\r\nping"));

    let missing = exchange(addr, "GET /nope HTTP/1.1\r\n\r\n");
    assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));

    let wrong_method = exchange(addr, "DELETE /hello HTTP/1.1\r\n\r\n");
    assert!(wrong_method.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(wrong_method.contains("Allow: GET\r\n"));
}

#[test]
fn malformed_requests_get_an_error_status() {
    let executor = Executor::new("http-bad", 1).expect("executor");
    let server = server(&executor);
    let addr = server.local_addr();

    let bad = exchange(addr, "GARBAGE\r\n\r\n");
    assert!(bad.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{bad}");

    let version = exchange(addr, "GET /hello HTTP/2.0\r\n\r\n");
    assert!(version.starts_with("HTTP/1.1 505 "));
}

#[test]
fn handler_panic_becomes_500_and_server_keeps_serving() {
    let executor = Executor::new("http-panic", 1).expect("executor");
    let server = server(&executor);
    let addr = server.local_addr();

    let failed = exchange(addr, "GET /panic HTTP/1.1\r\n\r\n");
    assert!(failed.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

    let ok = exchange(addr, "GET /hello HTTP/1.1\r\n\r\n");
    assert!(ok.ends_with("hello world"));
}

#[test]
fn routes_and_fallbacks_can_change_while_running() {
    let executor = Executor::new("http-live", 1).expect("executor");
    let server = server(&executor);
    let addr = server.local_addr();

    server.route(Method::Get, "/late", |_| Response::ok().with_text("added"));
    server.set_not_found(|_| Response::new(StatusCode::GONE));

    assert!(exchange(addr, "GET /late HTTP/1.1\r\n\r\n").ends_with("added"));
    assert!(exchange(addr, "GET /other HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 410 Gone\r\n"));
}

/// Counts body bytes and sums them without keeping the body.
#[derive(Default)]
struct Digest {
    bytes: u64,
    sum: u64,
    chunks_in_order: bool,
}

impl BodyHandler for Digest {
    fn on_head(&mut self, _request: &Request) {
        self.chunks_in_order = true;
    }

    fn on_content(&mut self, _request: &Request, offset: u64, data: &[u8]) {
        self.chunks_in_order &= offset == self.bytes;
        self.bytes += data.len() as u64;
        self.sum += data.iter().map(|&b| u64::from(b)).sum::<u64>();
    }

    fn respond(&mut self, _request: &Request) -> Response {
        Response::ok().with_text(format!("{} {} {}", self.bytes, self.sum, self.chunks_in_order))
    }
}

#[derive(Default)]
struct Fields {
    seen: Vec<String>,
}

impl MultipartHandler for Fields {
    fn on_text(&mut self, _request: &Request, part: &PartHeaders, value: &str) {
        self.seen.push(format!("{}={value}", part.name));
    }

    fn on_file(&mut self, _request: &Request, chunk: FileChunk<'_>) {
        if chunk.last {
            let filename = chunk.part.filename.as_deref().unwrap_or_default();
            self.seen.push(format!("{}@{filename}:{}", chunk.part.name, chunk.offset + chunk.data.len() as u64));
        }
    }

    fn respond(&mut self, _request: &Request) -> Response {
        Response::ok().with_text(self.seen.join(";"))
    }
}

#[test]
fn streaming_routes_bypass_the_body_limit() {
    common::init_tracing();
    let executor = Executor::new("http-stream", 2).expect("executor");
    let config = HttpConfig {
        max_body_bytes: 1024,
        ..HttpConfig::default()
    };
    let mut router = Router::new();
    router.route_streaming(Method::Put, "/blob", Digest::default);
    router.route(Method::Put, "/small", |request| Response::ok().with_body(request.body.clone()));
    let server = HttpServer::bind(executor.handle(), common::localhost(), config, router, None).expect("bind");
    let addr = server.local_addr();

    let body: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    let sum: u64 = body.iter().map(|&b| u64::from(b)).sum();
    let mut raw = format!("PUT /blob HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    raw.extend_from_slice(&body);

    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
    stream.write_all(&raw).expect("write");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read");
    assert!(response.ends_with(&format!("{} {sum} true", body.len())), "{response}");

    // Buffered routes are refused as soon as the head declares too much.
    let refused = exchange(addr, "PUT /small HTTP/1.1\r\nContent-Length: 2048\r\n\r\n");
    assert!(refused.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{refused}");
}

#[test]
fn form_routes_over_the_wire() {
    let executor = Executor::new("http-forms", 1).expect("executor");
    let server = server(&executor);
    let addr = server.local_addr();

    server.route_form(Method::Post, "/search", |_, fields| {
        Response::ok().with_text(fields.get("q").unwrap_or_default().to_string())
    });
    server.route_multipart(Method::Post, "/upload", Fields::default);

    let body = "q=caf%C3%A9+au+lait";
    let search = exchange(
        addr,
        &format!(
            "POST /search HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    );
    assert!(search.ends_with("café au lait"), "{search}");

    let form = "--sep\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nnotes\r\n\
                --sep\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"n.txt\"\r\n\
                Content-Type: text/plain\r\n\r\nfirst\r\nsecond\r\n--sep--\r\n";
    let upload = exchange(
        addr,
        &format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=sep\r\n\
             Content-Length: {}\r\n\r\n{form}",
            form.len()
        ),
    );
    assert!(upload.ends_with("title=notes;doc@n.txt:13"), "{upload}");
}
