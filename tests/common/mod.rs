//! Shared plumbing for the integration suites: spawn a server, speak raw
//! HTTP/1.1 over a std TcpStream, read back one response.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use petrel::{HttpServer, Response, Router, RunningServer, ServerConfig};

pub fn spawn_server(config: ServerConfig, router: Router) -> RunningServer {
    let server = HttpServer::new(config.with_port(0), router).expect("server construction");
    server.spawn()
}

pub fn echo_router() -> Router {
    let mut router = Router::new();
    router.get("/x", |_req| Response::ok().with_body("hello"));
    router.post("/e", |req| Response::ok().with_body(req.body().to_vec()));
    router
}

pub fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// One parsed response: head lines plus body bytes.
#[derive(Debug)]
pub struct RawResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn status_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().skip(1).find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim())
        })
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }
}

/// Read exactly one response (head + content-length body) from `stream`.
pub fn read_response(stream: &mut impl Read) -> RawResponse {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => raw.push(byte[0]),
            Ok(_) => break,
            Err(err) => panic!("reading response head: {err} (got {raw:?})"),
        }
        assert!(raw.len() < 64 * 1024, "response head unreasonably large");
    }
    let head = String::from_utf8(raw).expect("response head is utf-8");

    let content_length: usize = head
        .lines()
        .find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .strip_prefix("content-length:")
                .map(|value| value.trim().parse().expect("content-length value"))
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).expect("response body");
    }
    RawResponse { head, body }
}

/// Send `request` and read one response back.
pub fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> RawResponse {
    stream.write_all(request).expect("send request");
    read_response(stream)
}
