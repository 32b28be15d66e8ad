//! End-to-end HTTP/1.x behavior over real sockets.

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::{connect, echo_router, read_response, roundtrip, spawn_server};
use petrel::{Handler, ProbesConfig, Response, Router, ServerConfig};

#[test]
fn basic_get_keep_alive() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("HTTP/1.1 200"));
    assert_eq!(resp.header("content-length"), Some("5"));
    assert_eq!(resp.header("connection"), Some("keep-alive"));
    assert!(resp.header("date").is_some());
    assert_eq!(resp.body_str(), "hello");

    // the connection stays usable
    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(resp.body_str(), "hello");

    server.stop_and_join().unwrap();
}

#[test]
fn pipelined_requests_answered_in_order() {
    let mut router = Router::new();
    router.get("/1", |_req| Response::ok().with_body("A"));
    router.get("/2", |_req| Response::ok().with_body("A"));
    let server = spawn_server(ServerConfig::default(), router);
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /1 HTTP/1.1\r\nHost: h\r\n\r\nGET /2 HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    let second = read_response(&mut stream);
    assert!(first.status_line().contains("200"));
    assert!(second.status_line().contains("200"));
    assert_eq!(first.body_str(), "A");
    assert_eq!(second.body_str(), "A");

    server.stop_and_join().unwrap();
}

#[test]
fn chunked_upload_echo() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());

    let resp = roundtrip(
        &mut stream,
        b"POST /e HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.header("content-length"), Some("5"));
    assert_eq!(resp.body_str(), "hello");

    server.stop_and_join().unwrap();
}

#[test]
fn expect_continue_interim_precedes_final_response() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());

    stream
        .write_all(
            b"POST /e HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap();

    let interim = read_response(&mut stream);
    assert!(interim.status_line().contains("100 Continue"));

    stream.write_all(b"abc").unwrap();
    let resp = read_response(&mut stream);
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.body_str(), "abc");

    server.stop_and_join().unwrap();
}

#[test]
fn oversize_body_is_413() {
    let server = spawn_server(
        ServerConfig::default().with_max_body_bytes(8),
        echo_router(),
    );
    let mut stream = connect(server.port());

    let resp = roundtrip(
        &mut stream,
        b"POST /e HTTP/1.1\r\nHost: h\r\nContent-Length: 9\r\n\r\n123456789",
    );
    assert!(resp.status_line().contains("413"));
    assert_eq!(resp.header("content-length"), Some("0"));
    assert_eq!(resp.header("connection"), Some("close"));

    server.stop_and_join().unwrap();
}

#[test]
fn head_matches_get_with_empty_body() {
    let server = spawn_server(ServerConfig::default(), echo_router());

    let mut stream = connect(server.port());
    let get = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");

    stream
        .write_all(b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();
    // read only the head; no body bytes follow
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    assert!(head.contains("HTTP/1.1 200"));
    assert!(head.to_ascii_lowercase().contains("content-length: 5"));
    assert_eq!(get.header("content-length"), Some("5"));

    // the connection is still in sync: a follow-up request works
    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(resp.body_str(), "hello");

    server.stop_and_join().unwrap();
}

#[test]
fn unknown_method_is_501() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());
    let resp = roundtrip(&mut stream, b"BREW /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("501"));
    server.stop_and_join().unwrap();
}

#[test]
fn http2_version_on_plain_path_is_505() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());
    let resp = roundtrip(&mut stream, b"GET /x HTTP/2.0\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("505"));
    server.stop_and_join().unwrap();
}

#[test]
fn missing_route_is_404() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());
    let resp = roundtrip(&mut stream, b"GET /nope HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("404"));
    server.stop_and_join().unwrap();
}

#[test]
fn http10_defaults_to_close() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());
    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("HTTP/1.0 200"));
    assert_eq!(resp.header("connection"), Some("close"));

    // server closes; further reads hit EOF
    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).unwrap();
    assert!(tail.is_empty());

    server.stop_and_join().unwrap();
}

#[test]
fn request_cap_forces_close() {
    let server = spawn_server(
        ServerConfig::default().with_max_requests_per_connection(2),
        echo_router(),
    );
    let mut stream = connect(server.port());

    let first = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(first.header("connection"), Some("keep-alive"));
    let second = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(second.header("connection"), Some("close"));

    server.stop_and_join().unwrap();
}

#[test]
fn oversized_headers_are_431() {
    let server = spawn_server(
        ServerConfig::default().with_max_header_bytes(256),
        echo_router(),
    );
    let mut stream = connect(server.port());
    let request = format!(
        "GET /x HTTP/1.1\r\nHost: h\r\nX-Padding: {}\r\n\r\n",
        "p".repeat(512)
    );
    let resp = roundtrip(&mut stream, request.as_bytes());
    assert!(resp.status_line().contains("431"));
    server.stop_and_join().unwrap();
}

#[test]
fn builtin_probes_short_circuit_routing() {
    let server = spawn_server(
        ServerConfig::default().with_probes(ProbesConfig::enabled()),
        Router::new(),
    );
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /livez HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.body_str(), "ok\n");

    let resp = roundtrip(&mut stream, b"GET /readyz HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));

    let resp = roundtrip(&mut stream, b"GET /startupz HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));

    // no default handler: anything else is 404
    let resp = roundtrip(&mut stream, b"GET /other HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("404"));

    server.stop_and_join().unwrap();
}

#[test]
fn streaming_handler_chunk_encodes() {
    let mut router = Router::new();
    router.set(
        "/stream",
        Handler::streaming(|_req, stream| {
            stream.send_head(http::StatusCode::OK, "text/plain", None);
            stream.write_chunk(b"part one, ");
            stream.write_chunk(b"part two");
            stream.end();
        }),
    );
    let server = spawn_server(ServerConfig::default(), router);
    let mut stream = connect(server.port());

    stream
        .write_all(b"GET /stream HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(text.contains("a\r\npart one, \r\n"));
    assert!(text.contains("8\r\npart two\r\n"));
    assert!(text.ends_with("0\r\n\r\n"));

    server.stop_and_join().unwrap();
}

#[test]
fn async_handler_completes_after_suspension() {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    // a future that parks itself once, then wakes from a helper thread
    struct YieldOnce {
        fired: bool,
    }
    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.fired {
                return Poll::Ready(());
            }
            self.fired = true;
            let waker = cx.waker().clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                waker.wake();
            });
            Poll::Pending
        }
    }

    let mut router = Router::new();
    router.set(
        "/slow",
        Handler::asynchronous(|_req| async {
            YieldOnce { fired: false }.await;
            Response::ok().with_body("eventually")
        }),
    );
    let server = spawn_server(ServerConfig::default(), router);
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.body_str(), "eventually");

    server.stop_and_join().unwrap();
}

#[test]
fn file_response_is_byte_exact() {
    use std::io::Seek;

    let mut file = tempfile::tempfile().unwrap();
    let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
    file.write_all(&payload).unwrap();
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    let len = payload.len() as u64;

    let mut router = Router::new();
    let file = std::sync::Mutex::new(Some(file));
    router.set(
        "/file",
        Handler::sync(move |_req| {
            let file = file.lock().unwrap().take().expect("single request");
            Response::ok()
                .with_content_type("application/octet-stream")
                .with_file(file, 0, len)
        }),
    );
    let server = spawn_server(ServerConfig::default(), router);
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /file HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.header("content-length"), Some("400000"));
    assert_eq!(resp.body, payload);

    server.stop_and_join().unwrap();
}

#[test]
fn handler_panic_becomes_500() {
    let mut router = Router::new();
    router.get("/boom", |_req| panic!("handler exploded"));
    let server = spawn_server(ServerConfig::default(), router);
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /boom HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("500"));

    // the reactor survives and serves the next connection
    let mut other = connect(server.port());
    let resp = roundtrip(&mut other, b"GET /boom HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("500"));

    server.stop_and_join().unwrap();
}

#[cfg(feature = "compression")]
#[test]
fn gzip_request_body_is_decompressed() {
    use std::io::Write as _;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"packed payload").unwrap();
    let packed = encoder.finish().unwrap();

    let server = spawn_server(
        ServerConfig::default().with_request_decompression(true),
        echo_router(),
    );
    let mut stream = connect(server.port());

    let mut request = format!(
        "POST /e HTTP/1.1\r\nHost: h\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        packed.len()
    )
    .into_bytes();
    request.extend_from_slice(&packed);

    let resp = roundtrip(&mut stream, &request);
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.body_str(), "packed payload");

    server.stop_and_join().unwrap();
}

#[cfg(feature = "compression")]
#[test]
fn response_compression_negotiates_gzip() {
    use petrel::ResponseCompressionConfig;

    let body = "repetitive body ".repeat(512);
    let expected = body.clone();
    let mut router = Router::new();
    router.get("/big", move |_req| Response::ok().with_body(body.clone()));

    let server = spawn_server(
        ServerConfig::default().with_response_compression(ResponseCompressionConfig {
            enabled: true,
            min_bytes: 64,
        }),
        router,
    );
    let mut stream = connect(server.port());

    let resp = roundtrip(
        &mut stream,
        b"GET /big HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\n\r\n",
    );
    assert_eq!(resp.header("content-encoding"), Some("gzip"));
    let mut unpacked = Vec::new();
    flate2::read::GzDecoder::new(resp.body.as_slice())
        .read_to_end(&mut unpacked)
        .unwrap();
    assert_eq!(unpacked, expected.as_bytes());

    // without accept-encoding the body stays identity
    let resp = roundtrip(&mut stream, b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.header("content-encoding").is_none());
    assert_eq!(resp.body_str(), expected);

    server.stop_and_join().unwrap();
}
