//! Lifecycle, hot updates, stats and robustness.

mod common;

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use common::{connect, echo_router, roundtrip, spawn_server};
use petrel::{Response, ServerConfig};

#[test]
fn stop_returns_promptly() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let _idle = connect(server.port());

    let started = Instant::now();
    server.stop_and_join().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        started.elapsed()
    );
}

#[test]
fn drain_refuses_new_connections_and_finishes() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let port = server.port();

    // existing connection keeps working through the drain
    let mut stream = connect(port);
    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));

    server
        .control()
        .begin_drain(Some(Instant::now() + Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(300));

    // the listener is gone
    let refused = std::net::TcpStream::connect(("127.0.0.1", port));
    match refused {
        Err(_) => {}
        Ok(mut stream) => {
            // a race may let the connect through; it must be dead though
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let _ = stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
            let mut sink = Vec::new();
            assert_eq!(stream.read_to_end(&mut sink).unwrap_or(0), 0);
        }
    }

    drop(stream);
    server.stop_and_join().unwrap();
}

#[test]
fn router_hot_update_applies() {
    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut stream = connect(server.port());

    let resp = roundtrip(&mut stream, b"GET /new HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("404"));

    server.control().post_router_update(|router| {
        router.get("/new", |_req| Response::ok().with_body("added"));
    });
    std::thread::sleep(Duration::from_millis(200));

    let resp = roundtrip(&mut stream, b"GET /new HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));
    assert_eq!(resp.body_str(), "added");

    server.stop_and_join().unwrap();
}

#[test]
fn config_hot_update_applies() {
    let server = spawn_server(ServerConfig::default(), echo_router());

    server.control().post_config_update(|config| {
        config.max_body_bytes = 4;
    });
    std::thread::sleep(Duration::from_millis(200));

    let mut stream = connect(server.port());
    let resp = roundtrip(
        &mut stream,
        b"POST /e HTTP/1.1\r\nHost: h\r\nContent-Length: 6\r\n\r\nabcdef",
    );
    assert!(resp.status_line().contains("413"));

    server.stop_and_join().unwrap();
}

#[test]
fn stats_count_requests_and_connections() {
    let server = spawn_server(ServerConfig::default(), echo_router());

    let mut stream = connect(server.port());
    for _ in 0..3 {
        let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(resp.status_line().contains("200"));
    }
    drop(stream);
    std::thread::sleep(Duration::from_millis(300));

    let stats = server.stats();
    assert!(stats.total_requests >= 3, "stats: {stats:?}");
    assert!(stats.connections_accepted >= 1);

    server.stop_and_join().unwrap();
}

#[test]
fn closed_connections_are_recycled() {
    let server = spawn_server(ServerConfig::default(), echo_router());

    for _ in 0..5 {
        let mut stream = connect(server.port());
        let resp = roundtrip(&mut stream, b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n");
        assert!(resp.status_line().contains("200"));
        // HTTP/1.0: server closes after the response
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    }
    std::thread::sleep(Duration::from_millis(300));

    let stats = server.stats();
    assert_eq!(stats.open_connections, 0, "stats: {stats:?}");
    assert!(stats.connections_closed >= 5);
    assert!(stats.cached_connections >= 1);

    server.stop_and_join().unwrap();
}

#[test]
fn random_garbage_never_kills_the_server() {
    // deterministic lcg so the byte streams are reproducible
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0
        }
    }

    let server = spawn_server(ServerConfig::default(), echo_router());
    let mut lcg = Lcg(0x5eed);

    for round in 0..50 {
        let len = (lcg.next() % 8192) as usize;
        let garbage: Vec<u8> = (0..len).map(|_| (lcg.next() >> 16) as u8).collect();

        let mut stream = connect(server.port());
        let _ = stream.write_all(&garbage);
        let _ = stream.shutdown(std::net::Shutdown::Write);
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        // either an error response or a clean close; we only require that
        // something terminal happens and the server survives
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
        drop(stream);

        if round % 10 == 0 {
            let mut healthy = connect(server.port());
            let resp = roundtrip(&mut healthy, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
            assert!(resp.status_line().contains("200"), "round {round}");
        }
    }

    std::thread::sleep(Duration::from_millis(300));
    let stats = server.stats();
    assert_eq!(stats.open_connections, 0, "no leaked connection states");

    server.stop_and_join().unwrap();
}

#[test]
fn keep_alive_timeout_reaps_idle_connections() {
    let server = spawn_server(
        ServerConfig::default()
            .with_keep_alive_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(50)),
        echo_router(),
    );

    let mut stream = connect(server.port());
    let resp = roundtrip(&mut stream, b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    assert!(resp.status_line().contains("200"));

    // sit idle past the keep-alive timeout; the server closes
    let mut sink = Vec::new();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let n = stream.read_to_end(&mut sink).unwrap_or(0);
    assert_eq!(n, 0);

    server.stop_and_join().unwrap();
}
