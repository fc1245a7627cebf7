//! Wire-level behavior of the push channel: throttled coalescing and the
//! persistent compression stream.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::ZlibDecoder;
use livetree_push::{BufferTransport, RenderFn, Route, Server, ServerConfig};
use livetree_state::TreePath;
use serde_json::json;

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn counter_render() -> RenderFn {
    Arc::new(|ctx| {
        let n = ctx
            .global()
            .at("n")
            .get()
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        format!("<p>n {n}</p>")
    })
}

fn content_frames(transport: &BufferTransport) -> Vec<String> {
    transport
        .frames()
        .into_iter()
        .map(|f| String::from_utf8(f).expect("utf-8 frame"))
        .filter(|f| f.starts_with("event: content\n"))
        .collect()
}

#[test]
fn rapid_writes_coalesce_into_one_throttled_render() {
    let server = Server::new(ServerConfig {
        min_render_interval: Duration::from_millis(300),
        ..ServerConfig::default()
    });
    server.add_route(Route::new("home", counter_render()));

    let transport = BufferTransport::new();
    server
        .open_connection(
            "s",
            "t1",
            "home",
            BTreeMap::new(),
            Box::new(transport.clone()),
            false,
        )
        .unwrap();
    wait_until("initial render", || {
        content_frames(&transport).iter().any(|f| f.contains("n 0"))
    });

    // Ten commits well inside one interval.
    for i in 1..=10 {
        server
            .store()
            .write(&TreePath::parse("global/n").unwrap(), json!(i));
    }
    wait_until("coalesced render", || {
        content_frames(&transport).iter().any(|f| f.contains("n 10"))
    });
    std::thread::sleep(Duration::from_millis(400));

    let frames = content_frames(&transport);
    assert_eq!(
        frames.len(),
        2,
        "burst must collapse to one render: {frames:?}"
    );
    assert!(frames[1].contains("n 10"), "final render reflects final state");
}

#[test]
fn spaced_writes_each_render() {
    let server = Server::new(ServerConfig {
        min_render_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    });
    server.add_route(Route::new("home", counter_render()));

    let transport = BufferTransport::new();
    server
        .open_connection(
            "s",
            "t1",
            "home",
            BTreeMap::new(),
            Box::new(transport.clone()),
            false,
        )
        .unwrap();
    wait_until("initial render", || !content_frames(&transport).is_empty());

    for i in 1..=3 {
        server
            .store()
            .write(&TreePath::parse("global/n").unwrap(), json!(i));
        wait_until("spaced render", || {
            content_frames(&transport)
                .iter()
                .any(|f| f.contains(&format!("n {i}")))
        });
        std::thread::sleep(Duration::from_millis(60));
    }
    assert_eq!(content_frames(&transport).len(), 4);
}

#[test]
fn compressed_transcript_is_one_valid_stream() {
    let server = Server::new(ServerConfig {
        min_render_interval: Duration::ZERO,
        ..ServerConfig::default()
    });
    server.add_route(Route::new("home", counter_render()));

    let transport = BufferTransport::new();
    server
        .open_connection(
            "s",
            "t1",
            "home",
            BTreeMap::new(),
            Box::new(transport.clone()),
            true,
        )
        .unwrap();
    // Compressed bytes for connected + initial render.
    wait_until("initial compressed output", || transport.frames().len() >= 2);

    let before = transport.bytes().len();
    server
        .store()
        .write(&TreePath::parse("global/n").unwrap(), json!(7));
    wait_until("compressed push", || transport.bytes().len() > before);

    // Closing finishes the stream; only then is the transcript complete.
    server.close_connection("t1");

    let mut plain = Vec::new();
    ZlibDecoder::new(transport.bytes().as_slice())
        .read_to_end(&mut plain)
        .expect("concatenated wire bytes form one zlib stream");
    let text = String::from_utf8(plain).expect("utf-8 transcript");

    assert!(text.starts_with("event: connected\n"), "got: {text}");
    assert!(text.contains("n 0"), "initial render in transcript");
    assert!(text.contains("n 7"), "post-write render in transcript");
    assert!(text.ends_with("\n\n"), "transcript ends on a frame boundary");
}

#[test]
fn uncompressed_frames_are_plain_text() {
    let server = Server::new(ServerConfig {
        min_render_interval: Duration::ZERO,
        ..ServerConfig::default()
    });
    server.add_route(Route::new("home", counter_render()));

    let transport = BufferTransport::new();
    server
        .open_connection(
            "s",
            "t1",
            "home",
            BTreeMap::new(),
            Box::new(transport.clone()),
            false,
        )
        .unwrap();
    wait_until("frames", || transport.frames().len() >= 2);
    for frame in transport.frames() {
        let text = String::from_utf8(frame).expect("plain frame");
        assert!(text.starts_with("event: "));
        assert!(text.ends_with("\n\n"));
    }
}
