//! Builder end-to-end: job connections over TCP, object cache reuse and
//! the object cache HTTP endpoint.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fisk_builder::object_cache::{CacheHeader, CacheState};
use fisk_builder::{compute_digest, handlers, serve_jobs, BuilderConfig, BuilderState};
use fisk_protocol::message::decode;
use fisk_protocol::{
    BuilderReply, Connection, ConnectionError, ErrorCode, JobHeaders, JobResponse, JobStart,
    OutputEntry,
};
use fisk_store::{EnvironmentStore, Prepared};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const ENV: &str = "toolchain1";

// Copies stdin to the `-o` target.
const COMPILER: &str = r#"#!/bin/sh
out=""; prev=""
for a in "$@"; do [ "$prev" = "-o" ] && out="$a"; prev="$a"; done
cat > "$out"
echo compiled"#;

// =============================================================================
// Fixtures
// =============================================================================

struct Builder {
    _dir: tempfile::TempDir,
    state: Arc<BuilderState>,
    addr: std::net::SocketAddr,
    compiler: std::path::PathBuf,
    shutdown: CancellationToken,
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn install_environment(packages: &Path, scratch: &Path) {
    let src = scratch.join("tree");
    fs::create_dir_all(src.join("usr/bin")).unwrap();
    fs::write(src.join("usr/bin/cc"), "placeholder").unwrap();
    let tarball = scratch.join("env.tar.gz");
    let status = Command::new("tar")
        .arg("-czf")
        .arg(&tarball)
        .arg("-C")
        .arg(&src)
        .arg("usr")
        .status()
        .unwrap();
    assert!(status.success());
    let payload = fs::read(&tarball).unwrap();

    let store = EnvironmentStore::load(packages).unwrap();
    let Prepared::Write(mut pending) = store.prepare(ENV, "", payload.len() as u64).unwrap() else {
        panic!("fresh store already had the environment");
    };
    pending.write(&payload).unwrap();
    store.complete(pending).unwrap();
}

async fn start_builder(slots: u32) -> Builder {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BuilderConfig::default();
    config.root = dir.path().join("state");
    config.slots = slots;
    config.heartbeat_interval_ms = 50;
    install_environment(&config.packages_dir(), dir.path());

    let compiler = dir.path().join("cc");
    fs::write(&compiler, COMPILER).unwrap();
    fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755)).unwrap();

    let state = BuilderState::open(config).await.unwrap();
    assert!(state.environments.is_ready(ENV));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve_jobs(Arc::clone(&state), listener, shutdown.clone()));

    Builder {
        _dir: dir,
        state,
        addr,
        compiler,
        shutdown,
    }
}

fn headers(environment: &str) -> JobHeaders {
    JobHeaders {
        environment: environment.into(),
        reservation: Some(7),
        digest: None,
        source_file: Some("main.c".into()),
        name: Some("laptop".into()),
        hostname: None,
        user: None,
    }
}

/// Run one job as a client would and return the response and payload.
async fn submit(builder: &Builder, source: &[u8]) -> (JobResponse, Vec<u8>) {
    let mut conn = Connection::connect(builder.addr, headers(ENV).to_handshake())
        .await
        .unwrap();
    let sender = conn.sender();
    sender
        .send_json(&JobStart {
            command_line: vec!["-c".into(), "main.c".into(), "-o".into(), "main.o".into()],
            argv0: builder.compiler.to_string_lossy().into_owned(),
            bytes: source.len() as u64,
            wait: true,
        })
        .await
        .unwrap();

    let reply: BuilderReply = decode(conn.recv_message().await.unwrap()).unwrap();
    assert_eq!(reply, BuilderReply::Resume);
    sender.send_binary(Bytes::copy_from_slice(source)).await.unwrap();

    loop {
        match decode::<BuilderReply>(conn.recv_message().await.unwrap()).unwrap() {
            BuilderReply::Heartbeat => continue,
            BuilderReply::Response(response) => {
                let payload = conn.recv_payload(response.bytes).await.unwrap();
                return (response, payload);
            }
            BuilderReply::Resume => panic!("second resume"),
        }
    }
}

async fn wait_cached(builder: &Builder, digest: &str) {
    for _ in 0..200 {
        if let Some(cache) = builder.state.cache() {
            if cache.state(digest) == CacheState::Exists {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached the object cache", digest);
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header block");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    (head, raw[split + 4..].to_vec())
}

// =============================================================================
// Jobs
// =============================================================================

#[tokio::test]
async fn test_job_compiles_and_returns_outputs() {
    let builder = start_builder(2).await;

    let (response, payload) = submit(&builder, b"int main;").await;
    assert!(response.success, "stderr: {}", response.stderr);
    assert_eq!(response.exit_code, 0);
    assert_eq!(response.stdout.trim(), "compiled");
    assert_eq!(response.index.len(), 1);
    assert_eq!(response.index[0].path, "main.o");
    assert_eq!(payload, b"int main;");
    assert_eq!(builder.state.queue.running(), 0);
}

#[tokio::test]
async fn test_cached_response_announces_its_payload() {
    let builder = start_builder(1).await;
    let source = b"int cached;";
    let compiler = builder.compiler.to_string_lossy().into_owned();
    let command_line: Vec<String> = vec!["-c".into(), "main.c".into(), "-o".into(), "main.o".into()];
    let digest = compute_digest(ENV, &compiler, &command_line, source);

    // An entry written without a byte count.
    let mut response = JobResponse::new(
        vec![OutputEntry {
            path: "main.o".into(),
            bytes: 6,
        }],
        0,
        digest.clone(),
        String::new(),
        String::new(),
    );
    response.bytes = 0;
    builder
        .state
        .cache()
        .unwrap()
        .add(&CacheHeader::new(response, Some("main.c".into())), b"object")
        .unwrap();

    let (response, payload) = submit(&builder, source).await;
    assert_eq!(response.digest, digest);
    assert_eq!(response.bytes, 6);
    assert_eq!(payload, b"object");
    assert_eq!(builder.state.cache().unwrap().hits(), 1);
}

#[tokio::test]
async fn test_repeat_job_is_served_from_cache() {
    let builder = start_builder(1).await;

    let (first, _) = submit(&builder, b"int cached;").await;
    assert!(first.success);
    wait_cached(&builder, &first.digest).await;

    // Without a compiler only the cache can answer.
    fs::remove_file(&builder.compiler).unwrap();
    let (second, payload) = submit(&builder, b"int cached;").await;
    assert!(second.success);
    assert_eq!(second.digest, first.digest);
    assert_eq!(payload, b"int cached;");

    let info = builder.state.cache().unwrap().info(Default::default());
    assert_eq!(info.hits, 1);
    assert_eq!(info.count, 1);
}

#[tokio::test]
async fn test_missing_compiler_reports_abnormal_exit() {
    let builder = start_builder(1).await;
    fs::remove_file(&builder.compiler).unwrap();

    let (response, payload) = submit(&builder, b"int x;").await;
    assert!(!response.success);
    assert_eq!(response.exit_code, fisk_compiler::ABNORMAL_EXIT_CODE);
    assert!(response.error.is_some());
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_unknown_environment_is_refused() {
    let builder = start_builder(1).await;

    let mut conn = Connection::connect(builder.addr, headers("nosuchenv").to_handshake())
        .await
        .unwrap();
    conn.sender()
        .send_json(&JobStart {
            command_line: vec!["-c".into(), "a.c".into()],
            argv0: "gcc".into(),
            bytes: 1,
            wait: true,
        })
        .await
        .unwrap();

    match conn.recv_message().await {
        Err(ConnectionError::Remote(error)) => {
            assert_eq!(error.code, ErrorCode::EnvironmentMissing)
        }
        other => panic!("expected an error frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_disconnect_while_queued_withdraws() {
    let builder = start_builder(1).await;
    let slot = builder.state.queue.acquire(9999).await.unwrap();

    let mut conn = Connection::connect(builder.addr, headers(ENV).to_handshake())
        .await
        .unwrap();
    conn.sender()
        .send_json(&JobStart {
            command_line: vec!["-c".into(), "main.c".into(), "-o".into(), "main.o".into()],
            argv0: builder.compiler.to_string_lossy().into_owned(),
            bytes: 3,
            wait: true,
        })
        .await
        .unwrap();

    for _ in 0..200 {
        if builder.state.queue.waiting() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(builder.state.queue.waiting(), 1);

    conn.close().await;
    drop(conn);
    for _ in 0..200 {
        if builder.state.queue.waiting() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(builder.state.queue.waiting(), 0);
    assert_eq!(builder.state.queue.running(), 1);

    slot.release();
    assert_eq!(builder.state.queue.running(), 0);
}

// =============================================================================
// Object cache endpoint
// =============================================================================

#[tokio::test]
async fn test_http_serves_cached_objects() {
    let builder = start_builder(1).await;
    let (response, _) = submit(&builder, b"int served;").await;
    wait_cached(&builder, &response.digest).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = listener.local_addr().unwrap();
    tokio::spawn(handlers::objectcache::serve(
        Arc::clone(&builder.state),
        listener,
        builder.shutdown.clone(),
    ));

    let (head, body) = http_get(http, &format!("/objectcache/{}", response.digest)).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    let expected = builder
        .state
        .cache()
        .unwrap()
        .get(&response.digest)
        .unwrap()
        .file_size;
    assert!(head
        .to_ascii_lowercase()
        .contains(&format!("content-length: {}", expected)));
    assert_eq!(body.len() as u64, expected);
    assert!(body.ends_with(b"int served;"));

    let (head, body) = http_get(http, "/objectcache/info?objects=true").await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["count"], 1);
    assert_eq!(info["objects"][0]["digest"], response.digest.as_str());

    let (head, _) = http_get(http, "/objectcache/0000missing").await;
    assert!(head.starts_with("HTTP/1.1 404"), "{}", head);

    let (head, _) = http_get(http, "/objectcache/bad.digest").await;
    assert!(head.starts_with("HTTP/1.1 400"), "{}", head);
}
