//! Framing over real TCP sockets.
//!
//! Covers the handshake, split payloads, header rejection and the
//! error-frame-then-close behaviour of protocol violations.

use bytes::Bytes;
use fisk_protocol::{
    BuilderHeaders, Connection, ConnectionError, ConnectionState, ErrorCode, Handshake, Inbound,
    JobStart, Role,
};
use tokio::net::TcpListener;

async fn listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_builder_handshake_over_tcp() {
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::accept(stream);
        let handshake = conn.accept_handshake().await.unwrap();
        BuilderHeaders::parse(&handshake.headers).unwrap()
    });

    let headers = BuilderHeaders {
        slots: 4,
        port: 8097,
        environments: vec!["abc123".into()],
        name: Some("b1".into()),
        hostname: None,
        system: Some("Linux x86_64".into()),
        cache_port: None,
    };
    let mut conn = Connection::connect(addr, headers.to_handshake()).await.unwrap();
    let parsed = server.await.unwrap();
    conn.close().await;

    assert_eq!(parsed, headers);
}

#[tokio::test]
async fn test_invalid_headers_get_error_frame() {
    let (listener, addr) = listener().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::accept(stream);
        let handshake = conn.accept_handshake().await.unwrap();
        if let Err(error) = BuilderHeaders::parse(&handshake.headers) {
            conn.fail(&error).await;
        }
    });

    let mut conn = Connection::connect(addr, Handshake::new(Role::Builder).header("port", "1"))
        .await
        .unwrap();

    match conn.recv().await {
        Some(Err(ConnectionError::Remote(error))) => {
            assert_eq!(error.code, ErrorCode::MissingHeader);
        }
        other => panic!("expected error frame, got ok={:?}", other.map(|r| r.is_ok())),
    }
    assert!(conn.recv().await.is_none());
}

// =============================================================================
// Payloads
// =============================================================================

#[tokio::test]
async fn test_job_start_with_split_source() {
    let (listener, addr) = listener().await;
    let source: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = source.clone();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::accept(stream);
        conn.accept_handshake().await.unwrap();
        let start: JobStart = fisk_protocol::message::decode(conn.recv_message().await.unwrap())
            .unwrap();
        let body = conn.recv_payload(start.bytes).await.unwrap();
        (start, body)
    });

    let mut conn = Connection::connect(addr, Handshake::new(Role::Job).header("environment", "e"))
        .await
        .unwrap();
    let tx = conn.sender();
    tx.send_json(&JobStart {
        command_line: vec!["-c".into(), "main.c".into()],
        argv0: "gcc".into(),
        bytes: source.len() as u64,
        wait: false,
    })
    .await
    .unwrap();
    for chunk in source.chunks(7_777) {
        tx.send_binary(Bytes::copy_from_slice(chunk)).await.unwrap();
    }

    let (start, body) = server.await.unwrap();
    conn.close().await;

    assert_eq!(start.argv0, "gcc");
    assert_eq!(body, expected);
}

#[tokio::test]
async fn test_json_inside_payload_is_violation() {
    let (listener, addr) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::accept(stream);
        conn.accept_handshake().await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = conn.recv().await {
            let failed = event.is_err();
            events.push(event.map(|inbound| matches!(inbound, Inbound::Data { .. })));
            if failed {
                break;
            }
        }
        (events.len(), conn.state())
    });

    let mut conn = Connection::connect(addr, Handshake::new(Role::Job)).await.unwrap();
    let tx = conn.sender();
    tx.send_json(&serde_json::json!({"type": "upload", "bytes": 10}))
        .await
        .unwrap();
    tx.send_binary(Bytes::from_static(b"12345")).await.unwrap();
    tx.send_json(&serde_json::json!({"type": "heartbeat"}))
        .await
        .unwrap();

    let (count, state) = server.await.unwrap();
    assert_eq!(count, 3);
    assert_eq!(state, ConnectionState::Errored);

    match conn.recv().await {
        Some(Err(ConnectionError::Remote(error))) => {
            assert_eq!(error.code, ErrorCode::ProtocolViolation)
        }
        other => panic!("expected violation, got ok={:?}", other.map(|r| r.is_ok())),
    }
}
