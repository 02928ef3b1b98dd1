//! Fake daemon for protocol and runner tests: a unix socket server that
//! answers each accepted connection with the next canned response.

use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

/// Spawn a fake daemon; the returned tempdir owns the socket's lifetime.
pub async fn fake_daemon(responses: Vec<Vec<u8>>) -> (PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    tokio::spawn(async move {
        for response in responses {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            // Drain the request head (and any body bytes sent with it).
            let mut seen = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        seen.extend_from_slice(&chunk[..n]);
                        if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    (socket, dir)
}

/// A fixed-length HTTP response.
pub fn response(status: &str, headers: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Length: {}\r\n\r\n{}",
        status,
        headers,
        body.len(),
        body
    )
    .into_bytes()
}

/// A chunked NDJSON response (build progress).
pub fn chunked_ndjson_response(ndjson: &str) -> Vec<u8> {
    let mut raw =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: application/json\r\n\r\n"
            .to_vec();
    raw.extend_from_slice(format!("{:x}\r\n", ndjson.len()).as_bytes());
    raw.extend_from_slice(ndjson.as_bytes());
    raw.extend_from_slice(b"\r\n0\r\n\r\n");
    raw
}

/// A 101 upgrade response followed by raw multiplexed frames.
pub fn exec_upgrade_response(frames: &[(u8, &[u8])]) -> Vec<u8> {
    let mut raw =
        b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n".to_vec();
    for (stream_type, payload) in frames {
        raw.push(*stream_type);
        raw.extend_from_slice(&[0, 0, 0]);
        raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        raw.extend_from_slice(payload);
    }
    raw
}
