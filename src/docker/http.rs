//! HTTP/1.1 plumbing for the daemon's local socket.
//!
//! The daemon speaks plain HTTP over a unix stream socket. Requests are
//! written by hand; responses are parsed with explicit byte buffers so the
//! exec path never round-trips binary payloads through strings. Three body
//! framings appear in practice: `Content-Length`, `Transfer-Encoding:
//! chunked` (build progress), and raw-until-EOF (upgraded exec streams).

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::errors::DaemonError;

/// Deadline for unary requests.
pub const UNARY_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-read deadline for streaming requests (build progress, exec frames).
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct HttpHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a response head out of `buf`. Returns the head and the number of
/// bytes it consumed, or `None` when the terminating blank line has not
/// arrived yet.
pub fn parse_head(buf: &[u8]) -> Result<Option<(HttpHead, usize)>, String> {
    let end = match find_head_end(buf) {
        Some(end) => end,
        None => return Ok(None),
    };
    let text = std::str::from_utf8(&buf[..end]).map_err(|_| "non-UTF-8 response head")?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or("empty response head")?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(format!("unexpected HTTP version: {}", version));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or("missing status code")?;
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line: {}", line))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Some((HttpHead { status, headers }, end + 4)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyFraming {
    ContentLength(usize),
    Chunked,
    Eof,
}

pub fn body_framing(head: &HttpHead) -> BodyFraming {
    if head
        .header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return BodyFraming::Chunked;
    }
    if let Some(len) = head
        .header("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        return BodyFraming::ContentLength(len);
    }
    BodyFraming::Eof
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
pub struct ChunkDecoder {
    state: ChunkState,
}

enum ChunkState {
    Size(Vec<u8>),
    Data(usize),
    DataCrlf(usize),
    Trailer(Vec<u8>),
    Done,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size(Vec::new()),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Feed raw bytes; decoded payload bytes are appended to `out`.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<(), String> {
        while !input.is_empty() {
            match &mut self.state {
                ChunkState::Size(line) => {
                    let pos = input.iter().position(|&b| b == b'\n');
                    match pos {
                        Some(pos) => {
                            line.extend_from_slice(&input[..pos]);
                            input = &input[pos + 1..];
                            let text = std::str::from_utf8(line)
                                .map_err(|_| "non-UTF-8 chunk size line")?
                                .trim_end_matches('\r');
                            let size_text = text.split(';').next().unwrap_or("").trim();
                            let size = usize::from_str_radix(size_text, 16)
                                .map_err(|_| format!("bad chunk size: {:?}", size_text))?;
                            self.state = if size == 0 {
                                ChunkState::Trailer(Vec::new())
                            } else {
                                ChunkState::Data(size)
                            };
                        }
                        None => {
                            line.extend_from_slice(input);
                            return Ok(());
                        }
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = (*remaining).min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCrlf(2);
                    }
                }
                ChunkState::DataCrlf(remaining) => {
                    let take = (*remaining).min(input.len());
                    input = &input[take..];
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = ChunkState::Size(Vec::new());
                    }
                }
                ChunkState::Trailer(seen) => {
                    // The trailer section ends at the first blank line.
                    let mut consumed = 0;
                    let mut done = false;
                    for &b in input.iter() {
                        consumed += 1;
                        seen.push(b);
                        if seen.ends_with(b"\r\n\r\n")
                            || (seen.len() == 2 && seen.ends_with(b"\r\n"))
                        {
                            done = true;
                            break;
                        }
                    }
                    input = &input[consumed..];
                    if done {
                        self.state = ChunkState::Done;
                    } else {
                        return Ok(());
                    }
                }
                ChunkState::Done => return Ok(()),
            }
        }
        Ok(())
    }
}

/// One request/response exchange over the daemon socket.
///
/// The daemon closes or upgrades connections per request, so a fresh
/// connection is opened for each operation.
pub struct DaemonConnection {
    stream: UnixStream,
    path: String,
    buf: Vec<u8>,
}

impl DaemonConnection {
    pub async fn open(socket: &Path, request_path: &str) -> Result<Self, DaemonError> {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|e| DaemonError::transport(request_path, e))?;
        Ok(Self {
            stream,
            path: request_path.to_string(),
            buf: Vec::new(),
        })
    }

    /// Write a request with an optional fixed-length body.
    pub async fn send_request(
        &mut self,
        method: &str,
        extra_headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<(), DaemonError> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, self.path);
        for (name, value) in extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n", body.map_or(0, |b| b.len())));
        head.push_str("\r\n");

        self.stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        if let Some(body) = body {
            self.stream
                .write_all(body)
                .await
                .map_err(|e| DaemonError::transport(&self.path, e))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        Ok(())
    }

    /// Write a request whose body uses chunked transfer-encoding. The whole
    /// payload is sent as one chunk plus the zero-length terminator.
    pub async fn send_chunked_request(
        &mut self,
        method: &str,
        extra_headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<(), DaemonError> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n",
            method, self.path
        );
        for (name, value) in extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        let mut payload = head.into_bytes();
        payload.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        payload.extend_from_slice(body);
        payload.extend_from_slice(b"\r\n0\r\n\r\n");

        self.stream
            .write_all(&payload)
            .await
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        Ok(())
    }

    /// Read until the response head is complete. Leftover body bytes stay
    /// buffered for the body readers.
    pub async fn read_head(&mut self, per_read: Duration) -> Result<HttpHead, DaemonError> {
        loop {
            if let Some((head, consumed)) =
                parse_head(&self.buf).map_err(|m| DaemonError::protocol(&self.path, m))?
            {
                self.buf.drain(..consumed);
                return Ok(head);
            }
            let n = self.read_some(per_read).await?;
            if n == 0 {
                return Err(DaemonError::protocol(
                    &self.path,
                    "connection closed before response head",
                ));
            }
        }
    }

    /// Read the entire response body according to its framing.
    pub async fn read_body(
        &mut self,
        head: &HttpHead,
        per_read: Duration,
    ) -> Result<Vec<u8>, DaemonError> {
        match body_framing(head) {
            BodyFraming::ContentLength(len) => {
                while self.buf.len() < len {
                    let n = self.read_some(per_read).await?;
                    if n == 0 {
                        return Err(DaemonError::protocol(
                            &self.path,
                            "connection closed mid-body",
                        ));
                    }
                }
                let body: Vec<u8> = self.buf.drain(..len).collect();
                Ok(body)
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkDecoder::new();
                let mut out = Vec::new();
                loop {
                    let pending: Vec<u8> = self.buf.drain(..).collect();
                    decoder
                        .feed(&pending, &mut out)
                        .map_err(|m| DaemonError::protocol(&self.path, m))?;
                    if decoder.is_done() {
                        return Ok(out);
                    }
                    let n = self.read_some(per_read).await?;
                    if n == 0 {
                        return Ok(out);
                    }
                }
            }
            BodyFraming::Eof => {
                loop {
                    let n = self.read_some(per_read).await?;
                    if n == 0 {
                        break;
                    }
                }
                Ok(std::mem::take(&mut self.buf))
            }
        }
    }

    /// Stream a chunked body into `sink` as decoded bytes arrive, rather
    /// than accumulating it (used for build progress).
    pub async fn stream_body(
        &mut self,
        head: &HttpHead,
        per_read: Duration,
        sink: &mut (dyn FnMut(&[u8]) + Send),
    ) -> Result<(), DaemonError> {
        match body_framing(head) {
            BodyFraming::Chunked => {
                let mut decoder = ChunkDecoder::new();
                loop {
                    let pending: Vec<u8> = self.buf.drain(..).collect();
                    let mut decoded = Vec::new();
                    decoder
                        .feed(&pending, &mut decoded)
                        .map_err(|m| DaemonError::protocol(&self.path, m))?;
                    if !decoded.is_empty() {
                        sink(&decoded);
                    }
                    if decoder.is_done() {
                        return Ok(());
                    }
                    let n = self.read_some(per_read).await?;
                    if n == 0 {
                        return Ok(());
                    }
                }
            }
            _ => {
                // Content-Length and EOF-delimited bodies stream as-is.
                loop {
                    if !self.buf.is_empty() {
                        let pending: Vec<u8> = self.buf.drain(..).collect();
                        sink(&pending);
                    }
                    let n = self.read_some(per_read).await?;
                    if n == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Read raw bytes after a connection upgrade (exec streams). Returns 0
    /// at EOF. Buffered bytes left over from head parsing drain first.
    pub async fn read_upgraded(
        &mut self,
        out: &mut Vec<u8>,
        per_read: Duration,
    ) -> Result<usize, DaemonError> {
        if !self.buf.is_empty() {
            let n = self.buf.len();
            out.extend_from_slice(&self.buf);
            self.buf.clear();
            return Ok(n);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = tokio::time::timeout(per_read, self.stream.read(&mut chunk))
            .await
            .map_err(|_| DaemonError::Timeout {
                path: self.path.clone(),
                seconds: per_read.as_secs(),
            })?
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        out.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_some(&mut self, per_read: Duration) -> Result<usize, DaemonError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = tokio::time::timeout(per_read, self.stream.read(&mut chunk))
            .await
            .map_err(|_| DaemonError::Timeout {
                path: self.path.clone(),
                seconds: per_read.as_secs(),
            })?
            .map_err(|e| DaemonError::transport(&self.path, e))?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// Decode an error body from the daemon (JSON `{"message": ...}`) into a
/// `DaemonError::Api`.
pub fn api_error(path: &str, status: u16, body: &[u8]) -> DaemonError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    DaemonError::Api {
        status,
        path: path.to_string(),
        message,
    }
}
