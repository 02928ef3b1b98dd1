//! Decoder for the daemon's multiplexed attach/exec stream.
//!
//! Frame format: `[type:1][reserved:3][size:4 big-endian][payload:size]`,
//! repeated. Type byte 1 is stdout, 2 is stderr; anything else is treated
//! as stdout. Frames arrive split across arbitrary read boundaries, so the
//! decoder keeps its own byte buffer between feeds.

use crate::db::models::LogStream;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream: LogStream,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the socket; returns every frame completed by
    /// this read. Incomplete trailing bytes stay buffered.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let size = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + size {
                break;
            }
            let stream = stream_for_type(self.buf[0]);
            let payload = self.buf[HEADER_LEN..HEADER_LEN + size].to_vec();
            self.buf.drain(..HEADER_LEN + size);
            frames.push(Frame { stream, payload });
        }
        frames
    }

    /// Flush whatever remains after the stream closed mid-frame. A short
    /// read with a complete header goes to that header's stream; bytes
    /// shorter than a header go to stdout as the best guess.
    pub fn finish(mut self) -> Option<Frame> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() >= HEADER_LEN {
            let stream = stream_for_type(self.buf[0]);
            let payload = self.buf.split_off(HEADER_LEN);
            if payload.is_empty() {
                return None;
            }
            return Some(Frame { stream, payload });
        }
        Some(Frame {
            stream: LogStream::Stdout,
            payload: std::mem::take(&mut self.buf),
        })
    }
}

fn stream_for_type(byte: u8) -> LogStream {
    match byte {
        2 => LogStream::Stderr,
        _ => LogStream::Stdout,
    }
}
