//! Parser for the daemon's NDJSON build-progress stream.
//!
//! `/build` responses are newline-delimited JSON objects. Lines with a
//! `stream` key carry build output; `errorDetail` (or a bare `error`) is
//! fatal regardless of earlier progress; `aux.ID` carries the image id.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// Human-readable build output (trailing newline stripped).
    Progress(String),
    /// Image id from an `aux` record.
    ImageId(String),
    /// Fatal build error message.
    Error(String),
}

#[derive(Default)]
pub struct BuildProgressParser {
    buf: Vec<u8>,
}

impl BuildProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed response body bytes; returns events for every complete line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<BuildEvent> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parse any trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Vec<BuildEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buf);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<BuildEvent> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        // A non-JSON line in the stream is surfaced as progress rather
        // than dropped; the daemon should not produce these.
        Err(_) => return Some(BuildEvent::Progress(text.to_string())),
    };

    if let Some(detail) = value.get("errorDetail") {
        let message = detail
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| value.get("error").and_then(|e| e.as_str()))
            .unwrap_or("unknown build error");
        return Some(BuildEvent::Error(message.to_string()));
    }
    if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
        return Some(BuildEvent::Error(error.to_string()));
    }
    if let Some(id) = value
        .get("aux")
        .and_then(|aux| aux.get("ID"))
        .and_then(|id| id.as_str())
    {
        return Some(BuildEvent::ImageId(id.to_string()));
    }
    if let Some(stream) = value.get("stream").and_then(|s| s.as_str()) {
        let trimmed = stream.trim_end_matches('\n');
        if trimmed.is_empty() {
            return None;
        }
        return Some(BuildEvent::Progress(trimmed.to_string()));
    }
    // Status records (pull progress etc.) are uninteresting here.
    None
}

/// Extract an image id from a `Successfully built <id>` progress line
/// (pre-BuildKit daemons do not emit `aux` records).
pub fn image_id_from_progress(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix("Successfully built ")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_lines_become_progress() {
        let mut parser = BuildProgressParser::new();
        let events =
            parser.feed(b"{\"stream\":\"Step 1/4 : FROM node:20\\n\"}\n{\"stream\":\" ---> abc\\n\"}\n");
        assert_eq!(
            events,
            vec![
                BuildEvent::Progress("Step 1/4 : FROM node:20".to_string()),
                BuildEvent::Progress(" ---> abc".to_string()),
            ]
        );
    }

    #[test]
    fn test_error_detail_is_fatal_even_after_progress() {
        let mut parser = BuildProgressParser::new();
        let events = parser.feed(
            b"{\"stream\":\"Step 1/4 : FROM node:20\\n\"}\n{\"errorDetail\":{\"message\":\"unknown instruction: FRMO\"},\"error\":\"unknown instruction: FRMO\"}\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            BuildEvent::Error("unknown instruction: FRMO".to_string())
        );
    }

    #[test]
    fn test_aux_record_carries_image_id() {
        let mut parser = BuildProgressParser::new();
        let events = parser.feed(b"{\"aux\":{\"ID\":\"sha256:deadbeef\"}}\n");
        assert_eq!(events, vec![BuildEvent::ImageId("sha256:deadbeef".to_string())]);
    }

    #[test]
    fn test_line_split_across_feeds() {
        let mut parser = BuildProgressParser::new();
        assert!(parser.feed(b"{\"stream\":\"par").is_empty());
        let events = parser.feed(b"tial\\n\"}\n");
        assert_eq!(events, vec![BuildEvent::Progress("partial".to_string())]);
    }

    #[test]
    fn test_finish_parses_unterminated_line() {
        let mut parser = BuildProgressParser::new();
        assert!(parser.feed(b"{\"stream\":\"no newline\"}").is_empty());
        let events = parser.finish();
        assert_eq!(events, vec![BuildEvent::Progress("no newline".to_string())]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_whitespace_only_stream_is_skipped() {
        let mut parser = BuildProgressParser::new();
        assert!(parser.feed(b"{\"stream\":\"\\n\"}\n").is_empty());
    }

    #[test]
    fn test_status_records_ignored() {
        let mut parser = BuildProgressParser::new();
        assert!(parser
            .feed(b"{\"status\":\"Pulling from library/node\",\"id\":\"20\"}\n")
            .is_empty());
    }

    #[test]
    fn test_successfully_built_marker() {
        assert_eq!(
            image_id_from_progress("Successfully built 1a2b3c4d5e6f"),
            Some("1a2b3c4d5e6f".to_string())
        );
        assert_eq!(image_id_from_progress("Successfully tagged x:1"), None);
        assert_eq!(image_id_from_progress("Successfully built "), None);
    }

    #[test]
    fn test_bare_error_key() {
        let mut parser = BuildProgressParser::new();
        let events = parser.feed(b"{\"error\":\"daemon exploded\"}\n");
        assert_eq!(events, vec![BuildEvent::Error("daemon exploded".to_string())]);
    }
}
