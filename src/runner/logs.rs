//! Log-line ingestion for workspace output.
//!
//! Exec frames arrive at arbitrary byte boundaries; `LineBuffer` holds the
//! trailing incomplete fragment so only complete lines are ever committed
//! to the store. Stdout lines are scanned for provider pull-request URLs.

use std::sync::OnceLock;

use regex::Regex;

/// Retains the last incomplete fragment between feeds; complete lines are
/// returned as they finish.
#[derive(Default)]
pub struct LineBuffer {
    fragment: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every line completed by this feed, with the
    /// newline (and a trailing carriage return, if any) stripped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.fragment.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.fragment.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.fragment.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush the retained fragment as a final line (stream closed without a
    /// trailing newline). Returns `None` when nothing is buffered.
    pub fn flush(&mut self) -> Option<String> {
        if self.fragment.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.fragment);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = match raw.last() {
        Some(b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

fn pr_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://github\.com/[\w.-]+/[\w.-]+/pull/\d+")
            .expect("PR URL regex is valid")
    })
}

/// First provider pull-request URL in a line, if any.
pub fn find_pr_url(line: &str) -> Option<String> {
    pr_url_regex().find(line).map(|m| m.as_str().to_string())
}

/// The numeric PR id at the end of a pull-request URL.
pub fn pr_number_from_url(url: &str) -> Option<i64> {
    url.rsplit('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_split() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"first\nsecond\n");
        assert_eq!(lines, vec!["first", "second"]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_fragment_retained_across_feeds() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"par").is_empty());
        let lines = buffer.push(b"tial line\nnext ");
        assert_eq!(lines, vec!["partial line"]);
        assert_eq!(buffer.flush(), Some("next ".to_string()));
    }

    #[test]
    fn test_crlf_stripped() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"windows line\r\n");
        assert_eq!(lines, vec!["windows line"]);
    }

    #[test]
    fn test_non_utf8_bytes_are_lossy_decoded() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(&[b'o', b'k', 0xFF, b'\n']);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }

    #[test]
    fn test_empty_lines_preserved() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"\n\n");
        assert_eq!(lines, vec!["", ""]);
    }

    #[test]
    fn test_find_pr_url() {
        assert_eq!(
            find_pr_url("Created https://github.com/acme/widget/pull/42 successfully"),
            Some("https://github.com/acme/widget/pull/42".to_string())
        );
        assert_eq!(
            find_pr_url("https://github.com/acme-corp/my.repo/pull/7"),
            Some("https://github.com/acme-corp/my.repo/pull/7".to_string())
        );
        assert!(find_pr_url("no url here").is_none());
        assert!(find_pr_url("https://github.com/acme/widget/issues/42").is_none());
    }

    #[test]
    fn test_pr_number_from_url() {
        assert_eq!(
            pr_number_from_url("https://github.com/acme/widget/pull/42"),
            Some(42)
        );
        assert_eq!(pr_number_from_url("not a url"), None);
    }
}
