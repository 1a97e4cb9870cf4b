// ABOUTME: Shared utility functions for Reprobox
// ABOUTME: ID generation and bounded log preview buffers

use crate::constants::TRUNCATION_MARKER;

/// Generate a globally unique identifier (UUID v4)
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character
pub fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Keeps the head of a stream up to a byte limit.
///
/// The rendered preview is always a prefix of the stream. When the stream
/// was longer than the limit the prefix is shortened to make room for
/// [`TRUNCATION_MARKER`], so the rendered text never exceeds the limit.
#[derive(Debug, Clone)]
pub struct PreviewBuffer {
    limit: usize,
    buf: Vec<u8>,
    total_bytes: u64,
}

impl PreviewBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total_bytes += data.len() as u64;
        // One extra byte tells us the stream overflowed
        let room = (self.limit + 1).saturating_sub(self.buf.len());
        if room > 0 {
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_truncated(&self) -> bool {
        self.total_bytes > self.limit as u64
    }

    pub fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.buf);
        if !self.is_truncated() && text.len() <= self.limit {
            return text.into_owned();
        }
        let budget = self.limit.saturating_sub(TRUNCATION_MARKER.len());
        let mut out = truncate_at_char_boundary(&text, budget).to_string();
        out.push_str(TRUNCATION_MARKER);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_is_unique_uuid() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_preview_under_limit_is_verbatim() {
        let mut preview = PreviewBuffer::new(64);
        preview.push(b"hello ");
        preview.push(b"world");
        assert!(!preview.is_truncated());
        assert_eq!(preview.render(), "hello world");
    }

    #[test]
    fn test_preview_over_limit_is_prefix_plus_marker() {
        let mut preview = PreviewBuffer::new(40);
        for _ in 0..100 {
            preview.push(b"abcdefghij");
        }
        let rendered = preview.render();
        assert!(preview.is_truncated());
        assert_eq!(preview.total_bytes(), 1000);
        assert!(rendered.len() <= 40);
        assert!(rendered.ends_with(TRUNCATION_MARKER));
        let body = rendered.trim_end_matches(TRUNCATION_MARKER);
        assert!("abcdefghij".repeat(100).starts_with(body));
    }

    #[test]
    fn test_preview_exactly_at_limit_is_not_truncated() {
        let mut preview = PreviewBuffer::new(5);
        preview.push(b"12345");
        assert!(!preview.is_truncated());
        assert_eq!(preview.render(), "12345");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "aé€";
        assert_eq!(truncate_at_char_boundary(s, 2), "a");
        assert_eq!(truncate_at_char_boundary(s, 3), "aé");
        assert_eq!(truncate_at_char_boundary(s, 100), s);
    }
}
