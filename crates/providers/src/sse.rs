//! Server-Sent Events parsing for OpenAI-compatible streaming endpoints.
//!
//! Events are separated by a blank line and carry `event:` / `data:` fields.
//! Bytes are buffered until a full event arrives, so multi-byte characters split
//! across network chunks decode correctly.

/// One parsed SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data {
        /// The `event:` field, if present
        event: Option<String>,
        /// `data:` lines joined with `\n`
        data: String,
    },
    /// The `data: [DONE]` sentinel that closes an OpenAI-style stream
    Done,
}

/// Incremental SSE parser
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the HTTP response. Returns any complete events found.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes received but not yet terminated by a blank line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Position and length of the first event separator (`\n\n` or `\r\n\r\n`)
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id:, retry: and `:` comments are ignored
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data.trim() == "[DONE]" {
        return Some(SseFrame::Done);
    }
    Some(SseFrame::Data { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseFrame {
        SseFrame::Data {
            event: None,
            data: s.to_string(),
        }
    }

    #[test]
    fn test_events_and_done() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: hello\n\n: keep-alive\n\ndata: world\n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec![data("hello"), data("world"), SseFrame::Done]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_crlf_and_event_field() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"event: delta\r\ndata: {\"a\":1}\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame::Data {
                event: Some("delta".into()),
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut parser = SseParser::new();
        let bytes = "data: café\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;

        assert!(parser.feed(&bytes[..split]).is_empty());
        assert_eq!(parser.feed(&bytes[split..]), vec![data("café")]);
    }

    #[test]
    fn test_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: one\ndata: two\n\n");
        assert_eq!(frames, vec![data("one\ntwo")]);
    }
}
