//! Minimal SSE framing over a raw byte stream: folds `data:` lines into
//! complete event payloads. Comments, ids, and event names are ignored;
//! the server puts everything in the data payload.
//!
//! Chunks are buffered as bytes and only decoded once a full line is
//! available, so a multi-byte codepoint split across chunk boundaries
//! comes through intact.

pub(crate) struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Vec::new(),
            data_lines: Vec::new(),
        }
    }

    /// Feed a chunk; returns every event payload completed by it.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_event_split_across_chunks() {
        let mut acc = SseAccumulator::new();
        assert!(acc.push(b"data: {\"ty").is_empty());
        assert!(acc.push(b"pe\":\"x\"}\n").is_empty());
        let events = acc.push(b"\n");
        assert_eq!(events, vec!["{\"type\":\"x\"}".to_string()]);
    }

    #[test]
    fn handles_crlf_and_multiple_events() {
        let mut acc = SseAccumulator::new();
        let events = acc.push(b"data: one\r\n\r\ndata: two\n\n");
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn ignores_comments_and_ids() {
        let mut acc = SseAccumulator::new();
        let events = acc.push(b": keep-alive\nid: 7\ndata: payload\n\n");
        assert_eq!(events, vec!["payload".to_string()]);
    }

    #[test]
    fn multibyte_codepoint_split_across_chunks_survives() {
        let mut acc = SseAccumulator::new();
        let payload = "data: h\u{e9}llo\n\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let (head, tail) = payload.split_at(8);
        assert!(acc.push(head).is_empty());
        let events = acc.push(tail);
        assert_eq!(events, vec!["h\u{e9}llo".to_string()]);
    }
}
