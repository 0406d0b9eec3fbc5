//! Incremental Server-Sent-Events framing.
//!
//! Bytes arrive in arbitrary pieces; an event is complete at a blank line.
//! Only `data:` lines matter to the decoders; multi-line data is joined with
//! `\n`.

#[derive(Debug, Default)]
pub struct SseFramer {
    pending: Vec<u8>,
    data_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    /// The OpenAI-style `[DONE]` sentinel.
    Done,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line_bytes = self.pending.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&line_bytes);
            let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
            if trimmed.is_empty() {
                if let Some(frame) = self.take_event() {
                    frames.push(frame);
                }
                continue;
            }
            if let Some(data) = trimmed.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }

        frames
    }

    /// Flushes an event left unterminated when the body ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest);
            if let Some(data) = line.trim_end_matches(&['\r', '\n'][..]).strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        if data.trim() == "[DONE]" {
            Some(SseFrame::Done)
        } else {
            Some(SseFrame::Data(data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_events_split_across_byte_chunks() {
        let mut framer = SseFramer::new();
        let mut frames = Vec::new();
        for piece in [
            &b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel"[..],
            b"lo\"}}]}\n",
            b"\n",
            b"data: [DONE]\n",
            b"\n",
        ] {
            frames.extend(framer.push(piece));
        }

        assert_eq!(
            frames,
            vec![
                SseFrame::Data("{\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}".to_string()),
                SseFrame::Done,
            ]
        );
    }

    #[test]
    fn ignores_event_and_comment_lines_and_handles_crlf() {
        let mut framer = SseFramer::new();
        let frames = framer.push(
            b": keep-alive\r\nevent: message_start\r\ndata: {\"type\":\"ping\"}\r\n\r\n",
        );
        assert_eq!(frames, vec![SseFrame::Data("{\"type\":\"ping\"}".to_string())]);
    }

    #[test]
    fn joins_multi_line_data_and_flushes_unterminated_tail() {
        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: line-1\ndata: line-2\n").is_empty());
        assert_eq!(
            framer.finish(),
            Some(SseFrame::Data("line-1\nline-2".to_string()))
        );

        let mut framer = SseFramer::new();
        assert!(framer.push(b"data: {\"a\":1}").is_empty());
        assert_eq!(framer.finish(), Some(SseFrame::Data("{\"a\":1}".to_string())));
    }

    #[test]
    fn multibyte_characters_split_between_pushes_survive() {
        let text = "data: {\"t\":\"漢\"}\n\n".as_bytes();
        let split = text.iter().position(|byte| *byte >= 0x80).expect("multibyte") + 1;
        let mut framer = SseFramer::new();
        assert!(framer.push(&text[..split]).is_empty());
        assert_eq!(
            framer.push(&text[split..]),
            vec![SseFrame::Data("{\"t\":\"漢\"}".to_string())]
        );
    }
}
