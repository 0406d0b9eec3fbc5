//! Splits a text channel that inlines reasoning between textual markers
//! (`<think>...</think>`) into thinking and answer deltas.
//!
//! One parser belongs to one live stream. Markers may straddle fragment
//! boundaries, so a trailing marker prefix is held back until the next
//! fragment decides it.

pub const DEFAULT_THINK_START: &str = "<think>";
pub const DEFAULT_THINK_END: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Outside,
    InsideThinking,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDelta {
    pub thinking_delta: Option<String>,
    pub text_content_delta: Option<String>,
}

impl ParsedDelta {
    pub fn is_empty(&self) -> bool {
        self.thinking_delta.is_none() && self.text_content_delta.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct TagParser {
    start_marker: String,
    end_marker: String,
    state: TagState,
    buffer: String,
}

impl Default for TagParser {
    fn default() -> Self {
        Self::new(DEFAULT_THINK_START, DEFAULT_THINK_END)
    }
}

impl TagParser {
    pub fn new(start_marker: impl Into<String>, end_marker: impl Into<String>) -> Self {
        Self {
            start_marker: start_marker.into(),
            end_marker: end_marker.into(),
            state: TagState::Outside,
            buffer: String::new(),
        }
    }

    pub fn state(&self) -> TagState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = TagState::Outside;
        self.buffer.clear();
    }

    pub fn parse(&mut self, fragment: &str) -> ParsedDelta {
        let mut input = std::mem::take(&mut self.buffer);
        input.push_str(fragment);

        let mut thinking = String::new();
        let mut text = String::new();
        let mut rest = input.as_str();

        loop {
            let marker = match self.state {
                TagState::Outside => self.start_marker.as_str(),
                TagState::InsideThinking => self.end_marker.as_str(),
            };

            if marker.is_empty() {
                push_for_state(self.state, rest, &mut thinking, &mut text);
                break;
            }

            if let Some(position) = rest.find(marker) {
                push_for_state(self.state, &rest[..position], &mut thinking, &mut text);
                rest = &rest[position + marker.len()..];
                self.state = match self.state {
                    TagState::Outside => TagState::InsideThinking,
                    TagState::InsideThinking => TagState::Outside,
                };
                continue;
            }

            let held = partial_marker_suffix_len(rest, marker);
            let split = rest.len() - held;
            push_for_state(self.state, &rest[..split], &mut thinking, &mut text);
            self.buffer.push_str(&rest[split..]);
            break;
        }

        ParsedDelta {
            thinking_delta: non_empty(thinking),
            text_content_delta: non_empty(text),
        }
    }

    /// Flushes a held-back partial marker as plain content of the current
    /// state. Called once when the stream ends.
    pub fn finish(&mut self) -> ParsedDelta {
        let held = std::mem::take(&mut self.buffer);
        let mut thinking = String::new();
        let mut text = String::new();
        push_for_state(self.state, &held, &mut thinking, &mut text);
        ParsedDelta {
            thinking_delta: non_empty(thinking),
            text_content_delta: non_empty(text),
        }
    }
}

fn push_for_state(state: TagState, segment: &str, thinking: &mut String, text: &mut String) {
    match state {
        TagState::Outside => text.push_str(segment),
        TagState::InsideThinking => thinking.push_str(segment),
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
fn partial_marker_suffix_len(text: &str, marker: &str) -> usize {
    let longest = marker.len().saturating_sub(1).min(text.len());
    (1..=longest)
        .rev()
        .find(|&len| {
            marker.is_char_boundary(len)
                && text.is_char_boundary(text.len() - len)
                && text.ends_with(&marker[..len])
        })
        .unwrap_or(0)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_fragments(fragments: &[&str]) -> (String, String) {
        let mut parser = TagParser::default();
        parser.reset();
        let mut thinking = String::new();
        let mut text = String::new();
        for fragment in fragments {
            let delta = parser.parse(fragment);
            thinking.push_str(delta.thinking_delta.as_deref().unwrap_or_default());
            text.push_str(delta.text_content_delta.as_deref().unwrap_or_default());
        }
        let tail = parser.finish();
        thinking.push_str(tail.thinking_delta.as_deref().unwrap_or_default());
        text.push_str(tail.text_content_delta.as_deref().unwrap_or_default());
        (thinking, text)
    }

    #[test]
    fn splits_single_fragment() {
        let (thinking, text) = run_fragments(&["<think>plan it</think>The answer"]);
        assert_eq!(thinking, "plan it");
        assert_eq!(text, "The answer");
    }

    #[test]
    fn holds_back_marker_split_across_fragments() {
        let mut parser = TagParser::default();
        let first = parser.parse("Hello <th");
        assert_eq!(first.text_content_delta.as_deref(), Some("Hello "));
        assert_eq!(first.thinking_delta, None);

        let second = parser.parse("ink>deep");
        assert_eq!(second.text_content_delta, None);
        assert_eq!(second.thinking_delta.as_deref(), Some("deep"));
        assert_eq!(parser.state(), TagState::InsideThinking);

        let third = parser.parse(" thought</");
        assert_eq!(third.thinking_delta.as_deref(), Some(" thought"));

        let fourth = parser.parse("think>done");
        assert_eq!(fourth.text_content_delta.as_deref(), Some("done"));
        assert_eq!(parser.state(), TagState::Outside);
    }

    #[test]
    fn false_marker_prefix_is_released_as_text() {
        let mut parser = TagParser::default();
        assert_eq!(parser.parse("a <").text_content_delta.as_deref(), Some("a "));
        assert_eq!(parser.parse("b").text_content_delta.as_deref(), Some("<b"));
    }

    #[test]
    fn every_split_point_matches_whole_parse() {
        let samples = [
            "plain text only",
            "<think>r1</think>answer",
            "pre<think>a</think>mid<think>b</think>post",
            "<think>never closed",
            "ends with partial <thi",
            "<think>x</thi",
            "unicode <think>é漢</think>ü",
        ];

        for sample in samples {
            let whole = run_fragments(&[sample]);
            for split in 0..=sample.len() {
                if !sample.is_char_boundary(split) {
                    continue;
                }
                let (left, right) = sample.split_at(split);
                assert_eq!(
                    run_fragments(&[left, right]),
                    whole,
                    "split at {split} of {sample:?}"
                );
            }
            let chars = sample
                .char_indices()
                .map(|(start, ch)| &sample[start..start + ch.len_utf8()])
                .collect::<Vec<_>>();
            assert_eq!(run_fragments(&chars), whole, "per-char split of {sample:?}");
        }
    }

    #[test]
    fn unterminated_partial_marker_is_flushed_in_current_state() {
        let (thinking, text) = run_fragments(&["<think>x</thi"]);
        assert_eq!(thinking, "x</thi");
        assert_eq!(text, "");

        let (thinking, text) = run_fragments(&["answer <thi"]);
        assert_eq!(thinking, "");
        assert_eq!(text, "answer <thi");
    }

    #[test]
    fn reset_clears_state_and_buffer() {
        let mut parser = TagParser::default();
        parser.parse("<think>abc</th");
        parser.reset();
        assert_eq!(parser.state(), TagState::Outside);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn custom_markers_are_honored() {
        let mut parser = TagParser::new("[[r]]", "[[/r]]");
        let delta = parser.parse("[[r]]why[[/r]]what");
        assert_eq!(delta.thinking_delta.as_deref(), Some("why"));
        assert_eq!(delta.text_content_delta.as_deref(), Some("what"));
    }
}
