//! Incremental stream classifier
//!
//! Turns raw LLM text, arriving in arbitrary fragments, into ordered
//! [`SemanticEvent`]s. Three block markers are recognized:
//!
//! - `<thinking>...</thinking>` becomes a `thinking` event
//! - `<tool_use>...</tool_use>` becomes a `tool_call` event when the body is a
//!   JSON invocation, otherwise it passes through as text
//! - `<completion>...</completion>` becomes a `completion` event
//!
//! Everything else is text. Text is emitted as soon as it is known not to be
//! the start of a marker, so a consumer sees output while the model is still
//! producing it. Markers split across fragments are buffered until they can
//! be decided.

use crate::job::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

/// Kind of semantic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Thinking,
    ToolCall,
    Completion,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Thinking => "thinking",
            EventKind::ToolCall => "tool_call",
            EventKind::Completion => "completion",
        }
    }

    /// Whether this kind is produced from a closed block
    pub fn is_structured(&self) -> bool {
        !matches!(self, EventKind::Text)
    }
}

/// A tool invocation decoded from a `<tool_use>` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolInvocation {
    /// Parse a block body. Accepts `arguments`, `input` or `args` for the
    /// argument object.
    fn parse(body: &str, fallback_id: impl FnOnce() -> String) -> Option<Self> {
        let value: Value = serde_json::from_str(body.trim()).ok()?;
        let object = value.as_object()?;

        let name = object.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }

        let arguments = ["arguments", "input", "args"]
            .iter()
            .find_map(|key| object.get(*key))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(fallback_id);

        Some(Self {
            id,
            name: name.to_string(),
            arguments,
        })
    }

    /// String argument looked up under the first present key
    pub fn str_arg(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|key| self.arguments.get(*key))
            .and_then(Value::as_str)
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Text(String),
    ToolCall(ToolInvocation),
}

/// Classified unit of LLM output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl SemanticEvent {
    /// Text content for text, thinking and completion events
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text(text) => Some(text),
            EventPayload::ToolCall(_) => None,
        }
    }

    /// Invocation for tool call events
    pub fn tool_call(&self) -> Option<&ToolInvocation> {
        match &self.payload {
            EventPayload::ToolCall(call) => Some(call),
            EventPayload::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Thinking,
    ToolUse,
    Completion,
}

impl Block {
    const ALL: [Block; 3] = [Block::Thinking, Block::ToolUse, Block::Completion];

    fn open(&self) -> &'static str {
        match self {
            Block::Thinking => "<thinking>",
            Block::ToolUse => "<tool_use>",
            Block::Completion => "<completion>",
        }
    }

    fn close(&self) -> &'static str {
        match self {
            Block::Thinking => "</thinking>",
            Block::ToolUse => "</tool_use>",
            Block::Completion => "</completion>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Block(Block),
}

/// Offset from which `buffer` still needs searching: the last `tail` bytes,
/// moved back to a char boundary
fn scan_start(buffer: &str, tail: usize) -> usize {
    let mut from = buffer.len().saturating_sub(tail);
    while !buffer.is_char_boundary(from) {
        from -= 1;
    }
    from
}

/// Per-job incremental classifier. Not shared between tasks.
#[derive(Debug)]
pub struct StreamClassifier {
    job_id: JobId,
    seq: u64,
    tool_calls: u64,
    mode: Mode,
    /// Unconsumed input: a possible marker prefix in text mode, the block
    /// body so far in block mode
    buffer: String,
}

impl StreamClassifier {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            seq: 0,
            tool_calls: 0,
            mode: Mode::Text,
            buffer: String::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Sequence number the next event will carry
    pub fn next_seq(&self) -> u64 {
        self.seq
    }

    /// Whether input is buffered that has not produced an event yet
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.mode != Mode::Text
    }

    /// Consume one fragment and return the events it completes
    pub fn feed(&mut self, fragment: &str) -> Vec<SemanticEvent> {
        let mut events = Vec::new();
        if fragment.is_empty() {
            return events;
        }

        self.buffer.push_str(fragment);
        let mut text = String::new();

        loop {
            match self.mode {
                Mode::Text => {
                    if !self.drain_text(&mut text) {
                        break;
                    }
                }
                Mode::Block(block) => {
                    let close = block.close();
                    // earlier input was already searched for the close marker
                    let from = scan_start(&self.buffer, fragment.len() + close.len() - 1);
                    let Some(end) = self.buffer[from..].find(close).map(|i| from + i) else {
                        break;
                    };
                    let body: String = self.buffer.drain(..end + close.len()).collect();
                    self.mode = Mode::Text;
                    self.close_block(block, &body[..end], true, &mut text, &mut events);
                }
            }
        }

        self.flush_text(&mut text, &mut events);
        events
    }

    /// Flush held-back text and force-complete an unclosed block
    pub fn finish(&mut self) -> Vec<SemanticEvent> {
        let mut events = Vec::new();
        let mut text = String::new();
        let rest = std::mem::take(&mut self.buffer);

        match std::mem::replace(&mut self.mode, Mode::Text) {
            Mode::Text => text.push_str(&rest),
            Mode::Block(block) => {
                debug!(
                    job_id = %self.job_id,
                    marker = block.open(),
                    "Stream ended inside an unclosed block"
                );
                self.close_block(block, &rest, false, &mut text, &mut events);
            }
        }

        self.flush_text(&mut text, &mut events);
        events
    }

    /// Clear all state and rebind to `job_id`
    pub fn reset(&mut self, job_id: impl Into<JobId>) {
        self.job_id = job_id.into();
        self.seq = 0;
        self.tool_calls = 0;
        self.mode = Mode::Text;
        self.buffer.clear();
    }

    /// Move decided text into `text`. Returns true when an opening marker was
    /// consumed and the classifier switched to block mode.
    fn drain_text(&mut self, text: &mut String) -> bool {
        let mut from = 0;
        while let Some(offset) = self.buffer[from..].find('<') {
            let at = from + offset;
            let rest = &self.buffer[at..];

            if let Some(block) = Block::ALL.iter().copied().find(|b| rest.starts_with(b.open())) {
                text.push_str(&self.buffer[..at]);
                self.buffer.drain(..at + block.open().len());
                self.mode = Mode::Block(block);
                return true;
            }

            if Block::ALL.iter().any(|b| b.open().starts_with(rest)) {
                // could still become a marker
                text.push_str(&self.buffer[..at]);
                self.buffer.drain(..at);
                return false;
            }

            from = at + 1;
        }

        text.push_str(&self.buffer);
        self.buffer.clear();
        false
    }

    fn close_block(
        &mut self,
        block: Block,
        body: &str,
        closed: bool,
        text: &mut String,
        events: &mut Vec<SemanticEvent>,
    ) {
        let payload = match block {
            Block::Thinking => (EventKind::Thinking, EventPayload::Text(body.trim().to_string())),
            Block::Completion => (
                EventKind::Completion,
                EventPayload::Text(body.trim().to_string()),
            ),
            Block::ToolUse => {
                let next_call = self.tool_calls + 1;
                match ToolInvocation::parse(body, || format!("call_{}", next_call)) {
                    Some(call) => {
                        self.tool_calls = next_call;
                        (EventKind::ToolCall, EventPayload::ToolCall(call))
                    }
                    None => {
                        debug!(
                            job_id = %self.job_id,
                            "Tool block is not a valid invocation, passing through as text"
                        );
                        text.push_str(block.open());
                        text.push_str(body);
                        if closed {
                            text.push_str(block.close());
                        }
                        return;
                    }
                }
            }
        };

        self.flush_text(text, events);
        let (kind, payload) = payload;
        self.push(kind, payload, events);
    }

    fn flush_text(&mut self, text: &mut String, events: &mut Vec<SemanticEvent>) {
        if text.is_empty() {
            return;
        }
        let run = std::mem::take(text);
        self.push(EventKind::Text, EventPayload::Text(run), events);
    }

    fn push(&mut self, kind: EventKind, payload: EventPayload, events: &mut Vec<SemanticEvent>) {
        trace!(job_id = %self.job_id, seq = self.seq, kind = kind.as_str(), "Classified event");
        events.push(SemanticEvent {
            job_id: self.job_id.clone(),
            seq: self.seq,
            kind,
            payload,
        });
        self.seq += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn run(fragments: &[&str]) -> Vec<SemanticEvent> {
        let mut classifier = StreamClassifier::new("job");
        let mut events = Vec::new();
        for fragment in fragments {
            events.extend(classifier.feed(fragment));
        }
        events.extend(classifier.finish());
        events
    }

    fn structured(events: &[SemanticEvent]) -> Vec<(EventKind, EventPayload)> {
        events
            .iter()
            .filter(|e| e.kind.is_structured())
            .map(|e| (e.kind, e.payload.clone()))
            .collect()
    }

    fn joined_text(events: &[SemanticEvent]) -> String {
        events
            .iter()
            .filter(|e| e.kind == EventKind::Text)
            .filter_map(SemanticEvent::text)
            .collect()
    }

    #[test]
    fn test_plain_text_is_emitted_eagerly() {
        let mut classifier = StreamClassifier::new("job");
        let events = classifier.feed("hello ");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text(), Some("hello "));
        assert!(!classifier.has_pending());
    }

    #[test]
    fn test_split_marker() {
        let whole = run(&[r#"<tool_use>{"name":"grep","arguments":{"q":"x"}}</tool_use>"#]);
        let split = run(&["<tool_us", r#"e>{"name":"grep","arguments":{"q":"x"}}</tool_use>"#]);

        assert_eq!(whole, split);
        assert_eq!(whole.len(), 1);
        let call = whole[0].tool_call().unwrap();
        assert_eq!(call.name, "grep");
        assert_eq!(call.arguments, json!({"q": "x"}));
        assert_eq!(call.id, "call_1");
    }

    #[test]
    fn test_marker_prefix_is_held_back() {
        let mut classifier = StreamClassifier::new("job");
        let events = classifier.feed("before <think");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text(), Some("before "));
        assert!(classifier.has_pending());

        let events = classifier.feed("ing>hmm</thinking>after");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Thinking);
        assert_eq!(events[0].text(), Some("hmm"));
        assert_eq!(events[1].text(), Some("after"));
    }

    #[test]
    fn test_text_and_blocks_keep_order() {
        let events = run(&["a<thinking>t</thinking>b<completion> done </completion>c"]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Text,
                EventKind::Thinking,
                EventKind::Text,
                EventKind::Completion,
                EventKind::Text
            ]
        );
        assert_eq!(events[3].text(), Some("done"));
        let seqs: Vec<_> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_tags_are_text() {
        let events = run(&["<b>bold</b> 1 < 2 <toolbox>"]);
        assert_eq!(joined_text(&events), "<b>bold</b> 1 < 2 <toolbox>");
        assert!(structured(&events).is_empty());
    }

    #[test]
    fn test_invalid_tool_body_degrades_to_text() {
        let events = run(&["x<tool_use>not json</tool_use>y"]);
        assert!(structured(&events).is_empty());
        assert_eq!(joined_text(&events), "x<tool_use>not json</tool_use>y");
        assert_eq!(events.len(), 1);

        let events = run(&[r#"<tool_use>{"arguments":{}}</tool_use>"#]);
        assert!(structured(&events).is_empty());
    }

    #[test]
    fn test_tool_argument_aliases_and_id() {
        let events = run(&[
            r#"<tool_use>{"id":"t-9","name":"ask_followup_question","input":{"question":"color?"}}</tool_use>"#,
            r#"<tool_use>{"name":"noop"}</tool_use>"#,
        ]);
        let first = events[0].tool_call().unwrap();
        assert_eq!(first.id, "t-9");
        assert_eq!(first.str_arg(&["question", "prompt"]), Some("color?"));

        let second = events[1].tool_call().unwrap();
        assert_eq!(second.id, "call_2");
        assert_eq!(second.arguments, json!({}));
    }

    #[test]
    fn test_finish_force_completes_unclosed_blocks() {
        let mut classifier = StreamClassifier::new("job");
        assert!(classifier.feed("<completion>partial answ").is_empty());
        let events = classifier.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Completion);
        assert_eq!(events[0].text(), Some("partial answ"));

        let events = run(&["<tool_use>{\"name\": "]);
        assert_eq!(joined_text(&events), "<tool_use>{\"name\": ");

        let events = run(&["trailing <tool_"]);
        assert_eq!(joined_text(&events), "trailing <tool_");
    }

    #[test]
    fn test_empty_fragment_is_noop() {
        let mut classifier = StreamClassifier::new("job");
        assert!(classifier.feed("").is_empty());
        assert_eq!(classifier.next_seq(), 0);
        assert!(!classifier.has_pending());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut classifier = StreamClassifier::new("job-a");
        classifier.feed("hi <thinking>half");
        assert!(classifier.next_seq() > 0);

        classifier.reset("job-b");
        assert_eq!(classifier.next_seq(), 0);
        assert!(!classifier.has_pending());
        let events = classifier.feed("</thinking>");
        assert_eq!(events[0].job_id, "job-b");
        assert_eq!(events[0].kind, EventKind::Text);
    }

    #[test]
    fn test_multibyte_text_around_markers() {
        let events = run(&["héllo <thin", "king>café</thinking>ü"]);
        assert_eq!(joined_text(&events), "héllo ü");
        assert_eq!(events[1].text(), Some("café"));
    }

    #[test]
    fn test_long_block_in_small_fragments() {
        let body = "é".repeat(500) + "</thinkin" + &"x".repeat(500);
        let input = format!("<thinking>{}</thinking>done", body);

        let mut classifier = StreamClassifier::new("job");
        let mut events = Vec::new();
        let chars: Vec<char> = input.chars().collect();
        for chunk in chars.chunks(3) {
            events.extend(classifier.feed(&chunk.iter().collect::<String>()));
        }
        events.extend(classifier.finish());

        assert_eq!(events[0].kind, EventKind::Thinking);
        assert_eq!(events[0].text(), Some(body.as_str()));
        assert_eq!(structured(&events).len(), 1);
        assert_eq!(joined_text(&events), "done");
    }

    #[test]
    fn test_scan_start_respects_char_boundaries() {
        assert_eq!(scan_start("abc", 10), 0);
        assert_eq!(scan_start("abcdef", 2), 4);
        // 'é' is two bytes, a cut inside it moves back to its start
        assert_eq!(scan_start("aé", 1), 1);
    }

    const SAMPLE: &str = concat!(
        "Let me look. <thinking>need the <b>color</b> first</thinking>",
        "Asking now <tool_use>{\"name\":\"ask_followup_question\",",
        "\"arguments\":{\"question\":\"Pick a color\",\"options\":[\"red\",\"blue\"]}}</tool_use>",
        " and <tool_use>broken</tool_use> < then ",
        "<completion>blue it is</completion> bye <complet"
    );

    proptest! {
        #[test]
        fn prop_fragmentation_does_not_change_events(
            cuts in proptest::collection::vec(0..SAMPLE.len(), 0..12)
        ) {
            let mut cuts = cuts;
            cuts.sort_unstable();
            cuts.dedup();

            let mut fragments = Vec::new();
            let mut last = 0;
            for cut in cuts {
                fragments.push(&SAMPLE[last..cut]);
                last = cut;
            }
            fragments.push(&SAMPLE[last..]);

            let whole = run(&[SAMPLE]);
            let split = run(&fragments);

            prop_assert_eq!(structured(&whole), structured(&split));
            prop_assert_eq!(joined_text(&whole), joined_text(&split));
            for (i, event) in split.iter().enumerate() {
                prop_assert_eq!(event.seq, i as u64);
            }
        }
    }
}
