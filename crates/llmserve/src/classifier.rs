//! Classification of raw backend fragments into typed stream output.
//!
//! [`StreamClassifier`] is fed every [`ChatChunk`] of one backend turn and
//! returns [`Fragment`]s as soon as they can be classified:
//!
//! - reasoning deltas, and text inside `<think>...</think>` spans of the
//!   content, become [`Fragment::Thinking`] until the first tool call of the
//!   turn is released; later reasoning is kept on the [`Turn`] only;
//! - tool-call deltas are merged until a call is complete, then become one
//!   [`Fragment::ToolCall`];
//! - remaining text becomes [`Fragment::Content`]. When tools are offered the
//!   text is held until the turn ends and released only if the turn requested
//!   no tools; otherwise it stays on the assistant message unemitted.
//!
//! A turn therefore always reads thinking, then tool calls, then content.

use std::mem;

use log::{debug, warn};
use uuid::Uuid;

use llmserve_client::ClientError;
use llmserve_common::{
    ChatChunk, FinishReason, StreamChunk, ToolCall, ToolCallDelta, Usage,
};

use crate::error::CoreError;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// One classified piece of a backend turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Thinking(String),
    ToolCall(ToolCall),
    Content(String),
}

impl From<Fragment> for StreamChunk {
    fn from(fragment: Fragment) -> Self {
        match fragment {
            Fragment::Thinking(text) => Self::Thinking(text),
            Fragment::ToolCall(call) => Self::ToolCall(call),
            Fragment::Content(text) => Self::Content(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Thinking,
    Content,
}

/// Splits text on `<think>` tags that may be cut across fragments.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    in_think: bool,
    buffer: String,
    trim_next_content: bool,
}

impl ThinkSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, text: &str) -> Vec<(Segment, String)> {
        self.buffer.push_str(text);
        let mut out = Vec::new();

        loop {
            let tag = if self.in_think { THINK_CLOSE } else { THINK_OPEN };
            if let Some(pos) = self.buffer.find(tag) {
                let before: String = self.buffer.drain(..pos).collect();
                self.buffer.drain(..tag.len());
                self.emit(&mut out, before);
                self.in_think = !self.in_think;
                if !self.in_think {
                    self.trim_next_content = true;
                }
                continue;
            }

            let keep = partial_tag_len(&self.buffer, tag);
            let ready = self.buffer.len() - keep;
            if ready > 0 {
                let text: String = self.buffer.drain(..ready).collect();
                self.emit(&mut out, text);
            }
            break;
        }

        out
    }

    fn finish(&mut self) -> Vec<(Segment, String)> {
        let mut out = Vec::new();
        let rest = mem::take(&mut self.buffer);
        self.emit(&mut out, rest);
        out
    }

    fn emit(&mut self, out: &mut Vec<(Segment, String)>, text: String) {
        if self.in_think {
            if !text.trim().is_empty() {
                out.push((Segment::Thinking, text));
            }
            return;
        }

        let text = if self.trim_next_content {
            let trimmed = text.trim_start();
            if trimmed.is_empty() {
                return;
            }
            self.trim_next_content = false;
            trimmed.to_string()
        } else {
            text
        };

        if !text.is_empty() {
            out.push((Segment::Content, text));
        }
    }

    /// Splits a complete reply into `(reasoning, content)`.
    #[must_use]
    pub fn split(text: &str) -> (String, String) {
        let mut splitter = Self::new();
        let mut segments = splitter.push(text);
        segments.extend(splitter.finish());

        let mut reasoning = String::new();
        let mut content = String::new();
        for (segment, text) in segments {
            match segment {
                Segment::Thinking => reasoning.push_str(&text),
                Segment::Content => content.push_str(&text),
            }
        }
        (reasoning.trim().to_string(), content)
    }
}

/// A call id in the format the backend adapters generate.
pub(crate) fn fresh_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_len(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| text.ends_with(&tag[..len]))
        .unwrap_or(0)
}

#[derive(Debug)]
struct PendingCall {
    index: Option<u32>,
    id: String,
    name: String,
    arguments: String,
}

impl PendingCall {
    fn is_complete(&self) -> bool {
        !self.name.is_empty()
            && (self.arguments.trim().is_empty()
                || serde_json::from_str::<serde_json::Value>(&self.arguments).is_ok())
    }

    fn into_tool_call(self) -> ToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            self.arguments
        };
        if self.id.is_empty() {
            ToolCall::new(self.name, arguments)
        } else {
            ToolCall::with_id(self.id, self.name, arguments)
        }
    }
}

/// Everything left over once the backend stream has ended.
#[derive(Debug, Default)]
pub struct Turn {
    /// Fragments released by the end of the stream.
    pub fragments: Vec<Fragment>,
    /// Full answer text, excluding reasoning.
    pub content: String,
    /// Full reasoning text.
    pub reasoning: String,
    /// Every tool call of the turn in request order.
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

/// Push-based classifier for one backend turn.
#[derive(Debug)]
pub struct StreamClassifier {
    accept_tools: bool,
    think: ThinkSplitter,
    pending: Vec<PendingCall>,
    emitted: Vec<ToolCall>,
    held: Vec<String>,
    content: String,
    reasoning: String,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl Default for StreamClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            accept_tools: true,
            think: ThinkSplitter::new(),
            pending: Vec::new(),
            emitted: Vec::new(),
            held: Vec::new(),
            content: String::new(),
            reasoning: String::new(),
            finish_reason: None,
            usage: None,
        }
    }

    /// A classifier that drops tool-call deltas, for turns sent without tools.
    #[must_use]
    pub fn without_tools() -> Self {
        Self {
            accept_tools: false,
            ..Self::new()
        }
    }

    fn requested_tools(&self) -> bool {
        !self.pending.is_empty() || !self.emitted.is_empty()
    }

    fn add_reasoning(&mut self, text: String, out: &mut Vec<Fragment>) {
        self.reasoning.push_str(&text);
        if self.emitted.is_empty() {
            out.push(Fragment::Thinking(text));
        } else {
            debug!("Keeping {} bytes of reasoning that followed a tool call", text.len());
        }
    }

    /// Classifies one backend fragment.
    pub fn push(&mut self, chunk: &ChatChunk) -> Vec<Fragment> {
        let mut out = Vec::new();

        if let Some(reasoning) = chunk.delta_reasoning.as_deref()
            && !reasoning.is_empty()
        {
            self.add_reasoning(reasoning.to_string(), &mut out);
        }

        if let Some(deltas) = &chunk.delta_tool_calls {
            if self.accept_tools {
                for delta in deltas {
                    self.merge(delta, &mut out);
                }
            } else {
                debug!("Ignoring {} tool call delta(s) in a turn without tools", deltas.len());
            }
        }

        if let Some(text) = chunk.delta_content.as_deref() {
            for (segment, text) in self.think.push(text) {
                self.classify_text(segment, text, &mut out);
            }
        }

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        out
    }

    fn classify_text(&mut self, segment: Segment, text: String, out: &mut Vec<Fragment>) {
        match segment {
            Segment::Thinking => self.add_reasoning(text, out),
            Segment::Content => {
                self.content.push_str(&text);
                if self.accept_tools {
                    self.held.push(text);
                } else {
                    out.push(Fragment::Content(text));
                }
            }
        }
    }

    fn merge(&mut self, delta: &ToolCallDelta, out: &mut Vec<Fragment>) {
        let id = delta.id.as_deref().filter(|id| !id.is_empty());

        // Some servers number every call 0, so a new id at a known index is a new call.
        let position = match (delta.index, id) {
            (Some(index), _) => self.pending.iter().rposition(|p| {
                p.index == Some(index) && id.is_none_or(|id| p.id.is_empty() || p.id == id)
            }),
            (None, Some(id)) => self.pending.iter().position(|p| p.id == id),
            (None, None) => self.pending.len().checked_sub(1),
        };

        let position = match position {
            Some(position) => position,
            None => {
                // A new call starts, so every earlier call is as complete as it will get.
                self.release_ready(self.pending.len(), out);
                self.pending.push(PendingCall {
                    index: delta.index,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                self.pending.len() - 1
            }
        };

        let call = &mut self.pending[position];
        if let Some(id) = id
            && call.id.is_empty()
        {
            call.id = id.to_string();
        }
        if let Some(name) = delta.name.as_deref()
            && call.name.is_empty()
        {
            call.name = name.to_string();
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
        }
    }

    /// Emits complete calls among the first `upto` pending ones, in order.
    fn release_ready(&mut self, upto: usize, out: &mut Vec<Fragment>) {
        let ready = self.pending[..upto]
            .iter()
            .take_while(|call| call.is_complete())
            .count();
        for pending in self.pending.drain(..ready) {
            let mut call = pending.into_tool_call();
            if self.emitted.iter().any(|other| other.id == call.id) {
                call.id = fresh_call_id();
            }
            debug!("Tool call complete: {} ({})", call.function.name, call.id);
            self.emitted.push(call.clone());
            out.push(Fragment::ToolCall(call));
        }
    }

    /// Ends the turn, releasing buffered text and remaining tool calls.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BackendProtocol`] if a tool call never received a
    /// name or its arguments are not valid JSON.
    pub fn finish(mut self) -> Result<Turn, CoreError> {
        let mut fragments = Vec::new();

        for (segment, text) in self.think.finish() {
            self.classify_text(segment, text, &mut fragments);
        }

        let total = self.pending.len();
        self.release_ready(total, &mut fragments);
        if let Some(broken) = self.pending.first() {
            warn!("Incomplete tool call at end of stream: {broken:?}");
            let reason = if broken.name.is_empty() {
                "tool call without a function name".to_string()
            } else {
                format!(
                    "tool call '{}' has arguments that are not valid JSON: {}",
                    broken.name, broken.arguments
                )
            };
            return Err(CoreError::BackendProtocol(
                ClientError::InvalidResponse(reason).into(),
            ));
        }

        if self.requested_tools() {
            if !self.held.is_empty() {
                debug!("Keeping {} bytes of content in a tool-calling turn", self.content.len());
            }
        } else {
            fragments.extend(self.held.drain(..).map(Fragment::Content));
        }

        Ok(Turn {
            fragments,
            content: self.content,
            reasoning: self.reasoning,
            tool_calls: self.emitted,
            finish_reason: self.finish_reason,
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::error::ErrorKind;

    fn text(content: &str) -> ChatChunk {
        ChatChunk::new("m").with_content(content)
    }

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ChatChunk {
        ChatChunk::new("m").with_tool_calls(vec![ToolCallDelta {
            index: Some(index),
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: Some(args.to_string()),
        }])
    }

    fn run(chunks: &[ChatChunk]) -> (Vec<Fragment>, Turn) {
        let mut classifier = StreamClassifier::new();
        let mut fragments: Vec<Fragment> = chunks.iter().flat_map(|c| classifier.push(c)).collect();
        let turn = classifier.finish().unwrap();
        fragments.extend(turn.fragments.clone());
        (fragments, turn)
    }

    #[test]
    fn test_plain_content_released_at_end_of_turn() {
        let mut classifier = StreamClassifier::new();
        assert!(classifier.push(&text("Hel")).is_empty());
        assert!(classifier.push(&text("lo")).is_empty());

        let turn = classifier.finish().unwrap();
        assert_eq!(
            turn.fragments,
            vec![Fragment::Content("Hel".into()), Fragment::Content("lo".into())]
        );
        assert_eq!(turn.content, "Hello");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_content_before_tool_call_is_not_emitted() {
        let (fragments, turn) = run(&[
            text("Let me check."),
            delta(0, Some("c1"), Some("weather"), "{}"),
            text(" One moment."),
        ]);

        assert_eq!(fragments.len(), 1);
        assert!(matches!(&fragments[0], Fragment::ToolCall(call) if call.id == "c1"));
        assert_eq!(turn.content, "Let me check. One moment.");
    }

    #[test]
    fn test_reasoning_after_tool_call_is_kept_but_not_emitted() {
        let (fragments, turn) = run(&[
            ChatChunk::new("m").with_reasoning("two lookups"),
            delta(0, Some("a"), Some("first"), "{}"),
            delta(1, Some("b"), Some("second"), "{}"),
            ChatChunk::new("m").with_reasoning(" second thoughts"),
            text("<think>more</think>"),
        ]);

        let kinds: Vec<&str> = fragments
            .iter()
            .map(|f| match f {
                Fragment::Thinking(_) => "thinking",
                Fragment::ToolCall(_) => "tool_call",
                Fragment::Content(_) => "content",
            })
            .collect();
        assert_eq!(kinds, vec!["thinking", "tool_call", "tool_call"]);
        assert_eq!(turn.reasoning, "two lookups second thoughtsmore");
    }

    #[test]
    fn test_reasoning_between_partial_deltas_still_precedes_the_call() {
        let (fragments, _) = run(&[
            delta(0, Some("a"), Some("first"), "{\"x\":"),
            ChatChunk::new("m").with_reasoning("hmm"),
            delta(0, None, None, "1}"),
        ]);
        assert!(matches!(fragments[0], Fragment::Thinking(_)));
        assert!(matches!(&fragments[1], Fragment::ToolCall(call) if call.id == "a"));
    }

    #[test]
    fn test_same_index_with_new_id_starts_a_new_call() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, Some("a"), Some("echo"), "{}"));
        let released = classifier.push(&delta(0, Some("b"), Some("echo"), "{\"x\":"));
        assert!(matches!(&released[..], [Fragment::ToolCall(call)] if call.id == "a"));

        classifier.push(&delta(0, None, None, "2}"));
        let turn = classifier.finish().unwrap();

        let calls: Vec<(&str, &str)> = turn
            .tool_calls
            .iter()
            .map(|c| (c.id.as_str(), c.function.arguments.as_str()))
            .collect();
        assert_eq!(calls, vec![("a", "{}"), ("b", "{\"x\":2}")]);
    }

    #[test]
    fn test_same_index_and_id_continues_the_call() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, Some("a"), Some("echo"), "{\"x\":"));
        classifier.push(&delta(0, Some("a"), None, "1}"));
        let turn = classifier.finish().unwrap();

        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].function.arguments, "{\"x\":1}");
    }

    #[test]
    fn test_reasoning_deltas_are_thinking() {
        let (fragments, turn) = run(&[
            ChatChunk::new("m").with_reasoning("hmm"),
            text("Answer"),
        ]);
        assert_eq!(
            fragments,
            vec![Fragment::Thinking("hmm".into()), Fragment::Content("Answer".into())]
        );
        assert_eq!(turn.reasoning, "hmm");
    }

    #[test]
    fn test_think_tags_split_across_fragments() {
        let (fragments, turn) = run(&[
            text("<th"),
            text("ink>pondering"),
            text(" more</thi"),
            text("nk>\n\nThe answer"),
            text(" is 4"),
        ]);
        assert_eq!(
            fragments,
            vec![
                Fragment::Thinking("pondering".into()),
                Fragment::Thinking(" more".into()),
                Fragment::Content("The answer".into()),
                Fragment::Content(" is 4".into()),
            ]
        );
        assert_eq!(turn.content, "The answer is 4");
        assert_eq!(turn.reasoning, "pondering more");
    }

    #[test]
    fn test_angle_bracket_that_is_not_a_tag() {
        let (fragments, _) = run(&[text("a <"), text("b")]);
        let joined: String = fragments
            .iter()
            .map(|f| match f {
                Fragment::Content(t) => t.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(joined, "a <b");
    }

    #[test]
    fn test_split_complete_reply() {
        let (reasoning, content) =
            ThinkSplitter::split("<think>\nI should greet.\n</think>\n\nHello!");
        assert_eq!(reasoning, "I should greet.");
        assert_eq!(content, "Hello!");

        let (reasoning, content) = ThinkSplitter::split("No tags here");
        assert!(reasoning.is_empty());
        assert_eq!(content, "No tags here");
    }

    #[test]
    fn test_tool_call_split_across_deltas() {
        let mut classifier = StreamClassifier::new();

        assert!(classifier.push(&delta(0, Some("call_1"), Some("get_current_temperature"), "{\"loc")).is_empty());
        assert!(classifier.push(&delta(0, None, None, "ation\": \"Tok")).is_empty());
        assert!(classifier.push(&delta(0, None, None, "yo\"}")).is_empty());

        let turn = classifier.finish().unwrap();
        assert_eq!(turn.fragments.len(), 1);
        let Fragment::ToolCall(call) = &turn.fragments[0] else {
            unreachable!("expected a tool call fragment");
        };
        assert_eq!(call.id, "call_1");
        assert_eq!(call.function.name, "get_current_temperature");
        assert_eq!(call.function.arguments, r#"{"location": "Tokyo"}"#);
        assert_eq!(turn.tool_calls.len(), 1);
    }

    #[test]
    fn test_previous_call_released_when_next_starts() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, Some("a"), Some("first"), "{}"));
        let released = classifier.push(&delta(1, Some("b"), Some("second"), "{\"x\":"));

        assert!(matches!(&released[..], [Fragment::ToolCall(call)] if call.id == "a"));

        classifier.push(&delta(1, None, None, "1}"));
        let turn = classifier.finish().unwrap();
        assert!(matches!(&turn.fragments[..], [Fragment::ToolCall(call)] if call.id == "b"));
        let ids: Vec<&str> = turn.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_deltas_without_index_merge_by_id_or_continue_last() {
        let mut classifier = StreamClassifier::new();
        let chunk = |id: Option<&str>, name: Option<&str>, args: &str| {
            ChatChunk::new("m").with_tool_calls(vec![ToolCallDelta {
                index: None,
                id: id.map(str::to_string),
                name: name.map(str::to_string),
                arguments: Some(args.to_string()),
            }])
        };

        classifier.push(&chunk(Some("x"), Some("lookup"), "{\"q\":"));
        classifier.push(&chunk(None, None, "\"a\"}"));
        classifier.push(&chunk(Some("y"), Some("lookup"), "{}"));

        let turn = classifier.finish().unwrap();
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].function.arguments, r#"{"q":"a"}"#);
        assert_eq!(turn.tool_calls[1].id, "y");
    }

    #[test]
    fn test_missing_id_and_empty_arguments() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, None, Some("get_current_time"), ""));
        let turn = classifier.finish().unwrap();

        let call = &turn.tool_calls[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.function.arguments, "{}");
    }

    #[test]
    fn test_duplicate_ids_are_replaced() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, Some("dup"), Some("first"), "{}"));
        classifier.push(&delta(1, Some("dup"), Some("second"), "{}"));
        let turn = classifier.finish().unwrap();

        assert_eq!(turn.tool_calls[0].id, "dup");
        assert_ne!(turn.tool_calls[1].id, "dup");
    }

    #[test]
    fn test_content_after_tool_call_is_held_back() {
        let (fragments, turn) = run(&[
            ChatChunk::new("m").with_reasoning("need weather"),
            delta(0, Some("c1"), Some("weather"), "{}"),
            text("Let me check."),
        ]);

        assert_eq!(fragments.len(), 2);
        assert!(matches!(fragments[0], Fragment::Thinking(_)));
        assert!(matches!(fragments[1], Fragment::ToolCall(_)));
        assert_eq!(turn.content, "Let me check.");
    }

    #[test]
    fn test_without_tools_ignores_deltas() {
        let mut classifier = StreamClassifier::without_tools();
        classifier.push(&delta(0, Some("c1"), Some("weather"), "{}"));
        let out = classifier.push(&text("Plain answer"));
        assert_eq!(out, vec![Fragment::Content("Plain answer".into())]);

        let turn = classifier.finish().unwrap();
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_unparseable_arguments_are_a_protocol_error() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&delta(0, Some("c1"), Some("weather"), "{\"location\": "));
        let err = classifier.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendProtocol);
    }

    #[test]
    fn test_finish_reason_and_usage_recorded() {
        let mut classifier = StreamClassifier::new();
        classifier.push(&text("done").with_finish_reason(FinishReason::Stop));
        let mut usage_chunk = ChatChunk::new("m");
        usage_chunk.usage = Some(Usage {
            prompt_tokens: 3,
            completion_tokens: 1,
            total_tokens: 4,
        });
        classifier.push(&usage_chunk);

        let turn = classifier.finish().unwrap();
        assert_eq!(turn.finish_reason, Some(FinishReason::Stop));
        assert_eq!(turn.usage.unwrap().total_tokens, 4);
    }
}
