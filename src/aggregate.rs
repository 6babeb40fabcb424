//! Delta aggregation.
//!
//! Folds a sequence of streamed fragments into one finalized result. The
//! fold is deterministic: however the server partitions a logical response
//! into chunks, the aggregate comes out identical. Fragments whose shape
//! matches nothing we recognize are no-op merges; the aggregator favors
//! forward progress over strict schema validation.

use serde::de::DeserializeOwned;

use crate::hooks::CallOutcome;
use crate::types::{
    ChatAggregate, ChatChunk, CompletionsAggregate, CompletionsChunk, FunctionCall, ToolCall,
    Usage,
};

/// Folding behavior shared by the chat and completions aggregators, so one
/// generic stream wrapper can drive either.
pub trait DeltaAggregate: Default + Send + Unpin + 'static {
    type Chunk: DeserializeOwned + Clone + Send + 'static;
    type Output: Send + Sync + Unpin + 'static;

    fn push(&mut self, chunk: &Self::Chunk);
    fn finish(self) -> Self::Output;
    fn outcome(output: &Self::Output) -> CallOutcome<'_>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
    Finalized,
}

/// One tool invocation under reconstruction, keyed by its fragment index.
#[derive(Debug, Clone)]
struct ToolCallSlot {
    index: u32,
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

/// Folds chat fragments into a [`ChatAggregate`].
#[derive(Debug)]
pub struct ChatAggregator {
    state: State,
    role: Option<String>,
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Vec<ToolCallSlot>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl Default for ChatAggregator {
    fn default() -> Self {
        Self {
            state: State::Idle,
            role: None,
            content: None,
            reasoning_content: None,
            tool_calls: Vec::new(),
            finish_reason: None,
            usage: None,
        }
    }
}

impl ChatAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal finish-reason has been observed. Trailing
    /// usage-only events are still merged in this state.
    pub fn is_finalized(&self) -> bool {
        self.state == State::Finalized
    }

    /// Tolerant entry point: an event that does not parse as a chat chunk
    /// is a no-op merge.
    pub fn push_json(&mut self, event: &serde_json::Value) {
        if let Ok(chunk) = serde_json::from_value::<ChatChunk>(event.clone()) {
            self.push_chunk(&chunk);
        }
    }

    pub fn push_chunk(&mut self, chunk: &ChatChunk) {
        if self.state == State::Idle {
            self.state = State::Accumulating;
        }
        if let Some(choice) = chunk.choices.first() {
            let delta = &choice.delta;
            if let Some(role) = &delta.role {
                self.role = Some(role.clone());
            }
            if let Some(text) = &delta.content {
                self.content.get_or_insert_with(String::new).push_str(text);
            }
            if let Some(text) = &delta.reasoning_content {
                self.reasoning_content
                    .get_or_insert_with(String::new)
                    .push_str(text);
            }
            if let Some(tool_calls) = &delta.tool_calls {
                for fragment in tool_calls {
                    let slot = match self
                        .tool_calls
                        .binary_search_by_key(&fragment.index, |s| s.index)
                    {
                        Ok(pos) => &mut self.tool_calls[pos],
                        Err(pos) => {
                            self.tool_calls.insert(
                                pos,
                                ToolCallSlot {
                                    index: fragment.index,
                                    id: String::new(),
                                    kind: String::new(),
                                    name: String::new(),
                                    arguments: String::new(),
                                },
                            );
                            &mut self.tool_calls[pos]
                        }
                    };
                    // identity fields come from whichever fragment carries
                    // them first; arguments concatenate across all fragments
                    if slot.id.is_empty()
                        && let Some(id) = &fragment.id
                    {
                        slot.id = id.clone();
                    }
                    if slot.kind.is_empty()
                        && let Some(kind) = &fragment.kind
                    {
                        slot.kind = kind.clone();
                    }
                    if let Some(function) = &fragment.function {
                        if slot.name.is_empty()
                            && let Some(name) = &function.name
                        {
                            slot.name = name.clone();
                        }
                        if let Some(arguments) = &function.arguments {
                            slot.arguments.push_str(arguments);
                        }
                    }
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
                self.state = State::Finalized;
            }
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
    }
}

impl DeltaAggregate for ChatAggregator {
    type Chunk = ChatChunk;
    type Output = ChatAggregate;

    fn push(&mut self, chunk: &ChatChunk) {
        self.push_chunk(chunk);
    }

    fn finish(self) -> ChatAggregate {
        ChatAggregate {
            role: self.role.unwrap_or_default(),
            content: self.content,
            reasoning_content: self.reasoning_content,
            tool_calls: self
                .tool_calls
                .into_iter()
                .map(|slot| ToolCall {
                    id: slot.id,
                    kind: if slot.kind.is_empty() {
                        "function".to_string()
                    } else {
                        slot.kind
                    },
                    function: FunctionCall {
                        name: slot.name,
                        arguments: slot.arguments,
                    },
                })
                .collect(),
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }

    fn outcome(output: &ChatAggregate) -> CallOutcome<'_> {
        CallOutcome::ChatStream(output)
    }
}

/// Folds completions fragments into a [`CompletionsAggregate`].
#[derive(Debug, Default)]
pub struct CompletionsAggregator {
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl CompletionsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &CompletionsChunk) {
        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = &choice.text {
                self.text.push_str(text);
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
    }
}

impl DeltaAggregate for CompletionsAggregator {
    type Chunk = CompletionsChunk;
    type Output = CompletionsAggregate;

    fn push(&mut self, chunk: &CompletionsChunk) {
        self.push_chunk(chunk);
    }

    fn finish(self) -> CompletionsAggregate {
        CompletionsAggregate {
            text: self.text,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }

    fn outcome(output: &CompletionsAggregate) -> CallOutcome<'_> {
        CallOutcome::CompletionsStream(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregate(events: &[serde_json::Value]) -> ChatAggregate {
        let mut agg = ChatAggregator::new();
        for event in events {
            agg.push_json(event);
        }
        agg.finish()
    }

    fn content_chunk(text: &str) -> serde_json::Value {
        json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    }

    #[test]
    fn content_merge_is_partition_invariant() {
        let split = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]}),
            content_chunk("Hel"),
            content_chunk("lo"),
        ]);
        let whole = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]}),
        ]);
        assert_eq!(split, whole);
        assert_eq!(split.content.as_deref(), Some("Hello"));
        assert_eq!(split.role, "assistant");
    }

    #[test]
    fn null_content_delta_is_a_no_op() {
        let agg = aggregate(&[
            content_chunk("Hello"),
            json!({"choices": [{"index": 0, "delta": {"content": null}}]}),
        ]);
        assert_eq!(agg.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn reasoning_channel_accumulates_independently() {
        let agg = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"reasoning_content": "think"}}]}),
            json!({"choices": [{"index": 0, "delta": {"reasoning_content": "ing"}}]}),
            content_chunk("Answer"),
        ]);
        assert_eq!(agg.reasoning_content.as_deref(), Some("thinking"));
        assert_eq!(agg.content.as_deref(), Some("Answer"));
    }

    #[test]
    fn tool_call_fragments_merge_by_index_not_id() {
        let agg = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "a", "type": "function",
                 "function": {"name": "f", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"x\":1}"}}
            ]}}]}),
        ]);
        assert_eq!(agg.tool_calls.len(), 1);
        let call = &agg.tool_calls[0];
        assert_eq!(call.id, "a");
        assert_eq!(call.function.name, "f");
        assert_eq!(call.function.arguments, "{\"x\":1}");
    }

    #[test]
    fn interleaved_tool_calls_keep_index_order() {
        let agg = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "id": "b", "function": {"name": "g", "arguments": "{"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "a", "function": {"name": "f", "arguments": "{}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "function": {"arguments": "}"}}
            ]}}]}),
        ]);
        assert_eq!(agg.tool_calls.len(), 2);
        assert_eq!(agg.tool_calls[0].id, "a");
        assert_eq!(agg.tool_calls[0].function.arguments, "{}");
        assert_eq!(agg.tool_calls[1].id, "b");
        assert_eq!(agg.tool_calls[1].function.arguments, "{}");
    }

    #[test]
    fn tool_call_partitioning_is_deterministic() {
        let one_shot = aggregate(&[json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "a", "type": "function",
             "function": {"name": "f", "arguments": "{\"q\":\"rust\"}"}}
        ]}}]})]);
        let per_token = aggregate(&[
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "a", "type": "function", "function": {"name": "f", "arguments": ""}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"q\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"rust\"}"}}
            ]}}]}),
        ]);
        assert_eq!(one_shot, per_token);
    }

    #[test]
    fn finish_reason_finalizes_but_trailing_usage_still_merges() {
        let mut agg = ChatAggregator::new();
        agg.push_json(&content_chunk("Hi"));
        agg.push_json(&json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
        assert!(agg.is_finalized());
        // trailing usage-only event, as DeepSeek and newer OpenAI models send
        agg.push_json(&json!({"choices": [], "usage": {
            "prompt_tokens": 17, "completion_tokens": 9, "total_tokens": 26
        }}));
        assert!(agg.is_finalized());
        let out = agg.finish();
        assert_eq!(out.finish_reason.as_deref(), Some("stop"));
        assert_eq!(out.usage.unwrap().total_tokens, Some(26));
        assert_eq!(out.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn unrecognized_event_shapes_are_ignored() {
        let agg = aggregate(&[
            content_chunk("ok"),
            json!({"object": "ping"}),
            json!({"choices": "not-an-array"}),
            json!("just a string"),
        ]);
        assert_eq!(agg.content.as_deref(), Some("ok"));
    }

    #[test]
    fn completions_chunks_concatenate_text() {
        let mut agg = CompletionsAggregator::new();
        for event in [
            json!({"choices": [{"index": 0, "text": "Once upon"}]}),
            json!({"choices": [{"index": 0, "text": " a time"}]}),
            json!({"choices": [{"index": 0, "text": null, "finish_reason": "length"}]}),
        ] {
            if let Ok(chunk) = serde_json::from_value::<CompletionsChunk>(event) {
                agg.push_chunk(&chunk);
            }
        }
        let out = agg.finish();
        assert_eq!(out.text, "Once upon a time");
        assert_eq!(out.finish_reason.as_deref(), Some("length"));
    }
}
