//! Running merge of streamed deltas into final values.
//!
//! A frame may carry several signals at once (reasoning, content, refusal,
//! tool-call arguments, usage, finish reason). Text is merged by
//! concatenation. Content and refusal finish when the stream moves to another
//! segment. Tool calls keyed by index may interleave, so they stay open until
//! content or a refusal starts, a finish reason arrives, or the stream ends.
//! Each "finished" event fires at most once.

use std::collections::{BTreeMap, HashSet};

use crate::models::{FinishReason, Usage};
use crate::upstream::CompletionFrame;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorEvent {
    ReasoningDelta(String),
    ContentDelta(String),
    ContentFinished(String),
    RefusalFinished(String),
    ToolCallFinished(ToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Content,
    Refusal,
}

#[derive(Debug, Default)]
pub struct Accumulator {
    content: String,
    reasoning: String,
    refusal: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    active: Option<Segment>,
    content_finished: bool,
    refusal_finished: bool,
    finished_tool_calls: HashSet<u32>,
}

impl Accumulator {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn refusal(&self) -> &str {
        &self.refusal
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls.values()
    }

    /// Merges one frame and returns what it produced, in order.
    pub fn push(&mut self, frame: &CompletionFrame) -> Vec<AccumulatorEvent> {
        let mut events = Vec::new();

        if let Some(usage) = frame.usage {
            self.usage = Some(usage);
        }
        let Some(choice) = frame.primary_choice() else {
            return events;
        };
        let delta = &choice.delta;

        if let Some(reasoning) = delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
            self.reasoning.push_str(reasoning);
            events.push(AccumulatorEvent::ReasoningDelta(reasoning.to_string()));
        }

        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            self.enter(Segment::Content, &mut events);
            self.content.push_str(content);
            events.push(AccumulatorEvent::ContentDelta(content.to_string()));
        }

        if let Some(refusal) = delta.refusal.as_deref().filter(|r| !r.is_empty()) {
            self.enter(Segment::Refusal, &mut events);
            self.refusal.push_str(refusal);
        }

        if !delta.tool_calls.is_empty() {
            self.close_active(&mut events);
        }
        for call in &delta.tool_calls {
            let entry = self.tool_calls.entry(call.index).or_insert_with(|| ToolCall {
                index: call.index,
                ..ToolCall::default()
            });
            if let Some(id) = call.id.as_deref().filter(|id| !id.is_empty()) {
                entry.id = id.to_string();
            }
            if let Some(name) = call.function.name.as_deref() {
                entry.name.push_str(name);
            }
            if let Some(arguments) = call.function.arguments.as_deref() {
                entry.arguments.push_str(arguments);
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            self.finish_reason = Some(FinishReason::from_upstream(reason));
            self.close_active(&mut events);
            self.close_tool_calls(&mut events);
        }

        events
    }

    /// End of stream: closes whatever is still open.
    pub fn finish(&mut self) -> Vec<AccumulatorEvent> {
        let mut events = Vec::new();
        self.close_active(&mut events);
        self.close_tool_calls(&mut events);
        events
    }

    fn enter(&mut self, segment: Segment, events: &mut Vec<AccumulatorEvent>) {
        if self.active != Some(segment) {
            self.close_active(events);
            self.close_tool_calls(events);
            self.active = Some(segment);
        }
    }

    /// Finishes every open tool call in index order.
    fn close_tool_calls(&mut self, events: &mut Vec<AccumulatorEvent>) {
        for (index, call) in &self.tool_calls {
            if self.finished_tool_calls.insert(*index) {
                events.push(AccumulatorEvent::ToolCallFinished(call.clone()));
            }
        }
    }

    fn close_active(&mut self, events: &mut Vec<AccumulatorEvent>) {
        match self.active.take() {
            Some(Segment::Content) => {
                if !self.content_finished {
                    self.content_finished = true;
                    events.push(AccumulatorEvent::ContentFinished(self.content.clone()));
                }
            }
            Some(Segment::Refusal) => {
                if !self.refusal_finished {
                    self.refusal_finished = true;
                    events.push(AccumulatorEvent::RefusalFinished(self.refusal.clone()));
                }
            }
            None => {}
        }
    }
}
