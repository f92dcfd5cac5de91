//! One in-flight generation and its viewers.
//!
//! Lock order is always `state` then `subscribers`. `unsubscribe` only takes
//! `subscribers`.
//!
//! Live delivery is best-effort: a subscriber whose queue is full misses that
//! chunk, and the upstream loop never waits for it. Viewers that fell behind
//! must treat the persisted message as the authoritative transcript.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::accumulator::{Accumulator, AccumulatorEvent};
use super::chunk::{Chunk, ChunkKind};
use super::registry::StreamRegistry;
use crate::lineage::TranscriptEntry;
use crate::models::{FinishReason, MessageCompletion, MessageMeta, MessageParts, MessageStatus, ModelSelection};
use crate::upstream::{CompletionRequest, UpstreamError};

/// Largest replay a new subscriber can receive: reasoning, content, finish reason.
const SNAPSHOT_LEN: usize = 3;
/// How long a lagging subscriber gets to make room for the terminal chunk.
const TERMINAL_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct HubState {
    chunks: Vec<Chunk>,
    content: String,
    reasoning: String,
    terminal: Option<Chunk>,
}

impl HubState {
    fn snapshot(&self) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(SNAPSHOT_LEN);
        if !self.reasoning.is_empty() {
            chunks.push(Chunk::reasoning(self.reasoning.clone()));
        }
        if !self.content.is_empty() {
            chunks.push(Chunk::content(self.content.clone()));
        }
        if let Some(terminal) = &self.terminal {
            chunks.push(terminal.clone());
        }
        chunks
    }
}

enum StreamOutcome {
    Finished,
    Failed(String),
    Cancelled,
}

pub struct StreamHub {
    message_id: String,
    owner_user_id: String,
    model: ModelSelection,
    queue_capacity: usize,
    state: Mutex<HubState>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<Chunk>>>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("message_id", &self.message_id)
            .field("owner_user_id", &self.owner_user_id)
            .field("model", &self.model.provider_id)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamHub {
    pub(crate) fn new(
        message_id: &str,
        owner_user_id: &str,
        model: ModelSelection,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            message_id: message_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            model,
            queue_capacity: queue_capacity.max(SNAPSHOT_LEN),
            state: Mutex::new(HubState::default()),
            subscribers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn model_id(&self) -> &str {
        &self.model.provider_id
    }

    /// Every chunk produced so far, in arrival order.
    #[cfg(test)]
    pub fn chunks(&self) -> Vec<Chunk> {
        lock(&self.state).chunks.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Requests cooperative cancellation. An upstream read already in flight is
    /// abandoned; the stream then finishes as `cancelled`.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling stream for message {}", self.message_id);
            self.cancel.cancel();
        }
    }

    /// Resolves once the final state is persisted and the hub has left the registry.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Registers a viewer and returns its delivery queue.
    ///
    /// The queue first receives a replay of what has accumulated (reasoning,
    /// then content), then every chunk produced afterwards. Registration and
    /// replay happen under the chunk lock, so a concurrent broadcast lands
    /// either inside the replay or after it, never in both and never in
    /// neither. A stream that has already completed replays its finish reason
    /// too and closes the queue straight away.
    pub fn subscribe(&self, subscriber_id: impl Into<String>) -> mpsc::Receiver<Chunk> {
        let subscriber_id = subscriber_id.into();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let state = lock(&self.state);
        let mut subscribers = lock(&self.subscribers);

        for chunk in state.snapshot() {
            // Fresh queue with room for a full snapshot.
            let _ = tx.try_send(chunk);
        }
        if state.terminal.is_none() {
            debug!("Subscriber {subscriber_id} joined stream {}", self.message_id);
            subscribers.insert(subscriber_id, tx);
        }

        rx
    }

    /// Removes a viewer and closes its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        if lock(&self.subscribers).remove(subscriber_id).is_some() {
            debug!("Subscriber {subscriber_id} left stream {}", self.message_id);
        }
    }

    // ── Fan-out ──────────────────────────────────────────────────────────────

    fn publish(&self, kind: ChunkKind, content: impl Into<String>) {
        let chunk = Chunk::new(kind, content);

        let mut state = lock(&self.state);
        match kind {
            ChunkKind::Content => state.content.push_str(&chunk.content),
            ChunkKind::Reasoning => state.reasoning.push_str(&chunk.content),
            _ => {}
        }
        state.chunks.push(chunk.clone());

        let message_id = &self.message_id;
        lock(&self.subscribers).retain(|id, tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Subscriber {id} of {message_id} is lagging, dropping chunk");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Appends the single finish-reason chunk, marks the stream complete and
    /// closes every queue. Returns the accumulated (content, reasoning).
    fn close(&self, finish_reason: FinishReason) -> (String, String) {
        let chunk = Chunk::new(ChunkKind::FinishReason, finish_reason.as_str());

        let mut state = lock(&self.state);
        state.chunks.push(chunk.clone());
        state.terminal = Some(chunk.clone());

        let subscribers: Vec<_> = lock(&self.subscribers).drain().collect();
        for (id, tx) in subscribers {
            match tx.try_send(chunk.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(chunk)) => {
                    debug!("Subscriber {id} is lagging, delivering finish reason in the background");
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(TERMINAL_DELIVERY_TIMEOUT, tx.send(chunk)).await;
                    });
                }
            }
        }

        (state.content.clone(), state.reasoning.clone())
    }

    /// Ends a stream that never got to run. Viewers that already joined see
    /// the failure and a closed queue; nothing is persisted.
    pub(crate) fn abandon(&self, reason: &str) {
        self.publish(ChunkKind::Error, format!("Error: {reason}"));
        self.close(FinishReason::Error);
        self.cancel.cancel();
        self.finished.cancel();
    }

    // ── Consumption ──────────────────────────────────────────────────────────

    /// Consumption loop plus terminal transition. Spawned exactly once per hub
    /// by [`StreamRegistry::start`]; finalisation is reached from here only.
    pub(crate) async fn run(self: Arc<Self>, transcript: Vec<TranscriptEntry>, registry: StreamRegistry) {
        let started = Instant::now();
        let mut acc = Accumulator::default();

        let outcome = self.consume(&registry, transcript, &mut acc).await;
        debug!(
            "Stream for message {} accumulated {} content bytes, {} reasoning bytes, {} tool call(s); \
             {} viewer(s) attached",
            self.message_id,
            acc.content().len(),
            acc.reasoning().len(),
            acc.tool_calls().count(),
            self.subscriber_count()
        );
        self.finalize(&registry, &acc, outcome).await;

        debug!(
            "Stream for message {} consumed and cleaned up in {:?}",
            self.message_id,
            started.elapsed()
        );
    }

    async fn consume(
        &self,
        registry: &StreamRegistry,
        transcript: Vec<TranscriptEntry>,
        acc: &mut Accumulator,
    ) -> StreamOutcome {
        let api_key = match registry.store().find_api_key(&self.owner_user_id).await {
            Ok(Some(key)) if !key.is_empty() => key,
            Ok(_) => {
                return StreamOutcome::Failed(format!("no API key found for user {}", self.owner_user_id))
            }
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        };

        let request = CompletionRequest {
            api_key,
            model: self.model.provider_id.clone(),
            transcript,
            options: self.model.options.clone().unwrap_or_default(),
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return StreamOutcome::Cancelled,
            opened = registry.provider().stream_completion(request, self.cancel.clone()) => opened,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(UpstreamError::Cancelled) => return StreamOutcome::Cancelled,
            Err(e) => return StreamOutcome::Failed(e.to_string()),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Stream for message {} cancelled", self.message_id);
                    return StreamOutcome::Cancelled;
                }
                next = frames.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    for event in acc.push(&frame) {
                        self.apply(event);
                    }
                }
                Some(Err(e)) => return StreamOutcome::Failed(e.to_string()),
                None => {
                    for event in acc.finish() {
                        self.apply(event);
                    }
                    return StreamOutcome::Finished;
                }
            }
        }
    }

    fn apply(&self, event: AccumulatorEvent) {
        match event {
            AccumulatorEvent::ReasoningDelta(text) => self.publish(ChunkKind::Reasoning, text),
            AccumulatorEvent::ContentDelta(text) => self.publish(ChunkKind::Content, text),
            AccumulatorEvent::ContentFinished(content) => {
                debug!("Content of {} finished ({} bytes)", self.message_id, content.len())
            }
            AccumulatorEvent::RefusalFinished(refusal) => {
                debug!("Refusal on {}: {refusal}", self.message_id);
                self.publish(ChunkKind::Error, refusal);
            }
            AccumulatorEvent::ToolCallFinished(call) => {
                debug!("Tool call {} ({}) finished on {}", call.id, call.name, self.message_id);
                self.publish(ChunkKind::UnknownTool, call.arguments);
            }
        }
    }

    async fn finalize(self: &Arc<Self>, registry: &StreamRegistry, acc: &Accumulator, outcome: StreamOutcome) {
        let (finish_reason, status, error) = match outcome {
            StreamOutcome::Finished => {
                let finish_reason = acc.finish_reason().unwrap_or(FinishReason::Unknown);
                if finish_reason == FinishReason::Error {
                    let message = "provider ended the generation with an error".to_string();
                    error!("Stream for message {} failed: {message}", self.message_id);
                    self.publish(ChunkKind::Error, format!("Error: {message}"));
                    (finish_reason, MessageStatus::Failed, message)
                } else if acc.refusal().is_empty() {
                    (finish_reason, MessageStatus::Completed, String::new())
                } else {
                    (finish_reason, MessageStatus::Refused, acc.refusal().to_string())
                }
            }
            StreamOutcome::Failed(message) => {
                error!("Stream for message {} failed: {message}", self.message_id);
                self.publish(ChunkKind::Error, format!("Error: {message}"));
                (FinishReason::Error, MessageStatus::Failed, message)
            }
            StreamOutcome::Cancelled => {
                self.publish(ChunkKind::Error, "");
                (FinishReason::Cancelled, MessageStatus::Cancelled, "stream cancelled".to_string())
            }
        };

        let (content, reasoning) = self.close(finish_reason);

        let completion = MessageCompletion {
            status,
            parts: MessageParts { content, reasoning, error },
            meta: MessageMeta {
                usage: acc.usage(),
                finish_reason: Some(finish_reason),
                model_options: self.model.options.clone(),
                ..MessageMeta::default()
            },
        };
        if let Err(e) = registry.store().complete_message(&self.message_id, &completion).await {
            error!("Failed to persist final state of message {}: {e}", self.message_id);
        }

        if !registry.remove(self) {
            warn!("Stream for message {} was not registered at completion", self.message_id);
        }
        self.cancel.cancel();
        self.finished.cancel();

        info!("Stream for message {} finished: {finish_reason} ({status})", self.message_id);
    }
}
