use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::hub::StreamHub;
use crate::db::ChatStore;
use crate::errors::AppError;
use crate::lineage::LineageResolver;
use crate::models::{MessageStatus, ModelSelection};
use crate::upstream::CompletionProvider;

/// Live generations by message id. Built once in `main` and shared through
/// application state; an entry lives exactly as long as its stream.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, Arc<StreamHub>>>,
    store: Arc<dyn ChatStore>,
    resolver: LineageResolver,
    provider: Arc<dyn CompletionProvider>,
    queue_capacity: usize,
}

impl StreamRegistry {
    pub fn new(
        store: Arc<dyn ChatStore>,
        resolver: LineageResolver,
        provider: Arc<dyn CompletionProvider>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            store,
            resolver,
            provider,
            queue_capacity,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub(crate) fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    /// Starts generating `message_id` and returns its hub without waiting for
    /// the generation.
    ///
    /// The id is reserved before any I/O, so two concurrent starts for the
    /// same message cannot both succeed. If the transcript cannot be built the
    /// reservation is released and nothing is sent upstream.
    pub async fn start(
        &self,
        message_id: &str,
        owner_user_id: &str,
        model: ModelSelection,
    ) -> Result<Arc<StreamHub>, AppError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| AppError::message_not_found(message_id))?;
        if message.owner_user_id != owner_user_id {
            return Err(AppError::forbidden("message", message_id));
        }

        let hub = StreamHub::new(message_id, owner_user_id, model, self.queue_capacity);
        match self.streams.entry(message_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(AppError::AlreadyActive { message_id: message_id.to_string() });
            }
            Entry::Vacant(slot) => {
                slot.insert(hub.clone());
            }
        }

        let prepared = async {
            let transcript = self.resolver.context_for_regeneration(owner_user_id, message_id).await?;
            self.store.set_message_status(message_id, MessageStatus::Generating).await?;
            Ok::<_, AppError>(transcript)
        }
        .await;

        let transcript = match prepared {
            Ok(transcript) => transcript,
            Err(e) => {
                warn!("Could not start stream for message {message_id}: {e}");
                hub.abandon(&e.to_string());
                self.remove(&hub);
                return Err(e);
            }
        };

        info!(
            "Starting stream for message {message_id} with {:?} ({} transcript entries)",
            hub.model_id(),
            transcript.len()
        );
        tokio::spawn(hub.clone().run(transcript, self.clone()));
        Ok(hub)
    }

    /// The live hub for `message_id`, if any. A finished stream is gone and
    /// its final state must be read from storage.
    pub fn lookup(&self, message_id: &str, owner_user_id: &str) -> Result<Option<Arc<StreamHub>>, AppError> {
        let Some(hub) = self.streams.get(message_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        if hub.owner_user_id() != owner_user_id {
            return Err(AppError::forbidden("message", message_id));
        }
        Ok(Some(hub))
    }

    /// Deregisters `hub`, but only if it is still the registered instance for
    /// its message. Called by the hub itself at its terminal transition.
    pub(crate) fn remove(&self, hub: &Arc<StreamHub>) -> bool {
        let removed = self
            .streams
            .remove_if(hub.message_id(), |_, registered| Arc::ptr_eq(registered, hub))
            .is_some();
        if removed {
            debug!("Stream for message {} deregistered", hub.message_id());
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    /// Cancels every live stream and waits until each has persisted its
    /// terminal state.
    pub async fn shutdown(&self) {
        let hubs: Vec<Arc<StreamHub>> = self.streams.iter().map(|entry| entry.value().clone()).collect();
        if hubs.is_empty() {
            return;
        }

        info!("Cancelling {} active stream(s) before exit", hubs.len());
        for hub in &hubs {
            hub.cancel();
        }
        join_all(hubs.iter().map(|hub| hub.finished())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Chunk, ChunkKind};
    use crate::testing::{content_frame, finish_frame, Fixture};

    #[tokio::test]
    async fn second_start_while_active_is_rejected() {
        let fx = Fixture::new();
        let (_, reply) = fx.seed_exchange("u1", "hi");
        let upstream = fx.provider.script();

        let hub = fx.registry.start(&reply.id, "u1", fx.model()).await.unwrap();
        let err = fx.registry.start(&reply.id, "u1", fx.model()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(fx.registry.active_count(), 1);

        upstream.send(Ok(finish_frame("stop"))).unwrap();
        drop(upstream);
        hub.finished().await;
        assert_eq!(fx.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn restart_after_completion_succeeds() {
        let fx = Fixture::new();
        let (_, reply) = fx.seed_exchange("u1", "hi");

        for answer in ["first", "second"] {
            let upstream = fx.provider.script();
            let hub = fx.registry.start(&reply.id, "u1", fx.model()).await.unwrap();
            upstream.send(Ok(content_frame(answer))).unwrap();
            upstream.send(Ok(finish_frame("stop"))).unwrap();
            drop(upstream);
            hub.finished().await;
        }

        let stored = fx.store.message(&reply.id).unwrap();
        assert_eq!(stored.parts.content, "second");
        assert_eq!(stored.status, MessageStatus::Completed);
        assert_eq!(fx.store.completions().len(), 2);
    }

    #[tokio::test]
    async fn lookup_denies_other_owners() {
        let fx = Fixture::new();
        let (_, reply) = fx.seed_exchange("u1", "hi");
        let _upstream = fx.provider.script();
        let hub = fx.registry.start(&reply.id, "u1", fx.model()).await.unwrap();

        assert!(fx.registry.lookup(&reply.id, "u2").unwrap_err().is_forbidden());
        assert!(fx.registry.lookup(&reply.id, "u1").unwrap().is_some());
        assert!(fx.registry.lookup("nope", "u1").unwrap().is_none());

        hub.cancel();
        hub.finished().await;
        assert!(fx.registry.lookup(&reply.id, "u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn start_rejects_foreign_or_missing_messages() {
        let fx = Fixture::new();
        let (_, reply) = fx.seed_exchange("u1", "hi");

        assert!(fx.registry.start(&reply.id, "u2", fx.model()).await.unwrap_err().is_forbidden());
        assert!(fx.registry.start("missing", "u1", fx.model()).await.unwrap_err().is_not_found());
        assert_eq!(fx.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn broken_lineage_never_reaches_upstream() {
        let fx = Fixture::new();
        let (user, reply) = fx.seed_exchange("u1", "hi");
        let mut orphan = user.clone();
        orphan.parent_message_id = Some("vanished".into());
        fx.store.put_messages([orphan]);

        let err = fx.registry.start(&reply.id, "u1", fx.model()).await.unwrap_err();
        assert!(err.is_lineage());
        assert!(fx.provider.requests().is_empty());
        assert_eq!(fx.registry.active_count(), 0);
        assert_eq!(fx.store.message(&reply.id).unwrap().status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_persists_every_stream() {
        let fx = Fixture::new();
        let (_, first) = fx.seed_exchange("u1", "one");
        let (_, second) = fx.seed_exchange("u1", "two");
        let up1 = fx.provider.script();
        let hub = fx.registry.start(&first.id, "u1", fx.model()).await.unwrap();
        let mut rx = hub.subscribe("viewer");
        up1.send(Ok(content_frame("partial"))).unwrap();
        assert_eq!(rx.recv().await, Some(Chunk::content("partial")));

        let _up2 = fx.provider.script();
        fx.registry.start(&second.id, "u1", fx.model()).await.unwrap();
        assert_eq!(fx.registry.active_count(), 2);

        fx.registry.shutdown().await;
        assert_eq!(fx.registry.active_count(), 0);

        let stored = fx.store.message(&first.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Cancelled);
        assert_eq!(stored.parts.content, "partial");
        assert_eq!(fx.store.message(&second.id).unwrap().status, MessageStatus::Cancelled);
        assert_eq!(rx.recv().await, Some(Chunk::new(ChunkKind::Error, "")));
        assert_eq!(rx.recv().await, Some(Chunk::new(ChunkKind::FinishReason, "cancelled")));
        assert_eq!(rx.recv().await, None);
    }
}
