//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::TitleModel;
use crate::db::{BlobStore, ChatStore};
use crate::errors::AppError;
use crate::lineage::LineageResolver;
use crate::models::{
    Message, MessageCompletion, MessageParts, MessageRole, MessageStatus, ModelSelection, Thread, TitleStatus,
};
use crate::stream::StreamRegistry;
use crate::upstream::{
    CompletionFrame, CompletionProvider, CompletionRequest, FrameChoice, FrameDelta, FrameStream,
    UpstreamError,
};

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<String, Message>>,
    threads: Mutex<HashMap<String, Thread>>,
    api_keys: Mutex<HashMap<String, String>>,
    completions: Mutex<Vec<(String, MessageCompletion)>>,
}

impl MemoryStore {
    pub fn put_messages(&self, messages: impl IntoIterator<Item = Message>) {
        let mut map = self.messages.lock().unwrap();
        for message in messages {
            map.insert(message.id.clone(), message);
        }
    }

    pub fn put_thread(&self, thread: Thread) {
        self.threads.lock().unwrap().insert(thread.id.clone(), thread);
    }

    pub fn put_api_key(&self, owner_user_id: &str, key: &str) {
        self.api_keys.lock().unwrap().insert(owner_user_id.into(), key.into());
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    pub fn thread(&self, id: &str) -> Option<Thread> {
        self.threads.lock().unwrap().get(id).cloned()
    }

    pub fn all_messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().values().cloned().collect()
    }

    /// Every terminal write, in order.
    pub fn completions(&self) -> Vec<(String, MessageCompletion)> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        Ok(self.message(id))
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), AppError> {
        self.put_messages(messages.iter().cloned());
        Ok(())
    }

    async fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<(), AppError> {
        let mut map = self.messages.lock().unwrap();
        let message = map.get_mut(id).ok_or_else(|| AppError::message_not_found(id))?;
        message.status = status;
        Ok(())
    }

    async fn complete_message(&self, id: &str, completion: &MessageCompletion) -> Result<(), AppError> {
        {
            let mut map = self.messages.lock().unwrap();
            let message = map.get_mut(id).ok_or_else(|| AppError::message_not_found(id))?;
            message.status = completion.status;
            message.parts = completion.parts.clone();
            message.meta = completion.meta.clone();
        }
        self.completions.lock().unwrap().push((id.to_string(), completion.clone()));
        Ok(())
    }

    async fn find_api_key(&self, owner_user_id: &str) -> Result<Option<String>, AppError> {
        Ok(self.api_keys.lock().unwrap().get(owner_user_id).cloned())
    }

    async fn find_thread(&self, id: &str) -> Result<Option<Thread>, AppError> {
        Ok(self.thread(id))
    }

    async fn insert_thread(&self, thread: &Thread) -> Result<(), AppError> {
        self.put_thread(thread.clone());
        Ok(())
    }

    async fn set_thread_title(&self, id: &str, title: &str, status: TitleStatus) -> Result<(), AppError> {
        let mut map = self.threads.lock().unwrap();
        let thread = map.get_mut(id).ok_or_else(|| AppError::ThreadNotFound { id: id.into() })?;
        thread.title = title.to_string();
        thread.title_generation_status = status;
        Ok(())
    }

    async fn set_thread_title_status(&self, id: &str, status: TitleStatus) -> Result<(), AppError> {
        let mut map = self.threads.lock().unwrap();
        let thread = map.get_mut(id).ok_or_else(|| AppError::ThreadNotFound { id: id.into() })?;
        thread.title_generation_status = status;
        Ok(())
    }
}

// ── Blobs ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    reads: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn put(&self, base_path: &str, message_id: &str, file_name: &str, bytes: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(format!("{base_path}/{message_id}/{file_name}"), bytes.to_vec());
    }

    /// Keys read so far, in order.
    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, base_path: &str, message_id: &str, file_name: &str) -> Result<Vec<u8>, AppError> {
        let key = format!("{base_path}/{message_id}/{file_name}");
        self.reads.lock().unwrap().push(key.clone());
        self.blobs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(AppError::MissingAttachment { path: key })
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub type FrameSender = mpsc::UnboundedSender<Result<CompletionFrame, UpstreamError>>;

/// Provider whose frames are pushed by the test through a [`FrameSender`].
/// Dropping the sender ends the upstream stream.
#[derive(Default)]
pub struct ScriptedProvider {
    pending: Mutex<Vec<mpsc::UnboundedReceiver<Result<CompletionFrame, UpstreamError>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    open_error: Mutex<Option<UpstreamError>>,
}

impl ScriptedProvider {
    /// Queues one upstream stream and returns the handle that feeds it.
    pub fn script(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().push(rx);
        tx
    }

    pub fn fail_next_open(&self, error: UpstreamError) {
        *self.open_error.lock().unwrap() = Some(error);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<FrameStream, UpstreamError> {
        self.requests.lock().unwrap().push(request);
        if let Some(error) = self.open_error.lock().unwrap().take() {
            return Err(error);
        }
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return Err(UpstreamError::Request("no scripted stream".into()));
            }
            pending.remove(0)
        };
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

pub fn content_frame(text: &str) -> CompletionFrame {
    delta_frame(FrameDelta { content: Some(text.into()), ..FrameDelta::default() }, None)
}

pub fn reasoning_frame(text: &str) -> CompletionFrame {
    delta_frame(FrameDelta { reasoning: Some(text.into()), ..FrameDelta::default() }, None)
}

pub fn finish_frame(reason: &str) -> CompletionFrame {
    delta_frame(FrameDelta::default(), Some(reason))
}

pub fn delta_frame(delta: FrameDelta, finish_reason: Option<&str>) -> CompletionFrame {
    CompletionFrame {
        id: "gen-test".into(),
        choices: vec![FrameChoice { index: 0, delta, finish_reason: finish_reason.map(str::to_owned) }],
        usage: None,
    }
}

// ── Title model ───────────────────────────────────────────────────────────────

pub enum TitleBehaviour {
    Reply(String),
    Fail,
    Hang,
}

pub struct FakeTitleModel {
    pub behaviour: TitleBehaviour,
}

#[async_trait]
impl TitleModel for FakeTitleModel {
    async fn generate_title(&self, _api_key: &str, _first_message: &str) -> Result<String, AppError> {
        match &self.behaviour {
            TitleBehaviour::Reply(title) => Ok(title.clone()),
            TitleBehaviour::Fail => Err(AppError::Upstream { message: "title model down".into() }),
            TitleBehaviour::Hang => std::future::pending().await,
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

pub const ATTACHMENT_BASE: &str = "messages";

/// A registry wired to in-memory collaborators.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub provider: Arc<ScriptedProvider>,
    pub registry: StreamRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_queue_capacity(16)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        let store = Arc::new(MemoryStore::default());
        let blobs = Arc::new(MemoryBlobStore::default());
        let provider = Arc::new(ScriptedProvider::default());
        let resolver = LineageResolver::new(store.clone(), blobs.clone(), ATTACHMENT_BASE, 64);
        let registry = StreamRegistry::new(store.clone(), resolver, provider.clone(), queue_capacity);
        Self { store, blobs, provider, registry }
    }

    pub fn model(&self) -> ModelSelection {
        ModelSelection { provider_id: "test/model".into(), options: None }
    }

    /// Seeds a thread holding one completed user message and a pending
    /// assistant reply under it, and gives `owner` an API key.
    pub fn seed_exchange(&self, owner: &str, text: &str) -> (Message, Message) {
        let thread = Thread::new(owner.to_string());
        let user = Message::new(
            thread.id.clone(),
            None,
            owner.to_string(),
            MessageRole::User,
            MessageStatus::Completed,
            MessageParts::text(text),
        );
        let reply = Message::new(
            thread.id.clone(),
            Some(user.id.clone()),
            owner.to_string(),
            MessageRole::Assistant,
            MessageStatus::Pending,
            MessageParts::default(),
        );
        self.store.put_thread(thread);
        self.store.put_messages([user.clone(), reply.clone()]);
        self.store.put_api_key(owner, "sk-test");
        (user, reply)
    }
}
