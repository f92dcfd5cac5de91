use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::db::ChatStore;
use crate::errors::AppError;
use crate::models::{
    new_id, EditMessageRequest, Message, MessageMeta, MessageParts, MessageRole, MessageStatus, ModelSelection,
    RegenerateMessageRequest, SendMessageRequest, SendMessageResponse, Thread,
};
use crate::service::title_task::TitleTask;
use crate::stream::{StreamHub, StreamRegistry};

const MAX_MESSAGE_LENGTH: usize = 50_000;

/// Where a viewer reads a reply from: the live hub, or storage once the
/// generation is over.
#[derive(Debug)]
pub enum StreamSource {
    Live(Arc<StreamHub>),
    Stored(Message),
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    registry: StreamRegistry,
    titles: TitleTask,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, registry: StreamRegistry, titles: TitleTask) -> Self {
        Self { store, registry, titles }
    }

    /// Persists a user message plus a pending assistant reply and starts
    /// generating the reply. Without a thread id a new thread is created and
    /// its title is generated in the background.
    pub async fn send_message(
        &self,
        owner_user_id: &str,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        validate_content(&request.content)?;
        validate_model(&request.response_model)?;

        // ── Resolve or create thread ──────────────────────────────────────────
        let (thread, created) = match request.thread_id.as_deref().filter(|id| !id.is_empty()) {
            Some(thread_id) => (self.owned_thread(owner_user_id, thread_id).await?, false),
            None => {
                if request.parent_message_id.is_some() {
                    return Err(AppError::InvalidInput {
                        message: "a parent message requires a thread id".into(),
                    });
                }
                (Thread::new(owner_user_id.to_string()), true)
            }
        };

        let parent_message_id = match request.parent_message_id.as_deref().filter(|id| !id.is_empty()) {
            Some(parent_id) => {
                let parent = self.owned_message(owner_user_id, parent_id).await?;
                if parent.parent_thread_id != thread.id {
                    return Err(AppError::InvalidInput {
                        message: format!("message '{parent_id}' belongs to another thread"),
                    });
                }
                Some(parent.id)
            }
            None => None,
        };

        // ── Persist user message and pending reply ────────────────────────────
        if created {
            self.store.insert_thread(&thread).await?;
            info!("Created thread {} for user {owner_user_id}", thread.id);
        }

        let user_message = Message::new(
            thread.id.clone(),
            parent_message_id,
            owner_user_id.to_string(),
            MessageRole::User,
            MessageStatus::Completed,
            MessageParts::text(request.content.clone()),
        );
        let response_message =
            self.open_reply(owner_user_id, &user_message, request.response_model).await?;

        if created {
            self.titles.spawn(owner_user_id, &thread.id, &request.content);
        }

        Ok(SendMessageResponse { thread_id: thread.id, user_message, response_message })
    }

    /// Branches a user message: stores an edited copy beside it and
    /// generates a fresh reply under the copy.
    pub async fn edit_message(
        &self,
        owner_user_id: &str,
        message_id: &str,
        request: EditMessageRequest,
    ) -> Result<SendMessageResponse, AppError> {
        validate_content(&request.content)?;
        validate_model(&request.response_model)?;

        let source = self.owned_message(owner_user_id, message_id).await?;
        if source.role != MessageRole::User {
            return Err(AppError::InvalidInput { message: "only user messages can be edited".into() });
        }

        let mut edited = sibling_of(&source);
        edited.parts = MessageParts::text(request.content);
        edited.status = MessageStatus::Completed;
        edited.meta.edited = true;
        edited.meta.original_message_id = Some(source.attachment_owner_id().to_string());

        let response_message = self.open_reply(owner_user_id, &edited, request.response_model).await?;
        debug!("Message {message_id} edited as {}", edited.id);

        Ok(SendMessageResponse {
            thread_id: edited.parent_thread_id.clone(),
            user_message: edited,
            response_message,
        })
    }

    /// Branches an assistant reply. With `content` the copy is a hand-written
    /// replacement and nothing is generated; otherwise the copy is generated
    /// again from the same context.
    pub async fn regenerate_message(
        &self,
        owner_user_id: &str,
        thread_id: &str,
        message_id: &str,
        request: RegenerateMessageRequest,
    ) -> Result<Message, AppError> {
        let source = self.owned_message(owner_user_id, message_id).await?;
        if source.role != MessageRole::Assistant {
            return Err(AppError::InvalidInput { message: "only assistant messages can be regenerated".into() });
        }
        if source.parent_thread_id != thread_id {
            return Err(AppError::InvalidInput {
                message: format!("message '{message_id}' does not belong to thread '{thread_id}'"),
            });
        }

        let mut copy = sibling_of(&source);

        if let Some(content) = request.content {
            validate_content(&content)?;
            copy.parts = MessageParts::text(content);
            copy.status = MessageStatus::Completed;
            copy.meta.edited = true;
            copy.meta.original_message_id = Some(source.attachment_owner_id().to_string());
            self.store.insert_messages(std::slice::from_ref(&copy)).await?;
            info!("Message {message_id} replaced by hand as {}", copy.id);
            return Ok(copy);
        }

        validate_model(&request.response_model)?;
        copy.parts = MessageParts::default();
        copy.status = MessageStatus::Pending;
        copy.model = request.response_model.provider_id.clone();
        copy.meta = MessageMeta { model_options: request.response_model.options.clone(), ..MessageMeta::default() };
        self.store.insert_messages(std::slice::from_ref(&copy)).await?;

        self.registry.start(&copy.id, owner_user_id, request.response_model).await?;
        copy.status = MessageStatus::Generating;
        info!("Regenerating message {message_id} as {}", copy.id);
        Ok(copy)
    }

    /// Cancels the live generation of `message_id` and waits for its final
    /// state to be stored.
    pub async fn stop(&self, owner_user_id: &str, message_id: &str) -> Result<(), AppError> {
        let hub = self
            .registry
            .lookup(message_id, owner_user_id)?
            .ok_or_else(|| AppError::message_not_found(message_id))?;
        hub.cancel();
        hub.finished().await;
        Ok(())
    }

    pub async fn stream_source(&self, owner_user_id: &str, message_id: &str) -> Result<StreamSource, AppError> {
        if let Some(hub) = self.registry.lookup(message_id, owner_user_id)? {
            return Ok(StreamSource::Live(hub));
        }
        let message = self.owned_message(owner_user_id, message_id).await?;
        Ok(StreamSource::Stored(message))
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Stores `prompt` with a pending assistant reply under it and starts the
    /// reply's stream. Returns the reply.
    async fn open_reply(
        &self,
        owner_user_id: &str,
        prompt: &Message,
        model: ModelSelection,
    ) -> Result<Message, AppError> {
        let mut reply = Message::new(
            prompt.parent_thread_id.clone(),
            Some(prompt.id.clone()),
            owner_user_id.to_string(),
            MessageRole::Assistant,
            MessageStatus::Pending,
            MessageParts::default(),
        );
        reply.model = model.provider_id.clone();
        reply.meta.model_options = model.options.clone();

        self.store.insert_messages(&[prompt.clone(), reply.clone()]).await?;
        self.registry.start(&reply.id, owner_user_id, model).await?;

        reply.status = MessageStatus::Generating;
        Ok(reply)
    }

    async fn owned_thread(&self, owner_user_id: &str, thread_id: &str) -> Result<Thread, AppError> {
        let thread = self
            .store
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| AppError::ThreadNotFound { id: thread_id.to_string() })?;
        if thread.owner_user_id != owner_user_id {
            return Err(AppError::forbidden("thread", thread_id));
        }
        Ok(thread)
    }

    async fn owned_message(&self, owner_user_id: &str, message_id: &str) -> Result<Message, AppError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or_else(|| AppError::message_not_found(message_id))?;
        if message.owner_user_id != owner_user_id {
            return Err(AppError::forbidden("message", message_id));
        }
        Ok(message)
    }
}

/// Copy of `source` under a new id, attached to the same parent.
fn sibling_of(source: &Message) -> Message {
    let now = Utc::now();
    Message { id: new_id(), created_at: now, updated_at: now, ..source.clone() }
}

fn validate_content(content: &str) -> Result<(), AppError> {
    if content.trim().is_empty() {
        return Err(AppError::EmptyField { field_name: "content".to_string() });
    }
    let length = content.chars().count();
    if length > MAX_MESSAGE_LENGTH {
        return Err(AppError::FieldTooLong {
            field_name: "content".to_string(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: length,
        });
    }
    Ok(())
}

fn validate_model(model: &ModelSelection) -> Result<(), AppError> {
    if model.provider_id.trim().is_empty() {
        return Err(AppError::EmptyField { field_name: "responseModel.providerId".to_string() });
    }
    Ok(())
}
