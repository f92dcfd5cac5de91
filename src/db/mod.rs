pub mod blob_store;
pub mod message_repository;
pub mod thread_repository;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{Message, MessageCompletion, MessageStatus, Thread, TitleStatus};

use self::message_repository::MessageRepository;
use self::thread_repository::ThreadRepository;

/// Persistence gateway used by the lineage resolver, the stream hub and the
/// chat service.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError>;

    /// Inserts every message in one transaction.
    async fn insert_messages(&self, messages: &[Message]) -> Result<(), AppError>;

    async fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<(), AppError>;

    /// Writes status, parts and meta of a finished generation as one update.
    async fn complete_message(&self, id: &str, completion: &MessageCompletion) -> Result<(), AppError>;

    /// The caller's stored upstream credential, if any.
    async fn find_api_key(&self, owner_user_id: &str) -> Result<Option<String>, AppError>;

    async fn find_thread(&self, id: &str) -> Result<Option<Thread>, AppError>;

    async fn insert_thread(&self, thread: &Thread) -> Result<(), AppError>;

    async fn set_thread_title(&self, id: &str, title: &str, status: TitleStatus) -> Result<(), AppError>;

    async fn set_thread_title_status(&self, id: &str, status: TitleStatus) -> Result<(), AppError>;
}

/// Raw attachment bytes, addressed by `(base path, owning message id, file name)`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, base_path: &str, message_id: &str, file_name: &str) -> Result<Vec<u8>, AppError>;
}

/// Postgres-backed [`ChatStore`].
#[derive(Clone)]
pub struct PgChatStore {
    messages: MessageRepository,
    threads: ThreadRepository,
}

impl PgChatStore {
    pub fn new(messages: MessageRepository, threads: ThreadRepository) -> Self {
        Self { messages, threads }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, AppError> {
        self.messages.find_by_id(id).await
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), AppError> {
        self.messages.save_all(messages).await
    }

    async fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<(), AppError> {
        self.messages.update_status(id, status).await
    }

    async fn complete_message(&self, id: &str, completion: &MessageCompletion) -> Result<(), AppError> {
        self.messages.complete(id, completion).await
    }

    async fn find_api_key(&self, owner_user_id: &str) -> Result<Option<String>, AppError> {
        self.messages.find_api_key(owner_user_id).await
    }

    async fn find_thread(&self, id: &str) -> Result<Option<Thread>, AppError> {
        self.threads.find_by_id(id).await
    }

    async fn insert_thread(&self, thread: &Thread) -> Result<(), AppError> {
        self.threads.save(thread).await.map(|_| ())
    }

    async fn set_thread_title(&self, id: &str, title: &str, status: TitleStatus) -> Result<(), AppError> {
        self.threads.update_title(id, title, status).await
    }

    async fn set_thread_title_status(&self, id: &str, status: TitleStatus) -> Result<(), AppError> {
        self.threads.update_title_status(id, status).await
    }
}
