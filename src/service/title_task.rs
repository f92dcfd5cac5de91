use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::TitleModel;
use crate::db::ChatStore;
use crate::errors::AppError;
use crate::models::{TitleStatus, DEFAULT_THREAD_TITLE};

const MAX_TITLE_CHARS: usize = 250;

/// Names a new thread after its first message, off the request path.
#[derive(Clone)]
pub struct TitleTask {
    store: Arc<dyn ChatStore>,
    model: Arc<dyn TitleModel>,
    timeout: Duration,
}

impl TitleTask {
    pub fn new(store: Arc<dyn ChatStore>, model: Arc<dyn TitleModel>, timeout: Duration) -> Self {
        Self { store, model, timeout }
    }

    /// Runs generation in the background under the configured timeout. Any
    /// failure ends with the thread's title status set to `failed`.
    pub fn spawn(&self, owner_user_id: &str, thread_id: &str, first_message: &str) -> JoinHandle<()> {
        let task = self.clone();
        let owner_user_id = owner_user_id.to_string();
        let thread_id = thread_id.to_string();
        let first_message = first_message.to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                task.timeout,
                task.generate(&owner_user_id, &thread_id, &first_message),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    info!("Title for thread {thread_id} settled in {:?}", started.elapsed());
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {:?}", task.timeout),
            };

            warn!("Title generation for thread {thread_id} failed: {failure}");
            if let Err(e) = task.store.set_thread_title_status(&thread_id, TitleStatus::Failed).await {
                error!("Failed to mark title of thread {thread_id} as failed: {e}");
            }
        })
    }

    async fn generate(&self, owner_user_id: &str, thread_id: &str, first_message: &str) -> Result<(), AppError> {
        let api_key = self
            .store
            .find_api_key(owner_user_id)
            .await?
            .filter(|key| !key.is_empty())
            .ok_or_else(|| AppError::Upstream { message: format!("no API key found for user {owner_user_id}") })?;

        let raw = self.model.generate_title(&api_key, first_message).await?;

        let thread = self
            .store
            .find_thread(thread_id)
            .await?
            .ok_or_else(|| AppError::ThreadNotFound { id: thread_id.to_string() })?;
        if thread.title != DEFAULT_THREAD_TITLE {
            info!("Thread {thread_id} already has a title, keeping it");
            return self.store.set_thread_title_status(thread_id, TitleStatus::Completed).await;
        }

        let title = sanitize_title(&raw);
        if title.is_empty() {
            return Err(AppError::Upstream { message: "title model returned an empty title".into() });
        }
        self.store.set_thread_title(thread_id, &title, TitleStatus::Completed).await
    }
}

/// Trims, caps at 250 characters and drops one pair of surrounding quotes or backticks.
pub fn sanitize_title(raw: &str) -> String {
    let capped: String = raw.trim().chars().take(MAX_TITLE_CHARS).collect();
    for quote in ['"', '\'', '`'] {
        if capped.len() > 1 && capped.starts_with(quote) && capped.ends_with(quote) {
            return capped[1..capped.len() - 1].trim().to_string();
        }
    }
    capped
}
