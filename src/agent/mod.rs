use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::CompletionClient;
use rig::providers::openrouter;
use tracing::error;

use crate::errors::AppError;

const TITLE_PREAMBLE: &str = "You are generating a title for a chat thread between a user and an AI \
                              assistant. You are given the first message in the thread by the user. \
                              Generate a concise and descriptive title for the thread based on this \
                              message. Output only the title and nothing else.";
const TITLE_MAX_TOKENS: u64 = 330;

/// Produces a short thread title from the first user message.
#[async_trait]
pub trait TitleModel: Send + Sync {
    async fn generate_title(&self, api_key: &str, first_message: &str) -> Result<String, AppError>;
}

/// [`TitleModel`] backed by a rig OpenRouter agent. A fresh client is built per
/// call because every user brings their own key.
#[derive(Clone)]
pub struct OpenRouterTitleModel {
    base_url: String,
    model: String,
}

impl OpenRouterTitleModel {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self { base_url: base_url.to_string(), model: model.to_string() }
    }
}

#[async_trait]
impl TitleModel for OpenRouterTitleModel {
    async fn generate_title(&self, api_key: &str, first_message: &str) -> Result<String, AppError> {
        let client: openrouter::Client = openrouter::Client::builder()
            .api_key(api_key)
            .base_url(&self.base_url)
            .build()
            .map_err(|e| AppError::Upstream { message: format!("Failed to build OpenRouter client: {e}") })?;

        let agent = client
            .agent(&self.model)
            .preamble(TITLE_PREAMBLE)
            .max_tokens(TITLE_MAX_TOKENS)
            .build();

        agent
            .prompt(format!("<first_message>{first_message}</first_message>"))
            .await
            .map_err(|e| {
                error!("Title generation with {} failed: {e}", self.model);
                AppError::Upstream { message: e.to_string() }
            })
    }
}
