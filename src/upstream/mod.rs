//! Upstream streaming provider: the request we send and the frames we get back.
//!
//! Frames mirror the OpenAI-compatible `chat.completion.chunk` object. Every
//! field is optional on the wire and decodes leniently: a missing field or a
//! field of the wrong JSON type becomes an empty value instead of an error.

pub mod openrouter;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::lineage::TranscriptEntry;
use crate::models::{ModelOptions, Usage};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream read failed: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("request cancelled")]
    Cancelled,
}

/// One generation request: ordered transcript, model id and options.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub api_key: String,
    pub model: String,
    pub transcript: Vec<TranscriptEntry>,
    pub options: ModelOptions,
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<CompletionFrame, UpstreamError>> + Send>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Opens a streaming completion. `cancel` aborts the request while it is
    /// being opened; the returned stream is read under the same token by the caller.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, UpstreamError>;
}

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CompletionFrame {
    #[serde(default, deserialize_with = "lenient_string_or_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub choices: Vec<FrameChoice>,
    #[serde(default, deserialize_with = "lenient")]
    pub usage: Option<Usage>,
}

impl CompletionFrame {
    /// The only choice we read: generation is single-choice.
    pub fn primary_choice(&self) -> Option<&FrameChoice> {
        self.choices.iter().find(|c| c.index == 0).or_else(|| self.choices.first())
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FrameChoice {
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub index: u32,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub delta: FrameDelta,
    #[serde(default, deserialize_with = "lenient_string")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FrameDelta {
    #[serde(default, deserialize_with = "lenient_string")]
    pub role: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: Option<String>,
    /// Reasoning side-channel, separate from `content`. Not part of the base
    /// OpenAI schema; OpenRouter sends it for reasoning models.
    #[serde(default, deserialize_with = "lenient_string")]
    pub reasoning: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub refusal: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub index: u32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FunctionDelta {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub arguments: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }))
}

fn lenient_string_or_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(lenient_string(d)?.unwrap_or_default())
}

fn lenient<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_or_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    Ok(lenient(d)?.unwrap_or_default())
}

fn lenient_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}
