use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_THREAD_TITLE: &str = "New Thread";

/// Time-ordered message/thread id (UUIDv7), so lexical order follows creation.
pub fn new_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

// ── Threads ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleStatus {
    Generating,
    Completed,
    Failed,
}

impl TitleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TitleStatus::Generating => "generating",
            TitleStatus::Completed => "completed",
            TitleStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for TitleStatus {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "generating" => Ok(TitleStatus::Generating),
            "completed" => Ok(TitleStatus::Completed),
            "failed" => Ok(TitleStatus::Failed),
            other => Err(format!("Unknown title status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub owner_user_id: String,
    pub title: String,
    pub title_generation_status: TitleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(owner_user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            owner_user_id,
            title: DEFAULT_THREAD_TITLE.to_string(),
            title_generation_status: TitleStatus::Generating,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Generating,
    Completed,
    Failed,
    Refused,
    Cancelled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Generating => "generating",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Refused => "refused",
            MessageStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageStatus {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(MessageStatus::Pending),
            "generating" => Ok(MessageStatus::Generating),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "refused" => Ok(MessageStatus::Refused),
            "cancelled" => Ok(MessageStatus::Cancelled),
            other => Err(format!("Unknown message status: {other}")),
        }
    }
}

/// Terminal classification of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Unknown,
    Stop,
    Length,
    ToolCall,
    FunctionCall,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Unknown => "unknown",
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCall => "tool_call",
            FinishReason::FunctionCall => "function_call",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
        }
    }

    /// Maps the provider's `finish_reason` string. Anything unrecognised is `Unknown`.
    pub fn from_upstream(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_call" | "tool_calls" => FinishReason::ToolCall,
            "function_call" => FinishReason::FunctionCall,
            "error" => FinishReason::Error,
            _ => FinishReason::Unknown,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Off,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Off => "off",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    #[serde(default)]
    pub web_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Which upstream model answers, and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSelection {
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
}

/// Token totals as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageParts {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl MessageParts {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default)]
    pub edited: bool,
    /// First version in the edit lineage; attachment blobs live under this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_options: Option<ModelOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub parent_thread_id: String,
    /// `None` only for the root of a thread.
    pub parent_message_id: Option<String>,
    pub owner_user_id: String,
    pub model: String,
    pub role: MessageRole,
    pub status: MessageStatus,
    pub parts: MessageParts,
    pub meta: MessageMeta,
    /// Attachment file names, in upload order.
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        parent_thread_id: String,
        parent_message_id: Option<String>,
        owner_user_id: String,
        role: MessageRole,
        status: MessageStatus,
        parts: MessageParts,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            parent_thread_id,
            parent_message_id,
            owner_user_id,
            model: String::new(),
            role,
            status,
            parts,
            meta: MessageMeta::default(),
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Id under which this message's attachment blobs are stored.
    pub fn attachment_owner_id(&self) -> &str {
        if self.meta.edited {
            if let Some(original) = self.meta.original_message_id.as_deref() {
                if !original.is_empty() {
                    return original;
                }
            }
        }
        &self.id
    }
}

/// Everything the terminal transition of a stream writes, in one update.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageCompletion {
    pub status: MessageStatus,
    pub parts: MessageParts,
    pub meta: MessageMeta,
}

// ── API payloads ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    pub content: String,
    pub response_model: ModelSelection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub content: String,
    pub response_model: ModelSelection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateMessageRequest {
    /// When present, the caller is replacing the reply by hand instead of regenerating it.
    #[serde(default)]
    pub content: Option<String>,
    pub response_model: ModelSelection,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub thread_id: String,
    pub user_message: Message,
    pub response_message: Message,
}
