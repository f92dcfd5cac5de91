use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Message, MessageCompletion, MessageMeta, MessageParts, MessageRole, MessageStatus};

const MESSAGE_COLUMNS: &str = "id, parent_thread_id, parent_message_id, owner_user_id, model, role, status,
     parts, meta, attachments, created_at, updated_at";

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Message>, AppError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find message {id}: {e}");
                AppError::db_query(format!("Failed to find message {id}"), e)
            })?;

        row.map(message_from_row).transpose()
    }

    pub async fn save_all(&self, messages: &[Message]) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::db_query("Failed to open transaction", e))?;

        for message in messages {
            sqlx::query(
                "INSERT INTO messages (id, parent_thread_id, parent_message_id, owner_user_id, model, role,
                                       status, parts, meta, attachments, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(&message.id)
            .bind(&message.parent_thread_id)
            .bind(&message.parent_message_id)
            .bind(&message.owner_user_id)
            .bind(&message.model)
            .bind(message.role.as_str())
            .bind(message.status.as_str())
            .bind(Json(&message.parts))
            .bind(Json(&message.meta))
            .bind(Json(&message.attachments))
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to save message {}: {e}", message.id);
                AppError::db_query("Failed to save message", e)
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit messages", e))
    }

    pub async fn update_status(&self, id: &str, status: MessageStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE messages SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update status of message {id}: {e}");
                AppError::db_query("Failed to update message status", e)
            })?;
        Ok(())
    }

    pub async fn complete(&self, id: &str, completion: &MessageCompletion) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE messages SET status = $1, parts = $2, meta = $3, updated_at = $4 WHERE id = $5",
        )
        .bind(completion.status.as_str())
        .bind(Json(&completion.parts))
        .bind(Json(&completion.meta))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete message {id}: {e}");
            AppError::db_query("Failed to complete message", e)
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::message_not_found(id));
        }
        Ok(())
    }

    pub async fn find_api_key(&self, owner_user_id: &str) -> Result<Option<String>, AppError> {
        sqlx::query_scalar::<_, String>("SELECT key FROM api_keys WHERE owner_user_id = $1 LIMIT 1")
            .bind(owner_user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find API key for user {owner_user_id}: {e}");
                AppError::db_query("Failed to find API key", e)
            })
    }
}

fn message_from_row(row: PgRow) -> Result<Message, AppError> {
    let role_str: String = row.try_get("role").map_err(|e| AppError::db_query("Failed to read role", e))?;
    let role = MessageRole::try_from(role_str)
        .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
    let status_str: String = row
        .try_get("status")
        .map_err(|e| AppError::db_query("Failed to read status", e))?;
    let status = MessageStatus::try_from(status_str).map_err(AppError::Unexpected)?;

    // Optional JSON columns decode leniently: a NULL column is an empty value.
    let parts: Option<Json<MessageParts>> =
        row.try_get("parts").map_err(|e| AppError::db_query("Failed to read parts", e))?;
    let meta: Option<Json<MessageMeta>> =
        row.try_get("meta").map_err(|e| AppError::db_query("Failed to read meta", e))?;
    let attachments: Option<Json<Vec<String>>> = row
        .try_get("attachments")
        .map_err(|e| AppError::db_query("Failed to read attachments", e))?;
    let parent_message_id: Option<String> = row
        .try_get("parent_message_id")
        .map_err(|e| AppError::db_query("Failed to read parent_message_id", e))?;

    Ok(Message {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        parent_thread_id: row
            .try_get("parent_thread_id")
            .map_err(|e| AppError::db_query("Failed to read parent_thread_id", e))?,
        parent_message_id: parent_message_id.filter(|p| !p.is_empty()),
        owner_user_id: row
            .try_get("owner_user_id")
            .map_err(|e| AppError::db_query("Failed to read owner_user_id", e))?,
        model: row.try_get("model").map_err(|e| AppError::db_query("Failed to read model", e))?,
        role,
        status,
        parts: parts.map(|Json(p)| p).unwrap_or_default(),
        meta: meta.map(|Json(m)| m).unwrap_or_default(),
        attachments: attachments.map(|Json(a)| a).unwrap_or_default(),
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::db_query("Failed to read updated_at", e))?,
    })
}
