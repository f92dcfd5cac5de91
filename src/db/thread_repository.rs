use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Thread, TitleStatus};

#[derive(Clone)]
pub struct ThreadRepository {
    pool: PgPool,
}

impl ThreadRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Thread>, AppError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, title, title_generation_status, created_at, updated_at
             FROM threads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find thread {id}: {e}");
            AppError::db_query(format!("Failed to find thread {id}"), e)
        })?;

        row.map(thread_from_row).transpose()
    }

    pub async fn save(&self, thread: &Thread) -> Result<Thread, AppError> {
        sqlx::query(
            "INSERT INTO threads (id, owner_user_id, title, title_generation_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&thread.id)
        .bind(&thread.owner_user_id)
        .bind(&thread.title)
        .bind(thread.title_generation_status.as_str())
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save thread {}: {e}", thread.id);
            AppError::db_query("Failed to save thread", e)
        })?;
        Ok(thread.clone())
    }

    pub async fn update_title(&self, id: &str, title: &str, status: TitleStatus) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE threads SET title = $1, title_generation_status = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(title)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update thread title {id}: {e}");
            AppError::db_query("Failed to update thread title", e)
        })?;
        Ok(())
    }

    pub async fn update_title_status(&self, id: &str, status: TitleStatus) -> Result<(), AppError> {
        sqlx::query("UPDATE threads SET title_generation_status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update thread title status {id}: {e}");
                AppError::db_query("Failed to update thread title status", e)
            })?;
        Ok(())
    }
}

fn thread_from_row(row: PgRow) -> Result<Thread, AppError> {
    let status: String = row
        .try_get("title_generation_status")
        .map_err(|e| AppError::db_query("Failed to read title_generation_status", e))?;
    Ok(Thread {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        owner_user_id: row
            .try_get("owner_user_id")
            .map_err(|e| AppError::db_query("Failed to read owner_user_id", e))?,
        title: row.try_get("title").map_err(|e| AppError::db_query("Failed to read title", e))?,
        title_generation_status: TitleStatus::try_from(status).map_err(AppError::Unexpected)?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AppError::db_query("Failed to read updated_at", e))?,
    })
}
