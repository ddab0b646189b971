use sqlx::PgPool;
use tracing::error;

use crate::db::message_repository::insert_message;
use crate::errors::AppError;
use crate::models::{SessionMessage, SessionSummary};

#[derive(Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<SessionSummary>, AppError> {
        sqlx::query_as::<_, SessionSummary>(
            "SELECT id, name, created_at, updated_at FROM sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch all sessions: {e}");
            AppError::db_query("Failed to fetch sessions", e)
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<SessionSummary>, AppError> {
        sqlx::query_as::<_, SessionSummary>(
            "SELECT id, name, created_at, updated_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find session {id}: {e}");
            AppError::db_query(format!("Failed to find session {id}"), e)
        })
    }

    /// Inserts a new session together with its opening messages.
    ///
    /// Returns `false` without writing anything when a session with this id
    /// already exists.
    pub async fn create(&self, session: &SessionSummary, opening: &[SessionMessage]) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to open transaction for session {}: {e}", session.id);
            AppError::db_query("Failed to begin transaction", e)
        })?;

        let inserted = sqlx::query(
            "INSERT INTO sessions (id, name, created_at, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save session {}: {e}", session.id);
            AppError::db_query("Failed to save session", e)
        })?
        .rows_affected()
            == 1;

        if !inserted {
            return Ok(false);
        }

        for message in opening {
            insert_message(&mut *tx, &session.id, message).await.map_err(|e| {
                error!("Failed to save opening message for session {}: {e}", session.id);
                AppError::db_query("Failed to save message", e)
            })?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit session {}: {e}", session.id);
            AppError::db_query("Failed to commit session", e)
        })?;
        Ok(true)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE sessions SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to rename session {id}: {e}");
                AppError::db_query("Failed to rename session", e)
            })?;
        Ok(())
    }
}
