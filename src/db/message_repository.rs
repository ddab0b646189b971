use chrono::Utc;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Itinerary, MessageRole, SessionMessage};

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_session_id(&self, session_id: &str) -> Result<Vec<SessionMessage>, AppError> {
        let rows = sqlx::query(
            "SELECT id, role, text, itinerary, created_at
             FROM messages
             WHERE session_id = $1
             ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for session {session_id}: {e}");
            AppError::db_query(format!("Failed to fetch messages for session {session_id}"), e)
        })?;

        rows.into_iter()
            .map(|row: sqlx::postgres::PgRow| {
                use sqlx::Row;
                let role_str: String = row.try_get("role")
                    .map_err(|e| AppError::db_query("Failed to read role", e))?;
                let role = MessageRole::try_from(role_str)
                    .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
                let itinerary: Option<Json<Itinerary>> = row.try_get("itinerary")
                    .map_err(|e| AppError::db_query("Failed to read itinerary", e))?;
                Ok(SessionMessage {
                    id: row.try_get("id")
                        .map_err(|e| AppError::db_query("Failed to read id", e))?,
                    role,
                    text: row.try_get("text")
                        .map_err(|e| AppError::db_query("Failed to read text", e))?,
                    timestamp: row.try_get("created_at")
                        .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
                    itinerary: itinerary.map(|Json(i)| i),
                })
            })
            .collect()
    }

    /// Stores a finished turn's messages and bumps the session's activity time
    /// in one transaction: either all of them land or none do.
    pub async fn append_turn(&self, session_id: &str, messages: &[SessionMessage]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to open transaction for session {session_id}: {e}");
            AppError::db_query("Failed to begin transaction", e)
        })?;

        for message in messages {
            insert_message(&mut *tx, session_id, message).await.map_err(|e| {
                error!("Failed to save message {}: {e}", message.id);
                AppError::db_query("Failed to save message", e)
            })?;
        }

        sqlx::query("UPDATE sessions SET updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to update session timestamp {session_id}: {e}");
                AppError::db_query("Failed to update session", e)
            })?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit turn for session {session_id}: {e}");
            AppError::db_query("Failed to commit turn", e)
        })
    }
}

/// Inserts one message on an existing connection or transaction.
pub async fn insert_message(
    conn: &mut PgConnection,
    session_id: &str,
    message: &SessionMessage,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, session_id, role, text, itinerary, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&message.id)
    .bind(session_id)
    .bind(message.role.as_str())
    .bind(&message.text)
    .bind(message.itinerary.as_ref().map(Json))
    .bind(message.timestamp)
    .execute(conn)
    .await?;
    Ok(())
}
