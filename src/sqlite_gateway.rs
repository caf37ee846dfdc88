//! [`PersistenceGateway`] on SQLite.
//!
//! Admission runs inside `BEGIN IMMEDIATE`, which takes the database write
//! lock before the pending counts are read. Two admissions, in this process
//! or another one sharing the file, can therefore never both pass a limit
//! that only one of them should.
//!
//! The transaction is a [`sqlx::Transaction`], so an admission future that is
//! dropped mid-flight rolls back instead of leaving the write lock held.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Row, SqlitePool};

use crate::config::AdmissionConfig;
use crate::gateway::{now_ts, AdmitOutcome, NewRequest, PendingCounts, PersistenceGateway, ABANDONED};
use crate::models::{ConversationSummary, ConversationTurn, RequestRecord, RequestStatus};

pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const PENDING: &str = RequestStatus::Pending.as_str();
const COMPLETED: &str = RequestStatus::Completed.as_str();

async fn count_pending(conn: &mut SqliteConnection, user_id: Option<&str>) -> Result<u64> {
    let count: i64 = match user_id {
        Some(user_id) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM llm_requests WHERE status = ? AND user_id = ?",
            )
            .bind(PENDING)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM llm_requests WHERE status = ?")
                .bind(PENDING)
                .fetch_one(&mut *conn)
                .await?
        }
    };
    Ok(count as u64)
}

async fn admit_locked(
    conn: &mut SqliteConnection,
    req: &NewRequest,
    limits: &AdmissionConfig,
) -> Result<AdmitOutcome> {
    if count_pending(conn, None).await? >= u64::from(limits.global_limit) {
        return Ok(AdmitOutcome::SystemBusy);
    }
    if count_pending(conn, Some(&req.user_id)).await? >= u64::from(limits.per_user_limit) {
        return Ok(AdmitOutcome::UserBusy);
    }

    let now = now_ts();
    let id = sqlx::query(
        r#"
        INSERT INTO llm_requests (user_id, conv_id, question, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&req.user_id)
    .bind(&req.conv_id)
    .bind(&req.question)
    .bind(PENDING)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(AdmitOutcome::Admitted(id))
}

fn parse_status(raw: &str) -> RequestStatus {
    if raw == COMPLETED {
        RequestStatus::Completed
    } else {
        RequestStatus::Pending
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn admit_pending(
        &self,
        req: &NewRequest,
        limits: &AdmissionConfig,
    ) -> Result<AdmitOutcome> {
        // Rolled back on drop, including when this future is cancelled.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let outcome = admit_locked(&mut *tx, req, limits).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn mark_completed(
        &self,
        id: i64,
        response_time: f64,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE llm_requests
            SET status = ?, response_time = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(COMPLETED)
        .bind(response_time)
        .bind(error)
        .bind(now_ts())
        .bind(id)
        .bind(PENDING)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending_counts(&self, user_id: &str) -> Result<PendingCounts> {
        let mut conn = self.pool.acquire().await?;
        Ok(PendingCounts {
            total: count_pending(&mut *conn, None).await?,
            user: count_pending(&mut *conn, Some(user_id)).await?,
        })
    }

    async fn request(&self, id: i64) -> Result<Option<RequestRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, conv_id, question, status, response_time, error_message,
                   created_at, updated_at
            FROM llm_requests WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            RequestRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                conv_id: row.get("conv_id"),
                question: row.get("question"),
                status: parse_status(&status),
                response_time: row.get("response_time"),
                error_message: row.get("error_message"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            }
        }))
    }

    async fn store_turn(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (conv_id, user_id, question, answer, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&turn.conv_id)
        .bind(&turn.user_id)
        .bind(&turn.question)
        .bind(&turn.answer)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conversation_turns(
        &self,
        conv_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT conv_id, user_id, question, answer, created_at
            FROM conversations
            WHERE conv_id = ? AND user_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(conv_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversationTurn {
                conv_id: row.get("conv_id"),
                user_id: row.get("user_id"),
                question: row.get("question"),
                answer: row.get("answer"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn conversation_owned_by_other(&self, conv_id: &str, user_id: &str) -> Result<bool> {
        let other: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM conversations WHERE conv_id = ? AND user_id != ? LIMIT 1",
        )
        .bind(conv_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(other.is_some())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.conv_id AS conv_id,
                   (SELECT f.question FROM conversations f
                    WHERE f.conv_id = c.conv_id AND f.user_id = c.user_id
                    ORDER BY f.created_at ASC, f.id ASC LIMIT 1) AS title,
                   MIN(c.created_at) AS first_message_time,
                   MAX(c.created_at) AS last_message_time,
                   COUNT(*) AS message_count
            FROM conversations c
            WHERE c.user_id = ?
            GROUP BY c.conv_id
            ORDER BY last_message_time DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ConversationSummary {
                conv_id: row.get("conv_id"),
                title: row.get("title"),
                first_message_time: row.get("first_message_time"),
                last_message_time: row.get("last_message_time"),
                message_count: row.get("message_count"),
            })
            .collect())
    }

    async fn delete_conversation(&self, conv_id: &str, user_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversations WHERE conv_id = ? AND user_id = ?")
            .bind(conv_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn abandon_pending(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE llm_requests
            SET status = ?, error_message = ?, updated_at = ?
            WHERE status = ?
            "#,
        )
        .bind(COMPLETED)
        .bind(ABANDONED)
        .bind(now_ts())
        .bind(PENDING)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
