//! Persistence gateway for request records and conversation history.
//!
//! The admission check-and-insert is a single gateway call
//! ([`PersistenceGateway::admit_pending`]) so each backend can make it atomic
//! in its own way: a transaction for SQLite, a lock for the in-memory store.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::AdmissionConfig;
use crate::models::{ConversationSummary, ConversationTurn, RequestRecord, RequestStatus};

/// Fields of a request record supplied at admission.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub user_id: String,
    pub conv_id: String,
    pub question: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// A pending record was inserted with this id.
    Admitted(i64),
    SystemBusy,
    UserBusy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub total: u64,
    pub user: u64,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Count pending records and insert a new one, atomically.
    ///
    /// The global limit is checked before the per-user limit.
    async fn admit_pending(&self, req: &NewRequest, limits: &AdmissionConfig)
        -> Result<AdmitOutcome>;

    /// Transition a pending record to completed. Returns `false` if the record
    /// was not pending (already completed or unknown).
    async fn mark_completed(&self, id: i64, response_time: f64, error: Option<&str>)
        -> Result<bool>;

    async fn pending_counts(&self, user_id: &str) -> Result<PendingCounts>;

    async fn request(&self, id: i64) -> Result<Option<RequestRecord>>;

    async fn store_turn(&self, turn: &ConversationTurn) -> Result<()>;

    /// A user's turns in one conversation, oldest first.
    async fn conversation_turns(&self, conv_id: &str, user_id: &str)
        -> Result<Vec<ConversationTurn>>;

    /// Whether any user other than `user_id` has turns under `conv_id`.
    async fn conversation_owned_by_other(&self, conv_id: &str, user_id: &str) -> Result<bool>;

    /// A user's conversations, most recently active first.
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>>;

    /// Delete a user's conversation; returns the number of turns removed.
    async fn delete_conversation(&self, conv_id: &str, user_id: &str) -> Result<u64>;

    /// Complete every leftover pending record. Run once at startup so slots
    /// held by a crashed process are released.
    async fn abandon_pending(&self) -> Result<u64>;
}

pub(crate) const ABANDONED: &str = "abandoned at restart";

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    requests: Vec<RequestRecord>,
    turns: Vec<ConversationTurn>,
}

impl MemoryState {
    fn pending(&self, user_id: Option<&str>) -> u64 {
        self.requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .count() as u64
    }
}

/// Gateway kept entirely in process memory.
#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<MemoryState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory gateway lock poisoned"))
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn admit_pending(
        &self,
        req: &NewRequest,
        limits: &AdmissionConfig,
    ) -> Result<AdmitOutcome> {
        let mut state = self.lock()?;
        if state.pending(None) >= u64::from(limits.global_limit) {
            return Ok(AdmitOutcome::SystemBusy);
        }
        if state.pending(Some(&req.user_id)) >= u64::from(limits.per_user_limit) {
            return Ok(AdmitOutcome::UserBusy);
        }

        state.next_id += 1;
        let id = state.next_id;
        let now = now_ts();
        state.requests.push(RequestRecord {
            id,
            user_id: req.user_id.clone(),
            conv_id: req.conv_id.clone(),
            question: req.question.clone(),
            status: RequestStatus::Pending,
            response_time: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        });
        Ok(AdmitOutcome::Admitted(id))
    }

    async fn mark_completed(
        &self,
        id: i64,
        response_time: f64,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        match state
            .requests
            .iter_mut()
            .find(|r| r.id == id && r.status == RequestStatus::Pending)
        {
            Some(record) => {
                record.status = RequestStatus::Completed;
                record.response_time = Some(response_time);
                record.error_message = error.map(str::to_string);
                record.updated_at = now_ts();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_counts(&self, user_id: &str) -> Result<PendingCounts> {
        let state = self.lock()?;
        Ok(PendingCounts {
            total: state.pending(None),
            user: state.pending(Some(user_id)),
        })
    }

    async fn request(&self, id: i64) -> Result<Option<RequestRecord>> {
        Ok(self.lock()?.requests.iter().find(|r| r.id == id).cloned())
    }

    async fn store_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.lock()?.turns.push(turn.clone());
        Ok(())
    }

    async fn conversation_turns(
        &self,
        conv_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConversationTurn>> {
        Ok(self
            .lock()?
            .turns
            .iter()
            .filter(|t| t.conv_id == conv_id && t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn conversation_owned_by_other(&self, conv_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .turns
            .iter()
            .any(|t| t.conv_id == conv_id && t.user_id != user_id))
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let state = self.lock()?;
        let mut order: Vec<&str> = Vec::new();
        let mut by_conv: HashMap<&str, ConversationSummary> = HashMap::new();

        for turn in state.turns.iter().filter(|t| t.user_id == user_id) {
            match by_conv.get_mut(turn.conv_id.as_str()) {
                Some(summary) => {
                    summary.first_message_time = summary.first_message_time.min(turn.created_at);
                    summary.last_message_time = summary.last_message_time.max(turn.created_at);
                    summary.message_count += 1;
                }
                None => {
                    order.push(&turn.conv_id);
                    by_conv.insert(
                        &turn.conv_id,
                        ConversationSummary {
                            conv_id: turn.conv_id.clone(),
                            title: turn.question.clone(),
                            first_message_time: turn.created_at,
                            last_message_time: turn.created_at,
                            message_count: 1,
                        },
                    );
                }
            }
        }

        let mut summaries: Vec<ConversationSummary> = order
            .into_iter()
            .filter_map(|conv_id| by_conv.remove(conv_id))
            .collect();
        summaries.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(summaries)
    }

    async fn delete_conversation(&self, conv_id: &str, user_id: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.turns.len();
        state
            .turns
            .retain(|t| !(t.conv_id == conv_id && t.user_id == user_id));
        Ok((before - state.turns.len()) as u64)
    }

    async fn abandon_pending(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let now = now_ts();
        let mut abandoned = 0;
        for record in state
            .requests
            .iter_mut()
            .filter(|r| r.status == RequestStatus::Pending)
        {
            record.status = RequestStatus::Completed;
            record.error_message = Some(ABANDONED.to_string());
            record.updated_at = now;
            abandoned += 1;
        }
        Ok(abandoned)
    }
}
