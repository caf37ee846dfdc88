//! Admission control for generation requests.
//!
//! [`AdmissionController::admit`] either hands out a [`RequestHandle`] backed
//! by a `pending` request record, or declines with a [`BusyReason`]. The
//! handle must be completed exactly once. [`RequestHandle::complete`] consumes
//! it, and dropping an uncompleted handle (a cancelled task, a panic, a
//! forgotten branch) completes the record from a spawned task, so a slot can
//! never leak while the runtime is alive.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SharedConfig;
use crate::error::{RagError, Result};
use crate::gateway::{AdmitOutcome, NewRequest, PersistenceGateway};

/// Why an admission was declined. A normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyReason {
    /// The global pending limit is reached.
    System,
    /// This user already has the maximum number of requests in flight.
    User,
}

impl BusyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::System => "The system is busy. Please try again shortly.",
            Self::User => "Your previous request is still being processed.",
        }
    }
}

pub enum Admission {
    Admitted(RequestHandle),
    Busy(BusyReason),
}

pub struct AdmissionController {
    gateway: Arc<dyn PersistenceGateway>,
    config: Arc<SharedConfig>,
}

impl AdmissionController {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: Arc<SharedConfig>) -> Self {
        Self { gateway, config }
    }

    /// Check both limits against the persisted pending counts and, if they
    /// allow it, insert a pending record.
    pub async fn admit(&self, user_id: &str, conv_id: &str, question: &str) -> Result<Admission> {
        let limits = self.config.snapshot().await.admission.clone();
        let req = NewRequest {
            user_id: user_id.to_string(),
            conv_id: conv_id.to_string(),
            question: question.to_string(),
        };

        let outcome = self
            .gateway
            .admit_pending(&req, &limits)
            .await
            .map_err(RagError::gateway)?;

        match outcome {
            AdmitOutcome::Admitted(id) => {
                tracing::debug!(request_id = id, user_id, "request admitted");
                Ok(Admission::Admitted(RequestHandle {
                    id,
                    user_id: req.user_id,
                    started: Instant::now(),
                    gateway: self.gateway.clone(),
                    completed: false,
                }))
            }
            AdmitOutcome::SystemBusy => {
                tracing::info!(user_id, global_limit = limits.global_limit, "admission declined: system busy");
                Ok(Admission::Busy(BusyReason::System))
            }
            AdmitOutcome::UserBusy => {
                tracing::info!(user_id, per_user_limit = limits.per_user_limit, "admission declined: user busy");
                Ok(Admission::Busy(BusyReason::User))
            }
        }
    }
}

/// An admitted request's claim on a pending slot.
pub struct RequestHandle {
    id: i64,
    user_id: String,
    started: Instant,
    gateway: Arc<dyn PersistenceGateway>,
    completed: bool,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("completed", &self.completed)
            .finish()
    }
}

impl RequestHandle {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mark the record completed with the elapsed time since admission.
    ///
    /// Gateway failures are logged; there is nothing a caller could do with
    /// them. If this future is cancelled before the update lands, the drop
    /// guard retries it.
    pub async fn complete(mut self, error: Option<String>) {
        let response_time = self.elapsed().as_secs_f64();
        finish(&*self.gateway, self.id, &self.user_id, response_time, error.as_deref()).await;
        self.completed = true;
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let gateway = self.gateway.clone();
        let id = self.id;
        let user_id = std::mem::take(&mut self.user_id);
        let response_time = self.elapsed().as_secs_f64();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(request_id = id, "request handle dropped before completion; releasing slot");
                runtime.spawn(async move {
                    finish(&*gateway, id, &user_id, response_time, Some("cancelled")).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    request_id = id,
                    "request handle dropped outside a runtime; record stays pending until restart"
                );
            }
        }
    }
}

async fn finish(
    gateway: &dyn PersistenceGateway,
    id: i64,
    user_id: &str,
    response_time: f64,
    error: Option<&str>,
) {
    match gateway.mark_completed(id, response_time, error).await {
        Ok(true) => {
            tracing::info!(request_id = id, user_id, response_time, error, "request completed");
        }
        Ok(false) => {
            tracing::warn!(request_id = id, "request was already completed");
        }
        Err(e) => {
            tracing::error!(request_id = id, error = %e, "failed to mark request completed");
        }
    }
}
