//! Per-identity admission control.
//!
//! Each identity token may have at most one generation in flight. Admission
//! claims the token in the shared store before work starts and releases it
//! when the job finishes, whatever the outcome. Store outages are handled
//! per policy: fail-open admits unchecked, fail-closed rejects until the
//! store is reachable again.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::store::{ClaimRecord, ClaimStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    FailOpen,
    FailClosed,
}

impl AdmissionPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        if config.fail_closed {
            Self::FailClosed
        } else {
            Self::FailOpen
        }
    }
}

/// Proof of a granted claim. The task id correlates logs, responses, and
/// the stored claim for this job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub task_id: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Granted(ClaimTicket),
    /// The identity already has a processing claim.
    InFlight,
    /// The store is unreachable and policy is fail-closed.
    Unavailable,
}

/// Read-only variant of [`ClaimOutcome`] for endpoints that check the
/// identity's state without claiming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCheck {
    Clear,
    InFlight,
    Unavailable,
}

pub struct AdmissionController {
    store: ClaimStore,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(store: ClaimStore, policy: AdmissionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn store(&self) -> &ClaimStore {
        &self.store
    }

    /// Inspect the identity's claim state without writing anything.
    pub async fn check(&self, token: &str) -> AdmissionCheck {
        let read = self.store.read_claim(token).await;
        let check = check_from_read(self.policy, &read);

        match check {
            AdmissionCheck::InFlight => {
                info!(token = %token, "identity already has a generation in flight");
            }
            AdmissionCheck::Clear if read.is_err() => {
                warn!(token = %token, "claim store unavailable, admitting without claim check");
            }
            _ => {}
        }
        check
    }

    /// Claim the identity for a new job. On success the claim is recorded
    /// with a fresh task id and the store's TTL.
    pub async fn try_claim(&self, token: &str) -> ClaimOutcome {
        match self.check(token).await {
            AdmissionCheck::InFlight => return ClaimOutcome::InFlight,
            AdmissionCheck::Unavailable => return ClaimOutcome::Unavailable,
            AdmissionCheck::Clear => {}
        }

        let ticket = ClaimTicket {
            task_id: uuid::Uuid::new_v4().to_string(),
        };
        let record = ClaimRecord::processing(&ticket.task_id);

        match self.store.write_claim(token, &record).await {
            Ok(()) => {
                debug!(token = %token, task_id = %ticket.task_id, "claim granted");
                ClaimOutcome::Granted(ticket)
            }
            Err(_) if self.policy == AdmissionPolicy::FailOpen => {
                // Claim not recorded; the job still runs, it just cannot be
                // seen by other front ends until the store recovers.
                warn!(token = %token, task_id = %ticket.task_id, "claim store unavailable, admitting unrecorded job");
                ClaimOutcome::Granted(ticket)
            }
            Err(_) => ClaimOutcome::Unavailable,
        }
    }

    /// Release the identity's claim. Idempotent and infallible: a release
    /// that finds no claim, or cannot reach the store, only logs.
    pub async fn release(&self, token: &str) {
        let cleared = self.store.clear_claim(token).await;
        if cleared {
            debug!(token = %token, "claim released");
        }
    }
}

fn check_from_read(
    policy: AdmissionPolicy,
    read: &Result<Option<ClaimRecord>>,
) -> AdmissionCheck {
    match read {
        Ok(Some(record)) if record.is_processing() => AdmissionCheck::InFlight,
        Ok(_) => AdmissionCheck::Clear,
        Err(_) => match policy {
            AdmissionPolicy::FailOpen => AdmissionCheck::Clear,
            AdmissionPolicy::FailClosed => AdmissionCheck::Unavailable,
        },
    }
}
