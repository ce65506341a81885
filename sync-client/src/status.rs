//! Per-account sync freshness.
//!
//! Each [`SyncClient`](crate::SyncClient) owns the context for its own
//! account; nothing here is process-global, so two accounts in one process
//! never see each other's status.

use opsync_types::{ServerSeq, UserId};
use serde::{Deserialize, Serialize};

/// Freshness and health of one account's sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusContext {
    user_id: UserId,
    /// Last successful contact with the server, ms since epoch.
    last_remote_check: Option<i64>,
    /// Last cycle failure, cleared by the next success.
    last_error: Option<String>,
    /// Highest sequence the server reported.
    latest_server_seq: ServerSeq,
}

impl StatusContext {
    /// Fresh context for `user_id`.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            last_remote_check: None,
            last_error: None,
            latest_server_seq: ServerSeq::zero(),
        }
    }

    /// Account this context belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Record a successful exchange with the server.
    pub fn record_success(&mut self, now_ms: i64, latest_seq: ServerSeq) {
        self.last_remote_check = Some(now_ms);
        self.last_error = None;
        self.latest_server_seq = self.latest_server_seq.max(latest_seq);
    }

    /// Record a failed cycle.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Last successful contact, ms since epoch.
    pub fn last_remote_check(&self) -> Option<i64> {
        self.last_remote_check
    }

    /// Last failure message, if the most recent cycle failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Highest sequence the server reported.
    pub fn latest_server_seq(&self) -> ServerSeq {
        self.latest_server_seq
    }
}

/// Point-in-time view of a client's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Account.
    pub user_id: UserId,
    /// Operations waiting for upload.
    pub pending_count: usize,
    /// Operations the server refused.
    pub rejected_count: usize,
    /// Downloaded operations waiting for a newer client.
    pub held_back_count: usize,
    /// Highest sequence applied locally.
    pub cursor: ServerSeq,
    /// Highest sequence the server reported.
    pub latest_server_seq: ServerSeq,
    /// Last successful contact, ms since epoch.
    pub last_remote_check: Option<i64>,
    /// Last failure, if the most recent cycle failed.
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// True when nothing is waiting in either direction.
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0 && self.cursor >= self.latest_server_seq && self.last_error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_error() {
        let mut ctx = StatusContext::new(UserId::new("u"));
        ctx.record_failure("timeout");
        assert_eq!(ctx.last_error(), Some("timeout"));

        ctx.record_success(1_000, ServerSeq::new(4));
        assert_eq!(ctx.last_error(), None);
        assert_eq!(ctx.last_remote_check(), Some(1_000));
        assert_eq!(ctx.latest_server_seq(), ServerSeq::new(4));
    }

    #[test]
    fn latest_seq_never_regresses() {
        let mut ctx = StatusContext::new(UserId::new("u"));
        ctx.record_success(1, ServerSeq::new(9));
        ctx.record_success(2, ServerSeq::new(3));
        assert_eq!(ctx.latest_server_seq(), ServerSeq::new(9));
    }

    #[test]
    fn contexts_are_independent_per_account() {
        let mut alice = StatusContext::new(UserId::new("alice"));
        let bob = StatusContext::new(UserId::new("bob"));
        alice.record_failure("quota");
        assert!(bob.last_error().is_none());
    }
}
