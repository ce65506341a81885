//! SyncClient - the main interface for opsync.
//!
//! This module provides [`SyncClient`], the primary API for applications to
//! record local changes and keep them in sync with the server.
//!
//! # Architecture
//!
//! SyncClient uses the pure pieces from sync-core (operation log, conflict
//! resolver, cycle state machine) and performs the actual I/O via the
//! [`Transport`] trait.
//!
//! ```text
//! Application → SyncClient → Transport → Server
//!                   ↓
//!              sync-core (log, resolver, state machine)
//! ```
//!
//! Local writes are synchronous and never touch the network; only push and
//! pull await. Cycles for one client are serialized: a second `sync()` waits
//! for the first.
//!
//! # Example
//!
//! ```ignore
//! use opsync_client::{MockTransport, SyncClient, SyncConfig};
//!
//! let client = SyncClient::new(SyncConfig::default(), UserId::new("alice"), MockTransport::new());
//! client.record_local(OpType::Create, EntityType::Task, Some("t1".into()), json!({"title": "Milk"}))?;
//! let report = client.sync().await?;
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opsync_core::{
    Action, ApplyError, ApplyOutcome, ConflictResolver, CycleState, EntityStore, Event, LogError,
    MemoryStore, OperationLogStore, Phase, RecordedError, RetryPolicy, SkipReason, SyncEvent,
};
use opsync_types::{
    ClientId, CompactResponse, DownloadRequest, EntityType, OpId, OpType, Operation,
    RestorePointsResponse, ServerOperation, ServerSeq, StatusResponse, UploadRequest,
    UploadStatus, UserId, CURRENT_SCHEMA_VERSION, DEFAULT_DOWNLOAD_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, PayloadKey};
use crate::retry::with_retry;
use crate::status::{StatusContext, SyncStatus};
use crate::transport::{Transport, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The account is over its storage quota; needs user action.
    #[error("storage quota exceeded ({used_bytes} of {quota_bytes} bytes)")]
    QuotaExceeded {
        /// Bytes in use.
        used_bytes: u64,
        /// Account quota.
        quota_bytes: u64,
    },

    /// A downloaded payload could not be decrypted; nothing was applied.
    #[error("cannot decrypt operation {op_id} (entity {entity_id:?}); wrong or missing password")]
    Decryption {
        /// Offending operation.
        op_id: OpId,
        /// Its entity id, if any.
        entity_id: Option<String>,
    },

    /// Crypto error while sealing outgoing payloads.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Pending queue is full.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Local write cannot be applied.
    #[error("local write rejected: {0}")]
    Apply(#[from] ApplyError),

    /// Local write had no effect.
    #[error("local write skipped: {reason:?}")]
    WriteSkipped {
        /// Why it changed nothing.
        reason: SkipReason,
    },

    /// The server refused a snapshot upload.
    #[error("server refused operation {op_id}: {message}")]
    Refused {
        /// Refused operation.
        op_id: OpId,
        /// Reason given by the server.
        message: String,
    },

    /// A cycle phase failed without a more specific error.
    #[error("{phase:?} failed: {message}")]
    CycleFailed {
        /// Failing phase.
        phase: Phase,
        /// Error message.
        message: String,
    },
}

impl ClientError {
    /// True for failures worth retrying within a cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(e) if e.is_transient())
    }
}

/// Configuration for SyncClient.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum unconfirmed local operations.
    pub max_pending: usize,
    /// Operations per upload request.
    pub upload_batch_size: usize,
    /// Operations per download page.
    pub download_limit: u32,
    /// Retry schedule for transient failures.
    pub retry: RetryPolicy,
    /// Clock entries of clients unseen this long are pruned.
    pub clock_retention: Duration,
    /// Local tombstones older than this are pruned.
    pub tombstone_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            upload_batch_size: 100,
            download_limit: DEFAULT_DOWNLOAD_LIMIT,
            retry: RetryPolicy::default(),
            clock_retention: Duration::from_secs(30 * 24 * 3600),
            tombstone_retention: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

impl SyncConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the download page size.
    pub fn with_download_limit(mut self, limit: u32) -> Self {
        self.download_limit = limit;
        self
    }

    /// Set the pending queue capacity.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}

/// Everything a client persists between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientState {
    /// Operation log, clock and cursor.
    pub log: OperationLogStore,
    /// Per-field write history and tombstones.
    pub resolver: ConflictResolver,
    /// Current entity state.
    pub store: MemoryStore,
    /// Freshness for this account.
    pub status: StatusContext,
}

impl ClientState {
    /// Empty state for a new device.
    pub fn new(user_id: UserId, client_id: ClientId, max_pending: usize) -> Self {
        Self {
            log: OperationLogStore::new(client_id, max_pending),
            resolver: ConflictResolver::new(),
            store: MemoryStore::new(),
            status: StatusContext::new(user_id),
        }
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Newly stored operations.
    pub accepted: usize,
    /// Operations the server already had.
    pub duplicates: usize,
    /// Operations refused permanently.
    pub rejected: usize,
}

/// Outcome of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Operations that changed local state.
    pub applied: usize,
    /// Operations that changed nothing.
    pub skipped: usize,
    /// Concurrent writes resolved along the way.
    pub conflicts: usize,
    /// Operations that could not be applied (recorded in the log).
    pub errors: usize,
    /// Operations kept for a newer client version.
    pub held_back: usize,
    /// Pages downloaded.
    pub pages: usize,
    /// Times the cursor was rewound after a history gap.
    pub gap_resets: usize,
}

/// Outcome of a full cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Push half.
    pub push: PushReport,
    /// Pull half.
    pub pull: PullReport,
}

struct Local {
    state: ClientState,
    key: Option<PayloadKey>,
}

/// The main sync client.
///
/// Owns the local log and entity state for one device of one account.
pub struct SyncClient<T: Transport> {
    config: SyncConfig,
    transport: T,
    local: Mutex<Local>,
    cycle: tokio::sync::Mutex<()>,
}

impl<T: Transport> SyncClient<T> {
    /// Create a client for a new device with a random client id.
    pub fn new(config: SyncConfig, user_id: UserId, transport: T) -> Self {
        let state = ClientState::new(user_id, ClientId::random(), config.max_pending);
        Self::from_state(config, state, transport)
    }

    /// Resume from persisted state.
    pub fn from_state(config: SyncConfig, state: ClientState, transport: T) -> Self {
        Self {
            config,
            transport,
            local: Mutex::new(Local { state, key: None }),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Encrypt outgoing and decrypt incoming payloads with `key`.
    pub fn with_key(self, key: PayloadKey) -> Self {
        self.lock_local().key = Some(key);
        self
    }

    /// Derive the payload key from the account password.
    pub fn set_password(&self, password: &str) -> Result<(), ClientError> {
        let key = PayloadKey::from_password(password, &self.user_id())?;
        self.lock_local().key = Some(key);
        Ok(())
    }

    fn lock_local(&self) -> MutexGuard<'_, Local> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account this client syncs.
    pub fn user_id(&self) -> UserId {
        self.lock_local().state.status.user_id().clone()
    }

    /// This device's client id.
    pub fn client_id(&self) -> ClientId {
        self.lock_local().state.log.client_id().clone()
    }

    /// Copy of the state to persist.
    pub fn export_state(&self) -> ClientState {
        self.lock_local().state.clone()
    }

    /// Get a reference to the underlying transport (for testing).
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ===========================================
    // Local writes and reads
    // ===========================================

    /// Record a local change.
    ///
    /// The operation is applied to local state first and queued for upload
    /// only if it changed something.
    pub fn record_local(
        &self,
        op_type: OpType,
        entity_type: EntityType,
        entity_id: Option<String>,
        payload: Value,
    ) -> Result<Operation, ClientError> {
        let mut local = self.lock_local();
        let state = &mut local.state;
        if state.log.is_full() {
            return Err(LogError::Full {
                capacity: self.config.max_pending,
            }
            .into());
        }

        let op = state
            .log
            .prepare(op_type, entity_type, entity_id, payload, now_ms());
        match state.resolver.apply(&mut state.store, &op)? {
            ApplyOutcome::Applied { .. } => {
                state.log.enqueue(op.clone())?;
                debug!(op_id = %op.id, op_type = %op.op_type, entity_type = %op.entity_type, "recorded local op");
                Ok(op)
            }
            ApplyOutcome::Skipped(reason) => Err(ClientError::WriteSkipped { reason }),
        }
    }

    /// Current value of an entity.
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Value> {
        self.lock_local().state.store.get(entity_type, id)
    }

    /// Every entity of a type, by id.
    pub fn entities(&self, entity_type: EntityType) -> Vec<(String, Value)> {
        let local = self.lock_local();
        let store = &local.state.store;
        store
            .ids(entity_type)
            .into_iter()
            .filter_map(|id| store.get(entity_type, &id).map(|value| (id, value)))
            .collect()
    }

    /// Point-in-time status.
    pub fn status(&self) -> SyncStatus {
        let local = self.lock_local();
        let state = &local.state;
        SyncStatus {
            user_id: state.status.user_id().clone(),
            pending_count: state.log.pending_count(),
            rejected_count: state.log.rejected().len(),
            held_back_count: state.log.held_back_count(),
            cursor: state.log.last_server_seq(),
            latest_server_seq: state.status.latest_server_seq(),
            last_remote_check: state.status.last_remote_check(),
            last_error: state.status.last_error().map(str::to_string),
        }
    }

    /// Highest sequence fully applied locally.
    pub fn cursor(&self) -> ServerSeq {
        self.lock_local().state.log.last_server_seq()
    }

    /// Errors recorded while applying remote operations, oldest first.
    pub fn recorded_errors(&self) -> Vec<RecordedError> {
        self.lock_local().state.log.errors().cloned().collect()
    }

    // ===========================================
    // Sync cycle
    // ===========================================

    /// Push then pull, retrying transient failures.
    pub async fn sync(&self) -> Result<SyncReport, ClientError> {
        let _cycle = self.cycle.lock().await;
        let policy = &self.config.retry;

        let request_id = new_request_id();
        let mut report = SyncReport::default();
        let mut last_error: Option<ClientError> = None;
        let (mut state, actions) = CycleState::new().on_event(Event::SyncRequested, policy);
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            let event = match action {
                Action::StartPush => match self.push_once(&request_id).await {
                    Ok(push) => {
                        report.push = push;
                        Event::PushSucceeded
                    }
                    Err(error) => failed(error, &mut last_error),
                },
                Action::StartPull => match self.pull_once().await {
                    Ok(pull) => {
                        report.pull = pull;
                        Event::PullSucceeded
                    }
                    Err(error) => failed(error, &mut last_error),
                },
                Action::StartRetryTimer { delay } => {
                    tokio::time::sleep(delay).await;
                    Event::RetryTimer
                }
                Action::EmitEvent(event) => {
                    match event {
                        SyncEvent::CycleCompleted => {
                            info!(
                                pushed = report.push.accepted,
                                applied = report.pull.applied,
                                conflicts = report.pull.conflicts,
                                "sync cycle completed"
                            );
                            return Ok(report);
                        }
                        SyncEvent::CycleFailed { phase, error } => {
                            warn!(?phase, %error, "sync cycle failed");
                            self.lock_local().state.status.record_failure(&error);
                            return Err(last_error.take().unwrap_or(ClientError::CycleFailed {
                                phase,
                                message: error,
                            }));
                        }
                        SyncEvent::RetryScheduled {
                            phase,
                            attempt,
                            delay,
                            error,
                        } => {
                            warn!(?phase, attempt, ?delay, %error, "transient failure, retrying");
                        }
                        SyncEvent::CycleCancelled => {
                            debug!("sync cycle cancelled");
                            return Ok(report);
                        }
                    }
                    continue;
                }
            };

            let (next, actions) = state.on_event(event, policy);
            state = next;
            queue.extend(actions);
        }

        Ok(report)
    }

    /// Upload every pending operation, retrying transient failures.
    pub async fn push(&self) -> Result<PushReport, ClientError> {
        let _cycle = self.cycle.lock().await;
        let request_id = new_request_id();
        let result =
            with_retry(&self.config.retry, Phase::Push, || self.push_once(&request_id)).await;
        self.note_failure(&result);
        result
    }

    /// Download and apply everything past the cursor, retrying transient
    /// failures.
    pub async fn pull(&self) -> Result<PullReport, ClientError> {
        let _cycle = self.cycle.lock().await;
        let result = with_retry(&self.config.retry, Phase::Pull, || self.pull_once()).await;
        self.note_failure(&result);
        result
    }

    fn note_failure<R>(&self, result: &Result<R, ClientError>) {
        if let Err(error) = result {
            self.lock_local()
                .state
                .status
                .record_failure(error.to_string());
        }
    }

    /// One upload attempt. `request_id` is shared by every attempt of a
    /// cycle so the server can replay a reply lost in transit.
    async fn push_once(&self, request_id: &str) -> Result<PushReport, ClientError> {
        let (client_id, batch) = {
            let local = self.lock_local();
            let batch = local.state.log.pending_batch();
            let batch = match &local.key {
                Some(key) => batch
                    .iter()
                    .map(|op| key.seal_operation(op))
                    .collect::<Result<Vec<_>, _>>()?,
                None => batch,
            };
            (local.state.log.client_id().clone(), batch)
        };

        let mut report = PushReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let mut quota: Option<(u64, u64)> = None;

        for chunk in batch.chunks(self.config.upload_batch_size.max(1)) {
            // Keyed by the first op, so a chunk shifted by partial progress
            // never matches an earlier reply.
            let request = UploadRequest {
                client_id: client_id.clone(),
                ops: chunk.to_vec(),
                // Pull runs after every push and owns the cursor.
                last_known_server_seq: None,
                request_id: Some(format!("{request_id}-{}", chunk[0].id)),
            };
            let response = match self.transport.upload(&request).await {
                Ok(response) => response,
                Err(TransportError::QuotaExceeded {
                    used_bytes,
                    quota_bytes,
                }) => {
                    quota = Some((used_bytes, quota_bytes));
                    break;
                }
                Err(error) => return Err(error.into()),
            };

            let mut local = self.lock_local();
            let state = &mut local.state;
            for result in &response.results {
                match &result.status {
                    UploadStatus::Accepted { .. } => {
                        state.log.ack(&result.op_id);
                        report.accepted += 1;
                    }
                    UploadStatus::Duplicate => {
                        state.log.ack(&result.op_id);
                        report.duplicates += 1;
                    }
                    UploadStatus::Rejected { code, message } => {
                        warn!(op_id = %result.op_id, ?code, %message, "server rejected op");
                        let code = serde_json::to_value(code)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default();
                        state.log.reject(&result.op_id, code, message.clone());
                        report.rejected += 1;
                    }
                    UploadStatus::QuotaExceeded {
                        used_bytes,
                        quota_bytes,
                    } => {
                        quota = Some((*used_bytes, *quota_bytes));
                    }
                }
            }
            state.status.record_success(now_ms(), response.latest_seq);

            if quota.is_some() {
                break;
            }
        }

        match quota {
            Some((used_bytes, quota_bytes)) => {
                warn!(used_bytes, quota_bytes, "upload blocked by storage quota");
                Err(ClientError::QuotaExceeded {
                    used_bytes,
                    quota_bytes,
                })
            }
            None => {
                debug!(?report, "push finished");
                Ok(report)
            }
        }
    }

    async fn pull_once(&self) -> Result<PullReport, ClientError> {
        let mut report = PullReport::default();
        let client_id = {
            let mut local = self.lock_local();
            let state = &mut local.state;
            for held in state.log.take_held_back() {
                apply_remote(state, held, &mut report);
            }
            state.log.client_id().clone()
        };

        loop {
            let since_seq = self.lock_local().state.log.last_server_seq();
            let response = self
                .transport
                .download(&DownloadRequest {
                    since_seq,
                    limit: Some(self.config.download_limit),
                    exclude_client: Some(client_id.clone()),
                })
                .await?;

            if response.gap_detected && report.gap_resets == 0 {
                warn!(%since_seq, latest_seq = %response.latest_seq, "history gap, replaying from the start");
                self.lock_local().state.log.reset_cursor();
                report.gap_resets += 1;
                continue;
            }

            let mut local = self.lock_local();
            let ops = open_page(local.key.as_ref(), response.ops)?;
            let last_seq = ops.last().map(|op| op.server_seq);

            let state = &mut local.state;
            for op in ops {
                apply_remote(state, op, &mut report);
            }

            // Own ops are filtered out, so the last page covers up to latest_seq.
            let cursor = if response.has_more {
                last_seq.unwrap_or(since_seq)
            } else {
                last_seq.unwrap_or(since_seq).max(response.latest_seq)
            };
            state.log.advance_cursor(cursor);
            state.status.record_success(now_ms(), response.latest_seq);
            report.pages += 1;

            if !response.has_more {
                break;
            }
        }

        let mut local = self.lock_local();
        let state = &mut local.state;
        let now = now_ms();
        let pruned_clock = state
            .log
            .prune_clock(now, self.config.clock_retention.as_millis() as i64);
        let pruned_tombstones = state.resolver.prune_tombstones(
            now.saturating_sub(self.config.tombstone_retention.as_millis() as i64),
        );
        if pruned_clock > 0 || pruned_tombstones > 0 {
            debug!(pruned_clock, pruned_tombstones, "pruned local history");
        }

        debug!(?report, "pull finished");
        Ok(report)
    }

    // ===========================================
    // Account management
    // ===========================================

    /// Server-side status for the account.
    pub async fn server_status(&self) -> Result<StatusResponse, ClientError> {
        let status = self.transport.status().await?;
        self.lock_local()
            .state
            .status
            .record_success(now_ms(), status.latest_seq);
        Ok(status)
    }

    /// Restore points retained on the server, newest first.
    pub async fn restore_points(&self, limit: u32) -> Result<RestorePointsResponse, ClientError> {
        Ok(self.transport.restore_points(limit).await?)
    }

    /// Ask the server to drop history made redundant by restore points.
    pub async fn compact(&self) -> Result<CompactResponse, ClientError> {
        Ok(self.transport.compact().await?)
    }

    /// Change the account password.
    ///
    /// See [`Self::rotate_key`].
    pub async fn rotate_password(&self, new_password: &str) -> Result<(), ClientError> {
        let key = PayloadKey::from_password(new_password, &self.user_id())?;
        self.rotate_key(key).await
    }

    /// Re-encrypt the account under `new_key`.
    ///
    /// Deletes every server operation, then uploads a `SYNC_IMPORT` restore
    /// point holding the full local state sealed with the new key. Pending
    /// operations are folded into the snapshot. Devices still on the old key
    /// fail their next pull with [`ClientError::Decryption`].
    pub async fn rotate_key(&self, new_key: PayloadKey) -> Result<(), ClientError> {
        let _cycle = self.cycle.lock().await;

        let (client_id, restore_point, folded) = {
            let mut local = self.lock_local();
            let state = &mut local.state;
            let folded: BTreeSet<OpId> = state.log.pending().map(|op| op.id.clone()).collect();
            let snapshot = state.store.snapshot();
            let op = state.log.prepare(
                OpType::SyncImport,
                EntityType::All,
                None,
                snapshot.to_value(),
                now_ms(),
            );
            (state.log.client_id().clone(), op, folded)
        };
        let sealed = new_key.seal_operation(&restore_point)?;

        let deleted = with_retry(&self.config.retry, Phase::Push, || async {
            self.transport.delete_all().await.map_err(ClientError::from)
        })
        .await?;
        info!(deleted = deleted.deleted_count, "deleted server history for password change");

        let request = UploadRequest {
            client_id,
            ops: vec![sealed],
            last_known_server_seq: None,
            request_id: Some(new_request_id()),
        };
        let response = with_retry(&self.config.retry, Phase::Push, || async {
            self.transport.upload(&request).await.map_err(ClientError::from)
        })
        .await?;

        let status = response
            .results
            .into_iter()
            .find(|result| result.op_id == restore_point.id)
            .map(|result| result.status)
            .ok_or_else(|| {
                ClientError::Transport(TransportError::InvalidResponse(
                    "no result for restore point".into(),
                ))
            })?;

        let server_seq = match status {
            UploadStatus::Accepted { server_seq } => Some(server_seq),
            UploadStatus::Duplicate => None,
            UploadStatus::Rejected { message, .. } => {
                return Err(ClientError::Refused {
                    op_id: restore_point.id,
                    message,
                })
            }
            UploadStatus::QuotaExceeded {
                used_bytes,
                quota_bytes,
            } => {
                return Err(ClientError::QuotaExceeded {
                    used_bytes,
                    quota_bytes,
                })
            }
        };

        let mut local = self.lock_local();
        let Local { state, key } = &mut *local;
        state.resolver.apply(&mut state.store, &restore_point)?;
        for op_id in &folded {
            state.log.ack(op_id);
        }
        if let Some(seq) = server_seq {
            state.log.advance_cursor(seq);
        }
        state.status.record_success(now_ms(), response.latest_seq);
        *key = Some(new_key);

        info!(folded = folded.len(), "password changed, restore point uploaded");
        Ok(())
    }
}

fn failed(error: ClientError, last_error: &mut Option<ClientError>) -> Event {
    let event = Event::Failed {
        transient: error.is_transient(),
        error: error.to_string(),
    };
    *last_error = Some(error);
    event
}

/// Decrypt a whole page before anything is applied.
fn open_page(
    key: Option<&PayloadKey>,
    ops: Vec<ServerOperation>,
) -> Result<Vec<ServerOperation>, ClientError> {
    ops.into_iter()
        .map(|mut server_op| {
            if !server_op.op.is_payload_encrypted {
                return Ok(server_op);
            }
            let decryption = || ClientError::Decryption {
                op_id: server_op.op.id.clone(),
                entity_id: server_op.op.entity_id.clone(),
            };
            let key = key.ok_or_else(decryption)?;
            let opened = key.open_operation(&server_op.op).map_err(|_| decryption())?;
            server_op.op = opened;
            Ok(server_op)
        })
        .collect()
}

fn apply_remote(state: &mut ClientState, server_op: ServerOperation, report: &mut PullReport) {
    let op = &server_op.op;
    if op.schema_version > CURRENT_SCHEMA_VERSION {
        debug!(op_id = %op.id, schema_version = op.schema_version, "holding back op from newer schema");
        state.log.hold_back(server_op);
        report.held_back += 1;
        return;
    }

    let now = now_ms();
    state.log.observe_remote(op, now);
    match state.resolver.apply(&mut state.store, op) {
        Ok(outcome) => {
            if outcome.had_conflict() {
                report.conflicts += 1;
                debug!(op_id = %op.id, entity_id = ?op.entity_id, ?outcome, "resolved concurrent write");
            }
            match outcome {
                ApplyOutcome::Applied { .. } => report.applied += 1,
                ApplyOutcome::Skipped(reason) => {
                    debug!(op_id = %op.id, ?reason, "skipped remote op");
                    report.skipped += 1;
                }
            }
        }
        Err(error) => {
            warn!(op_id = %op.id, %error, "failed to apply remote op");
            state.log.record_error(RecordedError {
                op_id: op.id.clone(),
                entity_type: op.entity_type,
                entity_id: op.entity_id.clone(),
                reason: error.to_string(),
                recorded_at: now,
            });
            report.errors += 1;
        }
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
