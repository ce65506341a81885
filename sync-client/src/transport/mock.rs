//! Mock transport for testing.
//!
//! An in-memory stand-in for the sync server: assigns sequences, dedups by
//! op id, filters downloads, enforces an optional quota. Clones share state,
//! so several clients built on clones of one mock behave like devices of the
//! same account. Failures can be injected per call.

use super::{Transport, TransportError};
use async_trait::async_trait;
use opsync_types::{
    CompactResponse, DeleteAllResponse, DownloadRequest, DownloadResponse, OpId, RejectCode,
    RestorePoint, RestorePointsResponse, ServerOperation, ServerSeq, StatusResponse,
    UploadRequest, UploadResponse, UploadResult, UploadStatus, DEFAULT_DOWNLOAD_LIMIT,
    MAX_DOWNLOAD_LIMIT,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Mock transport for testing.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    ops: Vec<ServerOperation>,
    last_seq: u64,
    used_bytes: u64,
    quota_bytes: Option<u64>,
    uploads: Vec<UploadRequest>,
    download_calls: usize,
    rejections: HashMap<OpId, RejectCode>,
    fail_next_upload: VecDeque<TransportError>,
    fail_next_download: VecDeque<TransportError>,
    lose_next_upload_response: bool,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit stored payload bytes.
    pub fn set_quota(&self, quota_bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.quota_bytes = Some(quota_bytes);
    }

    /// Reject the op with this id on upload.
    pub fn reject_op(&self, op_id: &OpId, code: RejectCode) {
        let mut inner = self.inner.lock().unwrap();
        inner.rejections.insert(op_id.clone(), code);
    }

    /// Cause the next upload() to fail with the given error.
    pub fn fail_next_upload(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_upload.push_back(error);
    }

    /// Cause the next download() to fail with the given error.
    pub fn fail_next_download(&self, error: TransportError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_download.push_back(error);
    }

    /// Store the next upload but fail the reply, as if the connection
    /// dropped after the server committed.
    pub fn lose_next_upload_response(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lose_next_upload_response = true;
    }

    /// Every operation currently stored.
    pub fn stored_ops(&self) -> Vec<ServerOperation> {
        let inner = self.inner.lock().unwrap();
        inner.ops.clone()
    }

    /// Every upload request received.
    pub fn uploads(&self) -> Vec<UploadRequest> {
        let inner = self.inner.lock().unwrap();
        inner.uploads.clone()
    }

    /// Number of download() calls that reached the server.
    pub fn download_calls(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.download_calls
    }

    /// Drop stored ops up to and including `seq`, as compaction would.
    pub fn truncate_through(&self, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.retain(|op| op.server_seq.value() > seq);
        inner.used_bytes = inner.ops.iter().map(|op| op.op.payload_size() as u64).sum();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl MockTransportInner {
    fn ingest(&mut self, request: &UploadRequest) -> Vec<UploadResult> {
        let mut results = Vec::with_capacity(request.ops.len());
        for op in &request.ops {
            let status = if self.ops.iter().any(|stored| stored.op.id == op.id) {
                UploadStatus::Duplicate
            } else if let Some(code) = self.rejections.get(&op.id) {
                UploadStatus::Rejected {
                    code: *code,
                    message: "rejected by mock".into(),
                }
            } else {
                let size = op.payload_size() as u64;
                match self.quota_bytes {
                    Some(quota) if self.used_bytes + size > quota => UploadStatus::QuotaExceeded {
                        used_bytes: self.used_bytes,
                        quota_bytes: quota,
                    },
                    _ => {
                        self.last_seq += 1;
                        self.used_bytes += size;
                        let server_seq = ServerSeq::new(self.last_seq);
                        self.ops.push(ServerOperation {
                            op: op.clone(),
                            server_seq,
                            received_at: 0,
                        });
                        UploadStatus::Accepted { server_seq }
                    }
                }
            };
            results.push(UploadResult {
                op_id: op.id.clone(),
                status,
            });
        }
        results
    }

    fn fetch(&self, request: &DownloadRequest) -> DownloadResponse {
        let since = request.since_seq.value();
        let limit = request
            .limit
            .unwrap_or(DEFAULT_DOWNLOAD_LIMIT)
            .clamp(1, MAX_DOWNLOAD_LIMIT) as usize;
        let min_seq = self.ops.first().map(|op| op.server_seq.value());

        let gap_detected = since > 0
            && (since > self.last_seq
                || match min_seq {
                    Some(min) => since < min - 1,
                    None => since < self.last_seq,
                });

        let mut matching = self.ops.iter().filter(|op| {
            op.server_seq.value() > since
                && request
                    .exclude_client
                    .as_ref()
                    .map_or(true, |excluded| &op.op.client_id != excluded)
        });
        let ops: Vec<ServerOperation> = matching.by_ref().take(limit).cloned().collect();
        let has_more = matching.next().is_some();

        DownloadResponse {
            ops,
            has_more,
            latest_seq: ServerSeq::new(self.last_seq),
            gap_detected,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_upload.pop_front() {
            return Err(error);
        }

        inner.uploads.push(request.clone());
        let results = inner.ingest(request);

        if std::mem::take(&mut inner.lose_next_upload_response) {
            return Err(TransportError::Network("connection reset".into()));
        }

        let new_ops = match request.last_known_server_seq {
            Some(since) => {
                inner
                    .fetch(&DownloadRequest {
                        since_seq: since,
                        limit: Some(opsync_types::PIGGYBACK_LIMIT),
                        exclude_client: Some(request.client_id.clone()),
                    })
                    .ops
            }
            None => Vec::new(),
        };

        Ok(UploadResponse {
            results,
            latest_seq: ServerSeq::new(inner.last_seq),
            new_ops,
            deduplicated: false,
        })
    }

    async fn download(
        &self,
        request: &DownloadRequest,
    ) -> Result<DownloadResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_download.pop_front() {
            return Err(error);
        }

        inner.download_calls += 1;
        Ok(inner.fetch(request))
    }

    async fn status(&self) -> Result<StatusResponse, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(StatusResponse {
            latest_seq: ServerSeq::new(inner.last_seq),
            devices_online: 0,
            storage_used_bytes: inner.used_bytes,
            storage_quota_bytes: inner.quota_bytes.unwrap_or(u64::MAX),
        })
    }

    async fn restore_points(&self, limit: u32) -> Result<RestorePointsResponse, TransportError> {
        let inner = self.inner.lock().unwrap();
        let restore_points = inner
            .ops
            .iter()
            .rev()
            .filter(|op| op.op.is_restore_point())
            .take(limit as usize)
            .map(|op| RestorePoint {
                server_seq: op.server_seq,
                op_id: op.op.id.clone(),
                op_type: op.op.op_type,
                client_id: op.op.client_id.clone(),
                created_at: op.received_at,
            })
            .collect();
        Ok(RestorePointsResponse { restore_points })
    }

    async fn compact(&self) -> Result<CompactResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(newest) = inner
            .ops
            .iter()
            .rev()
            .find(|op| op.op.is_restore_point())
            .map(|op| op.server_seq)
        else {
            return Ok(CompactResponse {
                success: false,
                deleted_count: 0,
                freed_bytes: 0,
            });
        };

        let before = inner.ops.len();
        let used_before = inner.used_bytes;
        inner.ops.retain(|op| op.server_seq >= newest);
        inner.used_bytes = inner.ops.iter().map(|op| op.op.payload_size() as u64).sum();
        let deleted_count = (before - inner.ops.len()) as u64;

        Ok(CompactResponse {
            success: deleted_count > 0,
            deleted_count,
            freed_bytes: used_before - inner.used_bytes,
        })
    }

    async fn delete_all(&self) -> Result<DeleteAllResponse, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let deleted_count = inner.ops.len() as u64;
        inner.ops.clear();
        inner.used_bytes = 0;
        Ok(DeleteAllResponse { deleted_count })
    }
}
