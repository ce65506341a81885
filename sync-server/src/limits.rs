//! Rate limiting for opsync-server.
//!
//! Uploads and downloads are limited per account; a global limiter caps
//! aggregate request throughput. All use the governor crate, the keyed
//! ones backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use opsync_types::UserId;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the sync server.
#[derive(Clone)]
pub struct RateLimits {
    /// Upload requests per account (`limits.uploads_per_minute`).
    upload_limiter: Arc<KeyedLimiter<UserId>>,

    /// Download requests per account (`limits.downloads_per_minute`).
    download_limiter: Arc<KeyedLimiter<UserId>>,

    /// All requests, all accounts (`limits.global_requests_per_second`).
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("upload_limiter", &"KeyedLimiter<UserId>")
            .field("download_limiter", &"KeyedLimiter<UserId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

/// Zero is rejected by `Config::validate`; clamp rather than panic if a
/// hand-built config slips through.
fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        let upload_quota = Quota::per_minute(non_zero(config.uploads_per_minute));
        let download_quota = Quota::per_minute(non_zero(config.downloads_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            upload_limiter: Arc::new(RateLimiter::keyed(upload_quota)),
            download_limiter: Arc::new(RateLimiter::keyed(download_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if an upload from this account is allowed.
    pub fn check_upload(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.upload_limiter
            .check_key(user_id)
            .map_err(|_| RateLimitError::UploadLimitExceeded)
    }

    /// Check if a download for this account is allowed.
    pub fn check_download(&self, user_id: &UserId) -> Result<(), RateLimitError> {
        self.download_limiter
            .check_key(user_id)
            .map_err(|_| RateLimitError::DownloadLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    ///
    /// This is a server-wide rate limit that caps aggregate throughput
    /// regardless of individual account limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of accounts tracked by the upload limiter.
    pub fn upload_keys_count(&self) -> usize {
        self.upload_limiter.len()
    }

    /// Number of accounts tracked by the download limiter.
    pub fn download_keys_count(&self) -> usize {
        self.download_limiter.len()
    }

    /// Evict idle accounts from the keyed limiters.
    ///
    /// `retain_recent()` removes entries whose cells have fully recharged.
    /// Called periodically from the cleanup task.
    pub fn shrink(&self) {
        self.upload_limiter.retain_recent();
        self.download_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many uploads from this account.
    UploadLimitExceeded,
    /// Too many downloads for this account.
    DownloadLimitExceeded,
    /// Global request rate exceeded across all accounts.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UploadLimitExceeded => write!(f, "upload rate limit exceeded"),
            Self::DownloadLimitExceeded => write!(f, "download rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

impl From<RateLimitError> for crate::error::ServerError {
    fn from(err: RateLimitError) -> Self {
        crate::error::ServerError::RateLimited {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(uploads: u32, downloads: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            uploads_per_minute: uploads,
            downloads_per_minute: downloads,
            global_requests_per_second: global,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&LimitsConfig::default());
        assert_eq!(limits.upload_keys_count(), 0);
        assert_eq!(limits.download_keys_count(), 0);
    }

    #[test]
    fn upload_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(5, 100, 1000));
        let user = UserId::new("alice");

        for _ in 0..5 {
            assert!(limits.check_upload(&user).is_ok());
        }
        assert_eq!(
            limits.check_upload(&user),
            Err(RateLimitError::UploadLimitExceeded)
        );
        // Downloads have their own budget.
        assert!(limits.check_download(&user).is_ok());
    }

    #[test]
    fn download_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(100, 3, 1000));
        let user = UserId::new("alice");

        for _ in 0..3 {
            assert!(limits.check_download(&user).is_ok());
        }
        assert_eq!(
            limits.check_download(&user),
            Err(RateLimitError::DownloadLimitExceeded)
        );
    }

    #[test]
    fn different_accounts_have_independent_limits() {
        let limits = RateLimits::new(&test_config(2, 2, 1000));
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert!(limits.check_upload(&alice).is_ok());
        assert!(limits.check_upload(&alice).is_ok());
        assert!(limits.check_upload(&alice).is_err());

        assert!(limits.check_upload(&bob).is_ok());
        assert!(limits.check_upload(&bob).is_ok());
        assert!(limits.check_upload(&bob).is_err());
    }

    #[test]
    fn global_rate_limiter_rejects_excess() {
        let limits = RateLimits::new(&test_config(100, 100, 5));

        for _ in 0..5 {
            assert!(limits.check_global().is_ok());
        }
        assert_eq!(
            limits.check_global(),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_limit_is_clamped() {
        let limits = RateLimits::new(&test_config(0, 0, 0));
        assert!(limits.check_upload(&UserId::new("alice")).is_ok());
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::UploadLimitExceeded.to_string(),
            "upload rate limit exceeded"
        );
        assert_eq!(
            RateLimitError::GlobalLimitExceeded.to_string(),
            "global rate limit exceeded"
        );
    }

    #[test]
    fn rate_limit_error_converts_to_429() {
        let err: crate::error::ServerError = RateLimitError::DownloadLimitExceeded.into();
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn shrink_does_not_panic() {
        let limits = RateLimits::new(&LimitsConfig::default());
        let _ = limits.check_upload(&UserId::new("alice"));
        let _ = limits.check_download(&UserId::new("bob"));
        assert!(limits.upload_keys_count() > 0);

        // Fresh entries may or may not be evicted; only assert no panic.
        limits.shrink();
    }
}
