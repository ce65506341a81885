//! Retry of a single sync phase.
//!
//! Full cycles are driven by [`CycleState`](opsync_core::CycleState); this is
//! the same backoff schedule for callers running one phase on its own.

use std::future::Future;

use opsync_core::{calculate_backoff, Phase, RetryPolicy};
use tracing::warn;

use crate::client::ClientError;

/// Run `attempt` until it succeeds, fails permanently, or runs out of
/// attempts. Transient failures sleep for the backoff delay in between.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    phase: Phase,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut number = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && number < policy.max_attempts => {
                let delay = calculate_backoff(policy, number);
                warn!(?phase, attempt = number, ?delay, %error, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                number += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
