//! Sync cycle state machine.
//!
//! A pure, side-effect-free description of one push-then-pull cycle with
//! retry. The state machine takes events as input and produces a new state
//! plus a list of actions to execute; `sync-client` performs the I/O.

use std::time::Duration;

/// Which half of a cycle is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Uploading pending operations.
    Push,
    /// Downloading remote operations.
    Pull,
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per phase before the cycle fails (including the first).
    pub max_attempts: u32,
    /// Delay for the first retry; doubled on each further attempt.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }
}

/// Cycle state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle running.
    Idle,
    /// Upload in progress.
    Pushing {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Download in progress.
    Pulling {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Waiting to retry a failed phase.
    Backoff {
        /// Phase to retry.
        phase: Phase,
        /// Attempt that failed.
        attempt: u32,
    },
}

impl CycleState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function apart from backoff jitter. The caller is
    /// responsible for executing the returned actions.
    pub fn on_event(self, event: Event, policy: &RetryPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Idle
            (Self::Idle, Event::SyncRequested) => {
                (Self::Pushing { attempt: 1 }, vec![Action::StartPush])
            }

            // From Pushing
            (Self::Pushing { .. }, Event::PushSucceeded) => {
                (Self::Pulling { attempt: 1 }, vec![Action::StartPull])
            }
            (Self::Pushing { attempt }, Event::Failed { transient, error }) => {
                fail_or_retry(Phase::Push, attempt, transient, error, policy)
            }

            // From Pulling
            (Self::Pulling { .. }, Event::PullSucceeded) => (
                Self::Idle,
                vec![Action::EmitEvent(SyncEvent::CycleCompleted)],
            ),
            (Self::Pulling { attempt }, Event::Failed { transient, error }) => {
                fail_or_retry(Phase::Pull, attempt, transient, error, policy)
            }

            // From Backoff
            (Self::Backoff { phase, attempt }, Event::RetryTimer) => {
                let next = attempt.saturating_add(1);
                match phase {
                    Phase::Push => (Self::Pushing { attempt: next }, vec![Action::StartPush]),
                    Phase::Pull => (Self::Pulling { attempt: next }, vec![Action::StartPull]),
                }
            }

            // Cancellation from any running state
            (Self::Pushing { .. } | Self::Pulling { .. } | Self::Backoff { .. }, Event::Cancelled) => (
                Self::Idle,
                vec![Action::EmitEvent(SyncEvent::CycleCancelled)],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a cycle is running.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}

fn fail_or_retry(
    phase: Phase,
    attempt: u32,
    transient: bool,
    error: String,
    policy: &RetryPolicy,
) -> (CycleState, Vec<Action>) {
    if transient && attempt < policy.max_attempts {
        let delay = calculate_backoff(policy, attempt);
        (
            CycleState::Backoff { phase, attempt },
            vec![
                Action::EmitEvent(SyncEvent::RetryScheduled {
                    phase,
                    attempt,
                    delay,
                    error,
                }),
                Action::StartRetryTimer { delay },
            ],
        )
    } else {
        (
            CycleState::Idle,
            vec![Action::EmitEvent(SyncEvent::CycleFailed { phase, error })],
        )
    }
}

/// Events that can occur during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked for a cycle.
    SyncRequested,
    /// Upload finished.
    PushSucceeded,
    /// Download finished.
    PullSucceeded,
    /// The running phase failed.
    Failed {
        /// Worth retrying (network abort, timeout, 5xx).
        transient: bool,
        /// Error message describing the failure.
        error: String,
    },
    /// Retry timer fired.
    RetryTimer,
    /// Caller abandoned the cycle.
    Cancelled,
}

/// Actions to be executed by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Upload the pending batch.
    StartPush,
    /// Download from the cursor.
    StartPull,
    /// Wait before retrying.
    StartRetryTimer {
        /// Delay before the retry.
        delay: Duration,
    },
    /// Emit an event to the application.
    EmitEvent(SyncEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Push and pull both succeeded.
    CycleCompleted,
    /// A phase failed permanently or ran out of attempts.
    CycleFailed {
        /// Failing phase.
        phase: Phase,
        /// Error message describing the failure.
        error: String,
    },
    /// A transient failure will be retried.
    RetryScheduled {
        /// Failing phase.
        phase: Phase,
        /// Attempt that failed.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
        /// Error message describing the failure.
        error: String,
    },
    /// The cycle was abandoned.
    CycleCancelled,
}

/// Calculate retry backoff with jitter.
///
/// Uses exponential backoff with random jitter to prevent thundering herd
/// when many clients retry simultaneously after a server restart.
///
/// Formula: min(max_delay, base_delay * 2^(attempt-1)) + random(0..=max_jitter)
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay);

    let max_jitter_ms = policy.max_jitter.as_millis() as u64;
    if max_jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(random_jitter_ms(max_jitter_ms))
}

/// Generate random jitter between 0 and `max_ms` milliseconds.
fn random_jitter_ms(max_ms: u64) -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    let random = u64::from_le_bytes(bytes);
    random % (max_ms + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    fn fail(transient: bool) -> Event {
        Event::Failed {
            transient,
            error: "boom".into(),
        }
    }

    #[test]
    fn starts_idle() {
        let state = CycleState::new();
        assert!(!state.is_running());
    }

    #[test]
    fn sync_request_starts_push() {
        let (state, actions) = CycleState::Idle.on_event(Event::SyncRequested, &policy());
        assert_eq!(state, CycleState::Pushing { attempt: 1 });
        assert_eq!(actions, vec![Action::StartPush]);
    }

    #[test]
    fn push_then_pull_then_idle() {
        let p = policy();
        let (state, _) = CycleState::Idle.on_event(Event::SyncRequested, &p);
        let (state, actions) = state.on_event(Event::PushSucceeded, &p);
        assert_eq!(state, CycleState::Pulling { attempt: 1 });
        assert_eq!(actions, vec![Action::StartPull]);

        let (state, actions) = state.on_event(Event::PullSucceeded, &p);
        assert_eq!(state, CycleState::Idle);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EmitEvent(SyncEvent::CycleCompleted))));
    }

    #[test]
    fn sync_request_while_running_is_ignored() {
        let state = CycleState::Pushing { attempt: 1 };
        let (state, actions) = state.on_event(Event::SyncRequested, &policy());
        assert_eq!(state, CycleState::Pushing { attempt: 1 });
        assert!(actions.is_empty());
    }

    // ===========================================
    // Failures and retry
    // ===========================================

    #[test]
    fn transient_push_failure_backs_off() {
        let (state, actions) = CycleState::Pushing { attempt: 1 }.on_event(fail(true), &policy());
        assert_eq!(
            state,
            CycleState::Backoff {
                phase: Phase::Push,
                attempt: 1
            }
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartRetryTimer { .. })));
    }

    #[test]
    fn retry_timer_resumes_same_phase() {
        let state = CycleState::Backoff {
            phase: Phase::Pull,
            attempt: 2,
        };
        let (state, actions) = state.on_event(Event::RetryTimer, &policy());
        assert_eq!(state, CycleState::Pulling { attempt: 3 });
        assert_eq!(actions, vec![Action::StartPull]);
    }

    #[test]
    fn permanent_failure_ends_cycle() {
        let (state, actions) = CycleState::Pulling { attempt: 1 }.on_event(fail(false), &policy());
        assert_eq!(state, CycleState::Idle);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::EmitEvent(SyncEvent::CycleFailed {
                phase: Phase::Pull,
                ..
            })
        )));
    }

    #[test]
    fn attempts_are_bounded() {
        let p = RetryPolicy::immediate(3);
        let (state, _) = CycleState::Pushing { attempt: 3 }.on_event(fail(true), &p);
        assert_eq!(state, CycleState::Idle);
    }

    #[test]
    fn cancel_returns_to_idle() {
        let (state, actions) = CycleState::Backoff {
            phase: Phase::Push,
            attempt: 1,
        }
        .on_event(Event::Cancelled, &policy());
        assert_eq!(state, CycleState::Idle);
        assert_eq!(
            actions,
            vec![Action::EmitEvent(SyncEvent::CycleCancelled)]
        );
    }

    // ===========================================
    // Backoff
    // ===========================================

    #[test]
    fn backoff_increases_with_attempt() {
        let p = policy();
        assert!(calculate_backoff(&p, 1) >= Duration::from_secs(1));
        assert!(calculate_backoff(&p, 4) >= Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_at_max_delay_plus_jitter() {
        let delay = calculate_backoff(&policy(), 20);
        assert!(
            delay <= Duration::from_secs(35),
            "delay must be capped at ~35s (30s base + 5s jitter), got {:?}",
            delay
        );
    }

    #[test]
    fn jitter_creates_variance() {
        let p = policy();
        let delays: Vec<Duration> = (0..20).map(|_| calculate_backoff(&p, 3)).collect();
        let min = delays.iter().min().unwrap();
        let max = delays.iter().max().unwrap();
        assert!(
            max.as_millis() - min.as_millis() >= 100,
            "Expected jitter variance, got min={:?} max={:?}",
            min,
            max
        );
    }

    #[test]
    fn immediate_policy_has_no_delay() {
        assert_eq!(calculate_backoff(&RetryPolicy::immediate(3), 5), Duration::ZERO);
    }
}
