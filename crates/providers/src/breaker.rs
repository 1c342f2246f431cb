use crate::error::ProviderError;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Closed { failures: usize },
    Open { since: Instant },
    /// One trial call is in flight; everyone else is still rejected.
    Trial { started: Instant },
}

/// Stops calling a provider after repeated failed calls. After the cooldown a
/// single trial call decides whether the circuit closes again.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, BreakerState::Closed { .. }) {
            info!("Circuit breaker closed");
        }
        *state = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 < self.failure_threshold => {
                BreakerState::Closed {
                    failures: failures + 1,
                }
            }
            BreakerState::Closed { failures } => {
                warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    failures + 1
                );
                BreakerState::Open {
                    since: Instant::now(),
                }
            }
            BreakerState::Open { .. } | BreakerState::Trial { .. } => BreakerState::Open {
                since: Instant::now(),
            },
        };
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.state.lock(), BreakerState::Closed { .. })
    }

    /// Admits the caller, or rejects with [`ProviderError::CircuitOpen`]. A
    /// trial that never reports back is replaced after another cooldown.
    pub fn should_allow_request(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } | BreakerState::Trial { started: since }
                if since.elapsed() >= self.cooldown =>
            {
                *state = BreakerState::Trial {
                    started: Instant::now(),
                };
                Ok(())
            }
            BreakerState::Open { .. } | BreakerState::Trial { .. } => {
                Err(ProviderError::CircuitOpen)
            }
        }
    }
}

/// Backoff before the next attempt. Rate limits honor the server's hint.
pub fn retry_delay_for_error(attempt: u32, err: &ProviderError) -> Duration {
    match err {
        ProviderError::RateLimited {
            retry_after: Some(seconds),
            ..
        } => Duration::from_secs((*seconds).min(90)),
        ProviderError::RateLimited { .. } => {
            Duration::from_secs((2_u64.saturating_pow(attempt + 1)).min(30))
        }
        _ => Duration::from_millis((250_u64.saturating_mul(2_u64.saturating_pow(attempt))).min(5000)),
    }
}
