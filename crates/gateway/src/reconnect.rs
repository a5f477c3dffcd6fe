// Client reconnect policy: exponential backoff with jitter and a bounded
// attempt ceiling.
//
// The observable state machine:
//   Disconnected → Reconnecting → Connected   (attempt succeeded)
//   Disconnected → Reconnecting → ... → Failed (ceiling exhausted)
//
// `Failed` is terminal until an explicit new connect resets the session to
// `Disconnected`.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 30_000;

/// Compute exponential backoff delay for a given attempt number (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(7); // cap exponent to avoid overflow
    let delay_ms = BASE_DELAY_MS.saturating_mul(1u64 << exp).min(MAX_DELAY_MS);
    Duration::from_millis(delay_ms)
}

/// Backoff with up to 25% additive jitter so reconnecting clients spread out.
pub fn backoff_delay_with_jitter(attempt: u32) -> Duration {
    let base = backoff_delay(attempt);
    let jitter_ceiling = (base.as_millis() as u64) / 4;
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    base + Duration::from_millis(jitter)
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Disconnected,
    Reconnecting { attempt: u32 },
    Connected,
    Failed,
}

impl ReconnectState {
    /// Begin (or continue) reconnecting. Exhausting the policy's attempt
    /// ceiling transitions to `Failed`.
    pub fn next_attempt(self, policy: &ReconnectPolicy) -> Self {
        match self {
            Self::Disconnected => {
                if policy.max_attempts == 0 {
                    Self::Failed
                } else {
                    Self::Reconnecting { attempt: 1 }
                }
            }
            Self::Reconnecting { attempt } => {
                if attempt >= policy.max_attempts {
                    Self::Failed
                } else {
                    Self::Reconnecting { attempt: attempt + 1 }
                }
            }
            // Terminal until an explicit connect resets the session.
            Self::Failed => Self::Failed,
            Self::Connected => Self::Connected,
        }
    }

    /// A reconnect attempt succeeded.
    pub fn connected(self) -> Self {
        match self {
            Self::Disconnected | Self::Reconnecting { .. } => Self::Connected,
            other => other,
        }
    }

    /// The live connection dropped.
    pub fn disconnected(self) -> Self {
        match self {
            Self::Connected => Self::Disconnected,
            other => other,
        }
    }

    /// An explicit new connect call restarts a failed session.
    pub fn reset(self) -> Self {
        Self::Disconnected
    }

    /// The backoff to wait before the current attempt.
    pub fn backoff(self) -> Option<Duration> {
        match self {
            Self::Reconnecting { attempt } => Some(backoff_delay_with_jitter(attempt - 1)),
            _ => None,
        }
    }
}
