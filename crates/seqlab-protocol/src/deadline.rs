//! Wall-clock deadline shared by transport, spawn-capture and bulk
//! transfer loops.
//!
//! A [`Deadline`] is an absolute expiry instant. Loops that make
//! incremental progress (bulk transfer chunks) use [`Deadline::reset`]
//! to push the expiry out again, turning it into a stall timeout:
//! "slow but alive" keeps going, "hung" fails.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

/// The deadline elapsed before the operation completed.
#[derive(Debug, Error)]
#[error("deadline of {budget:?} elapsed")]
pub struct DeadlineExpired {
    /// The budget the deadline was last armed with.
    pub budget: Duration,
}

/// An absolute wall-clock expiry.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires: Instant,
    budget: Duration,
}

impl Deadline {
    /// Arm a deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            expires: Instant::now() + budget,
            budget,
        }
    }

    /// Time left before expiry, or `None` if already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires.checked_duration_since(Instant::now())
    }

    /// Whether the deadline has elapsed.
    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Re-arm the deadline `budget` from now. Called on every unit of
    /// forward progress when the deadline acts as a stall timeout.
    pub fn reset(&mut self, budget: Duration) {
        self.expires = Instant::now() + budget;
        self.budget = budget;
    }

    /// The budget this deadline was last armed with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run `fut` to completion, failing with [`DeadlineExpired`] if the
    /// deadline elapses first.
    pub async fn bound<F, T>(&self, fut: F) -> Result<T, DeadlineExpired>
    where
        F: Future<Output = T>,
    {
        let expired = || DeadlineExpired {
            budget: self.budget,
        };
        let Some(remaining) = self.remaining() else {
            return Err(expired());
        };
        tokio::time::timeout(remaining, fut)
            .await
            .map_err(|_| expired())
    }
}
