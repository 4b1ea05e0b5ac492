//! Wait budgets computed once and consumed across suspension points

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{CourierError, CourierResult};

/// A point in time after which an observer stops waiting.
///
/// The instant is computed once when the wait starts; every later wait uses
/// what is left of it, so time spent setting up never inflates the budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Duration,
}

impl Deadline {
    /// Start a budget of `timeout` from now; `None` never expires
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            // A budget past the clock's range never expires.
            Some(budget) => Self {
                at: Instant::now().checked_add(budget),
                budget,
            },
            None => Self::never(),
        }
    }

    /// A deadline that never expires
    pub fn never() -> Self {
        Self {
            at: None,
            budget: Duration::MAX,
        }
    }

    /// Check if this deadline is bounded
    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }

    /// Time left before expiry, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Check if the budget has been used up
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Push the deadline back, excluding time spent outside the wait
    pub fn extend(&mut self, by: Duration) {
        if let Some(at) = self.at {
            self.at = at.checked_add(by);
        }
    }

    /// Await `future` until the deadline, failing with a timeout error
    pub async fn wait<F: Future>(&self, future: F) -> CourierResult<F::Output> {
        match self.at {
            None => Ok(future.await),
            Some(at) => tokio::time::timeout_at(at, future)
                .await
                .map_err(|_| CourierError::timeout(self.budget)),
        }
    }
}
