//! Run-wide request and token budget shared by all workers.
//!
//! Two independent limits:
//! - a requests-per-minute pacer: callers wait for the next free slot
//! - a total token budget: once spent, no new work is started
//!
//! The token counter is updated atomically; the pacer serializes slot
//! reservation behind a lock so concurrent callers get distinct slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::trajectory::TokenUsage;

/// Shared budget handle.
#[derive(Debug)]
pub struct RunBudget {
    /// Maximum tokens for the whole run.
    token_limit: Option<u64>,
    /// Tokens consumed so far.
    tokens_used: AtomicU64,
    /// Completion requests made so far.
    requests: AtomicU64,
    pacer: Option<Pacer>,
}

#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl RunBudget {
    /// A budget without limits.
    pub fn unlimited() -> Self {
        Self {
            token_limit: None,
            tokens_used: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            pacer: None,
        }
    }

    /// Caps the total number of tokens for the run.
    pub fn with_token_limit(mut self, limit: Option<u64>) -> Self {
        self.token_limit = limit;
        self
    }

    /// Limits completion requests to `rpm` per minute, spaced evenly.
    pub fn with_requests_per_minute(mut self, rpm: Option<u32>) -> Self {
        self.pacer = rpm.filter(|r| *r > 0).map(|rpm| Pacer {
            interval: Duration::from_secs(60) / rpm,
            next_slot: Mutex::new(Instant::now()),
        });
        self
    }

    /// Waits until a request slot is available and claims it.
    pub async fn acquire_request_slot(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let Some(pacer) = &self.pacer else {
            return;
        };

        let wait = {
            let mut next = pacer.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + pacer.interval;
            slot - now
        };

        if !wait.is_zero() {
            tracing::debug!(delay_ms = wait.as_millis() as u64, "Waiting for request slot");
            tokio::time::sleep(wait).await;
        }
    }

    /// Records token usage from one completion.
    pub fn record(&self, usage: &TokenUsage) {
        let total = self
            .tokens_used
            .fetch_add(usage.total_tokens as u64, Ordering::SeqCst)
            + usage.total_tokens as u64;

        if let Some(limit) = self.token_limit {
            if total >= limit && total - (usage.total_tokens as u64) < limit {
                tracing::warn!(tokens_used = total, token_limit = limit, "Token budget exhausted");
            }
        }
    }

    /// Whether the token budget has been spent.
    pub fn is_exhausted(&self) -> bool {
        self.token_limit
            .is_some_and(|limit| self.tokens_used.load(Ordering::SeqCst) >= limit)
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::SeqCst)
    }

    pub fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Tokens left, if a limit is set.
    pub fn remaining_tokens(&self) -> Option<u64> {
        self.token_limit
            .map(|limit| limit.saturating_sub(self.tokens_used()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_exhausted() {
        let budget = RunBudget::unlimited();
        budget.record(&TokenUsage::new(1_000_000, 1_000_000));
        assert!(!budget.is_exhausted());
        assert_eq!(budget.remaining_tokens(), None);
        assert_eq!(budget.tokens_used(), 2_000_000);
    }

    #[test]
    fn test_token_limit() {
        let budget = RunBudget::unlimited().with_token_limit(Some(100));
        budget.record(&TokenUsage::new(40, 20));
        assert!(!budget.is_exhausted());
        assert_eq!(budget.remaining_tokens(), Some(40));

        budget.record(&TokenUsage::new(30, 10));
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining_tokens(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_requests() {
        let budget = RunBudget::unlimited().with_requests_per_minute(Some(60));
        let start = Instant::now();

        budget.acquire_request_slot().await;
        budget.acquire_request_slot().await;
        budget.acquire_request_slot().await;

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(budget.requests_made(), 3);
    }

    #[tokio::test]
    async fn test_no_pacer_does_not_wait() {
        let budget = RunBudget::unlimited().with_requests_per_minute(Some(0));
        let start = std::time::Instant::now();
        for _ in 0..10 {
            budget.acquire_request_slot().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
