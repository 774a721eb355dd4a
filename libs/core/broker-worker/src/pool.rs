//! Bounded worker pool.
//!
//! A counting semaphore sized to the concurrency limit. Each admitted
//! delivery holds one [`ConcurrencyToken`] for the whole handler invocation;
//! dropping the token returns the slot, including when the task panics.

use crate::error::BrokerError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of deliveries processed at once.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// One unit of pool capacity. Released on drop.
#[derive(Debug)]
pub struct ConcurrencyToken {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// Create a pool admitting at most `limit` concurrent deliveries.
    pub fn new(limit: usize) -> Result<Self, BrokerError> {
        if limit == 0 {
            return Err(BrokerError::invalid("concurrency must be greater than 0"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    /// Wait until capacity is available and take one token.
    pub async fn acquire(&self) -> ConcurrencyToken {
        // The pool owns the semaphore and never closes it.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("Semaphore closed");
        ConcurrencyToken { _permit: permit }
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(&self) -> Option<ConcurrencyToken> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConcurrencyToken { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.limit - self.available()
    }
}
