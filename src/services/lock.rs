//! Cluster-wide mutual exclusion for periodic jobs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::store::PersistenceError;

/// A named lock held by at most one process at a time.
///
/// `try_acquire` never waits: a tick that cannot get the lock is skipped.
/// The TTL bounds how long a crashed holder keeps the lock.
#[async_trait]
pub trait PeriodicLock: Send + Sync {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, PersistenceError>;

    async fn release(&self, name: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPeriodicLock {
    held: Mutex<HashMap<String, Instant>>,
}

impl InMemoryPeriodicLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .get(name)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PeriodicLock for InMemoryPeriodicLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, PersistenceError> {
        let now = Instant::now();
        let mut held = self.held.lock();
        match held.get(name) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                held.insert(name.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str) -> Result<(), PersistenceError> {
        self.held.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let lock = InMemoryPeriodicLock::new();
        let ttl = Duration::from_secs(60);

        assert!(lock.try_acquire("overdue_tasks", ttl).await.unwrap());
        assert!(!lock.try_acquire("overdue_tasks", ttl).await.unwrap());
        assert!(lock.try_acquire("delayed_workflows", ttl).await.unwrap());

        lock.release("overdue_tasks").await.unwrap();
        assert!(!lock.is_held("overdue_tasks"));
        assert!(lock.try_acquire("overdue_tasks", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let lock = InMemoryPeriodicLock::new();
        assert!(lock.try_acquire("job", Duration::ZERO).await.unwrap());
        assert!(lock.try_acquire("job", Duration::from_secs(60)).await.unwrap());
    }
}
