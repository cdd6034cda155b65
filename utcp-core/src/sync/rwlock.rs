//! Writer-preferring asynchronous reader-writer lock.
//!
//! Readers pass through a turnstile and then take one permit from a shared
//! pool; a writer first serializes against other writers, seizes the
//! turnstile so no new reader can enter, then drains the entire permit pool,
//! which completes once every active reader has finished. Guards release
//! synchronously on drop, so the lock composes with any control flow.
//!
//! Invariants:
//! - any number of readers may hold the lock concurrently;
//! - writers are exclusive and serialized;
//! - a waiting writer blocks new readers (no writer starvation).

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Upper bound on concurrent readers; effectively unlimited.
const MAX_READERS: u32 = u32::MAX >> 3;

#[derive(Debug)]
pub struct TurnstileRwLock {
    turnstile: Arc<Mutex<()>>,
    writers: Arc<Mutex<()>>,
    permits: Arc<Semaphore>,
}

impl TurnstileRwLock {
    pub fn new() -> Self {
        Self {
            turnstile: Arc::new(Mutex::new(())),
            writers: Arc::new(Mutex::new(())),
            permits: Arc::new(Semaphore::new(MAX_READERS as usize)),
        }
    }

    /// Acquire shared read access.
    pub async fn read(&self) -> ReadGuard {
        // Pass the turnstile so a queued writer can hold readers back.
        drop(self.turnstile.lock().await);
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("reader-writer semaphore is never closed");
        ReadGuard { _permit: permit }
    }

    /// Acquire exclusive write access.
    pub async fn write(&self) -> WriteGuard {
        let writers = self.writers.clone().lock_owned().await;
        let turnstile = self.turnstile.clone().lock_owned().await;
        let permits = self
            .permits
            .clone()
            .acquire_many_owned(MAX_READERS)
            .await
            .expect("reader-writer semaphore is never closed");
        WriteGuard {
            _permits: permits,
            _turnstile: turnstile,
            _writers: writers,
        }
    }
}

impl Default for TurnstileRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ReadGuard {
    _permit: OwnedSemaphorePermit,
}

/// Fields drop in declaration order: the permit pool refills before the
/// turnstile reopens, so queued readers resume behind any queued writer.
#[derive(Debug)]
pub struct WriteGuard {
    _permits: OwnedSemaphorePermit,
    _turnstile: OwnedMutexGuard<()>,
    _writers: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn readers_run_concurrently() {
        let lock = Arc::new(TurnstileRwLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.read().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers should overlap");
    }

    #[tokio::test]
    async fn writer_is_exclusive() {
        let lock = Arc::new(TurnstileRwLock::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.write().await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(before % 2, 0, "another writer is active");
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn waiting_writer_blocks_new_readers() {
        let lock = Arc::new(TurnstileRwLock::new());

        let first_reader = lock.read().await;

        let writer_lock = lock.clone();
        let writer = tokio::spawn(async move {
            let _guard = writer_lock.write().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        // Give the writer time to seize the turnstile.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reader_lock = lock.clone();
        let late_reader = tokio::spawn(async move {
            let _guard = reader_lock.read().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !late_reader.is_finished(),
            "a reader arriving behind a waiting writer must queue"
        );

        drop(first_reader);
        writer.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), late_reader)
            .await
            .expect("late reader should eventually acquire")
            .unwrap();
    }
}
