// 🔄 Refresh Task - recompute on poll, newest result wins
//
// Each submit starts a new generation and aborts whatever was in flight.
// A result is published only if its generation is still the latest one,
// so a slow stale computation can never overwrite a newer result.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A published refresh result
#[derive(Debug)]
pub struct Published<T> {
    pub generation: u64,
    pub value: Arc<T>,
    pub completed_at: DateTime<Utc>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Published {
            generation: self.generation,
            value: Arc::clone(&self.value),
            completed_at: self.completed_at,
        }
    }
}

struct Inner<T> {
    generation: AtomicU64,
    latest: RwLock<Option<Published<T>>>,
    published_tx: watch::Sender<u64>,
}

impl<T> Inner<T> {
    /// Returns false when the result was superseded and dropped
    fn publish(&self, generation: u64, value: T) -> bool {
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());

        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(generation, "refresh superseded, result dropped");
            return false;
        }
        if latest.as_ref().map_or(false, |p| p.generation >= generation) {
            return false;
        }

        *latest = Some(Published {
            generation,
            value: Arc::new(value),
            completed_at: Utc::now(),
        });
        let _ = self.published_tx.send(generation);
        true
    }
}

/// Cancellable, supersede-on-submit refresher
pub struct Refresher<T> {
    inner: Arc<Inner<T>>,
    inflight: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Refresher<T> {
    pub fn new() -> Self {
        let (published_tx, _) = watch::channel(0);
        Refresher {
            inner: Arc::new(Inner {
                generation: AtomicU64::new(0),
                latest: RwLock::new(None),
                published_tx,
            }),
            inflight: Mutex::new(None),
        }
    }

    /// Start a refresh, superseding any refresh still running.
    /// Must be called from inside a tokio runtime.
    pub fn submit<F>(&self, work: F) -> u64
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.submit_with(|_| work)
    }

    /// Like `submit`, but the work receives its generation so blocking
    /// sections can bail out early once `is_current` turns false.
    pub fn submit_with<W, F>(&self, make_work: W) -> u64
    where
        W: FnOnce(u64) -> F,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        // Held across bump, spawn and replace so that abort order follows
        // generation order even when submits race
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let work = make_work(generation);
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            match work.await {
                Ok(value) => {
                    inner.publish(generation, value);
                }
                Err(e) if inner.generation.load(Ordering::SeqCst) != generation => {
                    debug!(generation, error = %e, "superseded refresh stopped")
                }
                Err(e) => warn!(generation, error = %e, "refresh failed, keeping previous result"),
            }
        });

        if let Some(previous) = inflight.replace(handle) {
            previous.abort();
        }

        generation
    }

    /// Whether `generation` is still the newest submit
    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Most recently published result
    pub fn latest(&self) -> Option<Published<T>> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Generation of the most recent submit
    pub fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Receives the generation of every published result
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.published_tx.subscribe()
    }

    /// Abort the in-flight refresh, if any, without publishing
    pub fn cancel(&self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = inflight.take() {
            handle.abort();
        }
    }
}

impl<T: Send + Sync + 'static> Default for Refresher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Refresher<T> {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.inflight.lock() {
            if let Some(handle) = inflight.take() {
                handle.abort();
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn wait_for(refresher: &Refresher<u32>, generation: u64) {
        let mut rx = refresher.subscribe();
        timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() < generation {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_newest_submit_wins() {
        let refresher: Refresher<u32> = Refresher::new();

        let slow = refresher.submit(async {
            sleep(Duration::from_millis(200)).await;
            Ok(1)
        });
        let fast = refresher.submit(async { Ok(2) });
        assert_eq!(slow, 1);
        assert_eq!(fast, 2);

        wait_for(&refresher, fast).await;
        sleep(Duration::from_millis(300)).await;

        let latest = refresher.latest().unwrap();
        assert_eq!(latest.generation, 2);
        assert_eq!(*latest.value, 2);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let refresher: Refresher<u32> = Refresher::new();
        let current = refresher.submit(async { Ok(10) });
        wait_for(&refresher, current).await;

        assert!(!refresher.inner.publish(current - 1, 99));
        assert_eq!(*refresher.latest().unwrap().value, 10);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_result() {
        let refresher: Refresher<u32> = Refresher::new();
        let first = refresher.submit(async { Ok(7) });
        wait_for(&refresher, first).await;

        refresher.submit(async { Err(anyhow::anyhow!("ledger sync unavailable")) });
        sleep(Duration::from_millis(50)).await;

        let latest = refresher.latest().unwrap();
        assert_eq!(latest.generation, first);
        assert_eq!(*latest.value, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_submits_never_lose_the_newest() {
        let runtime = tokio::runtime::Handle::current();

        for _ in 0..200 {
            let refresher: Arc<Refresher<u32>> = Arc::new(Refresher::new());
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let refresher = Arc::clone(&refresher);
                    let barrier = Arc::clone(&barrier);
                    let runtime = runtime.clone();
                    std::thread::spawn(move || {
                        let _guard = runtime.enter();
                        barrier.wait();
                        refresher.submit(async {
                            sleep(Duration::from_millis(5)).await;
                            Ok(1)
                        })
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            let newest = refresher.current_generation();
            assert_eq!(newest, 2);
            wait_for(&refresher, newest).await;
            assert_eq!(refresher.latest().unwrap().generation, newest);
        }
    }

    #[tokio::test]
    async fn test_work_sees_whether_it_was_superseded() {
        let refresher: Arc<Refresher<u32>> = Arc::new(Refresher::new());

        let observer = Arc::clone(&refresher);
        let first = refresher.submit_with(move |generation| async move {
            Ok(u32::from(observer.is_current(generation)))
        });
        wait_for(&refresher, first).await;
        assert_eq!(*refresher.latest().unwrap().value, 1);

        assert!(refresher.is_current(first));
        let second = refresher.submit(async { Ok(2) });
        assert!(!refresher.is_current(first));
        assert!(refresher.is_current(second));
    }

    #[tokio::test]
    async fn test_cancel_prevents_publication() {
        let refresher: Refresher<u32> = Refresher::new();
        refresher.submit(async {
            sleep(Duration::from_millis(100)).await;
            Ok(5)
        });
        refresher.cancel();
        sleep(Duration::from_millis(200)).await;

        assert!(refresher.latest().is_none());
    }
}
