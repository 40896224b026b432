// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request-coalescing async build queue: at most one build in flight per
//! fingerprint, with every concurrent requester fanned in to the same
//! result.
//!
//! Built on `tokio::sync` primitives and `Arc`-shared counters: a build
//! either has no waiters yet (spawn it) or already has some (join the
//! existing waiter list), and every waiter receives the same `Result`
//! clone when the single execution finishes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_core::{fingerprint, BuildDescriptor};
use cdn_error::{CdnError, ErrorKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, info};

/// The out-of-scope "actually run the pipeline" collaborator — in
/// production, `cdn-orchestrator`'s `BuildTask`.
#[async_trait]
pub trait BuildExecutor<T>: Send + Sync {
    /// Run the full build for `descriptor`, returning the shareable result
    /// every coalesced waiter receives a clone of.
    async fn execute(&self, descriptor: &BuildDescriptor) -> Result<T, CdnError>;
}

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<Result<T, CdnError>>,
}

enum SlotState<T> {
    Queued { waiters: Vec<Waiter<T>> },
    InProcess { waiters: Vec<Waiter<T>> },
}

impl<T> SlotState<T> {
    fn waiters_mut(&mut self) -> &mut Vec<Waiter<T>> {
        match self {
            SlotState::Queued { waiters } | SlotState::InProcess { waiters } => waiters,
        }
    }
}

/// A handle a caller uses to wait for (or abandon) one coalesced build.
pub struct Consumer<T> {
    fingerprint: String,
    id: u64,
    rx: oneshot::Receiver<Result<T, CdnError>>,
    state: Arc<Mutex<BTreeMap<String, SlotState<T>>>>,
}

impl<T> Consumer<T> {
    /// The fingerprint this consumer is waiting on.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// This consumer's waiter id, for a manual [`BuildQueue::remove_consumer`]
    /// call (e.g. a caller that drives its own `select!` against a deadline
    /// instead of using [`Consumer::wait_with_timeout`]).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait indefinitely for the coalesced build to finish.
    ///
    /// # Errors
    ///
    /// Propagates the build's own error, or `Fatal` if the queue dropped
    /// the sender without ever completing the build (a bug, not a normal
    /// outcome).
    pub async fn wait(self) -> Result<T, CdnError> {
        self.rx.await.unwrap_or_else(|_| Err(CdnError::new(ErrorKind::Fatal, "queue", "build task dropped without producing a result")))
    }

    /// Wait up to `deadline` for the coalesced build to finish.
    ///
    /// On expiry, this detaches itself from the fingerprint's waiter list
    /// (the same effect as [`BuildQueue::remove_consumer`]) before returning
    /// `Timeout` — the underlying build is never cancelled by a timed-out
    /// wait, only this caller's interest in its result.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if `deadline` elapses first.
    pub async fn wait_with_timeout(self, deadline: Duration) -> Result<T, CdnError> {
        let fingerprint = self.fingerprint.clone();
        let id = self.id;
        let state = Arc::clone(&self.state);
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdnError::new(ErrorKind::Fatal, "queue", "build task dropped without producing a result")),
            Err(_) => {
                let mut guard = state.lock().await;
                if let Some(slot) = guard.get_mut(&fingerprint) {
                    slot.waiters_mut().retain(|w| w.id != id);
                }
                drop(guard);
                Err(CdnError::new(ErrorKind::Timeout, "queue", "timed out waiting for build"))
            }
        }
    }
}

/// Coalescing build queue bounded by a fixed worker pool.
pub struct BuildQueue<T, E> {
    executor: Arc<E>,
    state: Arc<Mutex<BTreeMap<String, SlotState<T>>>>,
    semaphore: Arc<Semaphore>,
    next_waiter_id: AtomicU64,
}

impl<T, E> BuildQueue<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: BuildExecutor<T> + Send + Sync + 'static,
{
    /// Construct a queue bounded to `concurrency` simultaneous builds.
    #[must_use]
    pub fn new(executor: E, concurrency: usize) -> Self {
        Self {
            executor: Arc::new(executor),
            state: Arc::new(Mutex::new(BTreeMap::new())),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Submit `descriptor` for building, coalescing with any in-flight or
    /// queued build for the same fingerprint. `requester_tag` is carried
    /// only for logging (e.g. a request ID or client IP).
    pub async fn add(&self, descriptor: BuildDescriptor, requester_tag: impl Into<String>) -> Consumer<T> {
        let requester_tag = requester_tag.into();
        let fp = fingerprint(&descriptor);
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock().await;
        match state.get_mut(&fp) {
            Some(slot) => {
                debug!(target: "cdn.queue", fingerprint = %fp, requester_tag, waiter_id = id, "coalescing onto in-flight build");
                slot.waiters_mut().push(Waiter { id, tx });
            }
            None => {
                debug!(target: "cdn.queue", fingerprint = %fp, requester_tag, waiter_id = id, "starting new build");
                state.insert(fp.clone(), SlotState::Queued { waiters: vec![Waiter { id, tx }] });
                self.spawn_worker(fp.clone(), descriptor);
            }
        }
        drop(state);

        Consumer { fingerprint: fp, id, rx, state: Arc::clone(&self.state) }
    }

    /// Detach waiter `consumer_id` from the in-flight build for
    /// `fingerprint`, e.g. because its own caller already gave up via
    /// `Consumer::wait_with_timeout`. A no-op if the build has already
    /// completed and fanned out (the waiter list is gone by then) or the
    /// waiter was never registered.
    pub async fn remove_consumer(&self, fingerprint: &str, consumer_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.get_mut(fingerprint) {
            slot.waiters_mut().retain(|w| w.id != consumer_id);
        }
    }

    /// Number of fingerprints with a build currently queued or in-flight.
    pub async fn active_fingerprints(&self) -> usize {
        self.state.lock().await.len()
    }

    fn spawn_worker(&self, fp: String, descriptor: BuildDescriptor) {
        let executor = Arc::clone(&self.executor);
        let state = Arc::clone(&self.state);
        let semaphore = Arc::clone(&self.semaphore);

        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
            {
                let mut guard = state.lock().await;
                if let Some(slot) = guard.get_mut(&fp) {
                    let waiters = std::mem::take(slot.waiters_mut());
                    *slot = SlotState::InProcess { waiters };
                }
            }

            let result = executor.execute(&descriptor).await;
            drop(permit);

            let waiters = {
                let mut guard = state.lock().await;
                match guard.remove(&fp) {
                    Some(slot) => match slot {
                        SlotState::Queued { waiters } | SlotState::InProcess { waiters } => waiters,
                    },
                    None => Vec::new(),
                }
            };

            info!(target: "cdn.queue", fingerprint = %fp, waiters = waiters.len(), ok = result.is_ok(), "build finished, fanning out");
            for waiter in waiters {
                let _ = waiter.tx.send(clone_result(&result));
            }
        });
    }
}

fn clone_result<T: Clone>(result: &Result<T, CdnError>) -> Result<T, CdnError> {
    match result {
        Ok(value) => Ok(value.clone()),
        Err(err) => Err(CdnError::new(err.kind, err.stage.clone(), err.message.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdn_core::{Package, Target};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct CountingExecutor {
        calls: AtomicU32,
        delay: Duration,
        fail: bool,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl BuildExecutor<u32> for CountingExecutor {
        async fn execute(&self, _descriptor: &BuildDescriptor) -> Result<u32, CdnError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            } else {
                self.release.notified().await;
            }
            if self.fail {
                Err(CdnError::new(ErrorKind::BuildFailed, "bundle", "simulated failure"))
            } else {
                Ok(n)
            }
        }
    }

    fn descriptor() -> BuildDescriptor {
        BuildDescriptor::new(Package { name: "lodash".to_string(), version: "4.17.21".to_string(), submodule: String::new() }, 136, Target::Es2022)
    }

    #[tokio::test]
    async fn single_request_gets_the_build_result() {
        let release = Arc::new(Notify::new());
        release.notify_one();
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::ZERO, fail: false, release };
        let queue = BuildQueue::new(executor, 4);
        let consumer = queue.add(descriptor(), "test").await;
        assert_eq!(consumer.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_fingerprint_coalesce_to_one_execution() {
        let release = Arc::new(Notify::new());
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::ZERO, fail: false, release: Arc::clone(&release) };
        let queue = Arc::new(BuildQueue::new(executor, 4));

        let c1 = queue.add(descriptor(), "req-1").await;
        let c2 = queue.add(descriptor(), "req-2").await;
        let c3 = queue.add(descriptor(), "req-3").await;

        release.notify_waiters();
        let (r1, r2, r3) = tokio::join!(c1.wait(), c2.wait(), c3.wait());
        assert_eq!(r1.unwrap(), 1);
        assert_eq!(r2.unwrap(), 1);
        assert_eq!(r3.unwrap(), 1);
    }

    #[tokio::test]
    async fn distinct_fingerprints_each_get_their_own_execution() {
        let release = Arc::new(Notify::new());
        release.notify_one();
        release.notify_one();
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::ZERO, fail: false, release };
        let queue = BuildQueue::new(executor, 4);

        let mut desc_a = descriptor();
        desc_a.package.name = "react".to_string();
        let mut desc_b = descriptor();
        desc_b.package.name = "preact".to_string();

        let a = queue.add(desc_a, "req-a").await.wait().await.unwrap();
        let b = queue.add(desc_b, "req-b").await.wait().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn failure_is_fanned_out_to_every_waiter() {
        let release = Arc::new(Notify::new());
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::ZERO, fail: true, release: Arc::clone(&release) };
        let queue = Arc::new(BuildQueue::new(executor, 4));

        let c1 = queue.add(descriptor(), "req-1").await;
        let c2 = queue.add(descriptor(), "req-2").await;
        release.notify_waiters();

        let (r1, r2) = tokio::join!(c1.wait(), c2.wait());
        assert!(r1.is_err());
        assert!(r2.is_err());
    }

    #[tokio::test]
    async fn wait_with_timeout_times_out_without_cancelling_the_build() {
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::from_millis(200), fail: false, release: Arc::new(Notify::new()) };
        let queue = BuildQueue::new(executor, 4);
        let consumer = queue.add(descriptor(), "req-1").await;
        let err = consumer.wait_with_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn remove_consumer_detaches_without_affecting_other_waiters() {
        let release = Arc::new(Notify::new());
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::ZERO, fail: false, release: Arc::clone(&release) };
        let queue = Arc::new(BuildQueue::new(executor, 4));

        let c1 = queue.add(descriptor(), "req-1").await;
        let c2 = queue.add(descriptor(), "req-2").await;
        queue.remove_consumer(c1.fingerprint(), c1.id).await;
        drop(c1);

        release.notify_waiters();
        assert_eq!(c2.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected_across_distinct_fingerprints() {
        let release = Arc::new(Notify::new());
        let executor = CountingExecutor { calls: AtomicU32::new(0), delay: Duration::from_millis(50), fail: false, release };
        let queue = Arc::new(BuildQueue::new(executor, 1));

        let mut desc_a = descriptor();
        desc_a.package.name = "react".to_string();
        let mut desc_b = descriptor();
        desc_b.package.name = "preact".to_string();

        let start = tokio::time::Instant::now();
        let ca = queue.add(desc_a, "req-a").await;
        let cb = queue.add(desc_b, "req-b").await;
        let (_, _) = tokio::join!(ca.wait(), cb.wait());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
