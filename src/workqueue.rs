/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! A keyed work queue with de-duplication and rate-limited retries.
//!
//! Keys are `namespace/name` strings. A key already waiting in the queue is
//! never queued twice, and a key whose sync is currently running is
//! coalesced into a single re-run afterwards, which also makes execution
//! serial per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signal::ShutdownRx;

// The first few retries of a key are fast, everything after backs off to the
// slow delay.
const FAST_RETRIES: u32 = 5;
const FAST_DELAY: Duration = Duration::from_millis(20);
const SLOW_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct WorkerQueue {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    rerun: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

impl WorkerQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::default(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Number of keys waiting in the queue (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a key to the queue. A no-op if the key is already waiting; if
    /// the key is currently being synced, it is re-queued once afterwards.
    pub fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutdown || state.queued.contains(&key) {
            return;
        }
        if state.running.contains(&key) {
            state.rerun.insert(key);
            return;
        }
        state.queued.insert(key.clone());
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Re-queues a failed key after its rate-limited delay.
    pub fn requeue_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.to_owned()).or_default();
            *failures += 1;
            if *failures <= FAST_RETRIES {
                FAST_DELAY
            } else {
                SLOW_DELAY
            }
        };
        self.enqueue_after(key.to_owned(), delay);
    }

    fn enqueue_after(&self, key: String, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Clears the failure history of a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.running.remove(key);
        if state.rerun.remove(key) && !state.shutdown {
            state.queued.insert(key.to_owned());
            state.queue.push_back(key.to_owned());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.running.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // wake a sibling for the rest of the backlog
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            self.inner.notify.notified().await;
        }
    }

    fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    /// Runs `workers` workers against the queue until shutdown. Sync
    /// failures are re-queued rate limited; panics in the sync callback are
    /// recovered so they cannot take the queue down.
    pub async fn run<F, Fut>(&self, workers: usize, mut shutdown: ShutdownRx, sync: F)
    where
        F: Fn(String) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let queue = self.clone();
            let sync = sync.clone();
            tasks.spawn(async move {
                while let Some(key) = queue.next().await {
                    match std::panic::AssertUnwindSafe(sync(key.clone()))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => queue.forget(&key),
                        Ok(Err(error)) => {
                            tracing::error!(queue = queue.name(), key, %error, "error syncing key");
                            crate::metrics::reconcile_errors_total(queue.name()).inc();
                            queue.requeue_rate_limited(&key);
                        }
                        Err(_) => {
                            tracing::error!(queue = queue.name(), key, "sync panicked");
                            crate::metrics::reconcile_errors_total(queue.name()).inc();
                            queue.requeue_rate_limited(&key);
                        }
                    }
                    queue.done(&key);
                }
            });
        }

        let _ = shutdown.changed().await;
        self.shutdown();
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::signal;

    fn counting_sync(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn(String) -> futures::future::BoxFuture<'static, crate::Result<()>> + Clone {
        move |_key| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn queued_keys_are_deduplicated() {
        let queue = WorkerQueue::new("test");
        let syncs = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = signal::channel();

        queue.enqueue("default/one");
        queue.enqueue("default/one");
        queue.enqueue("default/one");

        let runner = {
            let queue = queue.clone();
            let syncs = syncs.clone();
            tokio::spawn(async move { queue.run(2, shutdown_rx, counting_sync(syncs)).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_keys_are_coalesced_into_one_rerun() {
        let queue = WorkerQueue::new("test");
        let syncs = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = signal::channel();

        let runner = {
            let queue = queue.clone();
            let syncs = syncs.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |_key| {
                        let syncs = syncs.clone();
                        async move {
                            syncs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        }
                    })
                    .await
            })
        };

        queue.enqueue("default/one");
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the first sync is mid-flight; these coalesce into a single re-run
        queue.enqueue("default/one");
        queue.enqueue("default/one");

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(syncs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_keys_are_retried() {
        let queue = WorkerQueue::new("test");
        let attempts = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = signal::channel();

        let runner = {
            let queue = queue.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |_key| {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                Err(eyre::eyre!("transient"))
                            } else {
                                Ok(())
                            }
                        }
                    })
                    .await
            })
        };

        queue.enqueue("default/retry");
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panics_do_not_take_down_the_queue() {
        let queue = WorkerQueue::new("test");
        let attempts = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = signal::channel();

        let runner = {
            let queue = queue.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move {
                queue
                    .run(1, shutdown_rx, move |_key| {
                        let attempts = attempts.clone();
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                panic!("boom");
                            }
                            Ok(())
                        }
                    })
                    .await
            })
        };

        queue.enqueue("default/panicky");
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        // panicked once, then re-queued and succeeded
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
