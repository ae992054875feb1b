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

//! The batched matchmaker. A single driver task serializes matching against
//! a cached snapshot of the sorted ready list, which removes all races over
//! shared inventory, while a pool of update workers commits reservations
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use super::find::{find_game_server_for_allocation, TOP_N_GAME_SERVER_COUNT};
use super::{AllocationError, ReadyGameServerCache};
use crate::api::allocation::MetaPatch;
use crate::api::policy::connection_info_sequence;
use crate::api::{GameServer, GameServerAllocation};
use crate::cluster::{AllocationPolicies, EventSeverity, Recorder, Secrets};
use crate::signal::ShutdownRx;

const MAX_BATCH_QUEUE: usize = 100;
// refresh the cached list after this many requests served from one snapshot,
// so it cannot drift arbitrarily far from truth under sustained load
const MAX_BATCH_BEFORE_REFRESH: usize = 100;
// how long the driver idles before dropping its snapshot
const BATCH_WAIT: Duration = Duration::from_millis(500);

const RETRY_STEPS: usize = 5;
const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_JITTER: f64 = 0.1;

/// An async allocation request travelling into the driver loop.
struct Request {
    gsa: GameServerAllocation,
    reply: oneshot::Sender<Result<GameServer, AllocationError>>,
}

/// A matched pair handed from the driver to the update workers.
struct Matched {
    patch: MetaPatch,
    gs: GameServer,
    reply: oneshot::Sender<Result<GameServer, AllocationError>>,
}

pub struct Allocator {
    ready_cache: Arc<ReadyGameServerCache>,
    policies: Arc<dyn AllocationPolicies>,
    secrets: Arc<dyn Secrets>,
    recorder: Arc<dyn Recorder>,
    cluster_name: String,
    top_n: usize,
    pending: mpsc::Sender<Request>,
    pending_rx: Mutex<Option<mpsc::Receiver<Request>>>,
}

impl Allocator {
    pub fn new(
        ready_cache: Arc<ReadyGameServerCache>,
        policies: Arc<dyn AllocationPolicies>,
        secrets: Arc<dyn Secrets>,
        recorder: Arc<dyn Recorder>,
        cluster_name: impl Into<String>,
    ) -> Arc<Self> {
        let (pending, pending_rx) = mpsc::channel(MAX_BATCH_QUEUE);
        Arc::new(Self {
            ready_cache,
            policies,
            secrets,
            recorder,
            cluster_name: cluster_name.into(),
            top_n: TOP_N_GAME_SERVER_COUNT,
            pending,
            pending_rx: Mutex::new(Some(pending_rx)),
        })
    }

    /// Allocates a ready game server for the request. The returned record
    /// always carries a status: `Allocated` with the reserved game server's
    /// details, `UnAllocated` when nothing matched, or `Contention` when the
    /// retry budget was spent losing races.
    pub async fn allocate(
        &self,
        gsa: GameServerAllocation,
        shutdown: ShutdownRx,
    ) -> Result<GameServerAllocation, AllocationError> {
        let causes = gsa.validate();
        if !causes.is_empty() {
            let detail = causes
                .into_iter()
                .filter_map(|cause| cause.message)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(AllocationError::Invalid(detail));
        }

        if gsa.spec.multi_cluster_setting.enabled {
            self.apply_multi_cluster_allocation(gsa, shutdown).await
        } else {
            self.allocate_from_local_cluster(gsa, shutdown).await
        }
    }

    async fn allocate_from_local_cluster(
        &self,
        mut gsa: GameServerAllocation,
        shutdown: ShutdownRx,
    ) -> Result<GameServerAllocation, AllocationError> {
        match self.allocate_with_retry(&gsa, &shutdown).await {
            Ok(gs) => {
                gsa.fulfill(&gs);
                crate::metrics::allocations_total("allocated").inc();
                tracing::info!(game_server = gs.key(), "game server allocation");
                Ok(gsa)
            }
            Err(AllocationError::NoReady) => {
                gsa.unallocated();
                crate::metrics::allocations_total("unallocated").inc();
                Ok(gsa)
            }
            Err(AllocationError::Contention) => {
                // the whole retry budget went to lost races; resync the view
                // before surfacing the failure
                if let Err(error) = self.ready_cache.resync().await {
                    tracing::warn!(%error, "failed to resync the ready game server cache");
                }
                gsa.contention();
                crate::metrics::allocations_total("contention").inc();
                Ok(gsa)
            }
            Err(error) => {
                if let Err(resync_error) = self.ready_cache.resync().await {
                    tracing::warn!(error = %resync_error, "failed to resync the ready game server cache");
                }
                crate::metrics::allocations_total("error").inc();
                Err(error)
            }
        }
    }

    /// Drives the batch round trip, retrying only contention; `NoReady` is
    /// authoritative and any other failure is surfaced as-is.
    async fn allocate_with_retry(
        &self,
        gsa: &GameServerAllocation,
        shutdown: &ShutdownRx,
    ) -> Result<GameServer, AllocationError> {
        let mut result = self.enqueue_request(gsa.clone(), shutdown.clone()).await;
        for _ in 1..RETRY_STEPS {
            if !matches!(result, Err(AllocationError::Contention)) {
                break;
            }
            let jitter = 1.0 + rand::thread_rng().gen_range(0.0..RETRY_JITTER);
            tokio::time::sleep(RETRY_BASE.mul_f64(jitter)).await;
            result = self.enqueue_request(gsa.clone(), shutdown.clone()).await;
        }
        result
    }

    async fn enqueue_request(
        &self,
        gsa: GameServerAllocation,
        mut shutdown: ShutdownRx,
    ) -> Result<GameServer, AllocationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .pending
            .send(Request {
                gsa,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err(AllocationError::Shutdown);
        }

        tokio::select! {
            reply = reply_rx => reply.unwrap_or(Err(AllocationError::Shutdown)),
            _ = shutdown.changed() => Err(AllocationError::Shutdown),
        }
    }

    /// Walks the matching allocation policies' connection descriptors in
    /// order, allocating locally when one names this cluster and remotely
    /// otherwise, and returns the first success.
    async fn apply_multi_cluster_allocation(
        &self,
        gsa: GameServerAllocation,
        shutdown: ShutdownRx,
    ) -> Result<GameServerAllocation, AllocationError> {
        let policies = self
            .policies
            .list(
                gsa.namespace(),
                gsa.spec.multi_cluster_setting.policy_selector.as_ref(),
            )
            .await?;
        if policies.is_empty() {
            return Err(AllocationError::Invalid(
                "no multi-cluster allocation policy is specified".into(),
            ));
        }

        let secret_namespace = gsa.namespace().to_owned();
        let mut last_error = None;
        for connection_info in connection_info_sequence(policies) {
            let attempt = if connection_info.cluster_name == self.cluster_name {
                self.allocate_from_local_cluster(gsa.clone(), shutdown.clone())
                    .await
            } else {
                super::remote::allocate_from_remote_cluster(
                    gsa.clone(),
                    &connection_info,
                    &*self.secrets,
                    &secret_namespace,
                )
                .await
            };

            match attempt {
                Ok(result) => return Ok(result),
                Err(error) => {
                    tracing::error!(
                        cluster = %connection_info.cluster_name,
                        %error,
                        "allocation attempt against cluster failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(AllocationError::NoReady))
    }

    /// Runs the driver loop and update workers until shutdown. The driver
    /// serves pending requests off a cached sorted snapshot, refreshing it
    /// every [`MAX_BATCH_BEFORE_REFRESH`] requests or after
    /// [`BATCH_WAIT`] of quiet.
    pub async fn run(&self, update_workers: usize, mut shutdown: ShutdownRx) -> crate::Result<()> {
        let Some(mut pending) = self.pending_rx.lock().take() else {
            return Err(eyre::eyre!("allocator is already running"));
        };

        let update_workers = update_workers.max(1);
        let (update_tx, update_rx) = mpsc::channel::<Matched>(update_workers);
        let update_rx = Arc::new(tokio::sync::Mutex::new(update_rx));

        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..update_workers {
            let update_rx = update_rx.clone();
            let ready_cache = self.ready_cache.clone();
            let recorder = self.recorder.clone();
            let shutdown = shutdown.clone();
            workers.spawn(update_worker(update_rx, ready_cache, recorder, shutdown));
        }

        let mut list: Option<Vec<GameServer>> = None;
        let mut request_count = 0usize;

        loop {
            tokio::select! {
                request = pending.recv() => {
                    let Some(request) = request else { break };

                    // refresh the snapshot every so many requests served
                    request_count += 1;
                    if request_count >= MAX_BATCH_BEFORE_REFRESH {
                        list = None;
                        request_count = 0;
                    }
                    let cached = list
                        .get_or_insert_with(|| self.ready_cache.list_sorted_ready_game_servers());

                    match find_game_server_for_allocation(&request.gsa, cached, self.top_n) {
                        Err(error) => {
                            let _ = request.reply.send(Err(error));
                        }
                        Ok((gs, index)) => {
                            // drop the match from the working snapshot
                            cached.remove(index);
                            if let Err(error) =
                                self.ready_cache.remove_from_ready_game_server(&gs)
                            {
                                // unlikely, but handle it just in case
                                let _ = request.reply.send(Err(error));
                            } else {
                                let matched = Matched {
                                    patch: request.gsa.spec.metadata.clone(),
                                    gs,
                                    reply: request.reply,
                                };
                                if update_tx.send(matched).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(BATCH_WAIT) => {
                    // quiescent; drop the stale snapshot
                    list = None;
                    request_count = 0;
                }
            }
        }

        drop(update_tx);
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

/// Commits matched reservations: applies the request's metadata patch and
/// moves the game server to `Allocated`. A failed commit restores the game
/// server to the ready cache, so a lost update never leaks inventory.
async fn update_worker(
    update_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Matched>>>,
    ready_cache: Arc<ReadyGameServerCache>,
    recorder: Arc<dyn Recorder>,
    mut shutdown: ShutdownRx,
) {
    loop {
        let matched = tokio::select! {
            matched = async { update_rx.lock().await.recv().await } => match matched {
                Some(matched) => matched,
                None => return,
            },
            _ = shutdown.changed() => return,
        };

        let Matched { patch, gs, reply } = matched;
        let original = gs.clone();
        match ready_cache.patch_game_server_metadata(&patch, gs).await {
            Ok(updated) => {
                recorder.event(&updated, EventSeverity::Normal, "Allocated", "Allocated");
                let _ = reply.send(Ok(updated));
            }
            Err(error) => {
                // since we could not allocate, put it back
                ready_cache.add_to_ready_game_server(&original);
                let _ = reply.send(Err(AllocationError::Cluster(error)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::allocation::AllocationState;
    use crate::api::policy::{
        ClusterConnectionInfo, GameServerAllocationPolicy, GameServerAllocationPolicySpec,
    };
    use crate::cluster::fake::FakeCluster;
    use crate::signal;
    use crate::test_utils::ready_game_server;

    struct Fixture {
        cluster: Arc<FakeCluster>,
        cache: Arc<ReadyGameServerCache>,
        allocator: Arc<Allocator>,
        shutdown_tx: crate::signal::ShutdownTx,
        shutdown_rx: ShutdownRx,
    }

    fn fixture(cluster_name: &str) -> Fixture {
        let cluster = FakeCluster::new();
        let cache = ReadyGameServerCache::new(cluster.clone(), None);
        let allocator = Allocator::new(
            cache.clone(),
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            cluster_name,
        );
        let (shutdown_tx, shutdown_rx) = signal::channel();
        Fixture {
            cluster,
            cache,
            allocator,
            shutdown_tx,
            shutdown_rx,
        }
    }

    impl Fixture {
        fn seed_ready(&self, count: usize) {
            for i in 0..count {
                let gs = self
                    .cluster
                    .put_game_server(ready_game_server(&format!("gs-{i:02}"), "node-1"));
                self.cache.game_server_updated(&gs);
            }
        }

        fn spawn_driver(&self) -> tokio::task::JoinHandle<crate::Result<()>> {
            let allocator = self.allocator.clone();
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move { allocator.run(4, shutdown).await })
        }

        fn request(&self) -> GameServerAllocation {
            let mut gsa = GameServerAllocation::default();
            gsa.metadata.namespace = Some("default".into());
            gsa
        }
    }

    #[tokio::test]
    async fn allocates_a_ready_game_server() {
        let fixture = fixture("");
        fixture.seed_ready(1);
        let driver = fixture.spawn_driver();

        let result = fixture
            .allocator
            .allocate(fixture.request(), fixture.shutdown_rx.clone())
            .await
            .unwrap();

        let status = result.status.unwrap();
        assert_eq!(status.state, AllocationState::Allocated);
        assert_eq!(status.game_server_name.as_deref(), Some("gs-00"));
        assert_eq!(status.address, "10.0.0.1");
        assert!(!status.ports.is_empty());

        let stored = fixture.cluster.get_game_server("default", "gs-00").unwrap();
        assert_eq!(
            stored.state(),
            Some(crate::api::GameServerState::Allocated)
        );

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn applies_the_metadata_patch_at_reservation_time() {
        let fixture = fixture("");
        fixture.seed_ready(1);
        let driver = fixture.spawn_driver();

        let mut gsa = fixture.request();
        gsa.spec
            .metadata
            .labels
            .insert("session".into(), "match-42".into());
        fixture
            .allocator
            .allocate(gsa, fixture.shutdown_rx.clone())
            .await
            .unwrap();

        let stored = fixture.cluster.get_game_server("default", "gs-00").unwrap();
        assert_eq!(stored.labels().get("session").unwrap(), "match-42");

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replies_unallocated_when_nothing_matches() {
        let fixture = fixture("");
        let driver = fixture.spawn_driver();

        let result = fixture
            .allocator
            .allocate(fixture.request(), fixture.shutdown_rx.clone())
            .await
            .unwrap();
        assert_eq!(result.status.unwrap().state, AllocationState::UnAllocated);

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fifty_concurrent_requests_over_ten_servers_never_double_allocate() {
        let fixture = fixture("");
        fixture.seed_ready(10);
        let driver = fixture.spawn_driver();

        let mut requests = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let allocator = fixture.allocator.clone();
            let shutdown = fixture.shutdown_rx.clone();
            let gsa = fixture.request();
            requests.spawn(async move { allocator.allocate(gsa, shutdown).await });
        }

        let mut allocated = std::collections::BTreeSet::new();
        let mut unallocated = 0;
        while let Some(result) = requests.join_next().await {
            let gsa = result.unwrap().unwrap();
            let status = gsa.status.unwrap();
            match status.state {
                AllocationState::Allocated => {
                    let name = status.game_server_name.unwrap();
                    assert!(allocated.insert(name.clone()), "{name} allocated twice");
                }
                AllocationState::UnAllocated => unallocated += 1,
                AllocationState::Contention => panic!("contention should have resolved"),
            }
        }

        assert_eq!(allocated.len(), 10);
        assert_eq!(unallocated, 40);

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn a_failed_commit_restores_the_game_server() {
        let fixture = fixture("");
        fixture.seed_ready(1);
        let driver = fixture.spawn_driver();

        fixture
            .cluster
            .fail_next_game_server_update(crate::cluster::Error::Transient(
                "apiserver went away".into(),
            ));
        let error = fixture
            .allocator
            .allocate(fixture.request(), fixture.shutdown_rx.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, AllocationError::Cluster(_)));

        // the server went back into the ready set, and the record never
        // left Ready; once the driver drops its stale snapshot, a
        // following request picks it up cleanly
        assert_eq!(fixture.cache.ready_count(), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        let result = fixture
            .allocator
            .allocate(fixture.request(), fixture.shutdown_rx.clone())
            .await
            .unwrap();
        assert_eq!(result.status.unwrap().state, AllocationState::Allocated);

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let fixture = fixture("");
        let mut gsa = fixture.request();
        gsa.spec
            .metadata
            .labels
            .insert("bad key".into(), "value".into());

        let error = fixture
            .allocator
            .allocate(gsa, fixture.shutdown_rx.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, AllocationError::Invalid(_)));
    }

    #[tokio::test]
    async fn multi_cluster_requests_honour_a_local_policy() {
        let fixture = fixture("local-cluster");
        fixture.seed_ready(1);
        let driver = fixture.spawn_driver();

        let mut policy = GameServerAllocationPolicy::new(
            "stay-home",
            GameServerAllocationPolicySpec {
                priority: 1,
                weight: 100,
                connection_info: ClusterConnectionInfo {
                    cluster_name: "local-cluster".into(),
                    ..Default::default()
                },
            },
        );
        policy.metadata.namespace = Some("default".into());
        fixture.cluster.put_policy(policy);

        let mut gsa = fixture.request();
        gsa.spec.multi_cluster_setting.enabled = true;
        let result = fixture
            .allocator
            .allocate(gsa, fixture.shutdown_rx.clone())
            .await
            .unwrap();
        assert_eq!(result.status.unwrap().state, AllocationState::Allocated);

        fixture.shutdown_tx.send(()).unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn multi_cluster_requests_without_policies_are_invalid() {
        let fixture = fixture("local-cluster");
        let mut gsa = fixture.request();
        gsa.spec.multi_cluster_setting.enabled = true;

        let error = fixture
            .allocator
            .allocate(gsa, fixture.shutdown_rx.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, AllocationError::Invalid(_)));
    }

    #[tokio::test]
    async fn shutdown_unblocks_pending_callers() {
        let fixture = fixture("");
        // no driver running; the request parks until shutdown fires
        let allocator = fixture.allocator.clone();
        let shutdown_rx = fixture.shutdown_rx.clone();
        let gsa = fixture.request();
        let pending =
            tokio::spawn(async move { allocator.allocate(gsa, shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        fixture.shutdown_tx.send(()).unwrap();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(AllocationError::Shutdown)));
    }
}
