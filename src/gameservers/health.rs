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

//! Watches the health of backing pods and their nodes, and moves game
//! servers whose backing disappeared or failed into the terminal
//! `Unhealthy` state.

use std::sync::Arc;

use eyre::WrapErr;
use k8s_openapi::api::core::v1::Pod;

use crate::api::gameserver::{is_game_server_pod, owning_game_server_key};
use crate::api::{GameServer, GameServerState};
use crate::cluster::{EventSeverity, Substrate};
use crate::signal::ShutdownRx;
use crate::workqueue::WorkerQueue;

pub struct HealthController {
    substrate: Substrate,
    queue: WorkerQueue,
}

impl HealthController {
    pub fn new(substrate: Substrate) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            queue: WorkerQueue::new("gameservers-health"),
        })
    }

    /// Watch callback for pod updates; a pod entering a non-recoverable
    /// failure condemns its game server.
    pub fn pod_updated(&self, _old: &Pod, new: &Pod) {
        if !is_game_server_pod(new) {
            return;
        }
        let failed = new
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Failed");
        if failed {
            if let Some(key) = owning_game_server_key(new) {
                tracing::debug!(key, "game server pod failed");
                self.queue.enqueue(key);
            }
        }
    }

    /// Watch callback for pod deletions. A pod disappearing while its game
    /// server is still live is never normal; the deletion pipeline holds
    /// the finalizer until it has seen the pod out.
    pub fn pod_deleted(&self, pod: &Pod) {
        if !is_game_server_pod(pod) {
            return;
        }
        if let Some(key) = owning_game_server_key(pod) {
            tracing::debug!(key, "game server pod deleted");
            self.queue.enqueue(key);
        }
    }

    /// A node disappearing takes every game server scheduled on it with it.
    pub async fn node_deleted(&self, name: &str) -> crate::Result<()> {
        let game_servers = self
            .substrate
            .game_servers
            .list(None)
            .await
            .wrap_err("error listing game servers for a deleted node")?;

        for gs in game_servers {
            let on_node = gs
                .status
                .as_ref()
                .is_some_and(|status| status.node_name == name);
            if on_node {
                self.queue.enqueue(gs.key());
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, workers: usize, shutdown: ShutdownRx) {
        let this = self.clone();
        self.queue
            .run(workers, shutdown, move |key| {
                let this = this.clone();
                async move { this.sync_game_server(&key).await }
            })
            .await;
    }

    /// Moves the game server to `Unhealthy`, unless it is already on its
    /// way out or past caring.
    pub async fn sync_game_server(&self, key: &str) -> crate::Result<()> {
        let Some((namespace, name)) = key.split_once('/') else {
            tracing::error!(key, "ignoring invalid resource key");
            return Ok(());
        };

        let gs = match self.substrate.game_servers.get(namespace, name).await {
            Ok(gs) => gs,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("error retrieving game server {key}"))
            }
        };

        if skip_unhealthy(&gs) {
            return Ok(());
        }

        tracing::info!(key, "issue with game server pod, marking as unhealthy");
        let mut gs_copy = gs.clone();
        gs_copy.set_state(GameServerState::Unhealthy);
        let updated = self
            .substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| format!("error moving game server {key} to Unhealthy state"))?;
        self.substrate.recorder.event(
            &updated,
            EventSeverity::Warning,
            "Unhealthy",
            "Issue with game server pod",
        );
        Ok(())
    }
}

fn skip_unhealthy(gs: &GameServer) -> bool {
    gs.is_being_deleted()
        || gs.dev_address().is_some()
        || matches!(
            gs.state(),
            Some(GameServerState::Unhealthy) | Some(GameServerState::Shutdown)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::test_utils::{dev_game_server, game_server, ready_game_server};
    use k8s_openapi::api::core::v1::{Container, PodStatus};

    fn health(cluster: &Arc<FakeCluster>) -> Arc<HealthController> {
        HealthController::new(cluster.substrate())
    }

    #[tokio::test]
    async fn a_condemned_game_server_moves_to_unhealthy() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);
        cluster.put_game_server(ready_game_server("sick", "node-1"));

        health.sync_game_server("default/sick").await.unwrap();
        let gs = cluster.get_game_server("default", "sick").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Unhealthy));
        assert!(cluster
            .events()
            .iter()
            .any(|event| event.severity == EventSeverity::Warning && event.reason == "Unhealthy"));
    }

    #[tokio::test]
    async fn allocated_game_servers_can_still_become_unhealthy() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);
        let mut gs = ready_game_server("claimed", "node-1");
        gs.set_state(GameServerState::Allocated);
        cluster.put_game_server(gs);

        health.sync_game_server("default/claimed").await.unwrap();
        let gs = cluster.get_game_server("default", "claimed").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Unhealthy));
    }

    #[tokio::test]
    async fn terminal_and_deleting_game_servers_are_left_alone() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);

        let mut shutdown = game_server("shutdown");
        shutdown.set_state(GameServerState::Shutdown);
        cluster.put_game_server(shutdown);

        let mut deleting = ready_game_server("deleting", "node-1");
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        cluster.put_game_server(deleting);

        let mut dev = dev_game_server("dev", "192.168.1.2");
        dev.set_state(GameServerState::Ready);
        cluster.put_game_server(dev);

        for name in ["shutdown", "deleting", "dev"] {
            health
                .sync_game_server(&format!("default/{name}"))
                .await
                .unwrap();
            let gs = cluster.get_game_server("default", name).unwrap();
            assert_ne!(gs.state(), Some(GameServerState::Unhealthy), "{name}");
        }
    }

    #[tokio::test]
    async fn failed_pods_enqueue_their_owner() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);

        let gs = game_server("pod-owner");
        let mut pod = gs.build_pod(Container::default()).unwrap();
        pod.status = Some(PodStatus {
            phase: Some("Failed".into()),
            ..Default::default()
        });

        health.pod_updated(&pod.clone(), &pod);
        assert_eq!(health.queue.len(), 1);

        // a running pod changes nothing
        let mut running = pod.clone();
        running.metadata.name = Some("other".into());
        running.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        health.pod_updated(&running.clone(), &running);
        assert_eq!(health.queue.len(), 1);
    }

    #[tokio::test]
    async fn deleted_pods_enqueue_their_owner() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);

        let gs = game_server("pod-owner");
        let pod = gs.build_pod(Container::default()).unwrap();
        health.pod_deleted(&pod);
        assert_eq!(health.queue.len(), 1);
    }

    #[tokio::test]
    async fn a_lost_node_condemns_everything_scheduled_on_it() {
        let cluster = FakeCluster::new();
        let health = health(&cluster);

        cluster.put_game_server(ready_game_server("on-lost", "node-gone"));
        cluster.put_game_server(ready_game_server("elsewhere", "node-safe"));

        health.node_deleted("node-gone").await.unwrap();
        assert_eq!(health.queue.len(), 1);

        health.sync_game_server("default/on-lost").await.unwrap();
        assert_eq!(
            cluster.get_game_server("default", "on-lost").unwrap().state(),
            Some(GameServerState::Unhealthy)
        );
    }
}
