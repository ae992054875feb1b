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

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::allocations::{Allocator, ReadyGameServerCache};
use crate::api::GameServer;
use crate::cluster::k8s::{pump, KubeCluster, WatchDelta};
use crate::config::Config;
use crate::gameservers::{Controller, HealthController, PortAllocator};
use crate::signal;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::Parser)]
pub struct Cli {
    /// Inclusive lower bound of the dynamic host port range.
    #[clap(long, env = "ARENA_MIN_PORT", default_value_t = 7000)]
    min_port: u16,
    /// Inclusive upper bound of the dynamic host port range.
    #[clap(long, env = "ARENA_MAX_PORT", default_value_t = 8000)]
    max_port: u16,
    /// Image run as the SDK sidecar in every game server pod.
    #[clap(
        long,
        env = "ARENA_SIDECAR_IMAGE",
        default_value = "us-docker.pkg.dev/arena-images/release/arena-sdk:latest"
    )]
    sidecar_image: String,
    /// Always pull the sidecar image.
    #[clap(long, env = "ARENA_ALWAYS_PULL_SIDECAR")]
    always_pull_sidecar: bool,
    /// CPU request for the sidecar container; empty disables it.
    #[clap(long, env = "ARENA_SIDECAR_CPU_REQUEST", default_value = "30m")]
    sidecar_cpu_request: String,
    /// CPU limit for the sidecar container; empty disables it.
    #[clap(long, env = "ARENA_SIDECAR_CPU_LIMIT", default_value = "")]
    sidecar_cpu_limit: String,
    /// Service account for game server pods that don't bring their own.
    #[clap(long, env = "ARENA_SDK_SERVICE_ACCOUNT", default_value = "arena-sdk")]
    sdk_service_account: String,
    /// Workers per controller queue.
    #[clap(long, env = "ARENA_WORKERS", default_value_t = 8)]
    workers: usize,
    /// This cluster's name in multi-cluster allocation policies.
    #[clap(long, env = "ARENA_CLUSTER_NAME", default_value = "")]
    cluster_name: String,
    /// Namespace to manage game servers in; empty manages all namespaces.
    #[clap(long, env = "ARENA_NAMESPACE", default_value = "")]
    namespace: String,
    /// Whether to report any results to stdout/stderr.
    #[clap(short, long, env = "ARENA_QUIET")]
    quiet: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let quantity = |value: &str| (!value.is_empty()).then(|| Quantity(value.to_owned()));
        Config {
            min_port: self.min_port,
            max_port: self.max_port,
            sidecar_image: self.sidecar_image.clone(),
            always_pull_sidecar: self.always_pull_sidecar,
            sidecar_cpu_request: quantity(&self.sidecar_cpu_request),
            sidecar_cpu_limit: quantity(&self.sidecar_cpu_limit),
            sdk_service_account: self.sdk_service_account.clone(),
            workers: self.workers,
            cluster_name: self.cluster_name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Drives the controller's lifecycle from the command line arguments.
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = VERSION, "starting arena controller");

        let config = self.config();
        config.validate()?;

        let client = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            kube::Client::try_default(),
        )
        .await??;

        let kube_cluster = Arc::new(KubeCluster::new(client.clone()));
        let substrate = kube_cluster.substrate();

        let port_allocator = Arc::new(PortAllocator::new(config.min_port, config.max_port));
        let controller = Controller::new(config.clone(), substrate.clone(), port_allocator.clone());
        let health = HealthController::new(substrate.clone());
        let ready_cache = ReadyGameServerCache::new(
            substrate.game_servers.clone(),
            config.watch_namespace().map(str::to_owned),
        );
        let allocator = Allocator::new(
            ready_cache.clone(),
            kube_cluster.clone(),
            kube_cluster.clone(),
            substrate.recorder.clone(),
            config.cluster_name.clone(),
        );

        let shutdown = signal::spawn_handler();
        ready_cache.resync().await?;

        let mut tasks = tokio::task::JoinSet::<crate::Result<()>>::new();

        // game server watch: lifecycle queues, the allocator's ready view,
        // and port reclamation on deletion
        {
            let controller = controller.clone();
            let ready_cache = ready_cache.clone();
            let port_allocator = port_allocator.clone();
            let api = match config.watch_namespace() {
                Some(namespace) => kube::Api::<GameServer>::namespaced(client.clone(), namespace),
                None => kube::Api::<GameServer>::all(client.clone()),
            };
            let mut seen: HashMap<String, GameServer> = HashMap::new();
            tasks.spawn(pump(api, move |delta| match delta {
                WatchDelta::Upsert(gs) => {
                    let old = seen.insert(gs.key(), gs.clone());
                    ready_cache.game_server_updated(&gs);
                    controller.game_server_updated(old.as_ref(), &gs);
                }
                WatchDelta::Delete(gs) => {
                    seen.remove(&gs.key());
                    ready_cache.game_server_deleted(&gs);
                    port_allocator.deallocate(&gs);
                }
            }));
        }

        // pod watch: scheduling progress and health
        {
            let controller = controller.clone();
            let health = health.clone();
            let api = match config.watch_namespace() {
                Some(namespace) => kube::Api::<Pod>::namespaced(client.clone(), namespace),
                None => kube::Api::<Pod>::all(client.clone()),
            };
            let mut seen: HashMap<String, Pod> = HashMap::new();
            tasks.spawn(pump(api, move |delta| match delta {
                WatchDelta::Upsert(pod) => {
                    let key = format!(
                        "{}/{}",
                        pod.metadata.namespace.as_deref().unwrap_or_default(),
                        pod.metadata.name.as_deref().unwrap_or_default()
                    );
                    let old = seen.insert(key, pod.clone());
                    if let Some(old) = old {
                        controller.pod_updated(&old, &pod);
                        health.pod_updated(&old, &pod);
                    }
                }
                WatchDelta::Delete(pod) => {
                    seen.remove(&format!(
                        "{}/{}",
                        pod.metadata.namespace.as_deref().unwrap_or_default(),
                        pod.metadata.name.as_deref().unwrap_or_default()
                    ));
                    controller.pod_deleted(&pod);
                    health.pod_deleted(&pod);
                }
            }));
        }

        // node watch: the port table and node-loss health; nodes are
        // cluster scoped, so this one ignores the namespace
        {
            let port_allocator = port_allocator.clone();
            let health = health.clone();
            let api = kube::Api::<Node>::all(client.clone());
            tasks.spawn(pump(api, move |delta| match delta {
                WatchDelta::Upsert(node) => {
                    if let Some(name) = node.metadata.name.as_deref() {
                        port_allocator.sync_node_added(name);
                    }
                }
                WatchDelta::Delete(node) => {
                    let Some(name) = node.metadata.name.clone() else {
                        return;
                    };
                    port_allocator.sync_node_deleted(&name);
                    let health = health.clone();
                    tokio::spawn(async move {
                        if let Err(error) = health.node_deleted(&name).await {
                            tracing::error!(%error, node = name, "error condemning game servers on a deleted node");
                        }
                    });
                }
            }));
        }

        {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { controller.run(shutdown).await });
        }
        {
            let health = health.clone();
            let workers = config.workers;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                health.run(workers, shutdown).await;
                Ok(())
            });
        }
        {
            let allocator = allocator.clone();
            let workers = config.workers;
            let shutdown = shutdown.clone();
            tasks.spawn(async move { allocator.run(workers, shutdown).await });
        }

        // the first component to stop takes the process down with it
        match tasks.join_next().await {
            Some(result) => result?,
            None => Ok(()),
        }
    }
}
