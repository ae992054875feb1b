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

//! The main [`GameServer`] reconciler. Each sync pass reads the record and
//! pushes it through the lifecycle pipeline; every transition that applies
//! commits exactly one update, so an interrupted pass resumes cleanly on the
//! next one.

use std::sync::Arc;

use eyre::WrapErr;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HTTPGetAction, Node, ObjectFieldSelector, Pod, Probe,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::api::gameserver::{is_game_server_pod, owning_game_server_key};
use crate::api::{GameServer, GameServerState, GROUP};
use crate::cluster::{self, EventSeverity, Substrate};
use crate::config::Config;
use crate::signal::ShutdownRx;
use crate::workqueue::WorkerQueue;

use super::PortAllocator;

pub const SIDECAR_CONTAINER_NAME: &str = "arena-gameserver-sidecar";

pub struct Controller {
    config: Config,
    substrate: Substrate,
    port_allocator: Arc<PortAllocator>,
    /// Everything not covered by the creation and deletion queues, plus all
    /// pod-driven events.
    general_queue: WorkerQueue,
    creation_queue: WorkerQueue,
    deletion_queue: WorkerQueue,
}

impl Controller {
    pub fn new(
        config: Config,
        substrate: Substrate,
        port_allocator: Arc<PortAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            substrate,
            port_allocator,
            general_queue: WorkerQueue::new("gameservers"),
            creation_queue: WorkerQueue::new("gameservers-creation"),
            deletion_queue: WorkerQueue::new("gameservers-deletion"),
        })
    }

    /// Routes a game server onto the right queue for its current state.
    pub fn enqueue_game_server(&self, gs: &GameServer) {
        let key = gs.key();
        match gs.state() {
            Some(GameServerState::PortAllocation) | Some(GameServerState::Creating) => {
                self.creation_queue.enqueue(key);
            }
            Some(GameServerState::Shutdown) => self.deletion_queue.enqueue(key),
            _ => self.general_queue.enqueue(key),
        }
    }

    /// Watch callback for game server changes. There is no point syncing
    /// unless the state or the deletion timestamp moved.
    pub fn game_server_updated(&self, old: Option<&GameServer>, new: &GameServer) {
        let changed = old.is_none_or(|old| {
            old.state() != new.state()
                || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        });
        if changed {
            self.enqueue_game_server(new);
        }
    }

    /// Watch callback for pod updates; a pod gaining a node name means it
    /// has been scheduled.
    pub fn pod_updated(&self, old: &Pod, new: &Pod) {
        if !is_game_server_pod(old) {
            return;
        }
        let old_node = old.spec.as_ref().and_then(|spec| spec.node_name.as_ref());
        let new_node = new.spec.as_ref().and_then(|spec| spec.node_name.as_ref());
        if old_node != new_node {
            if let Some(key) = owning_game_server_key(new) {
                self.general_queue.enqueue(key);
            }
        }
    }

    /// Watch callback for pod deletions, for when game servers are deleted.
    pub fn pod_deleted(&self, pod: &Pod) {
        if is_game_server_pod(pod) {
            if let Some(key) = owning_game_server_key(pod) {
                self.general_queue.enqueue(key);
            }
        }
    }

    /// Runs the controller until shutdown. Blocks while the port allocator
    /// rebuilds its table, then serves the three work queues.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        self.port_allocator
            .run(
                &*self.substrate.nodes,
                &*self.substrate.game_servers,
                self.config.watch_namespace(),
            )
            .await
            .wrap_err("error running the port allocator")?;

        let mut tasks = tokio::task::JoinSet::new();
        for queue in [
            &self.general_queue,
            &self.creation_queue,
            &self.deletion_queue,
        ] {
            let queue = queue.clone();
            let workers = self.config.workers;
            let shutdown = shutdown.clone();
            let this = self.clone();
            tasks.spawn(async move {
                queue
                    .run(workers, shutdown, move |key| {
                        let this = this.clone();
                        async move { this.sync_game_server(&key).await }
                    })
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Synchronises a single game server through the lifecycle pipeline.
    /// Each step is a no-op unless its guard matches, and hands the record
    /// it returns to the next step.
    pub async fn sync_game_server(&self, key: &str) -> crate::Result<()> {
        tracing::debug!(key, "synchronising");

        let Some((namespace, name)) = key.split_once('/') else {
            // an unparseable key will never become parseable, don't retry
            tracing::error!(key, "ignoring invalid resource key");
            return Ok(());
        };

        let gs = match self.substrate.game_servers.get(namespace, name).await {
            Ok(gs) => gs,
            Err(error) if error.is_not_found() => {
                tracing::debug!(key, "game server no longer available for syncing");
                return Ok(());
            }
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("error retrieving game server {key}"))
            }
        };

        let gs = self.sync_deletion_timestamp(gs).await?;
        let gs = self.sync_port_allocation_state(gs).await?;
        let gs = self.sync_creating_state(gs).await?;
        let gs = self.sync_starting_state(gs).await?;
        let gs = self.sync_request_ready_state(gs).await?;
        let gs = self.sync_development_game_server(gs).await?;
        self.sync_shutdown_state(&gs).await?;

        Ok(())
    }

    /// If the deletion timestamp is set, tear down the backing pod first,
    /// and only strip our finalizer once no pod remains.
    async fn sync_deletion_timestamp(&self, gs: GameServer) -> crate::Result<GameServer> {
        if !gs.is_being_deleted() {
            return Ok(gs);
        }

        tracing::info!(key = gs.key(), "syncing with deletion timestamp");

        let pod = self.game_server_pod(&gs).await?;
        if let (Some(pod), None) = (&pod, gs.dev_address()) {
            // only need to issue the delete once
            if pod.metadata.deletion_timestamp.is_none() {
                let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
                self.substrate
                    .pods
                    .delete(gs.namespace(), pod_name)
                    .await
                    .wrap_err_with(|| {
                        format!(
                            "error deleting pod for game server {}, {pod_name}",
                            gs.name()
                        )
                    })?;
                self.record(&gs, EventSeverity::Normal, &format!("Deleting Pod {pod_name}"));
            }

            // no removing finalizers until the pod is truly gone
            return Ok(gs);
        }

        let mut gs_copy = gs.clone();
        if let Some(finalizers) = gs_copy.metadata.finalizers.as_mut() {
            finalizers.retain(|finalizer| finalizer != GROUP);
        }
        tracing::info!(key = gs.key(), "no pods found, removing finalizer {GROUP}");
        self.substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| format!("error removing finalizer for game server {}", gs.name()))
    }

    /// Gives a port to a dynamically allocating game server.
    async fn sync_port_allocation_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.state() != Some(GameServerState::PortAllocation) || gs.is_being_deleted() {
            return Ok(gs);
        }

        tracing::info!(key = gs.key(), "syncing port allocation state");

        let mut gs_copy = match self.port_allocator.allocate(gs.clone()) {
            Ok(allocated) => allocated,
            Err(exhausted) => {
                return self.move_to_error_state(gs, &exhausted.to_string()).await;
            }
        };

        gs_copy.set_state(GameServerState::Creating);
        let updated = match self.substrate.game_servers.update(&gs_copy).await {
            Ok(updated) => updated,
            Err(error) => {
                // if the record doesn't take the port data, put the ports
                // back in the pool; this pass gets retried
                self.port_allocator.deallocate(&gs_copy);
                return Err(error)
                    .wrap_err_with(|| format!("error updating game server {}", gs.name()));
            }
        };
        self.record(&gs, EventSeverity::Normal, "Port allocated");

        Ok(updated)
    }

    /// Creates the backing pod for a game server in the creating state and
    /// moves it to starting.
    async fn sync_creating_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.state() != Some(GameServerState::Creating)
            || gs.is_being_deleted()
            || gs.dev_address().is_some()
        {
            return Ok(gs);
        }

        tracing::info!(key = gs.key(), "syncing creating state");

        // something may have gone wrong previously and the pod already
        // exists, in which case it is reused
        let gs = if self.game_server_pod(&gs).await?.is_none() {
            let gs = self.create_game_server_pod(gs).await?;
            if gs.state() == Some(GameServerState::Error) {
                return Ok(gs);
            }
            gs
        } else {
            self.record(&gs, EventSeverity::Normal, "Pod already exists, reused");
            gs
        };

        let mut gs_copy = gs.clone();
        gs_copy.set_state(GameServerState::Starting);
        self.substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| {
                format!("error updating game server {} to Starting state", gs.name())
            })
    }

    async fn create_game_server_pod(&self, gs: GameServer) -> crate::Result<GameServer> {
        let sidecar = self.sidecar(&gs);
        let mut pod = match gs.build_pod(sidecar) {
            Ok(pod) => pod,
            // this shouldn't happen, but if it does
            Err(error) => {
                tracing::error!(key = gs.key(), %error, "error creating pod from game server");
                return self.move_to_error_state(gs, &error.to_string()).await;
            }
        };

        if let Some(spec) = pod.spec.as_mut() {
            // if the user didn't bring a service account, they get the
            // opinionated SDK one
            if spec.service_account_name.as_deref().unwrap_or_default().is_empty() {
                spec.service_account_name = Some(self.config.sdk_service_account.clone());
            }
        }

        self.add_game_server_health_check(&gs, &mut pod);

        tracing::info!(key = gs.key(), pod = ?pod.metadata.name, "creating pod for game server");
        match self.substrate.pods.create(&pod).await {
            Ok(pod) => {
                self.record(
                    &gs,
                    EventSeverity::Normal,
                    &format!(
                        "Pod {} created",
                        pod.metadata.name.as_deref().unwrap_or_default()
                    ),
                );
                Ok(gs)
            }
            Err(error) if error.is_already_exists() => {
                self.record(&gs, EventSeverity::Normal, "Pod already exists, reused");
                Ok(gs)
            }
            Err(error) if error.is_invalid() => {
                tracing::error!(key = gs.key(), %error, "pod created is invalid");
                self.move_to_error_state(gs, &error.to_string()).await
            }
            Err(error) => Err(error)
                .wrap_err_with(|| format!("error creating pod for game server {}", gs.name())),
        }
    }

    /// The sidecar container attached to every game server pod, exposing
    /// the local SDK endpoint.
    fn sidecar(&self, gs: &GameServer) -> Container {
        let mut args = vec![];
        if gs.spec.sdk_server.grpc_port != 0 {
            args.push(format!("--grpc-port={}", gs.spec.sdk_server.grpc_port));
        }
        if gs.spec.sdk_server.http_port != 0 {
            args.push(format!("--http-port={}", gs.spec.sdk_server.http_port));
        }

        let mut resources = ResourceRequirements::default();
        if let Some(request) = &self.config.sidecar_cpu_request {
            resources.requests = Some([("cpu".to_owned(), request.clone())].into());
        }
        if let Some(limit) = &self.config.sidecar_cpu_limit {
            resources.limits = Some([("cpu".to_owned(), limit.clone())].into());
        }

        Container {
            name: SIDECAR_CONTAINER_NAME.into(),
            image: Some(self.config.sidecar_image.clone()),
            args: Some(args),
            env: Some(vec![
                EnvVar {
                    name: "GAMESERVER_NAME".into(),
                    value: Some(gs.name().to_owned()),
                    value_from: None,
                },
                EnvVar {
                    name: "POD_NAMESPACE".into(),
                    value: None,
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.namespace".into(),
                            api_version: None,
                        }),
                        ..Default::default()
                    }),
                },
            ]),
            resources: Some(resources),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/healthz".into()),
                    port: IntOrString::Int(8080),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(3),
                ..Default::default()
            }),
            image_pull_policy: self.config.always_pull_sidecar.then(|| "Always".into()),
            ..Default::default()
        }
    }

    /// Injects the game server health probe into the game container, unless
    /// health checking is disabled or the container brings its own probe.
    fn add_game_server_health_check(&self, gs: &GameServer, pod: &mut Pod) {
        if gs.spec.health.disabled {
            return;
        }
        let Ok(container_name) = gs.container_name() else {
            return;
        };
        let container_name = container_name.to_owned();

        if let Some(spec) = pod.spec.as_mut() {
            for container in spec
                .containers
                .iter_mut()
                .filter(|container| container.name == container_name)
            {
                if container.liveness_probe.is_none() {
                    container.liveness_probe = Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some("/gshealthz".into()),
                            port: IntOrString::Int(8080),
                            ..Default::default()
                        }),
                        initial_delay_seconds: Some(gs.spec.health.initial_delay_seconds),
                        period_seconds: Some(gs.spec.health.period_seconds),
                        failure_threshold: Some(gs.spec.health.failure_threshold),
                        ..Default::default()
                    });
                }
            }
        }
    }

    /// Looks for the pod being scheduled onto a node, then records the
    /// external address and concrete ports on the status.
    async fn sync_starting_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.state() != Some(GameServerState::Starting)
            || gs.is_being_deleted()
            || gs.dev_address().is_some()
        {
            return Ok(gs);
        }

        tracing::info!(key = gs.key(), "syncing starting state");

        // there should be a pod, so any failure here, including it missing,
        // goes into queue backoff
        let pod = self
            .game_server_pod(&gs)
            .await?
            .ok_or_else(|| eyre::eyre!("no pod found for game server {}", gs.name()))?;

        let mut gs_copy = gs.clone();
        self.apply_address_and_port(&mut gs_copy, &pod).await?;

        gs_copy.set_state(GameServerState::Scheduled);
        let updated = self
            .substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| {
                format!("error updating game server {} to Scheduled state", gs.name())
            })?;
        self.record(&updated, EventSeverity::Normal, "Address and port populated");

        Ok(updated)
    }

    /// The game server has declared itself ready over the SDK; populate the
    /// address if the ready request raced ahead of scheduling, and mark it
    /// ready for allocation.
    async fn sync_request_ready_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.state() != Some(GameServerState::RequestReady)
            || gs.is_being_deleted()
            || gs.dev_address().is_some()
        {
            return Ok(gs);
        }

        tracing::info!(key = gs.key(), "syncing request ready state");

        let mut gs_copy = gs.clone();
        let mut address_populated = false;
        if gs
            .status
            .as_ref()
            .is_none_or(|status| status.node_name.is_empty())
        {
            address_populated = true;
            let pod = self
                .game_server_pod(&gs)
                .await?
                .ok_or_else(|| eyre::eyre!("no pod found for game server {}", gs.name()))?;
            self.apply_address_and_port(&mut gs_copy, &pod).await?;
        }

        gs_copy.set_state(GameServerState::Ready);
        let updated = self
            .substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| {
                format!(
                    "error setting Ready, port and address on game server {}",
                    gs.name()
                )
            })?;

        if address_populated {
            self.record(&updated, EventSeverity::Normal, "Address and port populated");
        }
        self.record(&updated, EventSeverity::Normal, "SDK.Ready() complete");
        Ok(updated)
    }

    /// Advances a development game server straight to ready, with its
    /// address and ports taken from the spec.
    async fn sync_development_game_server(&self, gs: GameServer) -> crate::Result<GameServer> {
        if gs.is_being_deleted() {
            return Ok(gs);
        }
        let Some(dev_address) = gs.dev_address().map(str::to_owned) else {
            return Ok(gs);
        };

        if gs.state() == Some(GameServerState::Ready) {
            return Ok(gs);
        }
        tracing::info!(
            key = gs.key(),
            "development game server will not be managed beyond its declared address"
        );

        let mut gs_copy = gs.clone();
        gs_copy.set_state(GameServerState::Ready);
        if let Some(status) = gs_copy.status.as_mut() {
            status.ports = gs.status_ports();
            status.address = dev_address.clone();
            status.node_name = dev_address;
        }
        self.substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| format!("error updating development game server {}", gs.name()))
    }

    /// Deletes a game server that has shut down; the substrate tears down
    /// the backing pod, after which the deletion pipeline strips the
    /// finalizer.
    async fn sync_shutdown_state(&self, gs: &GameServer) -> crate::Result<()> {
        if gs.state() != Some(GameServerState::Shutdown) || gs.is_being_deleted() {
            return Ok(());
        }

        tracing::info!(key = gs.key(), "syncing shutdown state");
        self.substrate
            .game_servers
            .delete(gs.namespace(), gs.name())
            .await
            .wrap_err_with(|| format!("error deleting game server {}", gs.name()))?;
        self.record(gs, EventSeverity::Normal, "Deletion started");
        Ok(())
    }

    async fn move_to_error_state(
        &self,
        gs: GameServer,
        message: &str,
    ) -> crate::Result<GameServer> {
        let mut gs_copy = gs.clone();
        gs_copy.set_state(GameServerState::Error);

        let updated = self
            .substrate
            .game_servers
            .update(&gs_copy)
            .await
            .wrap_err_with(|| {
                format!("error moving game server {} to Error state", gs.name())
            })?;
        self.substrate
            .recorder
            .event(&updated, EventSeverity::Warning, "Error", message);
        Ok(updated)
    }

    /// The backing pod for this game server, or `None` when it doesn't
    /// exist. A pod of the same name that isn't controlled by the game
    /// server counts as absent.
    async fn game_server_pod(&self, gs: &GameServer) -> crate::Result<Option<Pod>> {
        match self.substrate.pods.get(gs.namespace(), gs.name()).await {
            Ok(pod) if gs.controls(&pod) => Ok(Some(pod)),
            Ok(_) => Ok(None),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error)
                .wrap_err_with(|| format!("error retrieving pod for game server {}", gs.name())),
        }
    }

    /// Resolves the node's external address and materializes the spec ports
    /// into the status.
    async fn apply_address_and_port(
        &self,
        gs: &mut GameServer,
        pod: &Pod,
    ) -> crate::Result<()> {
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default();
        if node_name.is_empty() {
            return Err(eyre::eyre!(
                "pod for game server {} has not been scheduled yet",
                gs.name()
            ));
        }

        let node = self
            .substrate
            .nodes
            .get(&node_name)
            .await
            .wrap_err_with(|| {
                format!("error retrieving node {node_name} for game server {}", gs.name())
            })?;
        let address = external_address(&node)?;

        // host ports are always mirrored into the status, even when
        // dynamic, so consumers never have to look at the spec
        let ports = gs.status_ports();
        let status = gs.status.get_or_insert_with(Default::default);
        status.address = address;
        status.node_name = node_name;
        status.ports = ports;
        Ok(())
    }

    fn record(&self, gs: &GameServer, severity: EventSeverity, message: &str) {
        let reason = gs
            .state()
            .map(|state| state.to_string())
            .unwrap_or_default();
        self.substrate.recorder.event(gs, severity, &reason, message);
    }
}

/// The IP the given node is reachable on. This should be the ExternalIP,
/// but falls back to the InternalIP with a warning, since single-node dev
/// clusters tend to only have the latter.
fn external_address(node: &Node) -> crate::Result<String> {
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default();

    for address in addresses {
        if address.type_ == "ExternalIP" && address.address.parse::<std::net::IpAddr>().is_ok() {
            return Ok(address.address.clone());
        }
    }

    for address in addresses {
        if address.type_ == "InternalIP" && address.address.parse::<std::net::IpAddr>().is_ok() {
            tracing::warn!(
                node = node.metadata.name.as_deref().unwrap_or_default(),
                "could not find ExternalIP, falling back to InternalIP"
            );
            return Ok(address.address.clone());
        }
    }

    Err(eyre::eyre!(
        "could not find an address for node {}",
        node.metadata.name.as_deref().unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::test_utils::{dev_game_server, game_server, node};

    fn controller(cluster: &Arc<FakeCluster>) -> Arc<Controller> {
        controller_with_range(cluster, 7000, 7010)
    }

    fn controller_with_range(
        cluster: &Arc<FakeCluster>,
        min_port: u16,
        max_port: u16,
    ) -> Arc<Controller> {
        let config = Config {
            min_port,
            max_port,
            ..Default::default()
        };
        let allocator = Arc::new(PortAllocator::new(min_port, max_port));
        allocator.sync_node_added("node-1");
        Controller::new(config, cluster.substrate(), allocator)
    }

    fn fresh_game_server(cluster: &Arc<FakeCluster>, name: &str) -> GameServer {
        let mut gs = game_server(name);
        gs.status = None;
        gs.metadata.finalizers = None;
        gs.apply_defaults();
        cluster.put_game_server(gs)
    }

    #[tokio::test]
    async fn happy_path_for_a_dynamic_port_game_server() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller(&cluster);
        fresh_game_server(&cluster, "happy");

        // first pass cascades PortAllocation -> Creating -> Starting, then
        // backs off because the pod hasn't been scheduled
        assert!(controller.sync_game_server("default/happy").await.is_err());
        let gs = cluster.get_game_server("default", "happy").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Starting));
        assert!(cluster.get_pod("default", "happy").is_some());

        cluster.schedule_pod("default", "happy", "node-1");
        controller.sync_game_server("default/happy").await.unwrap();
        let gs = cluster.get_game_server("default", "happy").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Scheduled));
        let status = gs.status.as_ref().unwrap();
        assert_eq!(status.address, "10.0.0.1");
        assert_eq!(status.node_name, "node-1");

        // the sidecar reports SDK.Ready()
        let mut gs = cluster.get_game_server("default", "happy").unwrap();
        gs.set_state(GameServerState::RequestReady);
        cluster.put_game_server(gs);

        controller.sync_game_server("default/happy").await.unwrap();
        let gs = cluster.get_game_server("default", "happy").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Ready));
        let status = gs.status.as_ref().unwrap();
        assert_eq!(status.ports.len(), 1);
        assert!((7000..=7010).contains(&status.ports[0].port));
    }

    #[tokio::test]
    async fn port_exhaustion_moves_the_last_game_server_to_error() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller_with_range(&cluster, 7000, 7001);

        for name in ["one", "two", "three"] {
            fresh_game_server(&cluster, name);
            let _ = controller.sync_game_server(&format!("default/{name}")).await;
        }

        for name in ["one", "two"] {
            let gs = cluster.get_game_server("default", name).unwrap();
            assert_ne!(gs.state(), Some(GameServerState::Error), "{name}");
            assert!(gs.spec.ports[0].host_port.is_some(), "{name}");
        }

        let gs = cluster.get_game_server("default", "three").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Error));
        let events = cluster.events();
        assert!(events
            .iter()
            .any(|event| event.severity == EventSeverity::Warning
                && event.game_server == "default/three"));
    }

    #[tokio::test]
    async fn deletion_waits_for_the_pod_before_stripping_the_finalizer() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller(&cluster);
        fresh_game_server(&cluster, "doomed");

        let _ = controller.sync_game_server("default/doomed").await;
        assert!(cluster.get_pod("default", "doomed").is_some());

        // deletion arrives from the outside
        crate::cluster::GameServers::delete(&*cluster, "default", "doomed")
            .await
            .unwrap();

        // first pass deletes the pod but keeps the finalizer
        controller.sync_game_server("default/doomed").await.unwrap();
        let pod = cluster.get_pod("default", "doomed").unwrap();
        assert!(pod.metadata.deletion_timestamp.is_some());
        let gs = cluster.get_game_server("default", "doomed").unwrap();
        assert_eq!(
            gs.metadata.finalizers.as_deref(),
            Some(&[GROUP.to_owned()][..])
        );

        // the pod lingers; replaying changes nothing
        controller.sync_game_server("default/doomed").await.unwrap();
        assert!(cluster.get_pod("default", "doomed").is_some());

        // the kubelet finishes; the finalizer goes, and with it the record
        cluster.remove_pod("default", "doomed");
        controller.sync_game_server("default/doomed").await.unwrap();
        assert!(cluster.get_game_server("default", "doomed").is_none());
    }

    #[tokio::test]
    async fn replaying_a_settled_game_server_is_a_no_op() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller(&cluster);

        let mut gs = game_server("settled");
        gs.set_state(GameServerState::Ready);
        let status = gs.status.as_mut().unwrap();
        status.address = "10.0.0.1".into();
        status.node_name = "node-1".into();
        let stored = cluster.put_game_server(gs);

        controller.sync_game_server("default/settled").await.unwrap();
        let after = cluster.get_game_server("default", "settled").unwrap();
        assert_eq!(after.metadata.resource_version, stored.metadata.resource_version);
        assert_eq!(after.state(), Some(GameServerState::Ready));
    }

    #[tokio::test]
    async fn an_existing_pod_is_reused_on_creation() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller(&cluster);

        let mut gs = game_server("reused");
        gs.set_state(GameServerState::Creating);
        let gs = cluster.put_game_server(gs);
        let pod = gs.build_pod(Container::default()).unwrap();
        cluster.put_pod(pod);

        let _ = controller.sync_game_server("default/reused").await;
        let gs = cluster.get_game_server("default", "reused").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Starting));
        assert!(cluster
            .events()
            .iter()
            .any(|event| event.message.contains("already exists")));
    }

    #[tokio::test]
    async fn an_invalid_pod_spec_moves_the_game_server_to_error() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let mut gs = game_server("broken");
        gs.spec.container = Some("missing".into());
        gs.set_state(GameServerState::Creating);
        cluster.put_game_server(gs);

        controller.sync_game_server("default/broken").await.unwrap();
        let gs = cluster.get_game_server("default", "broken").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Error));
    }

    #[tokio::test]
    async fn a_rejected_pod_moves_the_game_server_to_error() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let mut gs = game_server("rejected");
        gs.set_state(GameServerState::Creating);
        cluster.put_game_server(gs);
        cluster.fail_next_pod_create(cluster::Error::Invalid {
            kind: "Pod",
            name: "rejected".into(),
            message: "spec rejected".into(),
        });

        controller.sync_game_server("default/rejected").await.unwrap();
        let gs = cluster.get_game_server("default", "rejected").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Error));
        assert!(cluster.get_pod("default", "rejected").is_none());
    }

    #[tokio::test]
    async fn a_failed_port_persist_returns_the_ports_to_the_pool() {
        let cluster = FakeCluster::new();
        let config = Config {
            min_port: 7000,
            max_port: 7001,
            ..Default::default()
        };
        let allocator = Arc::new(PortAllocator::new(7000, 7001));
        allocator.sync_node_added("node-1");
        let controller = Controller::new(config, cluster.substrate(), allocator.clone());

        fresh_game_server(&cluster, "flaky");
        cluster.fail_next_game_server_update(cluster::Error::Conflict {
            kind: "GameServer",
            name: "flaky".into(),
        });

        assert!(controller.sync_game_server("default/flaky").await.is_err());
        assert_eq!(allocator.slot_counts(), (2, 0));
    }

    #[tokio::test]
    async fn development_game_servers_skip_pod_management() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let mut gs = dev_game_server("devgs", "192.168.1.20");
        gs.set_state(GameServerState::Creating);
        cluster.put_game_server(gs);

        controller.sync_game_server("default/devgs").await.unwrap();
        let gs = cluster.get_game_server("default", "devgs").unwrap();
        assert_eq!(gs.state(), Some(GameServerState::Ready));
        let status = gs.status.as_ref().unwrap();
        assert_eq!(status.address, "192.168.1.20");
        assert_eq!(status.node_name, "192.168.1.20");
        assert!(cluster.get_pod("default", "devgs").is_none());
    }

    #[tokio::test]
    async fn shutdown_state_deletes_the_record() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));
        let controller = controller(&cluster);

        let mut gs = game_server("done");
        gs.metadata.finalizers = Some(vec![GROUP.to_owned()]);
        gs.set_state(GameServerState::Shutdown);
        cluster.put_game_server(gs);

        controller.sync_game_server("default/done").await.unwrap();
        let gs = cluster.get_game_server("default", "done").unwrap();
        // the finalizer keeps the record alive until the deletion pipeline
        // finishes tearing it down
        assert!(gs.is_being_deleted());
    }

    #[test]
    fn external_ip_is_preferred_over_internal() {
        let mut n = node("node-1", "10.0.0.1");
        n.status
            .as_mut()
            .unwrap()
            .addresses
            .as_mut()
            .unwrap()
            .insert(
                0,
                k8s_openapi::api::core::v1::NodeAddress {
                    type_: "InternalIP".into(),
                    address: "192.168.0.10".into(),
                },
            );
        assert_eq!(external_address(&n).unwrap(), "10.0.0.1");
    }

    #[test]
    fn internal_ip_is_a_fallback() {
        let mut n = node("node-1", "10.0.0.1");
        n.status.as_mut().unwrap().addresses = Some(vec![
            k8s_openapi::api::core::v1::NodeAddress {
                type_: "InternalIP".into(),
                address: "192.168.0.10".into(),
            },
        ]);
        assert_eq!(external_address(&n).unwrap(), "192.168.0.10");
    }

    #[test]
    fn sidecar_carries_identity_and_probe() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        let gs = game_server("sidecar");
        let sidecar = controller.sidecar(&gs);

        assert_eq!(sidecar.name, SIDECAR_CONTAINER_NAME);
        let env = sidecar.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|var| var.name == "GAMESERVER_NAME" && var.value.as_deref() == Some("sidecar")));
        assert!(sidecar.liveness_probe.is_some());
        let args = sidecar.args.as_ref().unwrap();
        assert!(args.contains(&"--grpc-port=9357".to_owned()));
    }

    #[test]
    fn health_probe_is_injected_unless_disabled() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let gs = game_server("probed");
        let mut pod = gs.build_pod(Container::default()).unwrap();
        controller.add_game_server_health_check(&gs, &mut pod);
        let probe = pod.spec.as_ref().unwrap().containers[0]
            .liveness_probe
            .as_ref()
            .unwrap();
        assert_eq!(
            probe.http_get.as_ref().unwrap().path.as_deref(),
            Some("/gshealthz")
        );

        let mut gs = game_server("unprobed");
        gs.spec.health.disabled = true;
        let mut pod = gs.build_pod(Container::default()).unwrap();
        controller.add_game_server_health_check(&gs, &mut pod);
        assert!(pod.spec.as_ref().unwrap().containers[0]
            .liveness_probe
            .is_none());
    }
}
