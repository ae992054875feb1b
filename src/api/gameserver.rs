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

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Container, ContainerPort, Pod, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, StatusCause},
};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::GROUP;

/// Label a game server pod carries to mark its role.
pub const ROLE_LABEL: &str = "arena.dev/role";
pub const GAMESERVER_POD_ROLE: &str = "gameserver";
/// Label a game server pod carries naming its owning game server.
pub const GAMESERVER_LABEL: &str = "arena.dev/gameserver";
/// Annotation that short-circuits pod management and points straight at a
/// developer-run game server process.
pub const DEV_ADDRESS_ANNOTATION: &str = "arena.dev/dev-address";

/// A [`GameServer`] describes a single dedicated game server instance, and
/// is driven through its lifecycle by the game server controller.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(group = "arena.dev", version = "v1", kind = "GameServer")]
#[kube(status = "GameServerStatus", shortname = "gs", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container specifies which pod container is the game server. Only
    /// required if there is more than one container defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Ports are the array of ports that can be exposed via the game server.
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    /// Configures health checking.
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy. Defaults to `Packed`.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Parameters for the SDK server sidecar container.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Describes the pod that will be created for the [`GameServer`].
    #[serde(default)]
    pub template: PodTemplateSpec,
}

impl Default for GameServerSpec {
    fn default() -> Self {
        Self {
            container: None,
            ports: vec![],
            health: Default::default(),
            scheduling: SchedulingStrategy::Packed,
            sdk_server: Default::default(),
            template: Default::default(),
        }
    }
}

/// The current lifecycle state of a [`GameServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GameServerState {
    /// A dynamically allocating [`GameServer`] is being created, an open
    /// port needs to be allocated.
    PortAllocation,
    /// The pod for the [`GameServer`] is being created.
    Creating,
    /// The pod has been created, but is not yet scheduled.
    Starting,
    /// The pod has been scheduled in the cluster, basically we have a node
    /// name.
    Scheduled,
    /// The [`GameServer`] has declared that it is ready.
    RequestReady,
    /// The [`GameServer`] is ready to take connections from game clients.
    Ready,
    /// The [`GameServer`] has shutdown and everything needs to be deleted
    /// from the cluster.
    Shutdown,
    /// Something has gone wrong with the [`GameServer`] and it cannot be
    /// resolved.
    Error,
    /// The [`GameServer`] has failed its health checks.
    Unhealthy,
    /// The [`GameServer`] has been allocated to a session.
    Allocated,
}

impl std::fmt::Display for GameServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PortAllocation => "PortAllocation",
            Self::Creating => "Creating",
            Self::Starting => "Starting",
            Self::Scheduled => "Scheduled",
            Self::RequestReady => "RequestReady",
            Self::Ready => "Ready",
            Self::Shutdown => "Shutdown",
            Self::Error => "Error",
            Self::Unhealthy => "Unhealthy",
            Self::Allocated => "Allocated",
        };
        f.write_str(name)
    }
}

/// Defines a set of ports that are to be exposed via the [`GameServer`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Name is the descriptive name of the port.
    pub name: String,
    /// Defines the policy for how [`Self::host_port`] is populated.
    ///
    /// - `Dynamic` will allocate a host port within the `min-port`/`max-port`
    ///   range the controller was started with.
    /// - `Static` requires [`Self::host_port`], to specify the port that
    ///   game clients will connect to.
    /// - `Passthrough` sets the container port to the same value as the
    ///   dynamically selected host port.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// The port that is being opened on the game server process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    /// The port exposed on the host for clients to connect to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// The network protocol being used. Defaults to UDP.
    #[serde(default)]
    pub protocol: Protocol,
}

impl GameServerPort {
    /// The concrete binding this port contributes to the game server's
    /// status.
    pub fn status(&self) -> GameServerStatusPort {
        GameServerStatusPort {
            name: self.name.clone(),
            port: self.host_port.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PortPolicy {
    /// The user defines the host port to be used in the configuration.
    Static,
    /// The system will choose an open port for the [`GameServer`] in
    /// question.
    #[default]
    Dynamic,
    /// Dynamically sets the container port to the same value as the
    /// dynamically selected host port.
    Passthrough,
}

impl PortPolicy {
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Dynamic | Self::Passthrough)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Protocol {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// Configures health checking on the game server container.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Whether health checking is disabled or not.
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in.
    #[serde(default = "default_period_seconds")]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
    /// Initial delay before checking health.
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: i32,
}

fn default_period_seconds() -> i32 {
    5
}
fn default_failure_threshold() -> i32 {
    3
}
fn default_initial_delay_seconds() -> i32 {
    5
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            period_seconds: default_period_seconds(),
            failure_threshold: default_failure_threshold(),
            initial_delay_seconds: default_initial_delay_seconds(),
        }
    }
}

/// Parameters for the SDK server sidecar container.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SdkServer {
    /// The port on which the SDK server binds its gRPC server.
    #[serde(default = "default_sdk_grpc_port")]
    pub grpc_port: u16,
    /// The port on which the SDK server binds its HTTP gateway.
    #[serde(default = "default_sdk_http_port")]
    pub http_port: u16,
}

fn default_sdk_grpc_port() -> u16 {
    9357
}
fn default_sdk_http_port() -> u16 {
    9358
}

impl Default for SdkServer {
    fn default() -> Self {
        Self {
            grpc_port: default_sdk_grpc_port(),
            http_port: default_sdk_http_port(),
        }
    }
}

/// The strategy used when packing game server pods across a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SchedulingStrategy {
    /// Prioritise allocating game servers on the nodes that already run the
    /// most allocated game servers, to bin pack and let cold nodes scale
    /// down. Most useful on dynamic cloud clusters.
    #[default]
    Packed,
    /// Prioritise allocating game servers on the emptiest nodes, to spread
    /// load. Most useful on statically sized clusters.
    Distributed,
}

/// The observed status of a [`GameServer`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current lifecycle state.
    pub state: Option<GameServerState>,
    /// The concrete host port bindings.
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    /// The externally reachable address of the node running the game server.
    #[serde(default)]
    pub address: String,
    /// The node the backing pod landed on.
    #[serde(default)]
    pub node_name: String,
}

/// The port that was allocated to a [`GameServer`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum PodBuildError {
    #[error("failed to find container named {0:?} in the pod template")]
    UnknownContainer(String),
    #[error("pod template declares no containers")]
    NoContainers,
}

impl GameServer {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The `namespace/name` key this game server is enqueued under.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().and_then(|status| status.state)
    }

    pub fn set_state(&mut self, state: GameServerState) {
        self.status.get_or_insert_with(Default::default).state = Some(state);
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The direct address a development game server declared, bypassing pod
    /// management entirely.
    pub fn dev_address(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(DEV_ADDRESS_ANNOTATION))
            .map(String::as_str)
    }

    pub fn has_port_policy(&self, policy: PortPolicy) -> bool {
        self.spec.ports.iter().any(|p| p.port_policy == policy)
    }

    fn has_dynamic_ports(&self) -> bool {
        self.spec.ports.iter().any(|p| p.port_policy.is_dynamic())
    }

    /// Applies all creation-time defaults. Defaulting is a fixed point:
    /// applying it to an already defaulted game server changes nothing.
    pub fn apply_defaults(&mut self) {
        self.apply_container_defaults();
        self.apply_state_defaults();
    }

    fn apply_container_defaults(&mut self) {
        if self.spec.container.is_none() {
            let containers = self
                .spec
                .template
                .spec
                .as_ref()
                .map(|spec| &spec.containers);
            if let Some([only]) = containers.map(Vec::as_slice) {
                self.spec.container = Some(only.name.clone());
            }
        }
    }

    fn apply_state_defaults(&mut self) {
        if self.state().is_none() {
            let state = if self.has_dynamic_ports() {
                GameServerState::PortAllocation
            } else {
                GameServerState::Creating
            };
            self.set_state(state);

            let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == GROUP) {
                finalizers.push(GROUP.to_owned());
            }
        }
    }

    /// Checks the spec for problems an apiserver would otherwise accept, and
    /// returns a cause for each one found.
    pub fn validate(&self) -> Vec<StatusCause> {
        let mut causes = vec![];

        let containers = self
            .spec
            .template
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();

        match &self.spec.container {
            None if containers.len() > 1 => causes.push(cause(
                "container",
                "container is required when the pod template has more than one container",
            )),
            Some(name) if !containers.iter().any(|c| &c.name == name) => causes.push(cause(
                "container",
                format!("could not find a container named {name} in the pod template"),
            )),
            _ => {}
        }

        let mut seen_names = std::collections::BTreeSet::new();
        let mut seen_host_ports = std::collections::BTreeSet::new();
        for (i, port) in self.spec.ports.iter().enumerate() {
            if !seen_names.insert(&port.name) {
                causes.push(cause(
                    format!("ports[{i}].name"),
                    format!("port name {:?} must be unique", port.name),
                ));
            }

            match port.port_policy {
                PortPolicy::Static => match port.host_port {
                    None => causes.push(cause(
                        format!("ports[{i}].hostPort"),
                        "hostPort is required with a Static port policy",
                    )),
                    Some(host_port) if !seen_host_ports.insert(host_port) => causes.push(cause(
                        format!("ports[{i}].hostPort"),
                        format!("hostPort {host_port} overlaps with another static port"),
                    )),
                    Some(_) => {}
                },
                PortPolicy::Dynamic | PortPolicy::Passthrough => {
                    if port.host_port.is_some() {
                        causes.push(cause(
                            format!("ports[{i}].hostPort"),
                            "hostPort cannot be specified with a Dynamic or Passthrough port policy",
                        ));
                    }
                }
            }

            match port.port_policy {
                PortPolicy::Passthrough => {
                    if port.container_port.is_some() {
                        causes.push(cause(
                            format!("ports[{i}].containerPort"),
                            "containerPort cannot be specified with a Passthrough port policy",
                        ));
                    }
                }
                _ => {
                    if port.container_port.is_none() {
                        causes.push(cause(
                            format!("ports[{i}].containerPort"),
                            "containerPort is required",
                        ));
                    }
                }
            }

            if self.dev_address().is_some() && port.port_policy != PortPolicy::Static {
                causes.push(cause(
                    format!("ports[{i}].portPolicy"),
                    "portPolicy must be Static on a development game server",
                ));
            }
        }

        if !self.spec.health.disabled {
            for (field, value) in [
                ("health.periodSeconds", self.spec.health.period_seconds),
                ("health.failureThreshold", self.spec.health.failure_threshold),
                (
                    "health.initialDelaySeconds",
                    self.spec.health.initial_delay_seconds,
                ),
            ] {
                if value <= 0 {
                    causes.push(cause(field, format!("{field} must be positive")));
                }
            }
        }

        if let Some(address) = self.dev_address() {
            if address.parse::<std::net::IpAddr>().is_err() {
                causes.push(cause(
                    format!("annotations.{DEV_ADDRESS_ANNOTATION}"),
                    format!("value {address:?} must be a valid IP address"),
                ));
            }
        }

        causes
    }

    /// The name of the container running the game server process.
    pub fn container_name(&self) -> Result<&str, PodBuildError> {
        if let Some(name) = self.spec.container.as_deref() {
            return Ok(name);
        }

        let containers = self
            .spec
            .template
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();
        match containers {
            [only] => Ok(&only.name),
            [] => Err(PodBuildError::NoContainers),
            _ => Err(PodBuildError::UnknownContainer(String::new())),
        }
    }

    /// Builds the backing pod for this game server, with the given SDK
    /// sidecar attached and the declared ports exposed on the game server
    /// container.
    pub fn build_pod(&self, sidecar: Container) -> Result<Pod, PodBuildError> {
        let template = &self.spec.template;

        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default();
        labels.insert(ROLE_LABEL.into(), GAMESERVER_POD_ROLE.into());
        labels.insert(GAMESERVER_LABEL.into(), self.name().into());

        let annotations = template
            .metadata
            .as_ref()
            .and_then(|meta| meta.annotations.clone());

        let mut pod = Pod {
            metadata: ObjectMeta {
                // Pods have a strict 1:1 relationship with their game
                // server, so they share a name.
                name: Some(self.name().into()),
                namespace: Some(self.namespace().into()),
                labels: Some(labels),
                annotations,
                owner_references: Some(vec![self.controller_owner_ref()]),
                ..Default::default()
            },
            spec: template.spec.clone(),
            status: None,
        };

        let container_name = self.container_name()?.to_owned();
        let ports = self.container_ports();
        let mut applied = false;
        if let Some(spec) = pod.spec.as_mut() {
            for container in spec.containers.iter_mut() {
                if container.name == container_name {
                    container
                        .ports
                        .get_or_insert_with(Vec::new)
                        .extend(ports.iter().cloned());
                    applied = true;
                }
            }
            spec.containers.push(sidecar);
        }
        if !applied {
            return Err(PodBuildError::UnknownContainer(container_name));
        }

        Ok(pod)
    }

    fn container_ports(&self) -> Vec<ContainerPort> {
        self.spec
            .ports
            .iter()
            .map(|port| {
                let container_port = match port.port_policy {
                    // Passthrough exposes the dynamically chosen host port
                    // directly in the container.
                    PortPolicy::Passthrough => port.host_port,
                    _ => port.container_port,
                };
                ContainerPort {
                    container_port: container_port.unwrap_or_default().into(),
                    host_port: port.host_port.map(Into::into),
                    protocol: Some(port.protocol.as_str().into()),
                    ..Default::default()
                }
            })
            .collect()
    }

    /// The owner reference game server pods carry back to their game server.
    pub fn controller_owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: GameServer::api_version(&()).into_owned(),
            kind: GameServer::kind(&()).into_owned(),
            name: self.name().into(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether the given pod is controlled by this game server.
    pub fn controls(&self, pod: &Pod) -> bool {
        pod.metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|owner| {
                owner.controller == Some(true)
                    && owner.kind == GameServer::kind(&())
                    && owner.name == self.name()
            })
    }

    /// The status bindings derived from the spec's ports.
    pub fn status_ports(&self) -> Vec<GameServerStatusPort> {
        self.spec.ports.iter().map(GameServerPort::status).collect()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }
}

fn cause(field: impl Into<String>, message: impl Into<String>) -> StatusCause {
    StatusCause {
        field: Some(field.into()),
        message: Some(message.into()),
        reason: Some("FieldValueInvalid".into()),
    }
}

/// Whether the pod was created by a game server controller.
pub fn is_game_server_pod(pod: &Pod) -> bool {
    let role = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ROLE_LABEL));
    if role.map(String::as_str) != Some(GAMESERVER_POD_ROLE) {
        return false;
    }

    controller_of(pod).is_some()
}

/// The `namespace/name` key of the game server owning this pod, if any.
pub fn owning_game_server_key(pod: &Pod) -> Option<String> {
    let owner = controller_of(pod)?;
    let namespace = pod.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{}", owner.name))
}

fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| owner.controller == Some(true) && owner.kind == GameServer::kind(&()))
}
