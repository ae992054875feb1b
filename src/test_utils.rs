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

//! Common constructors for tests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, Node, NodeAddress, NodeStatus, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::api::gameserver::{
    GameServerPort, GameServerSpec, GameServerState, PortPolicy, Protocol, DEV_ADDRESS_ANNOTATION,
};
use crate::api::GameServer;

/// A game server named `name` in the `default` namespace, with a single
/// dynamic UDP port and a one-container pod template.
pub fn game_server(name: &str) -> GameServer {
    let mut gs = GameServer::new(
        name,
        GameServerSpec {
            container: Some("game".into()),
            ports: vec![GameServerPort {
                name: "default".into(),
                port_policy: PortPolicy::Dynamic,
                container_port: Some(26000),
                host_port: None,
                protocol: Protocol::Udp,
            }],
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "game".into(),
                        image: Some("gcr.io/arena-images/simple-game-server:0.1".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        },
    );
    gs.metadata.namespace = Some("default".into());
    gs
}

/// A development game server pointing straight at `address`, with the
/// static port such servers require.
pub fn dev_game_server(name: &str, address: &str) -> GameServer {
    let mut gs = game_server(name);
    gs.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(DEV_ADDRESS_ANNOTATION.into(), address.to_owned());
    gs.spec.ports[0].port_policy = PortPolicy::Static;
    gs.spec.ports[0].host_port = Some(7777);
    gs
}

/// A game server in the `Ready` state, scheduled onto `node_name`.
pub fn ready_game_server(name: &str, node_name: &str) -> GameServer {
    let mut gs = game_server(name);
    gs.spec.ports[0].host_port = Some(7104);
    gs.set_state(GameServerState::Ready);
    let ports = gs.status_ports();
    let status = gs.status.as_mut().unwrap();
    status.address = "10.0.0.1".into();
    status.node_name = node_name.to_owned();
    status.ports = ports;
    gs
}

/// A node with a single `ExternalIP` address.
pub fn node(name: &str, external_ip: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "ExternalIP".into(),
                address: external_ip.to_owned(),
            }]),
            ..Default::default()
        }),
    }
}

/// A selector matching a single label.
pub fn label_selector(key: &str, value: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(key.to_owned(), value.to_owned())])),
        match_expressions: None,
    }
}
