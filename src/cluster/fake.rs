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

//! An in-memory substrate with the same optimistic-concurrency and deletion
//! semantics as a real apiserver, for exercising the controllers in tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use parking_lot::Mutex;

use super::{Error, EventSeverity, Substrate};
use crate::api::allocation::selector_matches;
use crate::api::policy::GameServerAllocationPolicy;
use crate::api::GameServer;

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub game_server: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
struct Inner {
    game_servers: BTreeMap<(String, String), GameServer>,
    pods: BTreeMap<(String, String), Pod>,
    nodes: BTreeMap<String, Node>,
    secrets: BTreeMap<(String, String), Secret>,
    policies: BTreeMap<(String, String), GameServerAllocationPolicy>,
    events: Vec<RecordedEvent>,
    next_resource_version: u64,
    fail_next_game_server_update: Option<Error>,
    fail_next_pod_create: Option<Error>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<Inner>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// The capability set for controllers under test, all backed by this
    /// fake.
    pub fn substrate(self: &Arc<Self>) -> Substrate {
        Substrate {
            game_servers: self.clone(),
            pods: self.clone(),
            nodes: self.clone(),
            recorder: self.clone(),
        }
    }

    pub fn put_game_server(&self, mut gs: GameServer) -> GameServer {
        let mut inner = self.inner.lock();
        if gs.metadata.resource_version.is_none() {
            gs.metadata.resource_version = Some(inner.bump_resource_version());
        }
        let key = (gs.namespace().to_owned(), gs.name().to_owned());
        inner.game_servers.insert(key, gs.clone());
        gs
    }

    pub fn get_game_server(&self, namespace: &str, name: &str) -> Option<GameServer> {
        self.inner
            .lock()
            .game_servers
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn put_pod(&self, mut pod: Pod) {
        let mut inner = self.inner.lock();
        if pod.metadata.resource_version.is_none() {
            pod.metadata.resource_version = Some(inner.bump_resource_version());
        }
        let key = object_key(&pod.metadata);
        inner.pods.insert(key, pod);
    }

    pub fn get_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.inner
            .lock()
            .pods
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Simulates the kubelet finishing a pod's termination: the record
    /// disappears entirely.
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.inner
            .lock()
            .pods
            .remove(&(namespace.to_owned(), name.to_owned()));
    }

    /// Simulates the scheduler binding a pod to a node.
    pub fn schedule_pod(&self, namespace: &str, name: &str, node: &str) {
        let mut inner = self.inner.lock();
        if let Some(pod) = inner
            .pods
            .get_mut(&(namespace.to_owned(), name.to_owned()))
        {
            pod.spec.get_or_insert_with(Default::default).node_name = Some(node.to_owned());
        }
    }

    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.inner.lock().nodes.insert(name, node);
    }

    pub fn remove_node(&self, name: &str) {
        self.inner.lock().nodes.remove(name);
    }

    pub fn put_secret(&self, secret: Secret) {
        let key = object_key(&secret.metadata);
        self.inner.lock().secrets.insert(key, secret);
    }

    pub fn put_policy(&self, policy: GameServerAllocationPolicy) {
        let key = object_key(&policy.metadata);
        self.inner.lock().policies.insert(key, policy);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner.lock().events.clone()
    }

    pub fn fail_next_game_server_update(&self, error: Error) {
        self.inner.lock().fail_next_game_server_update = Some(error);
    }

    pub fn fail_next_pod_create(&self, error: Error) {
        self.inner.lock().fail_next_pod_create = Some(error);
    }
}

impl Inner {
    fn bump_resource_version(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

fn object_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn now() -> Time {
    Time(k8s_openapi::chrono::Utc::now())
}

#[async_trait]
impl super::GameServers for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<GameServer, Error> {
        self.get_game_server(namespace, name)
            .ok_or_else(|| Error::NotFound {
                kind: "GameServer",
                name: name.to_owned(),
            })
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<GameServer>, Error> {
        Ok(self
            .inner
            .lock()
            .game_servers
            .values()
            .filter(|gs| namespace.is_none() || namespace == Some(gs.namespace()))
            .cloned()
            .collect())
    }

    async fn update(&self, gs: &GameServer) -> Result<GameServer, Error> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.fail_next_game_server_update.take() {
            return Err(error);
        }

        let key = (gs.namespace().to_owned(), gs.name().to_owned());
        let stored = inner.game_servers.get(&key).ok_or_else(|| Error::NotFound {
            kind: "GameServer",
            name: gs.name().to_owned(),
        })?;

        if stored.metadata.resource_version != gs.metadata.resource_version {
            return Err(Error::Conflict {
                kind: "GameServer",
                name: gs.name().to_owned(),
            });
        }

        // Once a record marked for deletion loses its last finalizer, the
        // apiserver removes it outright.
        let finalizers_gone = gs
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .is_empty();
        if stored.metadata.deletion_timestamp.is_some() && finalizers_gone {
            inner.game_servers.remove(&key);
            let mut gone = gs.clone();
            gone.metadata.resource_version = None;
            return Ok(gone);
        }

        let mut updated = gs.clone();
        updated.metadata.resource_version = Some(inner.bump_resource_version());
        inner.game_servers.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let key = (namespace.to_owned(), name.to_owned());
        let Some(stored) = inner.game_servers.get_mut(&key) else {
            return Err(Error::NotFound {
                kind: "GameServer",
                name: name.to_owned(),
            });
        };

        if stored
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .is_empty()
        {
            inner.game_servers.remove(&key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(now());
        }
        Ok(())
    }
}

#[async_trait]
impl super::Pods for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        self.get_pod(namespace, name).ok_or_else(|| Error::NotFound {
            kind: "Pod",
            name: name.to_owned(),
        })
    }

    async fn create(&self, pod: &Pod) -> Result<Pod, Error> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.fail_next_pod_create.take() {
            return Err(error);
        }

        let key = object_key(&pod.metadata);
        if inner.pods.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: "Pod",
                name: key.1,
            });
        }

        let mut pod = pod.clone();
        pod.metadata.resource_version = Some(inner.bump_resource_version());
        inner.pods.insert(key, pod.clone());
        Ok(pod)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let key = (namespace.to_owned(), name.to_owned());
        let Some(pod) = inner.pods.get_mut(&key) else {
            return Err(Error::NotFound {
                kind: "Pod",
                name: name.to_owned(),
            });
        };

        // Pods terminate gracefully; the record lingers until the kubelet is
        // done (tests call `remove_pod` for that).
        if pod.metadata.deletion_timestamp.is_none() {
            pod.metadata.deletion_timestamp = Some(now());
        }
        Ok(())
    }
}

#[async_trait]
impl super::Nodes for FakeCluster {
    async fn get(&self, name: &str) -> Result<Node, Error> {
        self.inner
            .lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Node",
                name: name.to_owned(),
            })
    }

    async fn list(&self) -> Result<Vec<Node>, Error> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }
}

#[async_trait]
impl super::Secrets for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        self.inner
            .lock()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Secret",
                name: name.to_owned(),
            })
    }
}

#[async_trait]
impl super::AllocationPolicies for FakeCluster {
    async fn list(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<GameServerAllocationPolicy>, Error> {
        Ok(self
            .inner
            .lock()
            .policies
            .values()
            .filter(|policy| policy.metadata.namespace.as_deref() == Some(namespace))
            .filter(|policy| {
                selector.is_none_or(|selector| {
                    let labels = policy.metadata.labels.clone().unwrap_or_default();
                    selector_matches(selector, &labels)
                })
            })
            .cloned()
            .collect())
    }
}

impl super::Recorder for FakeCluster {
    fn event(&self, gs: &GameServer, severity: EventSeverity, reason: &str, message: &str) {
        self.inner.lock().events.push(RecordedEvent {
            game_server: gs.key(),
            severity,
            reason: reason.to_owned(),
            message: message.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{GameServers as _, Pods as _};
    use crate::test_utils::game_server;

    #[tokio::test]
    async fn update_detects_stale_resource_versions() {
        let cluster = FakeCluster::new();
        let stored = cluster.put_game_server(game_server("stale"));

        let fresh = cluster.update(&stored).await.unwrap();
        assert_ne!(fresh.metadata.resource_version, stored.metadata.resource_version);

        // replaying the original commit now conflicts
        let err = cluster.update(&stored).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let cluster = FakeCluster::new();
        let mut gs = game_server("finalized");
        gs.metadata.finalizers = Some(vec![crate::api::GROUP.to_owned()]);
        let stored = cluster.put_game_server(gs);

        crate::cluster::GameServers::delete(&*cluster, "default", "finalized")
            .await
            .unwrap();
        let mut stored = cluster.get_game_server("default", "finalized").unwrap();
        assert!(stored.is_being_deleted());

        stored.metadata.finalizers = None;
        cluster.update(&stored).await.unwrap();
        assert!(cluster.get_game_server("default", "finalized").is_none());
    }

    #[tokio::test]
    async fn pods_terminate_gracefully() {
        let cluster = FakeCluster::new();
        let gs = game_server("graceful");
        let pod = gs.build_pod(Default::default()).unwrap();
        cluster.create(&pod).await.unwrap();

        assert!(cluster.create(&pod).await.unwrap_err().is_already_exists());

        crate::cluster::Pods::delete(&*cluster, "default", "graceful")
            .await
            .unwrap();
        let lingering = cluster.get_pod("default", "graceful").unwrap();
        assert!(lingering.metadata.deletion_timestamp.is_some());

        cluster.remove_pod("default", "graceful");
        assert!(cluster.get_pod("default", "graceful").is_none());
    }
}
