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

//! The production substrate, backed by a [`kube::Client`].

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher;
use kube::Resource;

use super::{Error, EventSeverity, Substrate};
use crate::api::allocation::selector_matches;
use crate::api::policy::GameServerAllocationPolicy;
use crate::api::GameServer;

const CONTROLLER_NAME: &str = "gameserver-controller";

#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub fn substrate(&self) -> Substrate {
        let this = std::sync::Arc::new(self.clone());
        Substrate {
            game_servers: this.clone(),
            pods: this.clone(),
            nodes: this.clone(),
            recorder: this,
        }
    }

    fn game_servers(&self, namespace: &str) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn convert(kind: &'static str, name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) => match response.code {
            404 => Error::NotFound {
                kind,
                name: name.to_owned(),
            },
            409 if response.reason == "AlreadyExists" => Error::AlreadyExists {
                kind,
                name: name.to_owned(),
            },
            409 => Error::Conflict {
                kind,
                name: name.to_owned(),
            },
            422 => Error::Invalid {
                kind,
                name: name.to_owned(),
                message: response.message,
            },
            _ => Error::Transient(response.message),
        },
        other => Error::Transient(other.to_string()),
    }
}

#[async_trait]
impl super::GameServers for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<GameServer, Error> {
        self.game_servers(namespace)
            .get(name)
            .await
            .map_err(|error| convert("GameServer", name, error))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<GameServer>, Error> {
        let api: Api<GameServer> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|error| convert("GameServer", "*", error))
    }

    async fn update(&self, gs: &GameServer) -> Result<GameServer, Error> {
        self.game_servers(gs.namespace())
            .replace(gs.name(), &PostParams::default(), gs)
            .await
            .map_err(|error| convert("GameServer", gs.name(), error))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.game_servers(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(drop)
            .map_err(|error| convert("GameServer", name, error))
    }
}

#[async_trait]
impl super::Pods for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|error| convert("Pod", name, error))
    }

    async fn create(&self, pod: &Pod) -> Result<Pod, Error> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods(pod.metadata.namespace.as_deref().unwrap_or_default())
            .create(&PostParams::default(), pod)
            .await
            .map_err(|error| convert("Pod", &name, error))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(drop)
            .map_err(|error| convert("Pod", name, error))
    }
}

#[async_trait]
impl super::Nodes for KubeCluster {
    async fn get(&self, name: &str) -> Result<Node, Error> {
        Api::<Node>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|error| convert("Node", name, error))
    }

    async fn list(&self) -> Result<Vec<Node>, Error> {
        Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|error| convert("Node", "*", error))
    }
}

#[async_trait]
impl super::Secrets for KubeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await
            .map_err(|error| convert("Secret", name, error))
    }
}

#[async_trait]
impl super::AllocationPolicies for KubeCluster {
    async fn list(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<GameServerAllocationPolicy>, Error> {
        let policies = Api::<GameServerAllocationPolicy>::namespaced(self.client.clone(), namespace)
            .list(&ListParams::default())
            .await
            .map_err(|error| convert("GameServerAllocationPolicy", "*", error))?;

        Ok(policies
            .items
            .into_iter()
            .filter(|policy| {
                selector.is_none_or(|selector| {
                    let labels = policy.metadata.labels.clone().unwrap_or_default();
                    selector_matches(selector, &labels)
                })
            })
            .collect())
    }
}

impl super::Recorder for KubeCluster {
    fn event(&self, gs: &GameServer, severity: EventSeverity, reason: &str, message: &str) {
        let recorder = Recorder::new(
            self.client.clone(),
            Reporter {
                controller: CONTROLLER_NAME.into(),
                instance: None,
            },
        );
        let reference = gs.object_ref(&());
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_owned(),
            note: Some(message.to_owned()),
            action: reason.to_owned(),
            secondary: None,
        };

        // Fire and forget; a dropped event is not worth failing a reconcile
        // over.
        tokio::spawn(async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::warn!(%error, "failed to publish event");
            }
        });
    }
}

/// A single observed change from a watch stream.
pub enum WatchDelta<T> {
    Upsert(T),
    Delete(T),
}

/// Pumps a watch stream over `T`, feeding every change to `apply` until the
/// stream fails or the process shuts down.
pub async fn pump<T, F>(api: Api<T>, mut apply: F) -> crate::Result<()>
where
    T: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    T::DynamicType: Default + Eq + std::hash::Hash + Clone,
    F: FnMut(WatchDelta<T>) + Send,
{
    let stream = watcher(api, watcher::Config::default());
    tokio::pin!(stream);

    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
                apply(WatchDelta::Upsert(object));
            }
            watcher::Event::Delete(object) => apply(WatchDelta::Delete(object)),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    Err(eyre::eyre!("watch stream unexpectedly ended"))
}
