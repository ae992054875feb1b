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

//! The narrow seam between the controllers and the cluster they run
//! against. Everything the reconciler and allocator need from Kubernetes is
//! expressed as a capability here, with a client-backed implementation in
//! [`k8s`] and an in-memory one in [`fake`] for tests.

pub mod fake;
pub mod k8s;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::api::policy::GameServerAllocationPolicy;
use crate::api::GameServer;

/// The error taxonomy shared by every substrate capability. The controllers
/// branch on these kinds, so implementations must map their transport
/// faithfully.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("{kind} {name:?} is invalid: {message}")]
    Invalid {
        kind: &'static str,
        name: String,
        message: String,
    },
    #[error("conflict updating {kind} {name:?}")]
    Conflict { kind: &'static str, name: String },
    #[error("transient failure: {0}")]
    Transient(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[async_trait]
pub trait GameServers: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<GameServer, Error>;
    /// Snapshot of game servers, across all namespaces when `None`.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<GameServer>, Error>;
    /// Commits the record, subject to optimistic concurrency on its resource
    /// version.
    async fn update(&self, gs: &GameServer) -> Result<GameServer, Error>;
    /// Deletes the record with background propagation.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait Pods: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Error>;
    async fn create(&self, pod: &Pod) -> Result<Pod, Error>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait Nodes: Send + Sync {
    async fn get(&self, name: &str) -> Result<Node, Error>;
    async fn list(&self) -> Result<Vec<Node>, Error>;
}

#[async_trait]
pub trait Secrets: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, Error>;
}

#[async_trait]
pub trait AllocationPolicies: Send + Sync {
    async fn list(
        &self,
        namespace: &str,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<GameServerAllocationPolicy>, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Sink for lifecycle events attached to game server records. Recording is
/// fire-and-forget; failures to record never fail a reconcile.
pub trait Recorder: Send + Sync {
    fn event(&self, gs: &GameServer, severity: EventSeverity, reason: &str, message: &str);
}

/// The capability set handed to the game server controllers.
#[derive(Clone)]
pub struct Substrate {
    pub game_servers: Arc<dyn GameServers>,
    pub pods: Arc<dyn Pods>,
    pub nodes: Arc<dyn Nodes>,
    pub recorder: Arc<dyn Recorder>,
}
