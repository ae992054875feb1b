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

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

/// Process-wide controller configuration, resolved once at startup from the
/// command line and environment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Inclusive lower bound of the host port range handed out to dynamic
    /// game server ports.
    pub min_port: u16,
    /// Inclusive upper bound of the host port range.
    pub max_port: u16,
    /// Container image run as the SDK sidecar in every game server pod.
    pub sidecar_image: String,
    /// Always pull the sidecar image, rather than only when not present.
    pub always_pull_sidecar: bool,
    /// CPU request applied to the sidecar container.
    pub sidecar_cpu_request: Option<Quantity>,
    /// CPU limit applied to the sidecar container.
    pub sidecar_cpu_limit: Option<Quantity>,
    /// Service account assigned to game server pods that don't bring their
    /// own.
    pub sdk_service_account: String,
    /// Number of workers each of the reconciler's queues runs.
    pub workers: usize,
    /// Name of this cluster, used to recognise ourselves in multi-cluster
    /// allocation policies.
    pub cluster_name: String,
    /// Namespace the controller manages game servers in. Empty manages all
    /// namespaces.
    pub namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_port: 7000,
            max_port: 8000,
            sidecar_image: "us-docker.pkg.dev/arena-images/release/arena-sdk:latest".into(),
            always_pull_sidecar: false,
            sidecar_cpu_request: Some(Quantity("30m".into())),
            sidecar_cpu_limit: None,
            sdk_service_account: "arena-sdk".into(),
            workers: 8,
            cluster_name: String::new(),
            namespace: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("min-port {0} must be less than or equal to max-port {1}")]
    PortRangeReversed(u16, u16),
    #[error("min-port must be non-zero")]
    PortRangeEmpty,
    #[error("sidecar-image must not be empty")]
    MissingSidecarImage,
    #[error("workers must be non-zero")]
    NoWorkers,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min_port == 0 {
            return Err(ValidationError::PortRangeEmpty);
        }
        if self.min_port > self.max_port {
            return Err(ValidationError::PortRangeReversed(
                self.min_port,
                self.max_port,
            ));
        }
        if self.sidecar_image.is_empty() {
            return Err(ValidationError::MissingSidecarImage);
        }
        if self.workers == 0 {
            return Err(ValidationError::NoWorkers);
        }
        Ok(())
    }

    /// The number of host ports available per node.
    pub fn port_range_size(&self) -> usize {
        usize::from(self.max_port - self.min_port) + 1
    }

    /// The namespace to watch and list game servers in, where `None` means
    /// the whole cluster.
    pub fn watch_namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }
}
