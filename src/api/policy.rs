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

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A [`GameServerAllocationPolicy`] routes multi-cluster allocation requests
/// towards one cluster, local or remote.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "multicluster.arena.dev",
    version = "v1",
    kind = "GameServerAllocationPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationPolicySpec {
    /// Policies are tried lowest priority value first.
    pub priority: i32,
    /// Tie break between policies of the same priority; heavier policies are
    /// tried first.
    pub weight: i32,
    /// How to reach the cluster this policy routes to.
    pub connection_info: ClusterConnectionInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnectionInfo {
    /// The name of the targeted cluster. When it matches the controller's
    /// own cluster name the request is served locally.
    #[serde(default)]
    pub cluster_name: String,
    /// The allocation endpoints of the targeted cluster, tried in order.
    #[serde(default)]
    pub allocation_endpoints: Vec<String>,
    /// Name of the secret holding the client certificate for the remote
    /// cluster.
    #[serde(default)]
    pub secret_name: String,
    /// The namespace allocation requests are rewritten to on the remote
    /// cluster.
    #[serde(default)]
    pub namespace: String,
}

/// Orders the given policies into the sequence their connection descriptors
/// should be tried in: priority ascending, then weight descending, with the
/// policy name as a deterministic tie break.
pub fn connection_info_sequence(
    mut policies: Vec<GameServerAllocationPolicy>,
) -> impl Iterator<Item = ClusterConnectionInfo> {
    policies.sort_by(|a, b| {
        (a.spec.priority, b.spec.weight, a.metadata.name.as_deref()).cmp(&(
            b.spec.priority,
            a.spec.weight,
            b.metadata.name.as_deref(),
        ))
    });
    policies
        .into_iter()
        .map(|policy| policy.spec.connection_info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, priority: i32, weight: i32) -> GameServerAllocationPolicy {
        let mut policy = GameServerAllocationPolicy::new(
            name,
            GameServerAllocationPolicySpec {
                priority,
                weight,
                connection_info: ClusterConnectionInfo {
                    cluster_name: name.to_owned(),
                    ..Default::default()
                },
            },
        );
        policy.metadata.namespace = Some("default".into());
        policy
    }

    #[test]
    fn sequences_by_priority_then_weight() {
        let order: Vec<_> = connection_info_sequence(vec![
            policy("fallback", 2, 100),
            policy("heavy", 1, 500),
            policy("light", 1, 100),
        ])
        .map(|info| info.cluster_name)
        .collect();

        assert_eq!(order, ["heavy", "light", "fallback"]);
    }

    #[test]
    fn equal_policies_sequence_by_name() {
        let order: Vec<_> =
            connection_info_sequence(vec![policy("b", 1, 1), policy("a", 1, 1)])
                .map(|info| info.cluster_name)
                .collect();
        assert_eq!(order, ["a", "b"]);
    }
}
