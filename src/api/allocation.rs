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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, StatusCause};
use serde::{Deserialize, Serialize};

use super::gameserver::{GameServer, GameServerStatusPort, SchedulingStrategy};

/// A request to reserve a single ready [`GameServer`] for a game session.
///
/// Unlike a [`GameServer`] this is transient: nothing is persisted, the
/// record only travels through the allocation engine (or over the wire to a
/// remote cluster) and comes back with a populated status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocation {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GameServerAllocationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<GameServerAllocationStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationSpec {
    /// Settings for forwarding this request to other clusters.
    #[serde(default)]
    pub multi_cluster_setting: MultiClusterSetting,
    /// A game server must match this selector to be eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<LabelSelector>,
    /// Matching any of these raises a game server's preference, in order of
    /// declaration.
    #[serde(default)]
    pub preferred: Vec<LabelSelector>,
    /// Which packing heuristic to apply when choosing between matches.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Labels and annotations stamped onto the reserved game server.
    #[serde(default)]
    pub metadata: MetaPatch,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterSetting {
    #[serde(default)]
    pub enabled: bool,
    /// Narrows which allocation policies apply to this request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_selector: Option<LabelSelector>,
}

/// Metadata applied to a game server at reservation time.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MetaPatch {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl MetaPatch {
    /// Stamps the patch onto the given game server's metadata.
    pub fn apply(&self, gs: &mut GameServer) {
        if !self.labels.is_empty() {
            gs.metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(self.labels.clone());
        }
        if !self.annotations.is_empty() {
            gs.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .extend(self.annotations.clone());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum AllocationState {
    /// A game server was reserved for the request.
    Allocated,
    /// No ready game server matched the request.
    UnAllocated,
    /// Every match was lost to a concurrent allocation.
    Contention,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameServerAllocationStatus {
    pub state: AllocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_server_name: Option<String>,
    #[serde(default)]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
}

impl GameServerAllocation {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Checks the request for malformed metadata patches.
    pub fn validate(&self) -> Vec<StatusCause> {
        let mut causes = vec![];
        let patch = &self.spec.metadata;
        for (kind, keys) in [
            ("labels", patch.labels.keys()),
            ("annotations", patch.annotations.keys()),
        ] {
            for key in keys {
                if key.is_empty() || key.chars().any(char::is_whitespace) {
                    causes.push(StatusCause {
                        field: Some(format!("metadata.{kind}")),
                        message: Some(format!("{key:?} is not a valid {kind} key")),
                        reason: Some("FieldValueInvalid".into()),
                    });
                }
            }
        }
        causes
    }

    /// Marks the request as fulfilled by the given game server.
    pub fn fulfill(&mut self, gs: &GameServer) {
        self.metadata.name = gs.metadata.name.clone();
        let status = gs.status.clone().unwrap_or_default();
        self.status = Some(GameServerAllocationStatus {
            state: AllocationState::Allocated,
            game_server_name: gs.metadata.name.clone(),
            ports: status.ports,
            address: status.address,
            node_name: status.node_name,
        });
    }

    pub fn unallocated(&mut self) {
        self.status = Some(GameServerAllocationStatus {
            state: AllocationState::UnAllocated,
            game_server_name: None,
            ports: vec![],
            address: String::new(),
            node_name: String::new(),
        });
    }

    pub fn contention(&mut self) {
        self.status = Some(GameServerAllocationStatus {
            state: AllocationState::Contention,
            game_server_name: None,
            ports: vec![],
            address: String::new(),
            node_name: String::new(),
        });
    }
}

/// Whether the given labels satisfy the selector, covering both the
/// `matchLabels` and `matchExpressions` forms. An empty selector matches
/// everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        if !match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
        {
            return false;
        }
    }

    for requirement in selector.match_expressions.as_deref().unwrap_or_default() {
        let value = labels.get(&requirement.key);
        let values = requirement.values.as_deref().unwrap_or_default();
        let matched = match requirement.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => !value.is_some_and(|v| values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !matched {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{game_server, label_selector};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    #[test]
    fn empty_selector_matches_everything() {
        let labels = BTreeMap::from([("game".to_owned(), "udp".to_owned())]);
        assert!(selector_matches(&LabelSelector::default(), &labels));
        assert!(selector_matches(&LabelSelector::default(), &BTreeMap::new()));
    }

    #[test]
    fn match_labels_require_exact_values() {
        let selector = label_selector("game", "udp");
        assert!(selector_matches(
            &selector,
            &BTreeMap::from([("game".to_owned(), "udp".to_owned())])
        ));
        assert!(!selector_matches(
            &selector,
            &BTreeMap::from([("game".to_owned(), "tcp".to_owned())])
        ));
        assert!(!selector_matches(&selector, &BTreeMap::new()));
    }

    #[test]
    fn match_expressions_cover_set_operators() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "region".into(),
                    operator: "In".into(),
                    values: Some(vec!["eu".into(), "us".into()]),
                },
                LabelSelectorRequirement {
                    key: "deprecated".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };

        assert!(selector_matches(
            &selector,
            &BTreeMap::from([("region".to_owned(), "eu".to_owned())])
        ));
        assert!(!selector_matches(
            &selector,
            &BTreeMap::from([("region".to_owned(), "apac".to_owned())])
        ));
        assert!(!selector_matches(
            &selector,
            &BTreeMap::from([
                ("region".to_owned(), "eu".to_owned()),
                ("deprecated".to_owned(), "true".to_owned()),
            ])
        ));
    }

    #[test]
    fn meta_patch_stamps_labels_and_annotations() {
        let mut gs = game_server("stamped");
        let patch = MetaPatch {
            labels: BTreeMap::from([("session".to_owned(), "abc123".to_owned())]),
            annotations: BTreeMap::from([("owner".to_owned(), "matchmaker".to_owned())]),
        };
        patch.apply(&mut gs);

        assert_eq!(gs.labels().get("session").unwrap(), "abc123");
        assert_eq!(
            gs.metadata
                .annotations
                .as_ref()
                .unwrap()
                .get("owner")
                .unwrap(),
            "matchmaker"
        );
    }

    #[test]
    fn rejects_invalid_patch_keys() {
        let mut gsa = GameServerAllocation::default();
        gsa.spec
            .metadata
            .labels
            .insert("bad key".into(), "value".into());
        let causes = gsa.validate();
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].field.as_deref(), Some("metadata.labels"));
    }

    #[test]
    fn fulfilled_status_mirrors_the_game_server() {
        let mut gs = game_server("winner");
        gs.set_state(crate::api::GameServerState::Ready);
        let status = gs.status.as_mut().unwrap();
        status.address = "10.0.0.1".into();
        status.node_name = "node-1".into();
        status.ports = vec![GameServerStatusPort {
            name: "default".into(),
            port: 7104,
        }];

        let mut gsa = GameServerAllocation::default();
        gsa.fulfill(&gs);
        let status = gsa.status.unwrap();
        assert_eq!(status.state, AllocationState::Allocated);
        assert_eq!(status.game_server_name.as_deref(), Some("winner"));
        assert_eq!(status.address, "10.0.0.1");
        assert_eq!(status.node_name, "node-1");
        assert_eq!(status.ports.len(), 1);
    }
}
