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

use parking_lot::Mutex;

use crate::api::gameserver::PortPolicy;
use crate::api::GameServer;
use crate::cluster::{GameServers, Nodes};

#[derive(Debug, thiserror::Error)]
#[error("not enough free ports in range {min_port}-{max_port} to allocate {wanted} ports")]
pub struct PortExhausted {
    pub min_port: u16,
    pub max_port: u16,
    pub wanted: usize,
}

/// Hands out host ports for dynamically allocated game server ports, from a
/// bounded range partitioned per node.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    // node name -> port -> occupied
    table: Mutex<BTreeMap<String, BTreeMap<u16, bool>>>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            table: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds the port table from the currently observed nodes and marks the
    /// ports of live game servers (in the managed namespace, or everywhere
    /// for `None`) as occupied, so a restarted controller never hands out a
    /// port twice.
    pub async fn run(
        &self,
        nodes: &dyn Nodes,
        game_servers: &dyn GameServers,
        namespace: Option<&str>,
    ) -> crate::Result<()> {
        let node_list = nodes.list().await?;
        {
            let mut table = self.table.lock();
            table.clear();
            for node in node_list {
                let name = node.metadata.name.unwrap_or_default();
                table.insert(name, self.empty_node_range());
            }
        }

        for gs in game_servers.list(namespace).await? {
            if !gs.is_being_deleted() {
                self.mark_occupied(&gs);
            }
        }

        tracing::info!(
            min_port = self.min_port,
            max_port = self.max_port,
            "port allocator synced"
        );
        Ok(())
    }

    fn empty_node_range(&self) -> BTreeMap<u16, bool> {
        (self.min_port..=self.max_port)
            .map(|port| (port, false))
            .collect()
    }

    /// Fills in a concrete host port for every dynamic port in the spec.
    /// Each port is taken from whichever node currently has the most free
    /// ports, ties broken by node name.
    pub fn allocate(&self, mut gs: GameServer) -> Result<GameServer, PortExhausted> {
        let mut table = self.table.lock();

        let wanted = gs
            .spec
            .ports
            .iter()
            .filter(|port| port.port_policy.is_dynamic() && port.host_port.is_none())
            .count();
        let free: usize = table
            .values()
            .map(|ports| ports.values().filter(|occupied| !**occupied).count())
            .sum();
        if wanted > free {
            return Err(PortExhausted {
                min_port: self.min_port,
                max_port: self.max_port,
                wanted,
            });
        }

        for port in gs
            .spec
            .ports
            .iter_mut()
            .filter(|port| port.port_policy.is_dynamic() && port.host_port.is_none())
        {
            let best = table
                .iter_mut()
                .map(|(name, ports)| {
                    let free = ports.values().filter(|occupied| !**occupied).count();
                    (name, ports, free)
                })
                .filter(|(_, _, free)| *free > 0)
                .max_by(|(a_name, _, a_free), (b_name, _, b_free)| {
                    // highest free count wins, then the lexicographically
                    // smaller node name
                    a_free.cmp(b_free).then(b_name.cmp(a_name))
                });

            let Some((node, ports, _)) = best else {
                return Err(PortExhausted {
                    min_port: self.min_port,
                    max_port: self.max_port,
                    wanted,
                });
            };

            let mut chosen = None;
            for (candidate, occupied) in ports.iter_mut() {
                if !*occupied {
                    *occupied = true;
                    chosen = Some(*candidate);
                    break;
                }
            }
            let Some(chosen) = chosen else {
                return Err(PortExhausted {
                    min_port: self.min_port,
                    max_port: self.max_port,
                    wanted,
                });
            };
            crate::metrics::ports_free(node).dec();

            port.host_port = Some(chosen);
            if port.port_policy == PortPolicy::Passthrough {
                port.container_port = Some(chosen);
            }
        }

        Ok(gs)
    }

    /// Returns a game server's dynamic host ports to the pool.
    pub fn deallocate(&self, gs: &GameServer) {
        let mut table = self.table.lock();
        for port in gs
            .spec
            .ports
            .iter()
            .filter(|port| port.port_policy.is_dynamic())
        {
            let Some(host_port) = port.host_port else {
                continue;
            };
            release(&mut table, host_port, gs.status.as_ref().map(|s| s.node_name.as_str()));
        }
    }

    /// Marks a game server's assigned dynamic ports as occupied, preferring
    /// the node it is known to run on.
    pub fn mark_occupied(&self, gs: &GameServer) {
        let mut table = self.table.lock();
        let node_name = gs
            .status
            .as_ref()
            .map(|status| status.node_name.as_str())
            .filter(|name| !name.is_empty());

        for port in gs
            .spec
            .ports
            .iter()
            .filter(|port| port.port_policy.is_dynamic())
        {
            let Some(host_port) = port.host_port else {
                continue;
            };

            let slot = node_name
                .and_then(|name| table.get_mut(name))
                .and_then(|ports| ports.get_mut(&host_port))
                .filter(|occupied| !**occupied);
            let node = match slot {
                Some(slot) => {
                    *slot = true;
                    node_name.map(str::to_owned)
                }
                // unscheduled yet, claim the port on any node that still has
                // it free
                None => occupy_anywhere(&mut table, host_port),
            };
            if let Some(node) = node {
                crate::metrics::ports_free(&node).dec();
            }
        }
    }

    /// Replicates the port range for a newly observed node.
    pub fn sync_node_added(&self, name: &str) {
        let mut table = self.table.lock();
        if !table.contains_key(name) {
            table.insert(name.to_owned(), self.empty_node_range());
            crate::metrics::ports_free(name)
                .set(i64::from(self.max_port - self.min_port) + 1);
        }
    }

    /// Discards a deleted node's slice of the table.
    pub fn sync_node_deleted(&self, name: &str) {
        self.table.lock().remove(name);
        crate::metrics::ports_free(name).set(0);
    }

    /// Free slots remaining on a single node.
    pub fn free_ports_on(&self, node: &str) -> usize {
        self.table
            .lock()
            .get(node)
            .map(|ports| ports.values().filter(|occupied| !**occupied).count())
            .unwrap_or_default()
    }

    /// Total `(free, occupied)` slots across all nodes.
    pub fn slot_counts(&self) -> (usize, usize) {
        let table = self.table.lock();
        let mut free = 0;
        let mut occupied = 0;
        for slot in table.values().flat_map(BTreeMap::values) {
            if *slot {
                occupied += 1;
            } else {
                free += 1;
            }
        }
        (free, occupied)
    }
}

fn release(table: &mut BTreeMap<String, BTreeMap<u16, bool>>, host_port: u16, node: Option<&str>) {
    let slot = node
        .filter(|name| !name.is_empty())
        .and_then(|name| table.get_mut(name))
        .and_then(|ports| ports.get_mut(&host_port))
        .filter(|occupied| **occupied);
    if let Some(slot) = slot {
        *slot = false;
        if let Some(node) = node {
            crate::metrics::ports_free(node).inc();
        }
        return;
    }

    // fall back to whichever node slice holds the claimed port
    for (name, ports) in table.iter_mut() {
        if let Some(occupied) = ports.get_mut(&host_port) {
            if *occupied {
                *occupied = false;
                crate::metrics::ports_free(name).inc();
                return;
            }
        }
    }
}

fn occupy_anywhere(
    table: &mut BTreeMap<String, BTreeMap<u16, bool>>,
    host_port: u16,
) -> Option<String> {
    for (name, ports) in table.iter_mut() {
        if let Some(occupied) = ports.get_mut(&host_port) {
            if !*occupied {
                *occupied = true;
                return Some(name.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::test_utils::{game_server, node};

    #[test]
    fn allocates_unique_ports_in_range() {
        let allocator = PortAllocator::new(7000, 7010);
        allocator.sync_node_added("node-1");

        let mut seen = std::collections::BTreeSet::new();
        for i in 0..11 {
            let gs = allocator.allocate(game_server(&format!("gs-{i}"))).unwrap();
            let port = gs.spec.ports[0].host_port.unwrap();
            assert!((7000..=7010).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn fails_when_the_range_is_exhausted() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.sync_node_added("node-1");

        allocator.allocate(game_server("one")).unwrap();
        allocator.allocate(game_server("two")).unwrap();
        assert!(allocator.allocate(game_server("three")).is_err());
    }

    #[test]
    fn prefers_the_node_with_the_most_free_ports() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.sync_node_added("node-a");
        allocator.sync_node_added("node-b");

        // claim a slot on node-a specifically
        let mut occupied = game_server("occupier");
        occupied.spec.ports[0].host_port = Some(7000);
        occupied.set_state(crate::api::GameServerState::Ready);
        occupied.status.as_mut().unwrap().node_name = "node-a".into();
        allocator.mark_occupied(&occupied);
        assert_eq!(allocator.free_ports_on("node-a"), 1);

        // node-b has more free slots, so it takes the next allocation
        allocator.allocate(game_server("next")).unwrap();
        assert_eq!(allocator.free_ports_on("node-a"), 1);
        assert_eq!(allocator.free_ports_on("node-b"), 1);
    }

    #[test]
    fn ties_break_on_node_name() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.sync_node_added("node-b");
        allocator.sync_node_added("node-a");

        allocator.allocate(game_server("first")).unwrap();
        assert_eq!(allocator.free_ports_on("node-a"), 1);
        assert_eq!(allocator.free_ports_on("node-b"), 2);
    }

    #[test]
    fn deallocate_returns_ports_to_the_pool() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.sync_node_added("node-1");

        let gs = allocator.allocate(game_server("gone")).unwrap();
        assert_eq!(allocator.slot_counts(), (1, 1));

        allocator.deallocate(&gs);
        assert_eq!(allocator.slot_counts(), (2, 0));
    }

    #[test]
    fn passthrough_ports_copy_into_the_container_port() {
        let allocator = PortAllocator::new(7000, 7010);
        allocator.sync_node_added("node-1");

        let mut gs = game_server("passthrough");
        gs.spec.ports[0].port_policy = PortPolicy::Passthrough;
        gs.spec.ports[0].container_port = None;

        let gs = allocator.allocate(gs).unwrap();
        assert_eq!(gs.spec.ports[0].container_port, gs.spec.ports[0].host_port);
    }

    #[test]
    fn node_deletion_discards_its_slice() {
        let allocator = PortAllocator::new(7000, 7004);
        allocator.sync_node_added("node-1");
        allocator.sync_node_added("node-2");
        assert_eq!(allocator.slot_counts(), (10, 0));

        allocator.sync_node_deleted("node-2");
        assert_eq!(allocator.slot_counts(), (5, 0));
    }

    #[tokio::test]
    async fn run_reclaims_ports_of_live_game_servers() {
        let cluster = FakeCluster::new();
        cluster.put_node(node("node-1", "10.0.0.1"));

        let mut gs = game_server("survivor");
        gs.spec.ports[0].host_port = Some(7003);
        gs.set_state(crate::api::GameServerState::Ready);
        gs.status.as_mut().unwrap().node_name = "node-1".into();
        cluster.put_game_server(gs);

        let allocator = PortAllocator::new(7000, 7004);
        allocator.run(&*cluster, &*cluster, None).await.unwrap();

        // the full range per node, minus the survivor's claimed port
        assert_eq!(allocator.slot_counts(), (4, 1));

        // the invariant: free + occupied covers the whole range per node
        let (free, occupied) = allocator.slot_counts();
        assert_eq!(free + occupied, 5);
    }
}
