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

//! The in-memory view of game servers eligible for allocation, kept in sync
//! from watch events and exposed only through atomic operations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::AllocationError;
use crate::api::allocation::MetaPatch;
use crate::api::gameserver::SchedulingStrategy;
use crate::api::{GameServer, GameServerState};
use crate::cluster::{self, GameServers};

pub struct ReadyGameServerCache {
    game_servers: Arc<dyn GameServers>,
    // namespace the cache rebuilds itself from; None covers the cluster
    namespace: Option<String>,
    state: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    // key -> game server, for everything currently Ready
    ready: HashMap<String, GameServer>,
    // key -> node name, for everything currently Allocated
    allocated: HashMap<String, String>,
}

impl Inner {
    fn apply(&mut self, gs: &GameServer) {
        let key = gs.key();
        if gs.state() == Some(GameServerState::Ready) && !gs.is_being_deleted() {
            self.ready.insert(key.clone(), gs.clone());
        } else {
            self.ready.remove(&key);
        }

        let node_name = gs
            .status
            .as_ref()
            .map(|status| status.node_name.clone())
            .unwrap_or_default();
        if gs.state() == Some(GameServerState::Allocated) && !gs.is_being_deleted() {
            self.allocated.insert(key, node_name);
        } else {
            self.allocated.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.ready.remove(key);
        self.allocated.remove(key);
    }

    fn allocated_per_node(&self) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for node in self.allocated.values() {
            *counts.entry(node.as_str()).or_default() += 1;
        }
        counts
    }
}

impl ReadyGameServerCache {
    pub fn new(game_servers: Arc<dyn GameServers>, namespace: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            game_servers,
            namespace,
            state: RwLock::default(),
        })
    }

    /// Watch callback keeping the cache in lockstep with the cluster.
    pub fn game_server_updated(&self, gs: &GameServer) {
        let mut state = self.state.write();
        state.apply(gs);
        crate::metrics::ready_game_servers().set(state.ready.len() as i64);
    }

    pub fn game_server_deleted(&self, gs: &GameServer) {
        let mut state = self.state.write();
        state.remove(&gs.key());
        crate::metrics::ready_game_servers().set(state.ready.len() as i64);
    }

    /// Drops the cached view and rebuilds it from a fresh list.
    pub async fn resync(&self) -> Result<(), cluster::Error> {
        let game_servers = self.game_servers.list(self.namespace.as_deref()).await?;
        let mut state = self.state.write();
        state.ready.clear();
        state.allocated.clear();
        for gs in &game_servers {
            state.apply(gs);
        }
        crate::metrics::ready_game_servers().set(state.ready.len() as i64);
        Ok(())
    }

    /// A stable snapshot of the ready game servers, ordered by the packing
    /// heuristic. The best candidates sort towards the tail, which is where
    /// selection draws from: under `Packed` scheduling those are the
    /// servers on the nodes already running the most allocated game
    /// servers, so cold nodes drain and can be scaled down.
    pub fn list_sorted_ready_game_servers(&self) -> Vec<GameServer> {
        let state = self.state.read();
        let counts = state.allocated_per_node();

        let mut list: Vec<GameServer> = state.ready.values().cloned().collect();
        list.sort_by_cached_key(|gs| {
            let node_name = gs
                .status
                .as_ref()
                .map(|status| status.node_name.as_str())
                .unwrap_or_default();
            let allocated = counts.get(node_name).copied().unwrap_or_default() as i64;
            let rank = match gs.spec.scheduling {
                SchedulingStrategy::Packed => allocated,
                SchedulingStrategy::Distributed => -allocated,
            };
            (rank, gs.key())
        });
        list
    }

    /// Takes a game server out of the ready set. Fails with contention if a
    /// concurrent remover got there first.
    pub fn remove_from_ready_game_server(&self, gs: &GameServer) -> Result<(), AllocationError> {
        let mut state = self.state.write();
        if state.ready.remove(&gs.key()).is_none() {
            return Err(AllocationError::Contention);
        }
        crate::metrics::ready_game_servers().set(state.ready.len() as i64);
        Ok(())
    }

    /// Restores a game server whose reservation fell through.
    pub fn add_to_ready_game_server(&self, gs: &GameServer) {
        let mut state = self.state.write();
        state.ready.insert(gs.key(), gs.clone());
        crate::metrics::ready_game_servers().set(state.ready.len() as i64);
    }

    /// Applies the request's metadata patch and commits the game server as
    /// `Allocated`, in a single update.
    pub async fn patch_game_server_metadata(
        &self,
        patch: &MetaPatch,
        gs: GameServer,
    ) -> Result<GameServer, cluster::Error> {
        let mut gs_copy = gs;
        patch.apply(&mut gs_copy);
        gs_copy.set_state(GameServerState::Allocated);

        let updated = self.game_servers.update(&gs_copy).await?;
        self.game_server_updated(&updated);
        Ok(updated)
    }

    pub fn ready_count(&self) -> usize {
        self.state.read().ready.len()
    }
}
