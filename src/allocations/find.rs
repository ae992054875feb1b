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

//! Matching a single allocation request against the sorted ready list.

use std::hash::{Hash, Hasher};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::AllocationError;
use crate::api::allocation::selector_matches;
use crate::api::{GameServer, GameServerAllocation};

/// Instead of always taking the top candidate, selection draws uniformly
/// from the best `TOP_N_GAME_SERVER_COUNT` matches, which breaks contention
/// symmetry between near-concurrent requests.
pub const TOP_N_GAME_SERVER_COUNT: usize = 100;

// seed used when a request carries no resource version to derive one from
const FALLBACK_SEED: u64 = 1234567;

/// Finds a game server for the allocation in the sorted ready list, and
/// returns it along with its index, so the caller can drop it from its
/// working copy.
///
/// Candidates must match every required selector; among those, the ones
/// matching the most preferred selectors win, and the final pick is random
/// within the top-N window at the tail of the (already sorted) list. The
/// randomness is seeded from the request, making the pick deterministic per
/// request but independent across requests.
pub fn find_game_server_for_allocation(
    gsa: &GameServerAllocation,
    list: &[GameServer],
    top_n: usize,
) -> Result<(GameServer, usize), AllocationError> {
    let required = gsa.spec.required.as_ref();
    let matches_required = |gs: &GameServer| {
        required.is_none_or(|selector| selector_matches(selector, gs.labels()))
    };

    let mut best_score = 0;
    let mut best: Vec<usize> = vec![];
    for (index, gs) in list.iter().enumerate() {
        if !matches_required(gs) {
            continue;
        }
        let score = gsa
            .spec
            .preferred
            .iter()
            .filter(|selector| selector_matches(selector, gs.labels()))
            .count();
        match score.cmp(&best_score) {
            std::cmp::Ordering::Greater => {
                best_score = score;
                best = vec![index];
            }
            std::cmp::Ordering::Equal => best.push(index),
            std::cmp::Ordering::Less => {}
        }
    }

    if best.is_empty() {
        return Err(AllocationError::NoReady);
    }

    let window = &best[best.len().saturating_sub(top_n.max(1))..];
    let mut rng = StdRng::seed_from_u64(request_seed(gsa));
    let index = window[rng.gen_range(0..window.len())];
    Ok((list[index].clone(), index))
}

fn request_seed(gsa: &GameServerAllocation) -> u64 {
    // resource versions are opaque strings, so hash rather than parse them
    match gsa.metadata.resource_version.as_deref() {
        Some(resource_version) if !resource_version.is_empty() => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            resource_version.hash(&mut hasher);
            hasher.finish()
        }
        _ => FALLBACK_SEED,
    }
}
