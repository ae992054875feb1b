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

pub mod allocator;
pub mod find;
pub mod ready_cache;
pub mod remote;

pub use allocator::Allocator;
pub use ready_cache::ReadyGameServerCache;

/// Why an allocation request could not be satisfied.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// No ready game server matched; terminal for the request.
    #[error("could not find a ready game server")]
    NoReady,
    /// Every candidate was lost to a concurrent allocator; worth retrying.
    #[error("the game server was already allocated")]
    Contention,
    #[error("allocation request is invalid: {0}")]
    Invalid(String),
    #[error("shutting down")]
    Shutdown,
    #[error(transparent)]
    Cluster(#[from] crate::cluster::Error),
    #[error("remote allocation failed: {0}")]
    Remote(String),
}
