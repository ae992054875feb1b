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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub(crate) fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
    &REGISTRY
}

fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("arena")
        .subsystem(subsystem)
}

/// Counter of finished allocation requests, labelled by their outcome
/// (`allocated`, `unallocated`, `contention`, `error`).
pub(crate) fn allocations_total(result: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        let metric = IntCounterVec::new(
            opts(
                "allocations_total",
                "allocator",
                "total number of allocation requests, by result",
            ),
            &["result"],
        )
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    METRIC.with_label_values(&[result])
}

/// Counter of reconcile passes that returned an error, labelled by queue.
pub(crate) fn reconcile_errors_total(queue: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        let metric = IntCounterVec::new(
            opts(
                "reconcile_errors_total",
                "gameservers",
                "total number of reconcile passes that failed, by queue",
            ),
            &["queue"],
        )
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    METRIC.with_label_values(&[queue])
}

/// Gauge of free host ports remaining, per node.
pub(crate) fn ports_free(node: &str) -> IntGauge {
    static METRIC: Lazy<IntGaugeVec> = Lazy::new(|| {
        let metric = IntGaugeVec::new(
            opts(
                "ports_free",
                "gameservers",
                "host ports still available for dynamic allocation, by node",
            ),
            &["node"],
        )
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    METRIC.with_label_values(&[node])
}

/// Gauge of game servers currently in the ready cache.
pub(crate) fn ready_game_servers() -> IntGauge {
    static METRIC: Lazy<IntGauge> = Lazy::new(|| {
        let metric = IntGauge::with_opts(opts(
            "ready_game_servers",
            "allocator",
            "game servers currently eligible for allocation",
        ))
        .unwrap();
        registry().register(Box::new(metric.clone())).unwrap();
        metric
    });
    METRIC.clone()
}
