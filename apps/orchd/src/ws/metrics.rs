// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use opentelemetry::global;
use std::sync::OnceLock;

/// Metrics for the machine stream fabric
#[derive(Clone)]
pub struct StreamMetrics {
    pub sessions_gauge: opentelemetry::metrics::Gauge<u64>,
    pub frames_counter: opentelemetry::metrics::Counter<u64>,
    pub dropped_counter: opentelemetry::metrics::Counter<u64>,
}

impl StreamMetrics {
    pub fn shared() -> Self {
        static METRICS: OnceLock<StreamMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("orchd_machine_streams");
                Self {
                    sessions_gauge: meter
                        .u64_gauge("machine_streams.sessions.active")
                        .with_description("Number of active machine stream sessions")
                        .build(),
                    frames_counter: meter
                        .u64_counter("machine_streams.frames")
                        .with_description("Outbound machine stream frames enqueued")
                        .build(),
                    dropped_counter: meter
                        .u64_counter("machine_streams.frames.dropped")
                        .with_description("Outbound machine stream frames dropped")
                        .build(),
                }
            })
            .clone()
    }
}
