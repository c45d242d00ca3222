// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use opentelemetry::global;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use std::time::Duration;

use crate::config::TelemetryConfig;

/// Build OTLP metrics exporter with optional custom headers.
fn build_otlp_exporter(
    endpoint: &str,
    headers: &std::collections::HashMap<String, String>,
) -> Result<opentelemetry_otlp::MetricExporter, Box<dyn std::error::Error>> {
    let mut exporter_builder = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10));

    if !headers.is_empty() {
        tracing::info!("Adding {} custom headers to OTLP exporter", headers.len());
        exporter_builder = exporter_builder.with_headers(headers.clone());
    }

    exporter_builder.build().map_err(|e| {
        tracing::error!("Failed to build OTLP metrics exporter: {}", e);
        e.into()
    })
}

/// Initialize metrics provider with OTLP export.
fn init_metrics_with_otlp(
    builder: opentelemetry_sdk::metrics::MeterProviderBuilder,
    endpoint: &str,
    headers: &std::collections::HashMap<String, String>,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    tracing::info!(endpoint = %endpoint, "Configuring OTLP metrics exporter");

    let exporter = build_otlp_exporter(endpoint, headers)?;

    let reader = PeriodicReader::builder(exporter).with_interval(Duration::from_secs(5)).build();

    let provider = builder.with_reader(reader).build();
    global::set_meter_provider(provider.clone());

    tracing::info!("OTLP exporter will send metrics to: {}", endpoint);

    Ok(provider)
}

/// Initialize metrics provider without export (local collection only).
fn init_metrics_local_only(
    builder: opentelemetry_sdk::metrics::MeterProviderBuilder,
) -> SdkMeterProvider {
    tracing::info!("No OTLP endpoint configured, metrics will be collected but not exported");
    let provider = builder.build();
    global::set_meter_provider(provider.clone());
    provider
}

/// Initializes the OpenTelemetry metrics provider with optional OTLP export.
///
/// # Errors
///
/// Returns an error if:
/// - The OTLP metrics exporter fails to build (invalid endpoint, network issues)
/// - The metrics provider fails to initialize
pub fn init_metrics(
    config: &TelemetryConfig,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error>> {
    let resource = Resource::builder_empty()
        .with_attributes([
            opentelemetry::KeyValue::new("service.name", "orchd"),
            opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let builder = SdkMeterProvider::builder().with_resource(resource);

    if let Some(endpoint) = &config.otlp_endpoint {
        init_metrics_with_otlp(builder, endpoint, &config.otlp_headers)
    } else {
        Ok(init_metrics_local_only(builder))
    }
}
