//! # Telemetry Features
//!
//! Console logging is always on. Metrics are optional and exported through
//! OpenTelemetry.
//!
//! ## Feature matrix
//!
//! - `tracing`: Structured log events from the simulator and the library.
//! - `metrics`: OpenTelemetry counters for admissions and persisted orders.
//! - `stdout`: Prints collected metrics to stdout every few seconds.
//!
//! ## Example usage
//!
//! ```bash
//! RUST_LOG=debug cargo run -p flashgate-sim --features metrics,stdout
//! ```

// Disallow using `stdout` without `metrics`
#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use flashgate::PurchaseOutcome;
#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Meter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("flashgate-sim")
            .with_version(env!("CARGO_PKG_VERSION"))
            .build();
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let resource = Resource::builder()
        .with_service_name("flashgate-sim")
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .build();
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource);

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static ADMISSIONS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ORDERS_PERSISTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static INTENTS_DEFERRED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RECOVERY_REPLAYS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = ADMISSIONS.set(
        meter
            .u64_counter("admissions")
            .with_description("Purchase attempts by outcome")
            .build(),
    );

    let _ = ORDERS_PERSISTED.set(
        meter
            .u64_counter("orders_persisted")
            .with_description("Orders written by the consumer")
            .build(),
    );

    let _ = INTENTS_DEFERRED.set(
        meter
            .u64_counter("intents_deferred")
            .with_description("Order intents left pending on lock contention")
            .build(),
    );

    let _ = RECOVERY_REPLAYS.set(
        meter
            .u64_counter("recovery_replays")
            .with_description("Pending order intents replayed by recovery")
            .build(),
    );
}

#[cfg(feature = "metrics")]
fn outcome_label(outcome: &PurchaseOutcome) -> &'static str {
    match outcome {
        PurchaseOutcome::Accepted { .. } => "accepted",
        PurchaseOutcome::SoldOut => "sold_out",
        PurchaseOutcome::Duplicate => "duplicate",
        PurchaseOutcome::NotFound => "not_found",
        PurchaseOutcome::NotStarted => "not_started",
        PurchaseOutcome::Ended => "ended",
    }
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn record_admission(outcome: &flashgate::PurchaseOutcome) {
    if let Some(counter) = ADMISSIONS.get() {
        counter.add(1, &[KeyValue::new("outcome", outcome_label(outcome))]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_admission(_outcome: &flashgate::PurchaseOutcome) {}

#[cfg(feature = "metrics")]
pub fn increment_orders_persisted(count: u64) {
    if let Some(counter) = ORDERS_PERSISTED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_orders_persisted(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_intents_deferred(count: u64) {
    if let Some(counter) = INTENTS_DEFERRED.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_intents_deferred(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_recovery_replays(count: u64) {
    if let Some(counter) = RECOVERY_REPLAYS.get() {
        counter.add(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_recovery_replays(_count: u64) {}
