//! Structured logging, optional OTLP export, and the telemetry counters
//! required by §4.3/§4.5/§8 ("counter conservation").

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

/// Initializes the global `tracing` subscriber. Call once at process startup.
/// When `otlp_endpoint` is set, spans are additionally exported over OTLP;
/// otherwise they are only used for local log correlation.
pub fn init_tracing(otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    // Cross-process trigger spans (§4.4) depend on this: `trigger.rs` injects
    // the current span's context into outbound headers via the global
    // propagator regardless of whether OTLP export is configured, so the
    // default no-op propagator would silently drop every `traceparent`.
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let subscriber = TracingRegistry::default().with(env_filter).with(fmt_layer);

    match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .build();
            let tracer = provider.tracer("machine-manager");
            global::set_tracer_provider(provider);
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            subscriber.with(otel_layer).try_init()?;
        }
        None => {
            subscriber.try_init()?;
        }
    }
    Ok(())
}

/// Label key for per-(workload-type, namespace) counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadLabel {
    pub workload_type: String,
    pub namespace: String,
}

/// Label key for per-(workload-name, namespace) trigger counters (§4.4 steps
/// 4-5). Distinct from `WorkloadLabel`: a trigger is invoked against one
/// deployed workload instance, not a workload type in aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerLabel {
    pub workload_name: String,
    pub namespace: String,
}

#[derive(Debug, Default)]
struct WorkloadCounters {
    vms: i64,
    workloads: i64,
    bytes: i64,
    vcpus: i64,
    memory_mb: i64,
}

#[derive(Debug, Default)]
struct TriggerCounters {
    success: u64,
    failure: u64,
    runtime_ns_total: i64,
}

/// In-process telemetry sink. Exposed deliberately narrow (increment/decrement
/// by labeled delta) so tests can assert counter conservation (§8 property 7)
/// without standing up a real metrics backend.
#[derive(Default)]
pub struct Telemetry {
    per_label: Mutex<HashMap<WorkloadLabel, WorkloadCounters>>,
    per_trigger_label: Mutex<HashMap<TriggerLabel, TriggerCounters>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_deploy(&self, label: WorkloadLabel, bytes: u64, vcpus: u32, memory_mb: u64) {
        let mut guard = self.per_label.lock().unwrap();
        let entry = guard.entry(label).or_default();
        entry.vms += 1;
        entry.workloads += 1;
        entry.bytes += bytes as i64;
        entry.vcpus += vcpus as i64;
        entry.memory_mb += memory_mb as i64;
    }

    pub fn on_stop(&self, label: WorkloadLabel, bytes: u64, vcpus: u32, memory_mb: u64) {
        let mut guard = self.per_label.lock().unwrap();
        let entry = guard.entry(label).or_default();
        entry.vms -= 1;
        entry.workloads -= 1;
        entry.bytes -= bytes as i64;
        entry.vcpus -= vcpus as i64;
        entry.memory_mb -= memory_mb as i64;
    }

    pub fn workload_count(&self, label: &WorkloadLabel) -> i64 {
        self.per_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.workloads)
            .unwrap_or(0)
    }

    pub fn vcpu_total(&self, label: &WorkloadLabel) -> i64 {
        self.per_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.vcpus)
            .unwrap_or(0)
    }

    pub fn memory_mb_total(&self, label: &WorkloadLabel) -> i64 {
        self.per_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.memory_mb)
            .unwrap_or(0)
    }

    pub fn bytes_total(&self, label: &WorkloadLabel) -> i64 {
        self.per_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.bytes)
            .unwrap_or(0)
    }

    pub fn on_trigger_success(&self, label: TriggerLabel, runtime_ns: i64) {
        let mut guard = self.per_trigger_label.lock().unwrap();
        let entry = guard.entry(label).or_default();
        entry.success += 1;
        entry.runtime_ns_total += runtime_ns;
    }

    pub fn on_trigger_failure(&self, label: TriggerLabel) {
        let mut guard = self.per_trigger_label.lock().unwrap();
        guard.entry(label).or_default().failure += 1;
    }

    pub fn trigger_success_count(&self, label: &TriggerLabel) -> u64 {
        self.per_trigger_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.success)
            .unwrap_or(0)
    }

    pub fn trigger_failure_count(&self, label: &TriggerLabel) -> u64 {
        self.per_trigger_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.failure)
            .unwrap_or(0)
    }

    pub fn trigger_runtime_ns_total(&self, label: &TriggerLabel) -> i64 {
        self.per_trigger_label
            .lock()
            .unwrap()
            .get(label)
            .map(|c| c.runtime_ns_total)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_conserve_across_deploy_and_stop() {
        let telemetry = Telemetry::new();
        let label = WorkloadLabel {
            workload_type: "v8".to_string(),
            namespace: "default".to_string(),
        };
        telemetry.on_deploy(label.clone(), 2048, 2, 512);
        assert_eq!(telemetry.workload_count(&label), 1);
        assert_eq!(telemetry.vcpu_total(&label), 2);

        telemetry.on_stop(label.clone(), 2048, 2, 512);
        assert_eq!(telemetry.workload_count(&label), 0);
        assert_eq!(telemetry.vcpu_total(&label), 0);
        assert_eq!(telemetry.memory_mb_total(&label), 0);
        assert_eq!(telemetry.bytes_total(&label), 0);
    }

    #[test]
    fn trigger_counters_increment_independently_per_label() {
        let telemetry = Telemetry::new();
        let echo = TriggerLabel {
            workload_name: "echo".to_string(),
            namespace: "default".to_string(),
        };
        let other = TriggerLabel {
            workload_name: "other".to_string(),
            namespace: "default".to_string(),
        };
        telemetry.on_trigger_success(echo.clone(), 1_500_000);
        telemetry.on_trigger_failure(echo.clone());
        telemetry.on_trigger_failure(other.clone());

        assert_eq!(telemetry.trigger_success_count(&echo), 1);
        assert_eq!(telemetry.trigger_failure_count(&echo), 1);
        assert_eq!(telemetry.trigger_runtime_ns_total(&echo), 1_500_000);
        assert_eq!(telemetry.trigger_success_count(&other), 0);
        assert_eq!(telemetry.trigger_failure_count(&other), 1);
    }
}
