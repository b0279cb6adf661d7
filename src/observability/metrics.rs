use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Ingestion metrics
	pub changes_ingested_total: IntCounter,
	pub changes_duplicate_total: IntCounter,

	// Execution metrics
	pub changes_applied_total: IntCounter,
	pub change_apply_failures_total: IntCounter,
	pub execute_queue_depth: IntGauge,

	// Transport metrics
	pub changes_downloaded_total: IntCounter,
	pub changes_uploaded_total: IntCounter,
	pub upload_rejections_total: IntCounter,
	pub transport_failures_total: IntCounter,
	pub upload_queue_depth: IntGauge,

	// Cycle metrics
	pub sync_cycles_total: IntCounter,
	pub sync_cycle_retries_total: IntCounter,
	pub sync_cycle_failures_total: IntCounter,
	pub sync_cycle_duration_seconds: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace("dialsync"))
		.expect("counter definition is valid");
	registry
		.register(Box::new(c.clone()))
		.expect("counter is registered once");
	c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
	let g = IntGauge::with_opts(Opts::new(name, help).namespace("dialsync"))
		.expect("gauge definition is valid");
	registry
		.register(Box::new(g.clone()))
		.expect("gauge is registered once");
	g
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let changes_ingested_total = counter(
			&registry,
			"changes_ingested_total",
			"Changes written to the change log",
		);
		let changes_duplicate_total = counter(
			&registry,
			"changes_duplicate_total",
			"Ingestions ignored because the change id was already logged",
		);
		let changes_applied_total = counter(
			&registry,
			"changes_applied_total",
			"Changes applied to the materialized tables",
		);
		let change_apply_failures_total = counter(
			&registry,
			"change_apply_failures_total",
			"Failed change application attempts",
		);
		let execute_queue_depth = gauge(
			&registry,
			"execute_queue_depth",
			"Changes waiting to be applied",
		);
		let changes_downloaded_total = counter(
			&registry,
			"changes_downloaded_total",
			"Changes received from the authority",
		);
		let changes_uploaded_total = counter(
			&registry,
			"changes_uploaded_total",
			"Changes acknowledged by the authority",
		);
		let upload_rejections_total = counter(
			&registry,
			"upload_rejections_total",
			"Upload batches the authority only partially accepted",
		);
		let transport_failures_total = counter(
			&registry,
			"transport_failures_total",
			"Download or upload exchanges that failed",
		);
		let upload_queue_depth = gauge(
			&registry,
			"upload_queue_depth",
			"Local changes waiting for acknowledgment",
		);
		let sync_cycles_total = counter(&registry, "sync_cycles_total", "Sync cycles started");
		let sync_cycle_retries_total = counter(
			&registry,
			"sync_cycle_retries_total",
			"Sync cycles that ended asking for a retry",
		);
		let sync_cycle_failures_total = counter(
			&registry,
			"sync_cycle_failures_total",
			"Sync cycles aborted by a failure",
		);

		let sync_cycle_duration_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"sync_cycle_duration_seconds",
				"Duration of sync cycles in seconds",
			)
			.namespace("dialsync")
			.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]),
		)
		.expect("histogram definition is valid");
		registry
			.register(Box::new(sync_cycle_duration_seconds.clone()))
			.expect("histogram is registered once");

		Self {
			registry,
			changes_ingested_total,
			changes_duplicate_total,
			changes_applied_total,
			change_apply_failures_total,
			execute_queue_depth,
			changes_downloaded_total,
			changes_uploaded_total,
			upload_rejections_total,
			transport_failures_total,
			upload_queue_depth,
			sync_cycles_total,
			sync_cycle_retries_total,
			sync_cycle_failures_total,
			sync_cycle_duration_seconds,
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Create a metrics registry to share between the sync components
pub fn init_metrics() -> Arc<MetricsRegistry> {
	Arc::new(MetricsRegistry::new())
}
