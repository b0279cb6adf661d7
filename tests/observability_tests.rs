mod common;

use std::sync::Arc;

use common::{FnApi, device};
use vanopticon_dialsync::observability::{MetricsRegistry, init_metrics};
use vanopticon_dialsync::sync::{Change, ChangeData, ChangeType};

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new();
	let output = registry.encode();

	assert!(output.contains("dialsync_changes_ingested_total"));
	assert!(output.contains("dialsync_changes_applied_total"));
	assert!(output.contains("dialsync_execute_queue_depth"));
	assert!(output.contains("dialsync_upload_queue_depth"));
	assert!(output.contains("dialsync_transport_failures_total"));
	assert!(output.contains("dialsync_sync_cycle_duration_seconds"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_init_metrics_returns_independent_registries() {
	let first = init_metrics();
	let second = init_metrics();
	first.sync_cycles_total.inc();
	assert_eq!(first.sync_cycles_total.get(), 1);
	assert_eq!(second.sync_cycles_total.get(), 0);
}

/// Counters follow a full ingest, execute and upload round
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_sync_round_is_counted() -> Result<(), Box<dyn std::error::Error>> {
	let engine = device("+15550100", Arc::new(FnApi::accepting())).await;
	let metrics = Arc::clone(&engine.metrics);

	let (t, d) = ChangeData::contact_insert("X", "+15550100", None);
	let ingested = engine
		.change_agent
		.change_from_client_with_id("c-1".into(), t, d.clone(), None)
		.await?;
	engine
		.change_agent
		.change_from_client_with_id(ingested.change_id().to_string(), t, d, None)
		.await?;
	engine
		.change_agent
		.change_from_server(Change {
			change_id: "s-1".into(),
			origin_instance: None,
			change_time: 5,
			change_type: ChangeType::ContactUpdate,
			data: ChangeData::default(),
			server_sequence: Some(1),
			error_count: 0,
		})
		.await?;

	engine.orchestrator.run_cycle().await;
	assert_eq!(metrics.changes_ingested_total.get(), 2);
	assert_eq!(metrics.changes_duplicate_total.get(), 1);
	assert_eq!(metrics.changes_applied_total.get(), 1);
	assert_eq!(metrics.change_apply_failures_total.get(), 1);
	assert_eq!(metrics.execute_queue_depth.get(), 1);
	assert_eq!(metrics.sync_cycle_retries_total.get(), 1);
	assert_eq!(metrics.changes_uploaded_total.get(), 0);

	let text = metrics.encode();
	assert!(text.contains("dialsync_sync_cycles_total 1"));
	assert!(text.contains("dialsync_sync_cycle_duration_seconds_count 1"));
	Ok(())
}
