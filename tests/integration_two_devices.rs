mod common;

use std::sync::Arc;

use common::{KEY, http_device, http_device_at, spawn_authority};
use vanopticon_dialsync::authority::Authority;
use vanopticon_dialsync::sync::{ChangeData, CycleOutcome};

fn authority() -> Arc<Authority> {
	let authority = Authority::new(2);
	authority.register("+15550100", KEY);
	authority.register("+15550200", KEY);
	Arc::new(authority)
}

/// Two replicas converge through the development authority over HTTP
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_two_devices_converge() -> Result<(), Box<dyn std::error::Error>> {
	let authority = authority();
	let base = spawn_authority(authority.clone()).await;
	let alice = http_device("+15550100", &base).await;
	// Bob edits after Alice's contact exists, so his clock runs ahead of hers.
	let bob = http_device_at("+15550200", &base, 2_000).await;

	for (t, d) in [
		ChangeData::instance_insert("+15550100"),
		ChangeData::contact_insert("X", "+15550100", Some("Ada".into())),
		ChangeData::contact_number_insert("X", "+15550111", Some("mobile".into()), 1),
	] {
		alice.change_agent.change_from_client(t, d, None).await?;
	}

	assert_eq!(alice.orchestrator.run_cycle().await.outcome, CycleOutcome::Success);
	assert_eq!(authority.accepted(), 3);
	assert_eq!(alice.store.queue_depths().await?.upload_queue, 0);

	// Page size 2 forces a second page.
	let report = bob.orchestrator.run_cycle().await;
	assert_eq!(report.outcome, CycleOutcome::Success);
	let downloaded = report.downloaded.ok_or("download phase did not run")?;
	assert_eq!((downloaded.pages, downloaded.ingested), (2, 3));
	{
		let mut conn = bob.store.read().await?;
		let contact = bob.store.contacts.get(&mut conn, "X").await?.ok_or("contact missing")?;
		assert_eq!(contact.display_name.as_deref(), Some("Ada"));
		assert_eq!(bob.store.change_log.max_server_sequence(&mut conn).await?, 3);
	}

	let (t, d) = ChangeData::contact_update("X", Some("Ada Lovelace".into()), None);
	bob.change_agent.change_from_client(t, d, None).await?;
	assert_eq!(bob.orchestrator.run_cycle().await.outcome, CycleOutcome::Success);
	assert_eq!(authority.accepted(), 4);

	assert_eq!(alice.orchestrator.run_cycle().await.outcome, CycleOutcome::Success);
	{
		let mut conn = alice.store.read().await?;
		let contact = alice.store.contacts.get(&mut conn, "X").await?.ok_or("contact missing")?;
		assert_eq!(contact.display_name.as_deref(), Some("Ada Lovelace"));
		assert_eq!(alice.store.change_log.max_server_sequence(&mut conn).await?, 4);
	}

	let converged = alice.store.snapshot().await?;
	assert_eq!(converged, bob.store.snapshot().await?);
	bob.execute_agent.rebuild().await?;
	assert_eq!(bob.store.snapshot().await?, converged);
	Ok(())
}

/// A device the authority does not know cannot sync
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_unknown_device_fails_cycle() -> Result<(), Box<dyn std::error::Error>> {
	let authority = authority();
	let base = spawn_authority(authority.clone()).await;
	let stranger = http_device("+15550300", &base).await;
	let (t, d) = ChangeData::contact_insert("Z", "+15550300", None);
	stranger.change_agent.change_from_client(t, d, None).await?;

	let report = stranger.orchestrator.run_cycle().await;
	assert!(matches!(report.outcome, CycleOutcome::Failure { .. }));
	assert_eq!(authority.accepted(), 0);
	assert_eq!(stranger.store.queue_depths().await?.upload_queue, 1);
	Ok(())
}

/// Re-running a cycle after everything is in sync changes nothing
#[tokio::test]
#[cfg(feature = "integration-tests")]
async fn test_idle_cycles_are_stable() -> Result<(), Box<dyn std::error::Error>> {
	let authority = authority();
	let base = spawn_authority(authority.clone()).await;
	let alice = http_device("+15550100", &base).await;
	let bob = http_device("+15550200", &base).await;

	let (t, d) = ChangeData::number_classify("+15550999", "spam");
	alice.change_agent.change_from_client(t, d, None).await?;
	alice.orchestrator.run_cycle().await;
	bob.orchestrator.run_cycle().await;
	let settled = bob.store.snapshot().await?;

	for _ in 0..3 {
		assert_eq!(alice.orchestrator.run_cycle().await.outcome, CycleOutcome::Success);
		assert_eq!(bob.orchestrator.run_cycle().await.outcome, CycleOutcome::Success);
	}
	assert_eq!(authority.accepted(), 1);
	assert_eq!(bob.store.snapshot().await?, settled);
	assert_eq!(settled.trusted_numbers.len(), 1);
	assert_eq!(settled.trusted_numbers[0].classification.as_deref(), Some("spam"));
	Ok(())
}
