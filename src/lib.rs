pub mod authority;
pub mod config;
pub mod normalizers;
pub mod observability;
pub mod store;
pub mod sync;

use std::time::Duration;

use log::{debug, info};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::config::Settings;
use crate::sync::SyncEngine;

/// Open the configured replica and sync it periodically until Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
	let engine = SyncEngine::open(&settings).await?;
	info!(
		"syncing instance {} against {} every {}s",
		engine.instance_number(),
		settings.server_url,
		settings.sync_interval_secs
	);

	let mut states = WatchStream::new(engine.orchestrator.subscribe());
	let watcher = tokio::spawn(async move {
		while let Some(state) = states.next().await {
			debug!("scheduler state: {:?}", state);
		}
	});

	let interval = Duration::from_secs(settings.sync_interval_secs.max(1));
	engine
		.orchestrator
		.run_periodic(interval, async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await;

	watcher.abort();
	Ok(())
}
