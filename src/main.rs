use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vanopticon_dialsync::authority::{self, Authority, DEFAULT_PAGE_SIZE};
use vanopticon_dialsync::sync::{CycleOutcome, SyncEngine};
use vanopticon_dialsync::{config, observability, run};

#[derive(Parser)]
#[command(name = "dialsync", about = "Dialsync - dialer replica synchronization")]
struct Cli {
	/// Extra settings file layered above the standard locations
	#[arg(long, global = true)]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run a single sync cycle and report the outcome
	Sync,
	/// Sync periodically until interrupted (default)
	Run,
	/// Print queue depths and changes that keep failing
	Status {
		/// Error count at which a queued change is listed
		#[arg(long)]
		threshold: Option<i64>,
	},
	/// Rebuild the materialized tables by replaying the change log
	Rebuild,
	/// Serve the development authority
	ServeAuthority {
		#[arg(long)]
		host: Option<String>,
		#[arg(long)]
		port: Option<u16>,
		/// Changes per download page
		#[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
		page_size: usize,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let settings = config::load_from(cli.config.as_deref()).context("failed to load settings")?;
	observability::init_logging(settings.log_level)?;

	match cli.command.unwrap_or(Commands::Run) {
		Commands::Sync => {
			let engine = SyncEngine::open(&settings).await?;
			let report = engine.orchestrator.run_cycle().await;
			println!("{:#?}", report);
			if let CycleOutcome::Failure { phase, error } = report.outcome {
				anyhow::bail!("sync failed during {}: {}", phase, error);
			}
		}
		Commands::Run => run(settings).await?,
		Commands::Status { threshold } => {
			let engine = SyncEngine::open(&settings).await?;
			let depths = engine.store.queue_depths().await?;
			println!("change log:     {}", depths.change_log);
			println!("execute queue:  {}", depths.execute_queue);
			println!("upload queue:   {}", depths.upload_queue);
			engine.metrics.execute_queue_depth.set(depths.execute_queue);
			engine.metrics.upload_queue_depth.set(depths.upload_queue);

			let stuck = engine
				.execute_agent
				.stuck_changes(threshold.unwrap_or(settings.stuck_threshold))
				.await?;
			for change in stuck {
				println!(
					"stuck: {} {} (errors: {})",
					change.change_id, change.change_type, change.error_count
				);
			}
			print!("{}", engine.metrics.encode());
		}
		Commands::Rebuild => {
			let engine = SyncEngine::open(&settings).await?;
			let report = engine.execute_agent.rebuild().await?;
			println!(
				"replayed {} change(s), skipped {}",
				report.replayed,
				report.skipped.len()
			);
		}
		Commands::ServeAuthority {
			host,
			port,
			page_size,
		} => {
			let host = host.unwrap_or(settings.authority_host);
			let port = port.unwrap_or(settings.authority_port);
			let listener = tokio::net::TcpListener::bind((host.as_str(), port))
				.await
				.with_context(|| format!("cannot bind {}:{}", host, port))?;
			let authority = Arc::new(Authority::new(page_size).with_open_enrollment());
			authority::serve(listener, authority).await?;
		}
	}
	Ok(())
}
