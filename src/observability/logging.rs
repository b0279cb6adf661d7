use log::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: the configured level for dialsync,
/// with sqlx held at `warn` because it logs every replica statement at `info`.
fn default_filter(level: Level) -> String {
	format!("{},sqlx=warn", level.as_str().to_ascii_lowercase())
}

/// Initialize structured JSON logging to stdout.
///
/// `RUST_LOG` wins when set. Otherwise `level` comes from
/// `Settings::log_level` (`DSY_LOG_LEVEL`, `info` unless configured) and is
/// applied through [`default_filter`]. Records emitted through the `log`
/// facade by the store, agents and orchestrator are forwarded into the same
/// subscriber.
pub fn init_logging(level: Level) -> anyhow::Result<()> {
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(default_filter(level)))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let json_layer = tracing_subscriber::fmt::layer()
		.json()
		.with_current_span(true)
		.with_span_list(true)
		.with_target(true)
		.with_level(true)
		.with_thread_ids(true)
		.with_file(true)
		.with_line_number(true);

	tracing_subscriber::registry()
		.with(env_filter)
		.with(json_layer)
		.try_init()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}
