use std::path::{Path, PathBuf};

use log::Level;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Runtime configuration for dialsync.
///
/// Values are loaded from (in order): the `/etc/vanopticon/dialsync.json`
/// file, the same file in the user config folders (optional), and
/// environment variables prefixed with `DSY_` (e.g. `DSY_SERVER_URL`).
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Base URL of the authority exposing `/downloadChanges` and `/uploadChanges`
	pub server_url: Url,
	pub database_path: PathBuf,
	/// This device's instance number (normalized before use)
	pub instance_number: String,
	pub credential_key: String,
	pub upload_batch_size: usize,
	pub sync_interval_secs: u64,
	pub request_timeout_secs: u64,
	/// Error count at which a queued change is reported as stuck
	pub stuck_threshold: i64,
	/// JSON snapshot of native contacts to reconcile each cycle
	pub native_snapshot: Option<PathBuf>,
	pub log_level: Level,
	// Development authority listener
	pub authority_host: String,
	pub authority_port: u16,
}

impl Default for Settings {
	fn default() -> Self {
		let database_path = dirs::data_local_dir()
			.map(|d| d.join("vanopticon").join("dialsync.db"))
			.unwrap_or_else(|| PathBuf::from("dialsync.db"));

		Self {
			server_url: Url::parse("http://127.0.0.1:8686/").unwrap(),
			database_path,
			instance_number: String::new(),
			credential_key: String::new(),
			upload_batch_size: 200,
			sync_interval_secs: 300,
			request_timeout_secs: 30,
			stuck_threshold: 5,
			native_snapshot: None,
			log_level: Level::Info,
			authority_host: "127.0.0.1".to_string(),
			authority_port: 8686,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

/// Load settings from the standard locations.
pub fn load() -> Result<Settings, SettingsError> {
	load_from(None)
}

/// Load settings, layering `extra` (if given) above the standard files and
/// below the environment.
pub fn load_from(extra: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/dialsync.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("dialsync.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("dialsync.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}
	if let Some(path) = extra {
		builder = builder.add_source(config::File::from(path).required(true));
	}

	builder = builder.add_source(config::Environment::with_prefix("DSY").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Read the commonly overridden variables directly so single-underscore
	// names like `DSY_SERVER_URL` always win.
	if let Ok(u) = std::env::var("DSY_SERVER_URL") {
		if let Ok(parsed) = Url::parse(&u) {
			s.server_url = parsed;
		}
	}
	if let Ok(p) = std::env::var("DSY_DATABASE_PATH") {
		if !p.is_empty() {
			s.database_path = PathBuf::from(p);
		}
	}
	if let Ok(n) = std::env::var("DSY_INSTANCE_NUMBER") {
		if !n.is_empty() {
			s.instance_number = n;
		}
	}
	if let Ok(k) = std::env::var("DSY_CREDENTIAL_KEY") {
		if !k.is_empty() {
			s.credential_key = k;
		}
	}
	if let Ok(b) = std::env::var("DSY_UPLOAD_BATCH_SIZE") {
		if let Ok(parsed) = b.parse::<usize>() {
			s.upload_batch_size = parsed;
		}
	}
	if let Ok(i) = std::env::var("DSY_SYNC_INTERVAL_SECS") {
		if let Ok(parsed) = i.parse::<u64>() {
			s.sync_interval_secs = parsed;
		}
	}
	if let Ok(p) = std::env::var("DSY_NATIVE_SNAPSHOT") {
		if !p.is_empty() {
			s.native_snapshot = Some(PathBuf::from(p));
		}
	}
	if let Ok(l) = std::env::var("DSY_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(p) = std::env::var("DSY_AUTHORITY_PORT") {
		if let Ok(parsed) = p.parse::<u16>() {
			s.authority_port = parsed;
		}
	}

	Ok(s)
}
