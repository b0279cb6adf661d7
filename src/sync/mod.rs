pub mod change;
pub mod change_agent;
pub mod clock;
pub mod execute_agent;
pub mod orchestrator;
pub mod precedence;
pub mod reconcile;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::Settings;
use crate::normalizers::canonical_or_raw;
use crate::observability::MetricsRegistry;
use crate::store::{Store, StoreError};

pub use change::{Change, ChangeData, ChangeType};
pub use change_agent::{ChangeAgent, ChangeAgentError, Ingested};
pub use clock::{Clock, ManualClock, SystemClock};
pub use execute_agent::{ApplyError, ExecuteAgent, ExecuteOutcome, ExecuteReport, RebuildReport};
pub use orchestrator::{
	CycleOutcome, CycleReport, RetryReason, SchedulerState, SyncOrchestrator, SyncPhase,
};
pub use reconcile::{
	JsonFileSource, NativeKind, NativeRecord, NativeSource, NativeSourceError, Reconciler,
	StaticSource,
};
pub use transport::{Credentials, HttpSyncApi, SyncApi, Transport, TransportError};

/// Errors that end a sync phase.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("transport failure: {0}")]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("cannot ingest change: {0}")]
	Ingest(#[from] ChangeAgentError),
	#[error(transparent)]
	Native(#[from] NativeSourceError),
}

impl SyncError {
	pub fn is_transport(&self) -> bool {
		matches!(self, SyncError::Transport(_))
	}
}

/// Every sync component wired around one store.
pub struct SyncEngine {
	pub store: Arc<Store>,
	pub metrics: Arc<MetricsRegistry>,
	pub change_agent: Arc<ChangeAgent>,
	pub execute_agent: Arc<ExecuteAgent>,
	pub orchestrator: SyncOrchestrator,
	instance_number: String,
}

impl SyncEngine {
	pub fn new(
		store: Arc<Store>,
		api: Arc<dyn SyncApi>,
		clock: Arc<dyn Clock>,
		credentials: Credentials,
		upload_batch_size: usize,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		let change_agent = Arc::new(ChangeAgent::new(
			Arc::clone(&store),
			clock,
			Arc::clone(&metrics),
		));
		let execute_agent = Arc::new(ExecuteAgent::new(Arc::clone(&store), Arc::clone(&metrics)));
		let instance_number = credentials.instance_number.clone();
		let transport = Transport::new(
			api,
			Arc::clone(&store),
			Arc::clone(&change_agent),
			credentials,
			upload_batch_size,
			Arc::clone(&metrics),
		);
		let orchestrator = SyncOrchestrator::new(
			Arc::clone(&store),
			Arc::clone(&execute_agent),
			transport,
			Arc::clone(&metrics),
		);
		Self {
			store,
			metrics,
			change_agent,
			execute_agent,
			orchestrator,
			instance_number,
		}
	}

	/// Reconcile `source` into the local instance at the start of each cycle.
	pub fn with_native_source(mut self, source: Arc<dyn NativeSource>) -> Self {
		let reconciler = Reconciler::new(
			Arc::clone(&self.store),
			Arc::clone(&self.change_agent),
			self.instance_number.clone(),
		);
		self.orchestrator = self.orchestrator.with_native_source(reconciler, source);
		self
	}

	pub fn instance_number(&self) -> &str {
		&self.instance_number
	}

	/// Open the on-disk replica and an HTTP client as configured.
	pub async fn open(settings: &Settings) -> Result<Self, SyncError> {
		let store = Arc::new(Store::open(&settings.database_path).await?);
		let api = HttpSyncApi::new(
			settings.server_url.clone(),
			Duration::from_secs(settings.request_timeout_secs),
		)?;
		let credentials = Credentials {
			instance_number: canonical_or_raw(&settings.instance_number),
			key: settings.credential_key.clone(),
		};
		let engine = Self::new(
			store,
			Arc::new(api),
			Arc::new(SystemClock),
			credentials,
			settings.upload_batch_size,
			crate::observability::init_metrics(),
		);
		Ok(match &settings.native_snapshot {
			Some(path) => engine.with_native_source(Arc::new(JsonFileSource::new(path))),
			None => engine,
		})
	}
}
