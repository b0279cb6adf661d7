use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;
use uuid::Uuid;

use crate::normalizers::NormalizerError;
use crate::observability::MetricsRegistry;
use crate::store::{Store, StoreError, TableId};
use crate::sync::change::{Change, ChangeData, ChangeType};
use crate::sync::clock::Clock;

/// Errors raised while ingesting a change.
#[derive(Debug, Error)]
pub enum ChangeAgentError {
	#[error("cannot normalize change payload: {0}")]
	Normalize(#[from] NormalizerError),
	#[error("refusing to ingest a change of unknown type")]
	UnknownType,
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Outcome of one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
	/// The change was logged and queued
	Logged { change_id: String },
	/// A change with this id was already logged; nothing was queued
	Duplicate { change_id: String },
}

impl Ingested {
	pub fn change_id(&self) -> &str {
		match self {
			Ingested::Logged { change_id } | Ingested::Duplicate { change_id } => change_id,
		}
	}

	pub fn is_duplicate(&self) -> bool {
		matches!(self, Ingested::Duplicate { .. })
	}
}

/// Sole ingestion gateway into the change log and the work queues.
pub struct ChangeAgent {
	store: Arc<Store>,
	clock: Arc<dyn Clock>,
	metrics: Arc<MetricsRegistry>,
}

impl ChangeAgent {
	pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			store,
			clock,
			metrics,
		}
	}

	/// Record a mutation made on this device. The change is logged and queued
	/// for both execution and upload.
	pub async fn change_from_client(
		&self,
		change_type: ChangeType,
		data: ChangeData,
		origin_instance: Option<String>,
	) -> Result<Ingested, ChangeAgentError> {
		self.change_from_client_with_id(Uuid::new_v4().to_string(), change_type, data, origin_instance)
			.await
	}

	/// [`change_from_client`](Self::change_from_client) with a caller-chosen
	/// id, for callers that retry a mutation and must not duplicate it.
	pub async fn change_from_client_with_id(
		&self,
		change_id: String,
		change_type: ChangeType,
		mut data: ChangeData,
		origin_instance: Option<String>,
	) -> Result<Ingested, ChangeAgentError> {
		if change_type == ChangeType::Unknown {
			return Err(ChangeAgentError::UnknownType);
		}
		data.normalize_strict()?;
		let origin_instance = origin_instance
			.map(|n| crate::normalizers::normalize_number(&n).map(|n| n.canonical))
			.transpose()?;

		let mut txn = self
			.store
			.begin_write(&[TableId::ChangeLog, TableId::ExecuteQueue, TableId::UploadQueue])
			.await?;
		// Read under the locks so change time, execute order and upload row
		// order agree between concurrent callers.
		let now = self.clock.now_millis();
		let change = Change {
			change_id,
			origin_instance,
			change_time: now,
			change_type,
			data,
			server_sequence: None,
			error_count: 0,
		};
		if !self.store.change_log.insert(txn.conn(), &change).await? {
			drop(txn);
			return Ok(self.duplicate(change.change_id));
		}
		self.store
			.execute_queue
			.push(txn.conn(), &change.change_id, now)
			.await?;
		self.store
			.upload_queue
			.push(txn.conn(), &change.change_id, now)
			.await?;
		txn.commit().await?;

		self.metrics.changes_ingested_total.inc();
		info!(
			"logged local change {} ({})",
			change.change_id, change.change_type
		);
		Ok(Ingested::Logged {
			change_id: change.change_id,
		})
	}

	/// Record a change received from the authority. It is queued for
	/// execution only and never uploaded back.
	pub async fn change_from_server(&self, mut change: Change) -> Result<Ingested, ChangeAgentError> {
		change.data.normalize_lenient();
		change.origin_instance = change
			.origin_instance
			.as_deref()
			.map(crate::normalizers::canonical_or_raw);
		change.error_count = 0;

		let mut txn = self
			.store
			.begin_write(&[TableId::ChangeLog, TableId::ExecuteQueue])
			.await?;
		if !self.store.change_log.insert(txn.conn(), &change).await? {
			// Our own upload coming back, or a redelivered page: only adopt
			// the authority sequence so the download cursor moves past it.
			if let Some(seq) = change.server_sequence {
				if self
					.store
					.change_log
					.stamp_server_sequence(txn.conn(), &change.change_id, seq)
					.await?
				{
					debug!("stamped server sequence {} on {}", seq, change.change_id);
				}
			}
			txn.commit().await?;
			return Ok(self.duplicate(change.change_id));
		}
		let now = self.clock.now_millis();
		self.store
			.execute_queue
			.push(txn.conn(), &change.change_id, now)
			.await?;
		txn.commit().await?;

		self.metrics.changes_ingested_total.inc();
		debug!(
			"logged server change {} ({}, seq {:?})",
			change.change_id, change.change_type, change.server_sequence
		);
		Ok(Ingested::Logged {
			change_id: change.change_id,
		})
	}

	fn duplicate(&self, change_id: String) -> Ingested {
		self.metrics.changes_duplicate_total.inc();
		debug!("ignoring already logged change {}", change_id);
		Ingested::Duplicate { change_id }
	}
}
