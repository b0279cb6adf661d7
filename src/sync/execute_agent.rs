//! Deterministic interpreter from the change log into the materialized
//! tables.
//!
//! Each queued change is applied in two committed steps: first its error
//! count is bumped, then the apply runs in one transaction together with the
//! removal of its execute-queue entry (and gives the attempt back). A crash
//! or a failed apply therefore leaves the entry queued with a higher count.
//! Every apply routine tolerates state that is already partially or fully
//! applied.
//!
//! The materialized tables always equal a replay of the applied changes in
//! `(change_time, log order)` order. A change that sorts before something
//! already applied (a late server change from a device that was offline, or
//! a change that failed earlier) is therefore applied by replaying the
//! history with it included.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use sqlx::sqlite::SqliteConnection;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::observability::MetricsRegistry;
use crate::store::{ContactNumberRow, ContactRow, Store, StoreError, TableId};
use crate::sync::change::{Change, ChangeType};
use crate::sync::precedence::VersionStamp;

/// Why a single change could not be applied.
#[derive(Debug, Error)]
pub enum ApplyError {
	#[error("{change_type} change is missing required field `{field}`")]
	MissingField {
		change_type: ChangeType,
		field: &'static str,
	},
	#[error("change type is not understood by this replica")]
	UnknownType,
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl ApplyError {
	/// Whether retrying can ever succeed.
	pub fn is_permanent(&self) -> bool {
		!matches!(self, ApplyError::Store(_))
	}
}

/// Result of one `execute_first` step.
#[derive(Debug)]
pub enum ExecuteOutcome {
	Applied {
		change_id: String,
		change_type: ChangeType,
	},
	Failed {
		change_id: String,
		change_type: ChangeType,
		error: ApplyError,
	},
}

impl ExecuteOutcome {
	pub fn change_id(&self) -> &str {
		match self {
			ExecuteOutcome::Applied { change_id, .. } | ExecuteOutcome::Failed { change_id, .. } => {
				change_id
			}
		}
	}

	pub fn is_applied(&self) -> bool {
		matches!(self, ExecuteOutcome::Applied { .. })
	}
}

/// Summary of an `execute_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteReport {
	pub applied: usize,
	/// Changes that failed during the pass and remain queued
	pub failed: Vec<String>,
}

/// Summary of a `rebuild`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
	pub replayed: usize,
	pub skipped: Vec<String>,
}

const ENTITY_TABLES: [TableId; 4] = [
	TableId::Instance,
	TableId::Contact,
	TableId::ContactNumber,
	TableId::TrustedNumber,
];

/// Entity tables an apply of `change_type` may write.
fn entity_tables(change_type: ChangeType) -> &'static [TableId] {
	match change_type {
		ChangeType::ContactInsert | ChangeType::ContactUpdate => &[TableId::Contact],
		ChangeType::ContactDelete
		| ChangeType::ContactNumberInsert
		| ChangeType::ContactNumberUpdate
		| ChangeType::ContactNumberDelete => &[
			TableId::Contact,
			TableId::ContactNumber,
			TableId::TrustedNumber,
		],
		ChangeType::InstanceInsert | ChangeType::InstanceDelete => {
			&[TableId::Instance, TableId::TrustedNumber]
		}
		ChangeType::NumberClassify => &[TableId::TrustedNumber],
		ChangeType::Unknown => &[],
	}
}

fn require<'a>(
	change_type: ChangeType,
	field: &'static str,
	value: Option<&'a str>,
) -> Result<&'a str, ApplyError> {
	value.ok_or(ApplyError::MissingField { change_type, field })
}

pub struct ExecuteAgent {
	store: Arc<Store>,
	metrics: Arc<MetricsRegistry>,
	// Serializes passes so two callers never apply the same entry.
	pass: Mutex<()>,
}

impl ExecuteAgent {
	pub fn new(store: Arc<Store>, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			store,
			metrics,
			pass: Mutex::new(()),
		}
	}

	/// Apply the oldest queued change. Returns `None` when the queue is empty.
	pub async fn execute_first(&self) -> Result<Option<ExecuteOutcome>, StoreError> {
		let _pass = self.pass.lock().await;
		self.execute_next(&HashSet::new()).await
	}

	/// Apply queued changes until the queue is empty or every remaining entry
	/// has failed once in this pass.
	pub async fn execute_all(&self) -> Result<ExecuteReport, StoreError> {
		let _pass = self.pass.lock().await;
		let mut report = ExecuteReport::default();
		let mut failed = HashSet::new();

		while let Some(outcome) = self.execute_next(&failed).await? {
			match outcome {
				ExecuteOutcome::Applied { .. } => report.applied += 1,
				ExecuteOutcome::Failed { change_id, .. } => {
					failed.insert(change_id.clone());
					report.failed.push(change_id);
				}
			}
		}

		let depth = self.store.queue_depths().await?.execute_queue;
		self.metrics.execute_queue_depth.set(depth);
		if report.applied > 0 || !report.failed.is_empty() {
			info!(
				"execute pass applied {} change(s), {} failed, {} still queued",
				report.applied,
				report.failed.len(),
				depth
			);
		}
		Ok(report)
	}

	async fn execute_next(
		&self,
		skip: &HashSet<String>,
	) -> Result<Option<ExecuteOutcome>, StoreError> {
		// Step 1: pick the entry and record the attempt.
		let (change, late) = loop {
			let mut txn = self
				.store
				.begin_write(&[TableId::ChangeLog, TableId::ExecuteQueue])
				.await?;
			let entries = self.store.execute_queue.entries(txn.conn()).await?;
			let Some(entry) = entries.into_iter().find(|e| !skip.contains(&e.change_id)) else {
				return Ok(None);
			};
			self.store
				.change_log
				.increment_error_count(txn.conn(), &entry.change_id)
				.await?;
			match self.store.change_log.get(txn.conn(), &entry.change_id).await? {
				Some(change) => {
					let late = self
						.store
						.change_log
						.applied_after(txn.conn(), &change.change_id)
						.await?;
					txn.commit().await?;
					break (change, late);
				}
				None => {
					// Only possible without foreign keys; drop the dangling entry.
					warn!("execute queue entry {} has no logged change", entry.change_id);
					self.store.execute_queue.remove(txn.conn(), &entry.change_id).await?;
					txn.commit().await?;
				}
			}
		};

		// Step 2: apply and dequeue atomically.
		let mut tables = vec![TableId::ChangeLog, TableId::ExecuteQueue];
		if late {
			tables.extend_from_slice(&ENTITY_TABLES);
		} else {
			tables.extend_from_slice(entity_tables(change.change_type));
		}
		let mut txn = self.store.begin_write(&tables).await?;

		if let Err(error) = self.apply(txn.conn(), &change).await {
			drop(txn);
			self.metrics.change_apply_failures_total.inc();
			warn!(
				"failed to apply {} change {} (attempt {}): {}",
				change.change_type, change.change_id, change.error_count, error
			);
			return Ok(Some(ExecuteOutcome::Failed {
				change_id: change.change_id,
				change_type: change.change_type,
				error,
			}));
		}

		self.store
			.execute_queue
			.remove(txn.conn(), &change.change_id)
			.await?;
		self.store
			.change_log
			.decrement_error_count(txn.conn(), &change.change_id)
			.await?;
		if late {
			info!(
				"{} change {} predates applied history, replaying from the log",
				change.change_type, change.change_id
			);
			self.replay(txn.conn()).await?;
		}
		txn.commit().await?;

		self.metrics.changes_applied_total.inc();
		debug!("applied {} change {}", change.change_type, change.change_id);
		Ok(Some(ExecuteOutcome::Applied {
			change_id: change.change_id,
			change_type: change.change_type,
		}))
	}

	/// Clear the materialized tables and replay every applied change in
	/// `(change_time, log order)` order. Changes still queued are left for
	/// the next execute pass.
	pub async fn rebuild(&self) -> Result<RebuildReport, StoreError> {
		let _pass = self.pass.lock().await;
		let mut tables = vec![TableId::ChangeLog, TableId::ExecuteQueue];
		tables.extend_from_slice(&ENTITY_TABLES);
		let mut txn = self.store.begin_write(&tables).await?;
		let report = self.replay(txn.conn()).await?;
		txn.commit().await?;

		info!(
			"rebuilt materialized tables from {} change(s), {} skipped",
			report.replayed,
			report.skipped.len()
		);
		Ok(report)
	}

	async fn replay(&self, conn: &mut SqliteConnection) -> Result<RebuildReport, StoreError> {
		self.store.trusted_numbers.clear(conn).await?;
		self.store.contact_numbers.clear(conn).await?;
		self.store.contacts.clear(conn).await?;
		self.store.instances.clear(conn).await?;

		let changes = self.store.change_log.applied_in_replay_order(conn).await?;
		let mut report = RebuildReport::default();
		for change in &changes {
			match self.apply(conn, change).await {
				Ok(()) => report.replayed += 1,
				Err(ApplyError::Store(e)) => return Err(e),
				Err(e) => {
					warn!("skipping {} during replay: {}", change.change_id, e);
					report.skipped.push(change.change_id.clone());
				}
			}
		}
		Ok(report)
	}

	/// Queued changes that failed at least `threshold` times.
	pub async fn stuck_changes(&self, threshold: i64) -> Result<Vec<Change>, StoreError> {
		let mut conn = self.store.read().await?;
		self.store.change_log.stuck(&mut conn, threshold).await
	}

	async fn apply(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		match change.change_type {
			ChangeType::ContactInsert => self.contact_insert(conn, change).await,
			ChangeType::ContactUpdate => self.contact_update(conn, change).await,
			ChangeType::ContactDelete => self.contact_delete(conn, change).await,
			ChangeType::ContactNumberInsert => self.contact_number_insert(conn, change).await,
			ChangeType::ContactNumberUpdate => self.contact_number_update(conn, change).await,
			ChangeType::ContactNumberDelete => self.contact_number_delete(conn, change).await,
			ChangeType::InstanceInsert => self.instance_insert(conn, change).await,
			ChangeType::InstanceDelete => self.instance_delete(conn, change).await,
			ChangeType::NumberClassify => self.number_classify(conn, change).await,
			ChangeType::Unknown => Err(ApplyError::UnknownType),
		}
	}

	async fn contact_insert(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let t = change.change_type;
		let data = &change.data;
		let contact_id = require(t, "contactId", data.contact_id.as_deref())?;
		let parent = require(t, "parentNumber", data.parent_number.as_deref())?;

		let row = ContactRow {
			contact_id: contact_id.to_string(),
			instance_number: parent.to_string(),
			display_name: data.display_name.clone(),
			blocked: data.blocked.unwrap_or(false),
			change_time: change.change_time,
		};
		self.store.contacts.upsert(conn, &row).await?;
		Ok(())
	}

	async fn contact_update(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let data = &change.data;
		let contact_id = require(change.change_type, "contactId", data.contact_id.as_deref())?;

		let found = self
			.store
			.contacts
			.update(
				conn,
				contact_id,
				data.display_name.as_deref(),
				data.blocked,
				change.change_time,
			)
			.await?;
		if !found {
			debug!("contact {} is gone, update {} has nothing to touch", contact_id, change.change_id);
		}
		Ok(())
	}

	async fn contact_delete(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let contact_id = require(change.change_type, "contactId", change.data.contact_id.as_deref())?;

		// Children first, so a contact never disappears while numbers still
		// point at it.
		let numbers = self.store.contact_numbers.for_contact(conn, contact_id).await?;
		for row in &numbers {
			if self.store.contact_numbers.delete(conn, contact_id, &row.number).await? {
				self.store.trusted_numbers.detach(conn, &row.number).await?;
			}
		}
		self.store.contacts.delete(conn, contact_id).await?;
		Ok(())
	}

	async fn contact_number_insert(
		&self,
		conn: &mut SqliteConnection,
		change: &Change,
	) -> Result<(), ApplyError> {
		let t = change.change_type;
		let data = &change.data;
		let contact_id = require(t, "contactId", data.contact_id.as_deref())?;
		let number = require(t, "number", data.number.as_deref())?;

		if self.store.contacts.get(conn, contact_id).await?.is_none() {
			debug!("contact {} is gone, dropping number {}", contact_id, number);
			return Ok(());
		}

		match self.store.contact_numbers.get(conn, contact_id, number).await? {
			Some(existing) => {
				let incoming = VersionStamp::new(data.version, change.change_time);
				if incoming.supersedes(&VersionStamp::of_row(&existing)) {
					let row = ContactNumberRow {
						label: data.label.clone().or(existing.label),
						version: data.version.unwrap_or(existing.version),
						change_time: change.change_time,
						..existing
					};
					self.store.contact_numbers.replace(conn, number, &row).await?;
				}
			}
			None => {
				let row = ContactNumberRow {
					contact_id: contact_id.to_string(),
					number: number.to_string(),
					label: data.label.clone(),
					version: data.version.unwrap_or(0),
					change_time: change.change_time,
				};
				if self.store.contact_numbers.insert(conn, &row).await? {
					self.store.trusted_numbers.attach(conn, number).await?;
				}
			}
		}
		Ok(())
	}

	async fn contact_number_update(
		&self,
		conn: &mut SqliteConnection,
		change: &Change,
	) -> Result<(), ApplyError> {
		let t = change.change_type;
		let data = &change.data;
		let contact_id = require(t, "contactId", data.contact_id.as_deref())?;
		let old_number = require(t, "oldNumber", data.old_number.as_deref())?;

		let Some(existing) = self.store.contact_numbers.get(conn, contact_id, old_number).await? else {
			debug!(
				"number {} of contact {} is gone, update {} has nothing to touch",
				old_number, contact_id, change.change_id
			);
			return Ok(());
		};

		let incoming = VersionStamp::new(data.version, change.change_time);
		if !incoming.supersedes(&VersionStamp::of_row(&existing)) {
			debug!(
				"ignoring stale update {} of {}/{} (version {:?} < {})",
				change.change_id, contact_id, old_number, data.version, existing.version
			);
			return Ok(());
		}

		let number = data.number.as_deref().unwrap_or(old_number);
		let row = ContactNumberRow {
			contact_id: contact_id.to_string(),
			number: number.to_string(),
			label: data.label.clone().or(existing.label),
			version: data.version.unwrap_or(existing.version),
			change_time: change.change_time,
		};

		let numbers = &self.store.contact_numbers;
		let trusted = &self.store.trusted_numbers;
		if number == old_number {
			numbers.replace(conn, old_number, &row).await?;
		} else if numbers.get(conn, contact_id, number).await?.is_some() {
			// Renamed onto a number the contact already has: fold the two.
			numbers.delete(conn, contact_id, old_number).await?;
			trusted.detach(conn, old_number).await?;
			numbers.replace(conn, number, &row).await?;
		} else {
			numbers.replace(conn, old_number, &row).await?;
			trusted.detach(conn, old_number).await?;
			trusted.attach(conn, number).await?;
		}
		Ok(())
	}

	async fn contact_number_delete(
		&self,
		conn: &mut SqliteConnection,
		change: &Change,
	) -> Result<(), ApplyError> {
		let t = change.change_type;
		let data = &change.data;
		let contact_id = require(t, "contactId", data.contact_id.as_deref())?;
		let number = require(t, "number", data.number.as_deref())?;

		if self.store.contact_numbers.delete(conn, contact_id, number).await? {
			self.store.trusted_numbers.detach(conn, number).await?;
		}
		Ok(())
	}

	async fn instance_insert(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let number = require(change.change_type, "number", change.data.number.as_deref())?;
		if self.store.instances.insert(conn, number, change.change_time).await? {
			self.store.trusted_numbers.attach(conn, number).await?;
		}
		Ok(())
	}

	async fn instance_delete(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let number = require(change.change_type, "number", change.data.number.as_deref())?;
		if self.store.instances.delete(conn, number).await? {
			self.store.trusted_numbers.detach(conn, number).await?;
		}
		Ok(())
	}

	async fn number_classify(&self, conn: &mut SqliteConnection, change: &Change) -> Result<(), ApplyError> {
		let t = change.change_type;
		let number = require(t, "number", change.data.number.as_deref())?;
		let classification = require(t, "classification", change.data.classification.as_deref())?;
		self.store.trusted_numbers.classify(conn, number, classification).await?;
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::sync::change::ChangeData;
	use crate::sync::change_agent::ChangeAgent;
	use crate::sync::clock::ManualClock;

	struct Harness {
		store: Arc<Store>,
		agent: ChangeAgent,
		exec: ExecuteAgent,
	}

	async fn harness() -> Harness {
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let metrics = Arc::new(MetricsRegistry::new());
		Harness {
			agent: ChangeAgent::new(
				Arc::clone(&store),
				Arc::new(ManualClock::new(10, 10)),
				Arc::clone(&metrics),
			),
			exec: ExecuteAgent::new(Arc::clone(&store), metrics),
			store,
		}
	}

	impl Harness {
		async fn local(&self, (t, d): (ChangeType, ChangeData)) -> String {
			self.agent
				.change_from_client(t, d, None)
				.await
				.unwrap()
				.change_id()
				.to_string()
		}

		/// Log and queue a change without going through normalization.
		async fn raw(&self, id: &str, change_type: ChangeType, data: ChangeData, time: i64) {
			let change = Change {
				change_id: id.to_string(),
				origin_instance: None,
				change_time: time,
				change_type,
				data,
				server_sequence: Some(time),
				error_count: 0,
			};
			self.agent.change_from_server(change).await.unwrap();
		}
	}

	#[tokio::test]
	async fn execute_first_is_fifo() {
		let h = harness().await;
		let c1 = h
			.local(ChangeData::contact_insert("X", "+15550100", Some("Ada".into())))
			.await;
		let c2 = h
			.local(ChangeData::contact_update("X", Some("Bob".into()), None))
			.await;

		let first = h.exec.execute_first().await.unwrap().unwrap();
		assert_eq!(first.change_id(), c1);
		assert!(first.is_applied());
		let mut conn = h.store.read().await.unwrap();
		let contact = h.store.contacts.get(&mut conn, "X").await.unwrap().unwrap();
		assert_eq!(contact.display_name.as_deref(), Some("Ada"));
		drop(conn);

		let second = h.exec.execute_first().await.unwrap().unwrap();
		assert_eq!(second.change_id(), c2);
		assert!(h.exec.execute_first().await.unwrap().is_none());

		let mut conn = h.store.read().await.unwrap();
		let contact = h.store.contacts.get(&mut conn, "X").await.unwrap().unwrap();
		assert_eq!(contact.display_name.as_deref(), Some("Bob"));
		assert_eq!(h.store.execute_queue.len(&mut conn).await.unwrap(), 0);
		// Successful applies leave no attempt behind.
		let change = h.store.change_log.get(&mut conn, &c1).await.unwrap().unwrap();
		assert_eq!(change.error_count, 0);
	}

	#[tokio::test]
	async fn contact_delete_cascades_and_reapplies() {
		let h = harness().await;
		h.local(ChangeData::contact_insert("X", "+15550100", None)).await;
		h.local(ChangeData::contact_number_insert("X", "+15550111", None, 1)).await;
		h.local(ChangeData::contact_number_insert("X", "+15550122", Some("work".into()), 1))
			.await;
		h.exec.execute_all().await.unwrap();

		let snapshot = h.store.snapshot().await.unwrap();
		assert_eq!(snapshot.contact_numbers.len(), 2);
		assert_eq!(snapshot.trusted_numbers.len(), 2);

		h.local(ChangeData::contact_delete("X")).await;
		let report = h.exec.execute_all().await.unwrap();
		assert_eq!(report.applied, 1);

		let snapshot = h.store.snapshot().await.unwrap();
		assert!(snapshot.contacts.is_empty());
		assert!(snapshot.contact_numbers.is_empty());
		assert!(snapshot.trusted_numbers.is_empty());

		// A second delete of the same contact finds nothing and still succeeds.
		h.local(ChangeData::contact_delete("X")).await;
		let report = h.exec.execute_all().await.unwrap();
		assert_eq!(report.applied, 1);
		assert!(report.failed.is_empty());
	}

	#[tokio::test]
	async fn malformed_change_stays_queued() {
		let h = harness().await;
		h.raw("bad-fields", ChangeType::ContactUpdate, ChangeData::default(), 1).await;
		h.raw("bad-type", ChangeType::Unknown, ChangeData::default(), 2).await;
		let good = h.local(ChangeData::instance_insert("+15550100")).await;

		let report = h.exec.execute_all().await.unwrap();
		assert_eq!(report.applied, 1);
		assert_eq!(report.failed, vec!["bad-fields".to_string(), "bad-type".to_string()]);

		let mut conn = h.store.read().await.unwrap();
		assert!(!h.store.execute_queue.contains(&mut conn, &good).await.unwrap());
		assert_eq!(h.store.execute_queue.len(&mut conn).await.unwrap(), 2);
		drop(conn);

		h.exec.execute_all().await.unwrap();
		let stuck = h.exec.stuck_changes(2).await.unwrap();
		assert_eq!(stuck.len(), 2);
		assert!(stuck.iter().all(|c| c.error_count == 2));

		match h.exec.execute_first().await.unwrap().unwrap() {
			ExecuteOutcome::Failed { error, .. } => {
				assert!(matches!(error, ApplyError::MissingField { field: "contactId", .. }));
				assert!(error.is_permanent());
			}
			other => panic!("expected failure, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn number_rename_moves_trust() {
		let h = harness().await;
		h.local(ChangeData::contact_insert("X", "+15550100", None)).await;
		h.local(ChangeData::contact_number_insert("X", "+15550111", None, 1)).await;
		h.local(ChangeData::contact_number_update(
			"X",
			"+15550111",
			Some("+15550133".into()),
			Some("home".into()),
			Some(2),
		))
		.await;
		h.exec.execute_all().await.unwrap();

		let snapshot = h.store.snapshot().await.unwrap();
		assert_eq!(snapshot.contact_numbers.len(), 1);
		assert_eq!(snapshot.contact_numbers[0].number, "+15550133");
		assert_eq!(snapshot.contact_numbers[0].label.as_deref(), Some("home"));
		assert_eq!(snapshot.trusted_numbers.len(), 1);
		assert_eq!(snapshot.trusted_numbers[0].number, "+15550133");
		assert_eq!(snapshot.trusted_numbers[0].confidence, 1);
	}

	#[tokio::test]
	async fn stale_number_update_is_ignored() {
		let h = harness().await;
		h.local(ChangeData::contact_insert("X", "+15550100", None)).await;
		h.local(ChangeData::contact_number_insert("X", "+15550111", Some("a".into()), 5))
			.await;
		h.local(ChangeData::contact_number_update("X", "+15550111", None, Some("b".into()), Some(4)))
			.await;
		let report = h.exec.execute_all().await.unwrap();
		assert_eq!(report.applied, 3);

		let snapshot = h.store.snapshot().await.unwrap();
		assert_eq!(snapshot.contact_numbers[0].label.as_deref(), Some("a"));
		assert_eq!(snapshot.contact_numbers[0].version, 5);
	}

	#[tokio::test]
	async fn classification_outlives_references() {
		let h = harness().await;
		h.local(ChangeData::instance_insert("+15550100")).await;
		h.local(ChangeData::number_classify("+15550100", "self")).await;
		h.local(ChangeData::instance_delete("+15550100")).await;
		h.exec.execute_all().await.unwrap();

		let snapshot = h.store.snapshot().await.unwrap();
		assert!(snapshot.instances.is_empty());
		assert_eq!(snapshot.trusted_numbers.len(), 1);
		assert_eq!(snapshot.trusted_numbers[0].confidence, 0);
		assert_eq!(snapshot.trusted_numbers[0].classification.as_deref(), Some("self"));
	}

	#[tokio::test]
	async fn late_server_update_does_not_override_newer_edit() {
		let h = harness().await;
		h.local(ChangeData::contact_insert("X", "+15550100", Some("Ada".into()))).await;
		h.local(ChangeData::contact_update("X", Some("Local".into()), None)).await;
		h.exec.execute_all().await.unwrap();

		let (t, d) = ChangeData::contact_update("X", Some("Remote".into()), None);
		h.raw("remote", t, d, 15).await;
		let report = h.exec.execute_all().await.unwrap();
		assert_eq!(report.applied, 1);

		let live = h.store.snapshot().await.unwrap();
		assert_eq!(live.contacts[0].display_name.as_deref(), Some("Local"));
		assert_eq!(live.contacts[0].change_time, 20);

		h.exec.rebuild().await.unwrap();
		assert_eq!(h.store.snapshot().await.unwrap(), live);
	}

	#[tokio::test]
	async fn late_delete_leaves_newer_contact() {
		let h = harness().await;
		h.local(ChangeData::contact_insert("X", "+15550100", None)).await;
		h.local(ChangeData::contact_number_insert("X", "+15550111", None, 1)).await;
		h.exec.execute_all().await.unwrap();

		let (t, d) = ChangeData::contact_delete("X");
		h.raw("remote-delete", t, d, 5).await;
		h.exec.execute_all().await.unwrap();

		let live = h.store.snapshot().await.unwrap();
		assert_eq!(live.contacts.len(), 1);
		assert_eq!(live.contact_numbers.len(), 1);
		assert_eq!(live.trusted_numbers[0].confidence, 1);
		h.exec.rebuild().await.unwrap();
		assert_eq!(h.store.snapshot().await.unwrap(), live);
	}

	#[tokio::test]
	async fn rebuild_reproduces_live_state() {
		let h = harness().await;
		h.local(ChangeData::instance_insert("+15550100")).await;
		h.local(ChangeData::contact_insert("X", "+15550100", Some("Ada".into()))).await;
		h.local(ChangeData::contact_number_insert("X", "+15550111", None, 1)).await;
		h.local(ChangeData::contact_insert("Y", "+15550100", Some("Bob".into()))).await;
		h.local(ChangeData::contact_number_insert("Y", "+15550111", None, 1)).await;
		h.local(ChangeData::contact_update("X", None, Some(true))).await;
		h.local(ChangeData::contact_delete("Y")).await;
		h.exec.execute_all().await.unwrap();
		let live = h.store.snapshot().await.unwrap();

		let report = h.exec.rebuild().await.unwrap();
		assert_eq!(report.replayed, 7);
		assert!(report.skipped.is_empty());
		assert_eq!(h.store.snapshot().await.unwrap(), live);
	}
}
