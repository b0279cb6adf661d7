//! Reconciliation of on-device providers (address book and the like) into
//! change-agent calls.
//!
//! A [`NativeSource`] yields the provider's current records. They are diffed
//! against the materialized rows owned by the local instance: contacts by id,
//! contact numbers by `(contact_id, number)`. Only the difference is emitted,
//! as ordinary local changes.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalizers::normalize_number;
use crate::store::{ContactNumberRow, ContactRow, Store};
use crate::sync::SyncError;
use crate::sync::change::{ChangeData, ChangeType};
use crate::sync::change_agent::ChangeAgent;

#[derive(Debug, Error)]
pub enum NativeSourceError {
	#[error("cannot read native snapshot: {0}")]
	Io(#[from] std::io::Error),
	#[error("cannot parse native snapshot: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("native provider failed: {0}")]
	Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeKind {
	Contact,
	ContactNumber,
}

/// Provider-side fields. Contacts use `display_name`/`blocked`; numbers use
/// `contact_id`/`number`/`label`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeFields {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub blocked: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub number: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
}

/// One record as reported by a native provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeRecord {
	pub kind: NativeKind,
	/// Provider id; for contacts this is the contact id
	pub native_id: String,
	#[serde(default)]
	pub fields: NativeFields,
	/// Provider revision of the record
	#[serde(default)]
	pub version_tag: i64,
}

impl NativeRecord {
	pub fn contact(id: impl Into<String>, display_name: Option<String>, version_tag: i64) -> Self {
		Self {
			kind: NativeKind::Contact,
			native_id: id.into(),
			fields: NativeFields {
				display_name,
				..NativeFields::default()
			},
			version_tag,
		}
	}

	pub fn contact_number(
		contact_id: impl Into<String>,
		number: impl Into<String>,
		label: Option<String>,
		version_tag: i64,
	) -> Self {
		let contact_id = contact_id.into();
		let number = number.into();
		Self {
			kind: NativeKind::ContactNumber,
			native_id: format!("{}/{}", contact_id, number),
			fields: NativeFields {
				contact_id: Some(contact_id),
				number: Some(number),
				label,
				..NativeFields::default()
			},
			version_tag,
		}
	}
}

pub type NativeStream = BoxStream<'static, Result<NativeRecord, NativeSourceError>>;

/// A provider of native records.
#[async_trait]
pub trait NativeSource: Send + Sync {
	async fn records(&self) -> Result<NativeStream, NativeSourceError>;
}

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
	records: Vec<NativeRecord>,
}

impl StaticSource {
	pub fn new(records: Vec<NativeRecord>) -> Self {
		Self { records }
	}
}

#[async_trait]
impl NativeSource for StaticSource {
	async fn records(&self) -> Result<NativeStream, NativeSourceError> {
		Ok(stream::iter(self.records.clone().into_iter().map(Ok)).boxed())
	}
}

/// Records read from a JSON array on disk, re-read on every reconcile.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
	path: PathBuf,
}

impl JsonFileSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

#[async_trait]
impl NativeSource for JsonFileSource {
	async fn records(&self) -> Result<NativeStream, NativeSourceError> {
		let bytes = tokio::fs::read(&self.path).await?;
		let records: Vec<NativeRecord> = serde_json::from_slice(&bytes)?;
		debug!("read {} native record(s) from {}", records.len(), self.path.display());
		Ok(stream::iter(records.into_iter().map(Ok)).boxed())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
	pub inserted: usize,
	pub updated: usize,
	pub deleted: usize,
	/// Native records ignored for missing or unusable fields
	pub skipped: usize,
}

impl ReconcileReport {
	pub fn emitted(&self) -> usize {
		self.inserted + self.updated + self.deleted
	}
}

struct NativeNumber {
	label: Option<String>,
	version_tag: i64,
}

/// Diffs a native source against the local instance's rows.
pub struct Reconciler {
	store: Arc<Store>,
	change_agent: Arc<ChangeAgent>,
	instance_number: String,
}

impl Reconciler {
	pub fn new(store: Arc<Store>, change_agent: Arc<ChangeAgent>, instance_number: impl Into<String>) -> Self {
		Self {
			store,
			change_agent,
			instance_number: instance_number.into(),
		}
	}

	pub async fn reconcile(&self, source: &dyn NativeSource) -> Result<ReconcileReport, SyncError> {
		let mut report = ReconcileReport::default();

		let mut contacts = BTreeMap::new();
		let mut numbers = BTreeMap::new();
		let mut records = source.records().await?;
		while let Some(record) = records.next().await {
			let record = record?;
			match record.kind {
				NativeKind::Contact => {
					contacts.insert(record.native_id.clone(), record);
				}
				NativeKind::ContactNumber => {
					let fields = record.fields;
					let (Some(contact_id), Some(raw)) = (fields.contact_id, fields.number) else {
						warn!("native number {} lacks contactId or number", record.native_id);
						report.skipped += 1;
						continue;
					};
					match normalize_number(&raw) {
						Ok(n) => {
							numbers.insert(
								(contact_id, n.canonical),
								NativeNumber {
									label: fields.label,
									version_tag: record.version_tag,
								},
							);
						}
						Err(e) => {
							warn!("skipping native number {}: {}", record.native_id, e);
							report.skipped += 1;
						}
					}
				}
			}
		}

		let (instances, rows, number_rows) = {
			let mut conn = self.store.read().await?;
			(
				self.store.instances.all(&mut conn).await?,
				self.store.contacts.owned_by(&mut conn, &self.instance_number).await?,
				self.store
					.contact_numbers
					.owned_by(&mut conn, &self.instance_number)
					.await?,
			)
		};

		if !instances.iter().any(|i| i.number == self.instance_number) {
			self.emit(ChangeData::instance_insert(self.instance_number.as_str()))
				.await?;
			report.inserted += 1;
		}

		let existing: BTreeMap<&str, &ContactRow> =
			rows.iter().map(|r| (r.contact_id.as_str(), r)).collect();
		let existing_numbers: BTreeMap<(&str, &str), &ContactNumberRow> = number_rows
			.iter()
			.map(|r| ((r.contact_id.as_str(), r.number.as_str()), r))
			.collect();
		// Contacts of other instances are never touched from here.
		let foreign: HashSet<&str> = {
			let mut conn = self.store.read().await?;
			let mut foreign = HashSet::new();
			for id in contacts.keys() {
				if !existing.contains_key(id.as_str()) {
					if let Some(row) = self.store.contacts.get(&mut conn, id).await? {
						if row.instance_number != self.instance_number {
							foreign.insert(id.as_str());
						}
					}
				}
			}
			foreign
		};

		for (id, record) in &contacts {
			if foreign.contains(id.as_str()) {
				report.skipped += 1;
				continue;
			}
			let fields = &record.fields;
			match existing.get(id.as_str()) {
				None => {
					let (t, mut data) = ChangeData::contact_insert(
						id.as_str(),
						self.instance_number.as_str(),
						fields.display_name.clone(),
					);
					data.blocked = fields.blocked;
					self.emit((t, data)).await?;
					report.inserted += 1;
				}
				Some(row) => {
					let name_changed =
						fields.display_name.is_some() && fields.display_name != row.display_name;
					let blocked_changed = fields.blocked.is_some_and(|b| b != row.blocked);
					if name_changed || blocked_changed {
						self.emit(ChangeData::contact_update(
							id.as_str(),
							fields.display_name.clone(),
							fields.blocked.filter(|_| blocked_changed),
						))
						.await?;
						report.updated += 1;
					}
				}
			}
		}

		for ((contact_id, number), native) in &numbers {
			if foreign.contains(contact_id.as_str()) {
				report.skipped += 1;
				continue;
			}
			if !contacts.contains_key(contact_id) && !existing.contains_key(contact_id.as_str()) {
				warn!("native number {} belongs to unknown contact {}", number, contact_id);
				report.skipped += 1;
				continue;
			}
			match existing_numbers.get(&(contact_id.as_str(), number.as_str())) {
				None => {
					self.emit(ChangeData::contact_number_insert(
						contact_id.as_str(),
						number.as_str(),
						native.label.clone(),
						native.version_tag,
					))
					.await?;
					report.inserted += 1;
				}
				Some(row) if row.version != native.version_tag || row.label != native.label => {
					self.emit(ChangeData::contact_number_update(
						contact_id.as_str(),
						number.as_str(),
						None,
						native.label.clone(),
						Some(native.version_tag),
					))
					.await?;
					report.updated += 1;
				}
				Some(_) => {}
			}
		}

		for row in &number_rows {
			let key = (row.contact_id.clone(), row.number.clone());
			// A vanished contact takes its numbers with it.
			if !numbers.contains_key(&key) && contacts.contains_key(&row.contact_id) {
				self.emit(ChangeData::contact_number_delete(
					row.contact_id.as_str(),
					row.number.as_str(),
				))
				.await?;
				report.deleted += 1;
			}
		}
		for row in &rows {
			if !contacts.contains_key(&row.contact_id) {
				self.emit(ChangeData::contact_delete(row.contact_id.as_str()))
					.await?;
				report.deleted += 1;
			}
		}

		if report.emitted() > 0 {
			info!(
				"reconcile emitted {} insert(s), {} update(s), {} delete(s)",
				report.inserted, report.updated, report.deleted
			);
		}
		Ok(report)
	}

	async fn emit(&self, (change_type, data): (ChangeType, ChangeData)) -> Result<(), SyncError> {
		self.change_agent
			.change_from_client(change_type, data, Some(self.instance_number.clone()))
			.await?;
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::observability::MetricsRegistry;
	use crate::sync::clock::ManualClock;
	use crate::sync::execute_agent::ExecuteAgent;

	const ME: &str = "+15550100";

	struct Harness {
		store: Arc<Store>,
		reconciler: Reconciler,
		exec: ExecuteAgent,
	}

	async fn harness() -> Harness {
		let store = Arc::new(Store::open_in_memory().await.unwrap());
		let metrics = Arc::new(MetricsRegistry::new());
		let agent = Arc::new(ChangeAgent::new(
			Arc::clone(&store),
			Arc::new(ManualClock::new(1, 1)),
			Arc::clone(&metrics),
		));
		Harness {
			reconciler: Reconciler::new(Arc::clone(&store), agent, ME),
			exec: ExecuteAgent::new(Arc::clone(&store), metrics),
			store,
		}
	}

	#[tokio::test]
	async fn first_reconcile_inserts_everything() {
		let h = harness().await;
		let source = StaticSource::new(vec![
			NativeRecord::contact("X", Some("Ada".into()), 1),
			NativeRecord::contact_number("X", "+1 555 0111", Some("mobile".into()), 1),
		]);

		let report = h.reconciler.reconcile(&source).await.unwrap();
		// Instance bootstrap, contact, number.
		assert_eq!(report.inserted, 3);
		h.exec.execute_all().await.unwrap();

		let snapshot = h.store.snapshot().await.unwrap();
		assert_eq!(snapshot.instances.len(), 1);
		assert_eq!(snapshot.contacts[0].instance_number, ME);
		assert_eq!(snapshot.contact_numbers[0].number, "+15550111");

		// Nothing changed on the provider side: nothing to emit.
		let again = h.reconciler.reconcile(&source).await.unwrap();
		assert_eq!(again.emitted(), 0);
	}

	#[tokio::test]
	async fn changed_and_removed_records_are_diffed() {
		let h = harness().await;
		let before = StaticSource::new(vec![
			NativeRecord::contact("X", Some("Ada".into()), 1),
			NativeRecord::contact_number("X", "+15550111", None, 1),
			NativeRecord::contact_number("X", "+15550122", None, 1),
			NativeRecord::contact("Y", Some("Bob".into()), 1),
		]);
		h.reconciler.reconcile(&before).await.unwrap();
		h.exec.execute_all().await.unwrap();

		let after = StaticSource::new(vec![
			NativeRecord::contact("X", Some("Ada L.".into()), 2),
			NativeRecord::contact_number("X", "+15550111", Some("home".into()), 2),
		]);
		let report = h.reconciler.reconcile(&after).await.unwrap();
		assert_eq!(report.updated, 2);
		// The +15550122 number and contact Y.
		assert_eq!(report.deleted, 2);
		h.exec.execute_all().await.unwrap();

		let snapshot = h.store.snapshot().await.unwrap();
		assert_eq!(snapshot.contacts.len(), 1);
		assert_eq!(snapshot.contacts[0].display_name.as_deref(), Some("Ada L."));
		assert_eq!(snapshot.contact_numbers.len(), 1);
		assert_eq!(snapshot.contact_numbers[0].label.as_deref(), Some("home"));
		assert_eq!(snapshot.contact_numbers[0].version, 2);
	}

	#[tokio::test]
	async fn unusable_native_numbers_are_skipped() {
		let h = harness().await;
		let source = StaticSource::new(vec![
			NativeRecord::contact("X", None, 1),
			NativeRecord::contact_number("X", "ask reception", None, 1),
			NativeRecord::contact_number("Z", "+15550133", None, 1),
		]);
		let report = h.reconciler.reconcile(&source).await.unwrap();
		assert_eq!(report.skipped, 2);
		assert_eq!(report.inserted, 2);
	}

	#[tokio::test]
	async fn json_file_source_reads_snapshot() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("native.json");
		let records = vec![
			NativeRecord::contact("X", Some("Ada".into()), 3),
			NativeRecord::contact_number("X", "+15550111", None, 3),
		];
		std::fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

		let source = JsonFileSource::new(&path);
		let read: Vec<NativeRecord> = source
			.records()
			.await
			.unwrap()
			.map(|r| r.unwrap())
			.collect()
			.await;
		assert_eq!(read, records);

		let missing = JsonFileSource::new(dir.path().join("absent.json"));
		assert!(matches!(missing.records().await, Err(NativeSourceError::Io(_))));
	}
}
