//! SQLite-backed repository for the change log, both work queues and the
//! materialized entity tables.
//!
//! Each table is a named resource type owning its own lock. Writers go through
//! [`Store::begin_write`], which takes the locks of every table the write
//! touches in [`TableId`] order and only then opens the storage transaction,
//! so a task holding the connection never waits on a table lock. Reads go
//! straight to the pool.

mod change_log;
mod entities;
mod queues;
mod schema;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
	SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use change_log::{ChangeLogTable, ChangeRow};
pub use entities::{
	ContactNumberRow, ContactNumberTable, ContactRow, ContactTable, InstanceRow, InstanceTable,
	TrustedNumberRow, TrustedNumberTable,
};
pub use queues::{ExecuteQueueEntry, ExecuteQueueTable, UploadQueueEntry, UploadQueueTable};

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("invalid stored change payload: {0}")]
	Payload(#[from] serde_json::Error),
	#[error("failed to prepare database location: {0}")]
	Io(#[from] std::io::Error),
}

/// Tables in canonical lock order. Multi-table writers always lock in the
/// order of this enum's discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableId {
	ChangeLog,
	ExecuteQueue,
	UploadQueue,
	Instance,
	Contact,
	ContactNumber,
	TrustedNumber,
}

impl TableId {
	pub fn name(self) -> &'static str {
		match self {
			TableId::ChangeLog => "change_log",
			TableId::ExecuteQueue => "execute_queue",
			TableId::UploadQueue => "upload_queue",
			TableId::Instance => "instance",
			TableId::Contact => "contact",
			TableId::ContactNumber => "contact_number",
			TableId::TrustedNumber => "trusted_number",
		}
	}
}

/// Exclusive write lock owned by one table.
#[derive(Debug)]
pub struct TableLock {
	id: TableId,
	mutex: Arc<Mutex<()>>,
}

impl TableLock {
	fn new(id: TableId) -> Self {
		Self {
			id,
			mutex: Arc::new(Mutex::new(())),
		}
	}

	pub fn id(&self) -> TableId {
		self.id
	}

	async fn acquire(&self) -> OwnedMutexGuard<()> {
		Arc::clone(&self.mutex).lock_owned().await
	}
}

/// An open write transaction together with the table locks it holds.
///
/// Dropping it without [`WriteTxn::commit`] rolls the transaction back and
/// releases the locks.
pub struct WriteTxn {
	tx: Transaction<'static, Sqlite>,
	tables: Vec<TableId>,
	// Released after `tx` because fields drop in declaration order.
	_guards: Vec<OwnedMutexGuard<()>>,
}

impl WriteTxn {
	/// Connection to run statements on inside this transaction.
	pub fn conn(&mut self) -> &mut SqliteConnection {
		&mut *self.tx
	}

	/// Tables locked by this transaction, in lock order.
	pub fn tables(&self) -> &[TableId] {
		&self.tables
	}

	pub async fn commit(self) -> Result<(), StoreError> {
		self.tx.commit().await?;
		Ok(())
	}
}

/// Point-in-time copy of every materialized table, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedSnapshot {
	pub instances: Vec<InstanceRow>,
	pub contacts: Vec<ContactRow>,
	pub contact_numbers: Vec<ContactNumberRow>,
	pub trusted_numbers: Vec<TrustedNumberRow>,
}

/// Row counts of the log and both queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
	pub change_log: i64,
	pub execute_queue: i64,
	pub upload_queue: i64,
}

/// The repository. Constructed once and shared by `Arc` with every component.
pub struct Store {
	pool: SqlitePool,
	pub change_log: ChangeLogTable,
	pub execute_queue: ExecuteQueueTable,
	pub upload_queue: UploadQueueTable,
	pub instances: InstanceTable,
	pub contacts: ContactTable,
	pub contact_numbers: ContactNumberTable,
	pub trusted_numbers: TrustedNumberTable,
}

impl Store {
	/// Open (creating if missing) the replica database at `path`.
	pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}

		let opts = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.foreign_keys(true)
			.busy_timeout(Duration::from_secs(5));

		Self::connect(opts).await
	}

	/// Open a private in-memory replica.
	pub async fn open_in_memory() -> Result<Self, StoreError> {
		let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
		Self::connect(opts).await
	}

	async fn connect(opts: SqliteConnectOptions) -> Result<Self, StoreError> {
		// One connection: SQLite serializes writers anyway, and an in-memory
		// database only lives as long as its connection.
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.min_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(opts)
			.await?;

		let store = Self {
			pool,
			change_log: ChangeLogTable::new(TableLock::new(TableId::ChangeLog)),
			execute_queue: ExecuteQueueTable::new(TableLock::new(TableId::ExecuteQueue)),
			upload_queue: UploadQueueTable::new(TableLock::new(TableId::UploadQueue)),
			instances: InstanceTable::new(TableLock::new(TableId::Instance)),
			contacts: ContactTable::new(TableLock::new(TableId::Contact)),
			contact_numbers: ContactNumberTable::new(TableLock::new(TableId::ContactNumber)),
			trusted_numbers: TrustedNumberTable::new(TableLock::new(TableId::TrustedNumber)),
		};
		store.migrate().await?;
		Ok(store)
	}

	async fn migrate(&self) -> Result<(), StoreError> {
		for stmt in schema::SCHEMA {
			sqlx::query(stmt).execute(&self.pool).await?;
		}
		debug!("replica schema ready ({} statements)", schema::SCHEMA.len());
		Ok(())
	}

	fn table_lock(&self, id: TableId) -> &TableLock {
		match id {
			TableId::ChangeLog => self.change_log.lock(),
			TableId::ExecuteQueue => self.execute_queue.lock(),
			TableId::UploadQueue => self.upload_queue.lock(),
			TableId::Instance => self.instances.lock(),
			TableId::Contact => self.contacts.lock(),
			TableId::ContactNumber => self.contact_numbers.lock(),
			TableId::TrustedNumber => self.trusted_numbers.lock(),
		}
	}

	/// Lock `tables` in canonical order, then open a transaction.
	pub async fn begin_write(&self, tables: &[TableId]) -> Result<WriteTxn, StoreError> {
		let mut ordered = tables.to_vec();
		ordered.sort();
		ordered.dedup();

		let mut guards = Vec::with_capacity(ordered.len());
		for id in &ordered {
			guards.push(self.table_lock(*id).acquire().await);
		}

		let tx = self.pool.begin().await?;
		Ok(WriteTxn {
			tx,
			tables: ordered,
			_guards: guards,
		})
	}

	/// Connection for lock-free reads.
	pub async fn read(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
		Ok(self.pool.acquire().await?)
	}

	/// Remove a change from the log together with any queue rows that
	/// reference it, in one transaction.
	pub async fn purge_change(&self, change_id: &str) -> Result<bool, StoreError> {
		let mut txn = self
			.begin_write(&[TableId::ChangeLog, TableId::ExecuteQueue, TableId::UploadQueue])
			.await?;
		self.execute_queue.remove(txn.conn(), change_id).await?;
		self.upload_queue.remove_change(txn.conn(), change_id).await?;
		let removed = self.change_log.delete(txn.conn(), change_id).await?;
		txn.commit().await?;
		Ok(removed)
	}

	pub async fn queue_depths(&self) -> Result<QueueDepths, StoreError> {
		let mut conn = self.read().await?;
		Ok(QueueDepths {
			change_log: self.change_log.count(&mut conn).await?,
			execute_queue: self.execute_queue.len(&mut conn).await?,
			upload_queue: self.upload_queue.len(&mut conn).await?,
		})
	}

	pub async fn snapshot(&self) -> Result<MaterializedSnapshot, StoreError> {
		let mut conn = self.read().await?;
		Ok(MaterializedSnapshot {
			instances: self.instances.all(&mut conn).await?,
			contacts: self.contacts.all(&mut conn).await?,
			contact_numbers: self.contact_numbers.all(&mut conn).await?,
			trusted_numbers: self.trusted_numbers.all(&mut conn).await?,
		})
	}
}
