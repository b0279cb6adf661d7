use sqlx::FromRow;
use sqlx::sqlite::SqliteConnection;

use super::{StoreError, TableLock};

/// A change waiting to be applied to the materialized tables.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ExecuteQueueEntry {
	pub change_id: String,
	pub create_time: i64,
}

/// Work list of changes not yet applied on this device. FIFO by
/// `create_time`, ties broken by insertion order.
#[derive(Debug)]
pub struct ExecuteQueueTable {
	lock: TableLock,
}

impl ExecuteQueueTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	/// Enqueue a change. Returns `false` if it was already queued.
	pub async fn push(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
		create_time: i64,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"INSERT INTO execute_queue (change_id, create_time) VALUES (?, ?) \
			ON CONFLICT (change_id) DO NOTHING",
		)
		.bind(change_id)
		.bind(create_time)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn oldest(
		&self,
		conn: &mut SqliteConnection,
	) -> Result<Option<ExecuteQueueEntry>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT change_id, create_time FROM execute_queue \
			ORDER BY create_time ASC, rowid ASC LIMIT 1",
		)
		.fetch_optional(&mut *conn)
		.await?)
	}

	/// Every queued entry in execution order.
	pub async fn entries(
		&self,
		conn: &mut SqliteConnection,
	) -> Result<Vec<ExecuteQueueEntry>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT change_id, create_time FROM execute_queue \
			ORDER BY create_time ASC, rowid ASC",
		)
		.fetch_all(&mut *conn)
		.await?)
	}

	pub async fn contains(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let found: Option<i64> =
			sqlx::query_scalar("SELECT 1 FROM execute_queue WHERE change_id = ?")
				.bind(change_id)
				.fetch_optional(&mut *conn)
				.await?;
		Ok(found.is_some())
	}

	pub async fn remove(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM execute_queue WHERE change_id = ?")
			.bind(change_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn len(&self, conn: &mut SqliteConnection) -> Result<i64, StoreError> {
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM execute_queue")
			.fetch_one(&mut *conn)
			.await?;
		Ok(count)
	}
}

/// A locally-originated change waiting for server acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UploadQueueEntry {
	pub row_id: i64,
	pub change_id: String,
	pub create_time: i64,
	pub error_count: i64,
}

/// Work list of local changes not yet acknowledged by the authority. Strict
/// FIFO by `row_id`, which is never reused.
#[derive(Debug)]
pub struct UploadQueueTable {
	lock: TableLock,
}

impl UploadQueueTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	/// Enqueue a change. Returns `false` if it was already queued.
	pub async fn push(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
		create_time: i64,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"INSERT INTO upload_queue (change_id, create_time) VALUES (?, ?) \
			ON CONFLICT (change_id) DO NOTHING",
		)
		.bind(change_id)
		.bind(create_time)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	/// Up to `limit` entries from the head of the queue.
	pub async fn head(
		&self,
		conn: &mut SqliteConnection,
		limit: i64,
	) -> Result<Vec<UploadQueueEntry>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT row_id, change_id, create_time, error_count FROM upload_queue \
			ORDER BY row_id ASC LIMIT ?",
		)
		.bind(limit)
		.fetch_all(&mut *conn)
		.await?)
	}

	pub async fn contains(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM upload_queue WHERE change_id = ?")
			.bind(change_id)
			.fetch_optional(&mut *conn)
			.await?;
		Ok(found.is_some())
	}

	/// Acknowledge every row up to and including `row_id`.
	pub async fn remove_through(
		&self,
		conn: &mut SqliteConnection,
		row_id: i64,
	) -> Result<u64, StoreError> {
		let result = sqlx::query("DELETE FROM upload_queue WHERE row_id <= ?")
			.bind(row_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected())
	}

	/// Acknowledge every row strictly before `row_id`.
	pub async fn remove_before(
		&self,
		conn: &mut SqliteConnection,
		row_id: i64,
	) -> Result<u64, StoreError> {
		let result = sqlx::query("DELETE FROM upload_queue WHERE row_id < ?")
			.bind(row_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected())
	}

	pub async fn increment_error_count(
		&self,
		conn: &mut SqliteConnection,
		row_id: i64,
	) -> Result<(), StoreError> {
		sqlx::query("UPDATE upload_queue SET error_count = error_count + 1 WHERE row_id = ?")
			.bind(row_id)
			.execute(&mut *conn)
			.await?;
		Ok(())
	}

	pub(super) async fn remove_change(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM upload_queue WHERE change_id = ?")
			.bind(change_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn len(&self, conn: &mut SqliteConnection) -> Result<i64, StoreError> {
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_queue")
			.fetch_one(&mut *conn)
			.await?;
		Ok(count)
	}
}
