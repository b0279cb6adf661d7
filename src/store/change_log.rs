use sqlx::FromRow;
use sqlx::sqlite::SqliteConnection;

use super::{StoreError, TableLock};
use crate::sync::change::{Change, ChangeData, ChangeType};

/// Stored form of a [`Change`]; the payload is kept as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct ChangeRow {
	pub change_id: String,
	pub origin_instance: Option<String>,
	pub change_time: i64,
	pub change_type: String,
	pub data: String,
	pub server_sequence: Option<i64>,
	pub error_count: i64,
}

impl TryFrom<ChangeRow> for Change {
	type Error = StoreError;

	fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
		let data: ChangeData = serde_json::from_str(&row.data)?;
		Ok(Change {
			change_id: row.change_id,
			origin_instance: row.origin_instance,
			change_time: row.change_time,
			change_type: ChangeType::from_name(&row.change_type),
			data,
			server_sequence: row.server_sequence,
			error_count: row.error_count,
		})
	}
}

const SELECT_CHANGE: &str = "SELECT change_id, origin_instance, change_time, change_type, data, \
	server_sequence, error_count FROM change_log";

/// Append-only log of every change this replica has seen.
#[derive(Debug)]
pub struct ChangeLogTable {
	lock: TableLock,
}

impl ChangeLogTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	/// Append `change`. Returns `false` when a change with the same id is
	/// already logged, in which case nothing is written.
	pub async fn insert(
		&self,
		conn: &mut SqliteConnection,
		change: &Change,
	) -> Result<bool, StoreError> {
		let data = serde_json::to_string(&change.data)?;
		let result = sqlx::query(
			"INSERT INTO change_log \
			(change_id, origin_instance, change_time, change_type, data, server_sequence, error_count) \
			VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (change_id) DO NOTHING",
		)
		.bind(&change.change_id)
		.bind(&change.origin_instance)
		.bind(change.change_time)
		.bind(change.change_type.as_str())
		.bind(data)
		.bind(change.server_sequence)
		.bind(change.error_count)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn get(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<Option<Change>, StoreError> {
		let row: Option<ChangeRow> = sqlx::query_as(&format!("{} WHERE change_id = ?", SELECT_CHANGE))
			.bind(change_id)
			.fetch_optional(&mut *conn)
			.await?;
		row.map(Change::try_from).transpose()
	}

	/// Stamp the authority sequence on an already-logged change. A sequence
	/// is only ever set once.
	pub async fn stamp_server_sequence(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
		server_sequence: i64,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE change_log SET server_sequence = ? \
			WHERE change_id = ? AND server_sequence IS NULL",
		)
		.bind(server_sequence)
		.bind(change_id)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn increment_error_count(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<(), StoreError> {
		sqlx::query("UPDATE change_log SET error_count = error_count + 1 WHERE change_id = ?")
			.bind(change_id)
			.execute(&mut *conn)
			.await?;
		Ok(())
	}

	pub async fn decrement_error_count(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<(), StoreError> {
		sqlx::query(
			"UPDATE change_log SET error_count = error_count - 1 \
			WHERE change_id = ? AND error_count > 0",
		)
		.bind(change_id)
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	/// Download cursor: highest authority sequence seen, 0 when none.
	pub async fn max_server_sequence(&self, conn: &mut SqliteConnection) -> Result<i64, StoreError> {
		let max: Option<i64> = sqlx::query_scalar("SELECT MAX(server_sequence) FROM change_log")
			.fetch_one(&mut *conn)
			.await?;
		Ok(max.unwrap_or(0))
	}

	/// Changes already applied (logged but no longer in the execute queue),
	/// in replay order.
	pub async fn applied_in_replay_order(
		&self,
		conn: &mut SqliteConnection,
	) -> Result<Vec<Change>, StoreError> {
		let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
			"{} WHERE change_id NOT IN (SELECT change_id FROM execute_queue) \
			ORDER BY change_time ASC, rowid ASC",
			SELECT_CHANGE
		))
		.fetch_all(&mut *conn)
		.await?;
		rows.into_iter().map(Change::try_from).collect()
	}

	/// Whether an applied change sorts after `change_id` in replay order.
	pub async fn applied_after(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let later: i64 = sqlx::query_scalar(
			"SELECT EXISTS (SELECT 1 FROM change_log AS c, change_log AS t \
			WHERE t.change_id = ? AND c.change_id <> t.change_id \
			AND c.change_id NOT IN (SELECT change_id FROM execute_queue) \
			AND (c.change_time > t.change_time \
			OR (c.change_time = t.change_time AND c.rowid > t.rowid)))",
		)
		.bind(change_id)
		.fetch_one(&mut *conn)
		.await?;
		Ok(later != 0)
	}

	/// Queued changes whose error count reached `threshold`.
	pub async fn stuck(
		&self,
		conn: &mut SqliteConnection,
		threshold: i64,
	) -> Result<Vec<Change>, StoreError> {
		let rows: Vec<ChangeRow> = sqlx::query_as(&format!(
			"{} WHERE error_count >= ? AND change_id IN (SELECT change_id FROM execute_queue) \
			ORDER BY error_count DESC, change_time ASC",
			SELECT_CHANGE
		))
		.bind(threshold)
		.fetch_all(&mut *conn)
		.await?;
		rows.into_iter().map(Change::try_from).collect()
	}

	pub async fn count(&self, conn: &mut SqliteConnection) -> Result<i64, StoreError> {
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_log")
			.fetch_one(&mut *conn)
			.await?;
		Ok(count)
	}

	/// Delete a logged change. Callers remove referencing queue rows first
	/// (see `Store::purge_change`).
	pub(super) async fn delete(
		&self,
		conn: &mut SqliteConnection,
		change_id: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM change_log WHERE change_id = ?")
			.bind(change_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}
}
