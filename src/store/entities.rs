//! Materialized entity tables. Only the execute agent writes these.

use sqlx::FromRow;
use sqlx::sqlite::SqliteConnection;

use super::{StoreError, TableLock};

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct InstanceRow {
	pub number: String,
	pub create_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContactRow {
	pub contact_id: String,
	pub instance_number: String,
	pub display_name: Option<String>,
	pub blocked: bool,
	pub change_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ContactNumberRow {
	pub contact_id: String,
	pub number: String,
	pub label: Option<String>,
	pub version: i64,
	pub change_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TrustedNumberRow {
	pub number: String,
	/// How many instance/contact-number rows reference this number
	pub confidence: i64,
	pub classification: Option<String>,
}

/// The device instance record(s), keyed by normalized number.
#[derive(Debug)]
pub struct InstanceTable {
	lock: TableLock,
}

impl InstanceTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	/// Returns `false` if the instance already existed.
	pub async fn insert(
		&self,
		conn: &mut SqliteConnection,
		number: &str,
		create_time: i64,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"INSERT INTO instance (number, create_time) VALUES (?, ?) \
			ON CONFLICT (number) DO NOTHING",
		)
		.bind(number)
		.bind(create_time)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn delete(&self, conn: &mut SqliteConnection, number: &str) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM instance WHERE number = ?")
			.bind(number)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn all(&self, conn: &mut SqliteConnection) -> Result<Vec<InstanceRow>, StoreError> {
		Ok(sqlx::query_as("SELECT number, create_time FROM instance ORDER BY number")
			.fetch_all(&mut *conn)
			.await?)
	}

	pub(crate) async fn clear(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM instance").execute(&mut *conn).await?;
		Ok(())
	}
}

const SELECT_CONTACT: &str =
	"SELECT contact_id, instance_number, display_name, blocked, change_time FROM contact";

#[derive(Debug)]
pub struct ContactTable {
	lock: TableLock,
}

impl ContactTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	/// Insert `row`, overwriting an existing contact with the same id.
	pub async fn upsert(&self, conn: &mut SqliteConnection, row: &ContactRow) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO contact (contact_id, instance_number, display_name, blocked, change_time) \
			VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT (contact_id) DO UPDATE SET \
			instance_number = excluded.instance_number, \
			display_name = excluded.display_name, \
			blocked = excluded.blocked, \
			change_time = excluded.change_time",
		)
		.bind(&row.contact_id)
		.bind(&row.instance_number)
		.bind(&row.display_name)
		.bind(row.blocked)
		.bind(row.change_time)
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	/// Update the mutable fields that are `Some`. Returns `false` when no
	/// contact has that id.
	pub async fn update(
		&self,
		conn: &mut SqliteConnection,
		contact_id: &str,
		display_name: Option<&str>,
		blocked: Option<bool>,
		change_time: i64,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE contact SET \
			display_name = COALESCE(?, display_name), \
			blocked = COALESCE(?, blocked), \
			change_time = ? \
			WHERE contact_id = ?",
		)
		.bind(display_name)
		.bind(blocked)
		.bind(change_time)
		.bind(contact_id)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn delete(&self, conn: &mut SqliteConnection, contact_id: &str) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM contact WHERE contact_id = ?")
			.bind(contact_id)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn get(
		&self,
		conn: &mut SqliteConnection,
		contact_id: &str,
	) -> Result<Option<ContactRow>, StoreError> {
		Ok(sqlx::query_as(&format!("{} WHERE contact_id = ?", SELECT_CONTACT))
			.bind(contact_id)
			.fetch_optional(&mut *conn)
			.await?)
	}

	pub async fn owned_by(
		&self,
		conn: &mut SqliteConnection,
		instance_number: &str,
	) -> Result<Vec<ContactRow>, StoreError> {
		Ok(
			sqlx::query_as(&format!(
				"{} WHERE instance_number = ? ORDER BY contact_id",
				SELECT_CONTACT
			))
			.bind(instance_number)
			.fetch_all(&mut *conn)
			.await?,
		)
	}

	pub async fn all(&self, conn: &mut SqliteConnection) -> Result<Vec<ContactRow>, StoreError> {
		Ok(sqlx::query_as(&format!("{} ORDER BY contact_id", SELECT_CONTACT))
			.fetch_all(&mut *conn)
			.await?)
	}

	pub(crate) async fn clear(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM contact").execute(&mut *conn).await?;
		Ok(())
	}
}

const SELECT_CONTACT_NUMBER: &str =
	"SELECT contact_id, number, label, version, change_time FROM contact_number";

/// Numbers attached to contacts, keyed by `(contact_id, number)`.
#[derive(Debug)]
pub struct ContactNumberTable {
	lock: TableLock,
}

impl ContactNumberTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	pub async fn get(
		&self,
		conn: &mut SqliteConnection,
		contact_id: &str,
		number: &str,
	) -> Result<Option<ContactNumberRow>, StoreError> {
		Ok(sqlx::query_as(&format!(
			"{} WHERE contact_id = ? AND number = ?",
			SELECT_CONTACT_NUMBER
		))
		.bind(contact_id)
		.bind(number)
		.fetch_optional(&mut *conn)
		.await?)
	}

	/// Returns `false` if a row with the same key already existed; the
	/// existing row is left untouched in that case.
	pub async fn insert(
		&self,
		conn: &mut SqliteConnection,
		row: &ContactNumberRow,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"INSERT INTO contact_number (contact_id, number, label, version, change_time) \
			VALUES (?, ?, ?, ?, ?) ON CONFLICT (contact_id, number) DO NOTHING",
		)
		.bind(&row.contact_id)
		.bind(&row.number)
		.bind(&row.label)
		.bind(row.version)
		.bind(row.change_time)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	/// Rewrite the row keyed by `(contact_id, old_number)` with the
	/// contents of `row` (which may carry a different number).
	pub async fn replace(
		&self,
		conn: &mut SqliteConnection,
		old_number: &str,
		row: &ContactNumberRow,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE contact_number SET number = ?, label = ?, version = ?, change_time = ? \
			WHERE contact_id = ? AND number = ?",
		)
		.bind(&row.number)
		.bind(&row.label)
		.bind(row.version)
		.bind(row.change_time)
		.bind(&row.contact_id)
		.bind(old_number)
		.execute(&mut *conn)
		.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn delete(
		&self,
		conn: &mut SqliteConnection,
		contact_id: &str,
		number: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM contact_number WHERE contact_id = ? AND number = ?")
			.bind(contact_id)
			.bind(number)
			.execute(&mut *conn)
			.await?;
		Ok(result.rows_affected() == 1)
	}

	pub async fn for_contact(
		&self,
		conn: &mut SqliteConnection,
		contact_id: &str,
	) -> Result<Vec<ContactNumberRow>, StoreError> {
		Ok(sqlx::query_as(&format!(
			"{} WHERE contact_id = ? ORDER BY number",
			SELECT_CONTACT_NUMBER
		))
		.bind(contact_id)
		.fetch_all(&mut *conn)
		.await?)
	}

	/// Number rows whose contact belongs to `instance_number`.
	pub async fn owned_by(
		&self,
		conn: &mut SqliteConnection,
		instance_number: &str,
	) -> Result<Vec<ContactNumberRow>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT n.contact_id, n.number, n.label, n.version, n.change_time \
			FROM contact_number n JOIN contact c ON c.contact_id = n.contact_id \
			WHERE c.instance_number = ? ORDER BY n.contact_id, n.number",
		)
		.bind(instance_number)
		.fetch_all(&mut *conn)
		.await?)
	}

	pub async fn all(&self, conn: &mut SqliteConnection) -> Result<Vec<ContactNumberRow>, StoreError> {
		Ok(sqlx::query_as(&format!(
			"{} ORDER BY contact_id, number",
			SELECT_CONTACT_NUMBER
		))
		.fetch_all(&mut *conn)
		.await?)
	}

	pub(crate) async fn clear(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM contact_number").execute(&mut *conn).await?;
		Ok(())
	}
}

/// Trust/classification tracking per number.
///
/// `confidence` counts the instance and contact-number rows referencing the
/// number. A row is dropped once nothing references it and it carries no
/// classification.
#[derive(Debug)]
pub struct TrustedNumberTable {
	lock: TableLock,
}

impl TrustedNumberTable {
	pub(super) fn new(lock: TableLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &TableLock {
		&self.lock
	}

	pub async fn attach(&self, conn: &mut SqliteConnection, number: &str) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO trusted_number (number, confidence) VALUES (?, 1) \
			ON CONFLICT (number) DO UPDATE SET confidence = confidence + 1",
		)
		.bind(number)
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	pub async fn detach(&self, conn: &mut SqliteConnection, number: &str) -> Result<(), StoreError> {
		sqlx::query(
			"UPDATE trusted_number SET confidence = confidence - 1 \
			WHERE number = ? AND confidence > 0",
		)
		.bind(number)
		.execute(&mut *conn)
		.await?;
		sqlx::query(
			"DELETE FROM trusted_number \
			WHERE number = ? AND confidence <= 0 AND classification IS NULL",
		)
		.bind(number)
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	pub async fn classify(
		&self,
		conn: &mut SqliteConnection,
		number: &str,
		classification: &str,
	) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO trusted_number (number, confidence, classification) VALUES (?, 0, ?) \
			ON CONFLICT (number) DO UPDATE SET classification = excluded.classification",
		)
		.bind(number)
		.bind(classification)
		.execute(&mut *conn)
		.await?;
		Ok(())
	}

	pub async fn get(
		&self,
		conn: &mut SqliteConnection,
		number: &str,
	) -> Result<Option<TrustedNumberRow>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT number, confidence, classification FROM trusted_number WHERE number = ?",
		)
		.bind(number)
		.fetch_optional(&mut *conn)
		.await?)
	}

	pub async fn all(&self, conn: &mut SqliteConnection) -> Result<Vec<TrustedNumberRow>, StoreError> {
		Ok(sqlx::query_as(
			"SELECT number, confidence, classification FROM trusted_number ORDER BY number",
		)
		.fetch_all(&mut *conn)
		.await?)
	}

	pub(crate) async fn clear(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM trusted_number").execute(&mut *conn).await?;
		Ok(())
	}
}
