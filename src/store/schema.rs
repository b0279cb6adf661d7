/// Replica schema, applied in order on every open. Statements are idempotent.
pub(super) const SCHEMA: &[&str] = &[
	"CREATE TABLE IF NOT EXISTS change_log (
		change_id TEXT PRIMARY KEY NOT NULL,
		origin_instance TEXT,
		change_time INTEGER NOT NULL,
		change_type TEXT NOT NULL,
		data TEXT NOT NULL,
		server_sequence INTEGER,
		error_count INTEGER NOT NULL DEFAULT 0
	)",
	"CREATE INDEX IF NOT EXISTS idx_change_log_server_sequence
		ON change_log (server_sequence)",
	"CREATE INDEX IF NOT EXISTS idx_change_log_change_time
		ON change_log (change_time)",
	"CREATE TABLE IF NOT EXISTS execute_queue (
		change_id TEXT PRIMARY KEY NOT NULL
			REFERENCES change_log (change_id) ON DELETE CASCADE,
		create_time INTEGER NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_execute_queue_create_time
		ON execute_queue (create_time)",
	// AUTOINCREMENT keeps row ids from being reused after the tail of the
	// queue is acknowledged; the upload watermark relies on that.
	"CREATE TABLE IF NOT EXISTS upload_queue (
		row_id INTEGER PRIMARY KEY AUTOINCREMENT,
		change_id TEXT NOT NULL UNIQUE
			REFERENCES change_log (change_id) ON DELETE CASCADE,
		create_time INTEGER NOT NULL,
		error_count INTEGER NOT NULL DEFAULT 0
	)",
	"CREATE TABLE IF NOT EXISTS instance (
		number TEXT PRIMARY KEY NOT NULL,
		create_time INTEGER NOT NULL
	)",
	"CREATE TABLE IF NOT EXISTS contact (
		contact_id TEXT PRIMARY KEY NOT NULL,
		instance_number TEXT NOT NULL,
		display_name TEXT,
		blocked INTEGER NOT NULL DEFAULT 0,
		change_time INTEGER NOT NULL
	)",
	"CREATE INDEX IF NOT EXISTS idx_contact_instance
		ON contact (instance_number)",
	"CREATE TABLE IF NOT EXISTS contact_number (
		contact_id TEXT NOT NULL,
		number TEXT NOT NULL,
		label TEXT,
		version INTEGER NOT NULL DEFAULT 0,
		change_time INTEGER NOT NULL,
		PRIMARY KEY (contact_id, number)
	)",
	"CREATE TABLE IF NOT EXISTS trusted_number (
		number TEXT PRIMARY KEY NOT NULL,
		confidence INTEGER NOT NULL DEFAULT 0,
		classification TEXT
	)",
];
