//! Precedence between concurrent writes to the same contact number.
//!
//! Two devices may update the same `(contact_id, number)` row. The row keeps
//! the write with the highest version counter; equal counters fall to the
//! later change time. An incoming write without a counter always applies.

use crate::store::ContactNumberRow;

/// Version stamp of one contact-number write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
	/// Version counter carried by the change, if any
	pub version: Option<i64>,
	/// Change time (Unix epoch milliseconds)
	pub change_time: i64,
}

impl VersionStamp {
	pub fn new(version: Option<i64>, change_time: i64) -> Self {
		Self {
			version,
			change_time,
		}
	}

	/// Stamp of a row already materialized.
	pub fn of_row(row: &ContactNumberRow) -> Self {
		Self {
			version: Some(row.version),
			change_time: row.change_time,
		}
	}

	/// Whether a write stamped `self` may overwrite a row stamped `stored`.
	pub fn supersedes(&self, stored: &VersionStamp) -> bool {
		match (self.version, stored.version) {
			(None, _) => true,
			(Some(_), None) => true,
			(Some(incoming), Some(current)) if incoming != current => incoming > current,
			// Tie-break on change time for deterministic replay
			_ => self.change_time >= stored.change_time,
		}
	}
}
