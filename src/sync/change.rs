use serde::{Deserialize, Serialize};

use crate::normalizers::{NormalizerError, canonical_or_raw, normalize_number};

/// Kind of mutation a [`Change`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
	ContactInsert,
	ContactUpdate,
	ContactDelete,
	ContactNumberInsert,
	ContactNumberUpdate,
	ContactNumberDelete,
	InstanceInsert,
	InstanceDelete,
	NumberClassify,
	/// A type this replica does not understand. Never produced locally.
	#[serde(other)]
	Unknown,
}

impl ChangeType {
	pub fn as_str(self) -> &'static str {
		match self {
			ChangeType::ContactInsert => "contact_insert",
			ChangeType::ContactUpdate => "contact_update",
			ChangeType::ContactDelete => "contact_delete",
			ChangeType::ContactNumberInsert => "contact_number_insert",
			ChangeType::ContactNumberUpdate => "contact_number_update",
			ChangeType::ContactNumberDelete => "contact_number_delete",
			ChangeType::InstanceInsert => "instance_insert",
			ChangeType::InstanceDelete => "instance_delete",
			ChangeType::NumberClassify => "number_classify",
			ChangeType::Unknown => "unknown",
		}
	}

	/// Payload fields (wire names) a change of this type cannot do without.
	pub fn required_fields(self) -> &'static [&'static str] {
		match self {
			ChangeType::ContactInsert => &["contactId", "parentNumber"],
			ChangeType::ContactUpdate | ChangeType::ContactDelete => &["contactId"],
			ChangeType::ContactNumberInsert | ChangeType::ContactNumberDelete => {
				&["contactId", "number"]
			}
			ChangeType::ContactNumberUpdate => &["contactId", "oldNumber"],
			ChangeType::InstanceInsert | ChangeType::InstanceDelete => &["number"],
			ChangeType::NumberClassify => &["number", "classification"],
			ChangeType::Unknown => &[],
		}
	}

	/// Parse the stored/wire name; unrecognized names map to `Unknown`.
	pub fn from_name(name: &str) -> Self {
		match name {
			"contact_insert" => ChangeType::ContactInsert,
			"contact_update" => ChangeType::ContactUpdate,
			"contact_delete" => ChangeType::ContactDelete,
			"contact_number_insert" => ChangeType::ContactNumberInsert,
			"contact_number_update" => ChangeType::ContactNumberUpdate,
			"contact_number_delete" => ChangeType::ContactNumberDelete,
			"instance_insert" => ChangeType::InstanceInsert,
			"instance_delete" => ChangeType::InstanceDelete,
			"number_classify" => ChangeType::NumberClassify,
			_ => ChangeType::Unknown,
		}
	}
}

impl std::fmt::Display for ChangeType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Payload of a change. Only the fields relevant to the change type are set;
/// which of them are required is enforced when the change is executed, so a
/// payload written by a remote device with a missing field is still logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeData {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub contact_id: Option<String>,
	/// Instance number owning a contact
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_number: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub blocked: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub number: Option<String>,
	/// Composite-key number a contact-number update targets
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub old_number: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub classification: Option<String>,
}

impl ChangeData {
	pub fn contact_insert(
		contact_id: impl Into<String>,
		parent_number: impl Into<String>,
		display_name: Option<String>,
	) -> (ChangeType, Self) {
		(
			ChangeType::ContactInsert,
			Self {
				contact_id: Some(contact_id.into()),
				parent_number: Some(parent_number.into()),
				display_name,
				..Self::default()
			},
		)
	}

	pub fn contact_update(
		contact_id: impl Into<String>,
		display_name: Option<String>,
		blocked: Option<bool>,
	) -> (ChangeType, Self) {
		(
			ChangeType::ContactUpdate,
			Self {
				contact_id: Some(contact_id.into()),
				display_name,
				blocked,
				..Self::default()
			},
		)
	}

	pub fn contact_delete(contact_id: impl Into<String>) -> (ChangeType, Self) {
		(
			ChangeType::ContactDelete,
			Self {
				contact_id: Some(contact_id.into()),
				..Self::default()
			},
		)
	}

	pub fn contact_number_insert(
		contact_id: impl Into<String>,
		number: impl Into<String>,
		label: Option<String>,
		version: i64,
	) -> (ChangeType, Self) {
		(
			ChangeType::ContactNumberInsert,
			Self {
				contact_id: Some(contact_id.into()),
				number: Some(number.into()),
				label,
				version: Some(version),
				..Self::default()
			},
		)
	}

	/// Update the number row keyed by `(contact_id, old_number)`; a different
	/// `number` renames it.
	pub fn contact_number_update(
		contact_id: impl Into<String>,
		old_number: impl Into<String>,
		number: Option<String>,
		label: Option<String>,
		version: Option<i64>,
	) -> (ChangeType, Self) {
		(
			ChangeType::ContactNumberUpdate,
			Self {
				contact_id: Some(contact_id.into()),
				old_number: Some(old_number.into()),
				number,
				label,
				version,
				..Self::default()
			},
		)
	}

	pub fn contact_number_delete(
		contact_id: impl Into<String>,
		number: impl Into<String>,
	) -> (ChangeType, Self) {
		(
			ChangeType::ContactNumberDelete,
			Self {
				contact_id: Some(contact_id.into()),
				number: Some(number.into()),
				..Self::default()
			},
		)
	}

	pub fn instance_insert(number: impl Into<String>) -> (ChangeType, Self) {
		(
			ChangeType::InstanceInsert,
			Self {
				number: Some(number.into()),
				..Self::default()
			},
		)
	}

	pub fn instance_delete(number: impl Into<String>) -> (ChangeType, Self) {
		(
			ChangeType::InstanceDelete,
			Self {
				number: Some(number.into()),
				..Self::default()
			},
		)
	}

	pub fn number_classify(
		number: impl Into<String>,
		classification: impl Into<String>,
	) -> (ChangeType, Self) {
		(
			ChangeType::NumberClassify,
			Self {
				number: Some(number.into()),
				classification: Some(classification.into()),
				..Self::default()
			},
		)
	}

	/// Canonicalize every number field, failing on the first that cannot be
	/// normalized.
	pub fn normalize_strict(&mut self) -> Result<(), NormalizerError> {
		for field in self.number_fields_mut() {
			if let Some(value) = field.as_mut() {
				*value = normalize_number(value)?.canonical;
			}
		}
		Ok(())
	}

	/// Canonicalize every number field, keeping values that cannot be
	/// normalized verbatim.
	pub fn normalize_lenient(&mut self) {
		for field in self.number_fields_mut() {
			if let Some(value) = field.as_mut() {
				*value = canonical_or_raw(value);
			}
		}
	}

	/// Whether the field with wire name `field` is set.
	pub fn has(&self, field: &str) -> bool {
		match field {
			"contactId" => self.contact_id.is_some(),
			"parentNumber" => self.parent_number.is_some(),
			"displayName" => self.display_name.is_some(),
			"blocked" => self.blocked.is_some(),
			"number" => self.number.is_some(),
			"oldNumber" => self.old_number.is_some(),
			"label" => self.label.is_some(),
			"version" => self.version.is_some(),
			"classification" => self.classification.is_some(),
			_ => false,
		}
	}

	fn number_fields_mut(&mut self) -> [&mut Option<String>; 3] {
		[
			&mut self.parent_number,
			&mut self.number,
			&mut self.old_number,
		]
	}
}

/// Immutable record of one mutation intent; the unit of replication.
///
/// Serialized field names follow the authority's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
	/// Unique, client-generated identifier
	#[serde(rename = "changeID")]
	pub change_id: String,
	/// Instance that originated the change, if known
	#[serde(rename = "instanceNumber", default)]
	pub origin_instance: Option<String>,
	/// When the change was made (Unix epoch milliseconds)
	#[serde(rename = "changeTime")]
	pub change_time: i64,
	#[serde(rename = "changeType")]
	pub change_type: ChangeType,
	#[serde(default)]
	pub data: ChangeData,
	/// Authority-assigned sequence, set once the server accepted the change
	#[serde(
		rename = "serverChangeID",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub server_sequence: Option<i64>,
	/// Failed or interrupted execution attempts; local bookkeeping only
	#[serde(skip)]
	pub error_count: i64,
}

impl Change {
	/// First reason this change can never be applied, if any.
	pub fn defect(&self) -> Option<String> {
		if self.change_type == ChangeType::Unknown {
			return Some("unknown change type".to_string());
		}
		self.change_type
			.required_fields()
			.iter()
			.find(|f| !self.data.has(f))
			.map(|f| format!("{} change is missing `{}`", self.change_type, f))
	}
}
