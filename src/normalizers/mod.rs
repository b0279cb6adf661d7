//! Canonicalizers for phone numbers.
//!
//! Every number that enters the change log goes through [`normalize_number`]
//! first, so materialized rows keyed by number (instances, contact numbers,
//! trusted numbers) compare equal regardless of how the dialer or the
//! authority formatted them.
//!
//! ## Versioning and Stability
//!
//! The output carries the algorithm version. Changing the canonical form in a
//! backward-incompatible way requires bumping the version because replicas
//! key rows by the canonical string.
//!
//! Current versions:
//! - Number normalization: v1

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Shortest and longest digit runs accepted (E.164 caps numbers at 15 digits;
/// short codes go down to 3).
const MIN_DIGITS: usize = 3;
const MAX_DIGITS: usize = 15;

/// Separators dialers and address books put inside numbers.
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"[\s\-\.\(\)/]").expect("separator pattern is a valid regex")
});

/// Errors that can occur during normalization.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizerError {
	#[error("empty phone number")]
	Empty,
	#[error("invalid phone number: {0}")]
	InvalidNumber(String),
	#[error("phone number has {digits} digits, expected 3..=15: {input}")]
	InvalidLength { input: String, digits: usize },
}

/// Normalized phone number with version tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedNumber {
	/// Canonical form: optional leading `+` followed by digits only
	pub canonical: String,
	/// Whether the number carries an international prefix
	pub international: bool,
	/// Normalization algorithm version
	pub version: u32,
}

/// Normalize a phone number to its canonical form.
///
/// Separators (spaces, dashes, dots, parentheses, slashes) are removed, a
/// leading `00` international access code is rewritten to `+`, and anything
/// else that is not a digit is rejected.
///
/// # Examples
///
/// ```
/// use vanopticon_dialsync::normalizers::normalize_number;
///
/// let n = normalize_number("+1 (555) 010-9999").unwrap();
/// assert_eq!(n.canonical, "+15550109999");
///
/// let n = normalize_number("0044 20 7946 0000").unwrap();
/// assert_eq!(n.canonical, "+442079460000");
/// assert!(n.international);
/// ```
pub fn normalize_number(input: &str) -> Result<NormalizedNumber, NormalizerError> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(NormalizerError::Empty);
	}

	let stripped = SEPARATORS.replace_all(trimmed, "");

	let (international, digits) = if let Some(rest) = stripped.strip_prefix('+') {
		(true, rest)
	} else if let Some(rest) = stripped.strip_prefix("00") {
		(true, rest)
	} else {
		(false, &stripped[..])
	};

	if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
		return Err(NormalizerError::InvalidNumber(input.to_string()));
	}

	if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
		return Err(NormalizerError::InvalidLength {
			input: input.to_string(),
			digits: digits.len(),
		});
	}

	let canonical = if international {
		format!("+{}", digits)
	} else {
		digits.to_string()
	};

	Ok(NormalizedNumber {
		canonical,
		international,
		version: 1,
	})
}

/// Canonical string for `input`, or `input` unchanged when it cannot be
/// normalized. Used for server payloads, which are stored even when a remote
/// device wrote a number this replica would reject.
pub fn canonical_or_raw(input: &str) -> String {
	match normalize_number(input) {
		Ok(n) => n.canonical,
		Err(e) => {
			log::warn!("keeping unnormalized number from server payload: {}", e);
			input.to_string()
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_normalize_plain_digits() {
		let result = normalize_number("5550109").unwrap();
		assert_eq!(result.canonical, "5550109");
		assert_eq!(result.version, 1);
		assert!(!result.international);
	}

	#[test]
	fn test_normalize_strips_separators() {
		let result = normalize_number(" (555) 010.99-99 ").unwrap();
		assert_eq!(result.canonical, "5550109999");
	}

	#[test]
	fn test_normalize_international_plus() {
		let result = normalize_number("+1 555 010 9999").unwrap();
		assert_eq!(result.canonical, "+15550109999");
		assert!(result.international);
	}

	#[test]
	fn test_normalize_double_zero_prefix() {
		let result = normalize_number("0049 30 123456").unwrap();
		assert_eq!(result.canonical, "+4930123456");
	}

	#[test]
	fn test_normalize_is_idempotent() {
		let once = normalize_number("+44 (20) 7946-0000").unwrap();
		let twice = normalize_number(&once.canonical).unwrap();
		assert_eq!(once, twice);
	}

	#[test]
	fn test_normalize_rejects_letters() {
		assert!(matches!(
			normalize_number("1-800-FLOWERS"),
			Err(NormalizerError::InvalidNumber(_))
		));
	}

	#[test]
	fn test_normalize_rejects_empty() {
		assert_eq!(normalize_number("   "), Err(NormalizerError::Empty));
		assert!(normalize_number("+").is_err());
	}

	#[test]
	fn test_normalize_rejects_bad_length() {
		assert!(matches!(
			normalize_number("12"),
			Err(NormalizerError::InvalidLength { digits: 2, .. })
		));
		assert!(normalize_number("1234567890123456").is_err());
	}

	#[test]
	fn test_canonical_or_raw_falls_back() {
		assert_eq!(canonical_or_raw("+1 555 0100"), "+15550100");
		assert_eq!(canonical_or_raw("anonymous"), "anonymous");
	}
}
