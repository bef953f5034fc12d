use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::BackupError;

/// A reduced consumer record, holding just what the backup needs.
///
/// Key and value are carried base64-encoded so the record serialises to JSON
/// regardless of the payload bytes. The timestamp is epoch millis and is the
/// sole input to bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
	pub topic: String,
	pub partition: i32,
	pub offset: i64,
	pub key: Option<String>,
	pub value: Option<String>,
	pub timestamp: i64,
}

impl Record {
	/// Compact JSON encoding, no whitespace.
	///
	/// The encoder is total over this struct; a failure here means an
	/// internal invariant broke, not bad input.
	pub fn to_json(&self) -> Result<Bytes, BackupError> {
		serde_json::to_vec(self)
			.map(Bytes::from)
			.map_err(|err| BackupError::UnhandledStreamCase(format!("record serialization: {err}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(timestamp: i64) -> Record {
		Record {
			topic: "events".into(),
			partition: 0,
			offset: 7,
			key: Some("a2V5".into()),
			value: Some("dmFsdWU=".into()),
			timestamp,
		}
	}

	#[test]
	fn json_is_compact_with_timestamp_last() {
		let json = record(1_000).to_json().unwrap();
		assert_eq!(
			std::str::from_utf8(&json).unwrap(),
			r#"{"topic":"events","partition":0,"offset":7,"key":"a2V5","value":"dmFsdWU=","timestamp":1000}"#
		);
	}

	#[test]
	fn tombstone_serialises_null_value() {
		let mut tombstone = record(0);
		tombstone.value = None;
		let json = tombstone.to_json().unwrap();
		assert!(std::str::from_utf8(&json).unwrap().contains(r#""value":null"#));
	}
}
