use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::{config::CompressionKind, errors::BackupError};

pub const JSON_EXTENSION: &str = ".json";
pub const GZIP_EXTENSION: &str = ".json.gz";

/// Object key for the bucket anchored at `anchor_millis`.
///
/// The key is the ISO-8601 rendering of the anchor plus an extension chosen
/// by the configured compression. Pure: same inputs, same key.
pub fn object_key(
	anchor_millis: i64,
	compression: Option<CompressionKind>,
) -> Result<String, BackupError> {
	let anchor = Utc
		.timestamp_millis_opt(anchor_millis)
		.single()
		.ok_or_else(|| {
			BackupError::UnhandledStreamCase(format!(
				"record timestamp {anchor_millis} is outside the representable datetime range"
			))
		})?;

	let extension = match compression {
		Some(CompressionKind::Gzip) => GZIP_EXTENSION,
		None => JSON_EXTENSION,
	};

	Ok(format!(
		"{}{extension}",
		anchor.to_rfc3339_opts(SecondsFormat::AutoSi, true)
	))
}

/// The timestamp portion of a key, with the extension stripped.
pub fn key_stem(key: &str) -> &str {
	key.strip_suffix(GZIP_EXTENSION)
		.or_else(|| key.strip_suffix(JSON_EXTENSION))
		.unwrap_or(key)
}

/// Parse a key's timestamp back to epoch millis.
///
/// Returns `None` for keys that were not produced by [`object_key`], which
/// lets the resume lookup skip over unrelated objects sharing the prefix.
pub fn stem_millis(key: &str) -> Option<i64> {
	DateTime::parse_from_rfc3339(key_stem(key))
		.ok()
		.map(|ts| ts.timestamp_millis())
}
