use std::num::NonZeroU64;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{config::CompressionKind, errors::StorageError, keys};

pub mod memory;
pub mod s3;

/// The minimum size of a part in a multipart upload (excluding the last part).
///
/// S3 documents the floor as 5 MiB but rejects parts right at it often enough
/// that a little headroom is needed. See
/// <https://docs.aws.amazon.com/AmazonS3/latest/userguide/qfacts.html>.
// SAFETY: hardcoded
pub const MINIMUM_MULTIPART_PART_SIZE: NonZeroU64 =
	unsafe { NonZeroU64::new_unchecked(6 * 1024 * 1024) };

/// What is known about a backup object besides its bytes.
///
/// Recovered from the key extension when an in-progress upload is found,
/// since object stores expose no user metadata for uploads that have not
/// completed. Describes the compression chosen when the upload began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
	pub compression: Option<CompressionKind>,
}

impl ObjectMeta {
	pub fn from_key(key: &str) -> Self {
		let compression = if key.ends_with(keys::GZIP_EXTENSION) {
			Some(CompressionKind::Gzip)
		} else {
			None
		};
		Self { compression }
	}
}

/// A completed part of a multipart upload, as the store identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRef {
	pub part_number: i32,
	pub etag: String,
}

/// An in-progress multipart upload recovered from storage.
///
/// Carried by value through the resume coordinator; the pipeline never
/// mutates it, it only appends parts through the store.
#[derive(Debug, Clone)]
pub struct InProgressUpload {
	pub key: String,
	pub upload_id: String,
	pub parts: Vec<PartRef>,
	pub meta: ObjectMeta,
}

impl InProgressUpload {
	/// Part number the next write to this upload must use.
	pub fn next_part_number(&self) -> i32 {
		self.parts.iter().map(|p| p.part_number).max().unwrap_or(0) + 1
	}

	/// Whether any bytes of this upload are already durable.
	pub fn has_parts(&self) -> bool {
		!self.parts.is_empty()
	}
}

/// Outcome of a completed backup object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
	pub key: String,
	pub etag: Option<String>,
}

/// The storage seam of the pipeline.
///
/// Implementations own connection pooling, request timeouts, and transient
/// retries; by the time an error escapes this trait, local recovery is over.
/// Keys are relative to whatever prefix the implementation manages. Aborting
/// uploads is deliberately not part of the contract: a failed or interrupted
/// upload stays in place so a later run can resume or terminate it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// Every in-progress multipart upload under this store's prefix.
	async fn list_in_progress(&self) -> Result<Vec<InProgressUpload>, StorageError>;

	/// Begin a new multipart upload under `key`.
	async fn create_upload(&self, key: &str) -> Result<InProgressUpload, StorageError>;

	/// Write one part. Parts are uploaded sequentially and in order.
	async fn upload_part(
		&self,
		key: &str,
		upload_id: &str,
		part_number: i32,
		bytes: Bytes,
	) -> Result<PartRef, StorageError>;

	/// Finalise the upload from its accumulated parts.
	async fn complete_upload(
		&self,
		key: &str,
		upload_id: &str,
		parts: &[PartRef],
	) -> Result<BackupResult, StorageError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn meta_follows_key_extension() {
		assert_eq!(
			ObjectMeta::from_key("1970-01-01T00:00:01Z.json.gz"),
			ObjectMeta {
				compression: Some(CompressionKind::Gzip)
			}
		);
		assert_eq!(
			ObjectMeta::from_key("1970-01-01T00:00:01Z.json"),
			ObjectMeta { compression: None }
		);
	}

	#[test]
	fn next_part_number_continues_after_existing_parts() {
		let upload = InProgressUpload {
			key: "k.json".into(),
			upload_id: "u".into(),
			parts: vec![
				PartRef {
					part_number: 1,
					etag: "a".into(),
				},
				PartRef {
					part_number: 2,
					etag: "b".into(),
				},
			],
			meta: ObjectMeta { compression: None },
		};
		assert_eq!(upload.next_part_number(), 3);

		let fresh = InProgressUpload {
			parts: Vec::new(),
			..upload
		};
		assert_eq!(fresh.next_part_number(), 1);
		assert!(!fresh.has_parts());
	}
}
