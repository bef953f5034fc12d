use std::{
	collections::BTreeMap,
	sync::Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::StorageError;

use super::{BackupResult, InProgressUpload, ObjectMeta, ObjectStore, PartRef};

/// An [`ObjectStore`] kept entirely in memory.
///
/// Backs the pipeline tests: uploads survive across pipeline runs against
/// the same store instance, which is how interrupted-and-resumed scenarios
/// are reproduced without a real bucket.
#[derive(Debug, Default)]
pub struct MemoryStore {
	state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
	uploads: BTreeMap<String, Upload>,
	objects: BTreeMap<String, Vec<u8>>,
	next_upload_id: u64,
}

#[derive(Debug, Default)]
struct Upload {
	upload_id: String,
	parts: BTreeMap<i32, Vec<u8>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Completed objects, by key.
	pub fn objects(&self) -> BTreeMap<String, Vec<u8>> {
		self.lock().objects.clone()
	}

	pub fn object(&self, key: &str) -> Option<Vec<u8>> {
		self.lock().objects.get(key).cloned()
	}

	/// Keys of uploads that have not completed.
	pub fn in_progress_keys(&self) -> Vec<String> {
		self.lock().uploads.keys().cloned().collect()
	}

	/// The concatenated bytes written so far to an in-progress upload.
	pub fn in_progress_bytes(&self, key: &str) -> Option<Vec<u8>> {
		let state = self.lock();
		state.uploads.get(key).map(|upload| {
			upload
				.parts
				.values()
				.flat_map(|part| part.iter().copied())
				.collect()
		})
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, State> {
		// A poisoned lock means a test already panicked; propagate.
		self.state.lock().expect("memory store lock poisoned")
	}
}

#[async_trait]
impl ObjectStore for MemoryStore {
	async fn list_in_progress(&self) -> Result<Vec<InProgressUpload>, StorageError> {
		let state = self.lock();
		Ok(state
			.uploads
			.iter()
			.map(|(key, upload)| InProgressUpload {
				key: key.clone(),
				upload_id: upload.upload_id.clone(),
				parts: upload
					.parts
					.keys()
					.map(|&part_number| PartRef {
						part_number,
						etag: format!("{}-{part_number}", upload.upload_id),
					})
					.collect(),
				meta: ObjectMeta::from_key(key),
			})
			.collect())
	}

	async fn create_upload(&self, key: &str) -> Result<InProgressUpload, StorageError> {
		let mut state = self.lock();
		state.next_upload_id += 1;
		let upload_id = format!("upload-{}", state.next_upload_id);
		state.uploads.insert(
			key.to_owned(),
			Upload {
				upload_id: upload_id.clone(),
				parts: BTreeMap::new(),
			},
		);
		Ok(InProgressUpload {
			key: key.to_owned(),
			upload_id,
			parts: Vec::new(),
			meta: ObjectMeta::from_key(key),
		})
	}

	async fn upload_part(
		&self,
		key: &str,
		upload_id: &str,
		part_number: i32,
		bytes: Bytes,
	) -> Result<PartRef, StorageError> {
		let mut state = self.lock();
		let upload = state
			.uploads
			.get_mut(key)
			.filter(|upload| upload.upload_id == upload_id)
			.ok_or_else(|| StorageError::Permanent(format!("no such upload: {key} {upload_id}")))?;
		upload.parts.insert(part_number, bytes.to_vec());
		Ok(PartRef {
			part_number,
			etag: format!("{upload_id}-{part_number}"),
		})
	}

	async fn complete_upload(
		&self,
		key: &str,
		upload_id: &str,
		parts: &[PartRef],
	) -> Result<BackupResult, StorageError> {
		let mut state = self.lock();
		let upload = state
			.uploads
			.remove(key)
			.filter(|upload| upload.upload_id == upload_id)
			.ok_or_else(|| StorageError::Permanent(format!("no such upload: {key} {upload_id}")))?;

		let mut body = Vec::new();
		for part in parts {
			let bytes = upload.parts.get(&part.part_number).ok_or_else(|| {
				StorageError::Permanent(format!(
					"completing {key} with unknown part {}",
					part.part_number
				))
			})?;
			body.extend_from_slice(bytes);
		}

		state.objects.insert(key.to_owned(), body);
		Ok(BackupResult {
			key: key.to_owned(),
			etag: Some(format!("{upload_id}-complete")),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn parts_concatenate_on_completion() {
		let store = MemoryStore::new();
		let upload = store.create_upload("a.json").await.unwrap();
		let one = store
			.upload_part("a.json", &upload.upload_id, 1, Bytes::from_static(b"[1,"))
			.await
			.unwrap();
		let two = store
			.upload_part("a.json", &upload.upload_id, 2, Bytes::from_static(b"2]"))
			.await
			.unwrap();
		store
			.complete_upload("a.json", &upload.upload_id, &[one, two])
			.await
			.unwrap();

		assert_eq!(store.object("a.json").unwrap(), b"[1,2]");
		assert!(store.in_progress_keys().is_empty());
	}

	#[tokio::test]
	async fn incomplete_uploads_are_listed_with_their_parts() {
		let store = MemoryStore::new();
		let upload = store.create_upload("a.json.gz").await.unwrap();
		store
			.upload_part("a.json.gz", &upload.upload_id, 1, Bytes::from_static(b"x"))
			.await
			.unwrap();

		let listed = store.list_in_progress().await.unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].key, "a.json.gz");
		assert_eq!(listed[0].parts.len(), 1);
		assert_eq!(
			listed[0].meta.compression,
			Some(crate::config::CompressionKind::Gzip)
		);
	}

	#[tokio::test]
	async fn completing_an_unknown_upload_is_refused() {
		let store = MemoryStore::new();
		let err = store.complete_upload("a.json", "nope", &[]).await.unwrap_err();
		assert!(matches!(err, StorageError::Permanent(_)));
	}
}
