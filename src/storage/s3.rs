use async_trait::async_trait;
use aws_sdk_s3::{
	error::DisplayErrorContext,
	primitives::ByteStream,
	types::{CompletedMultipartUpload, CompletedPart},
	Client as S3Client,
};
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::errors::StorageError;

use super::{BackupResult, InProgressUpload, ObjectMeta, ObjectStore, PartRef};

/// [`ObjectStore`] backed by an S3 bucket.
///
/// All keys handled by the pipeline are relative; this adapter applies and
/// strips the configured prefix at the wire boundary. Parts are written
/// sequentially by the sink, so no request-level parallelism is attempted.
#[derive(Debug, Clone)]
pub struct S3Store {
	client: S3Client,
	bucket: String,
	prefix: String,
}

impl S3Store {
	pub fn new(client: S3Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
		Self {
			client,
			bucket: bucket.into(),
			prefix: prefix.into(),
		}
	}

	fn full_key(&self, key: &str) -> String {
		format!("{}{key}", self.prefix)
	}

	async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartRef>, StorageError> {
		let mut parts = Vec::new();
		let mut marker: Option<String> = None;

		loop {
			let resp = self
				.client
				.list_parts()
				.bucket(&self.bucket)
				.key(self.full_key(key))
				.upload_id(upload_id)
				.set_part_number_marker(marker.take())
				.send()
				.await
				.map_err(permanent)?;

			for part in resp.parts() {
				if let (Some(part_number), Some(etag)) = (part.part_number(), part.e_tag()) {
					parts.push(PartRef {
						part_number,
						etag: etag.to_owned(),
					});
				}
			}

			if resp.is_truncated() == Some(true) {
				marker = resp.next_part_number_marker().map(str::to_owned);
			} else {
				break;
			}
		}

		parts.sort_by_key(|part| part.part_number);
		Ok(parts)
	}
}

#[async_trait]
impl ObjectStore for S3Store {
	#[instrument(skip(self))]
	async fn list_in_progress(&self) -> Result<Vec<InProgressUpload>, StorageError> {
		let mut uploads = Vec::new();
		let mut key_marker: Option<String> = None;
		let mut id_marker: Option<String> = None;

		loop {
			let resp = self
				.client
				.list_multipart_uploads()
				.bucket(&self.bucket)
				.prefix(&self.prefix)
				.set_key_marker(key_marker.take())
				.set_upload_id_marker(id_marker.take())
				.send()
				.await
				.map_err(permanent)?;

			for upload in resp.uploads() {
				let (Some(full_key), Some(upload_id)) = (upload.key(), upload.upload_id()) else {
					continue;
				};
				let Some(key) = full_key.strip_prefix(&self.prefix) else {
					continue;
				};

				let parts = self.list_parts(key, upload_id).await?;
				uploads.push(InProgressUpload {
					key: key.to_owned(),
					upload_id: upload_id.to_owned(),
					parts,
					meta: ObjectMeta::from_key(key),
				});
			}

			if resp.is_truncated() == Some(true) {
				key_marker = resp.next_key_marker().map(str::to_owned);
				id_marker = resp.next_upload_id_marker().map(str::to_owned);
			} else {
				break;
			}
		}

		debug!(count = uploads.len(), "listed in-progress uploads");
		Ok(uploads)
	}

	#[instrument(skip(self))]
	async fn create_upload(&self, key: &str) -> Result<InProgressUpload, StorageError> {
		let created = self
			.client
			.create_multipart_upload()
			.bucket(&self.bucket)
			.key(self.full_key(key))
			.metadata("Uploader", crate::APP_NAME)
			.send()
			.await
			.map_err(permanent)?;

		let upload_id = created
			.upload_id()
			.ok_or_else(|| StorageError::Permanent("no upload ID returned".into()))?;

		debug!(upload_id, "created multipart upload");
		Ok(InProgressUpload {
			key: key.to_owned(),
			upload_id: upload_id.to_owned(),
			parts: Vec::new(),
			meta: ObjectMeta::from_key(key),
		})
	}

	#[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
	async fn upload_part(
		&self,
		key: &str,
		upload_id: &str,
		part_number: i32,
		bytes: Bytes,
	) -> Result<PartRef, StorageError> {
		let uploaded = self
			.client
			.upload_part()
			.bucket(&self.bucket)
			.key(self.full_key(key))
			.upload_id(upload_id)
			.part_number(part_number)
			.body(ByteStream::from(bytes))
			.send()
			.await
			.map_err(|err| StorageError::PartFailed(format!("{}", DisplayErrorContext(err))))?;

		let etag = uploaded
			.e_tag()
			.ok_or_else(|| StorageError::PartFailed("no etag returned for part".into()))?;

		Ok(PartRef {
			part_number,
			etag: etag.to_owned(),
		})
	}

	#[instrument(skip(self, parts), fields(parts = parts.len()))]
	async fn complete_upload(
		&self,
		key: &str,
		upload_id: &str,
		parts: &[PartRef],
	) -> Result<BackupResult, StorageError> {
		let completed = parts
			.iter()
			.map(|part| {
				CompletedPart::builder()
					.part_number(part.part_number)
					.e_tag(&part.etag)
					.build()
			})
			.collect();

		let resp = self
			.client
			.complete_multipart_upload()
			.bucket(&self.bucket)
			.key(self.full_key(key))
			.upload_id(upload_id)
			.multipart_upload(
				CompletedMultipartUpload::builder()
					.set_parts(Some(completed))
					.build(),
			)
			.send()
			.await
			.map_err(permanent)?;

		Ok(BackupResult {
			key: key.to_owned(),
			etag: resp.e_tag().map(str::to_owned),
		})
	}
}

fn permanent<E: std::error::Error + Send + Sync + 'static>(
	err: aws_sdk_s3::error::SdkError<E>,
) -> StorageError {
	StorageError::Permanent(format!("{}", DisplayErrorContext(err)))
}
