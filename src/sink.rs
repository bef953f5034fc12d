use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
	errors::BackupError,
	source::CursorCommitter,
	storage::{BackupResult, InProgressUpload, ObjectStore, PartRef, MINIMUM_MULTIPART_PART_SIZE},
};

/// Writes one bucket's byte stream into a multipart upload.
///
/// Chunks are buffered into parts of at least the storage floor and uploaded
/// strictly in order. Cursor commits trail the durable byte watermark: a
/// cursor is committed exactly when every byte of its chunk sits inside a
/// completed part, which keeps the consumed frontier behind the stored bytes
/// on every failure path.
///
/// Nothing here ever aborts the upload. On error the upload is left exactly
/// as the last successful part left it, so a later run can resume or
/// terminate it.
pub struct BucketSink<C> {
	store: Arc<dyn ObjectStore>,
	committer: Arc<dyn CursorCommitter<C>>,
	key: String,
	upload_id: String,
	parts: Vec<PartRef>,
	next_part_number: i32,
	part_size: usize,
	buffer: BytesMut,
	pending: VecDeque<(u64, C)>,
	accepted: u64,
	durable: u64,
}

impl<C> BucketSink<C> {
	/// Open a sink over a fresh or resumed upload. For a resumed upload the
	/// part numbering continues after the parts already in storage.
	pub fn open(
		store: Arc<dyn ObjectStore>,
		committer: Arc<dyn CursorCommitter<C>>,
		upload: InProgressUpload,
		part_size: usize,
	) -> Self {
		let next_part_number = upload.next_part_number();
		Self {
			store,
			committer,
			key: upload.key,
			upload_id: upload.upload_id,
			parts: upload.parts,
			next_part_number,
			part_size: part_size.max(MINIMUM_MULTIPART_PART_SIZE.get() as usize),
			buffer: BytesMut::new(),
			pending: VecDeque::new(),
			accepted: 0,
			durable: 0,
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	/// Ingest one chunk. `cursor` is the cursor of the record the chunk
	/// carries; byte streams with no record behind them (a compression
	/// trailer) pass `None`.
	pub async fn write(&mut self, bytes: Bytes, cursor: Option<C>) -> Result<(), BackupError> {
		self.accepted += bytes.len() as u64;
		self.buffer.extend_from_slice(&bytes);
		if let Some(cursor) = cursor {
			self.pending.push_back((self.accepted, cursor));
		}
		trace!(
			bytes = bytes.len(),
			buffered = self.buffer.len(),
			"chunk accepted"
		);

		while self.buffer.len() >= self.part_size {
			self.flush_part().await?;
		}
		Ok(())
	}

	/// Complete the upload. Consumes the sink; every pending cursor is
	/// committed once completion succeeds.
	pub async fn finish(mut self) -> Result<BackupResult, BackupError> {
		self.flush_part().await?;

		if self.parts.is_empty() {
			return Err(BackupError::UnhandledStreamCase(format!(
				"completing upload {} with no parts",
				self.key
			)));
		}

		let result = self
			.store
			.complete_upload(&self.key, &self.upload_id, &self.parts)
			.await?;
		debug!(key = %self.key, parts = self.parts.len(), "upload completed");

		self.durable = self.accepted;
		self.commit_ready().await?;
		Ok(result)
	}

	/// Flush buffered bytes as a final part and stop, leaving the upload in
	/// progress for a later run. Cursors covered by the flushed bytes are
	/// committed; the dangling framing is repaired by the resume path.
	pub async fn suspend(mut self) -> Result<(), BackupError> {
		self.flush_part().await?;
		debug!(key = %self.key, "upload left in progress");
		Ok(())
	}

	async fn flush_part(&mut self) -> Result<(), BackupError> {
		if self.buffer.is_empty() {
			return Ok(());
		}

		let bytes = self.buffer.split().freeze();
		let size = bytes.len() as u64;
		let part = self
			.store
			.upload_part(&self.key, &self.upload_id, self.next_part_number, bytes)
			.await?;
		debug!(
			key = %self.key,
			part_number = part.part_number,
			bytes = size,
			"part uploaded"
		);

		self.parts.push(part);
		self.next_part_number += 1;
		self.durable += size;
		self.commit_ready().await
	}

	async fn commit_ready(&mut self) -> Result<(), BackupError> {
		while let Some(&(end, _)) = self.pending.front() {
			if end > self.durable {
				break;
			}
			// UNWRAP: front() just matched
			let (_, cursor) = self.pending.pop_front().unwrap();
			self.committer.commit(&cursor).await.map_err(BackupError::from)?;
		}
		Ok(())
	}
}
