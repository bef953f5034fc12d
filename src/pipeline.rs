use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
	bucketing::{BoundaryDetector, PeriodAssigner},
	compress::{self, ChunkCompressor},
	config::{BackupConfig, CompressionKind, TimePolicy},
	errors::BackupError,
	framing::{FramedChunk, JsonFramer},
	keys,
	record::Record,
	sink::BucketSink,
	source::{CursorCommitter, RecordSource},
	storage::{BackupResult, InProgressUpload, ObjectStore},
};

/// Bytes appended to a dangling array to turn it back into valid JSON.
/// Readers must tolerate the trailing `null` element.
const ARRAY_TERMINATOR: &[u8] = b"null]";

/// What storage knows about the key a bucket is about to write to.
///
/// At most one side is populated: `current` is an in-progress upload under
/// this bucket's own anchor, `previous` one under an earlier anchor. Built
/// fresh at every bucket start and consumed immediately.
#[derive(Debug, Default)]
pub struct UploadStateResult {
	pub current: Option<InProgressUpload>,
	pub previous: Option<InProgressUpload>,
}

/// What a finished run did.
#[derive(Debug, Default)]
pub struct BackupSummary {
	/// Objects completed by this run, termination objects included.
	pub completed: Vec<BackupResult>,
	pub records: u64,
}

/// The assembled backup pipeline.
///
/// Drives the record source through bucketing, framing, compression, and the
/// storage sink, one bucket in flight at a time. A bucket is fully completed
/// before the next one opens, so cursor commits and object completions keep
/// the ordering guarantees the upstream relies on.
pub struct Backup<S: RecordSource> {
	source: S,
	store: Arc<dyn ObjectStore>,
	committer: Arc<dyn CursorCommitter<S::Cursor>>,
	config: BackupConfig,
	shutdown: CancellationToken,
}

impl<S: RecordSource> Backup<S> {
	pub fn new(
		source: S,
		store: Arc<dyn ObjectStore>,
		committer: Arc<dyn CursorCommitter<S::Cursor>>,
		config: BackupConfig,
	) -> Self {
		Self {
			source,
			store,
			committer,
			config,
			shutdown: CancellationToken::new(),
		}
	}

	/// Handle for stopping the pipeline from outside. Cancellation is
	/// graceful: buffered bytes are flushed, their cursors committed, and
	/// any open upload is left in progress for the next run.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Use an externally owned shutdown token instead of the built-in one.
	pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
		self.shutdown = shutdown;
		self
	}

	/// Run until the upstream ends or shutdown is requested.
	///
	/// A bounded upstream ending cleanly closes the open bucket and
	/// completes its object. Shutdown instead suspends it: buffered bytes
	/// are flushed and the upload stays in progress so the next run can
	/// carry on from the committed frontier.
	///
	/// Fails with [`BackupError::ExpectedStartOfSource`] when a bounded
	/// upstream ends before yielding a single record.
	pub async fn run(mut self) -> Result<BackupSummary, BackupError> {
		let shutdown = self.shutdown.clone();
		let mut assigner = PeriodAssigner::new(self.config.policy);
		let mut detector = BoundaryDetector::default();
		let mut active: Option<ActiveBucket<S::Cursor>> = None;
		let mut summary = BackupSummary::default();

		let stop = loop {
			let polled = tokio::select! {
				biased;
				() = shutdown.cancelled() => {
					info!("shutdown requested");
					break Stop::Shutdown;
				}
				polled = self.source.poll_record() => polled?,
			};
			let Some((record, cursor)) = polled else {
				debug!("upstream ended");
				break Stop::EndOfStream;
			};
			summary.records += 1;

			let index = assigner.assign(record.timestamp);
			if detector.boundary_before(index)? {
				let Some(bucket) = active.take() else {
					return Err(BackupError::UnhandledStreamCase(
						"bucket boundary with no bucket open".into(),
					));
				};
				let result = bucket.close().await?;
				info!(key = %result.key, "bucket completed");
				summary.completed.push(result);
			}

			if active.is_none() {
				let opened = self.open_bucket(&assigner, &record, &mut summary).await?;
				info!(key = %opened.sink.key(), bucket = index, "bucket opened");
				active = Some(opened);
			}
			let Some(bucket) = active.as_mut() else {
				return Err(BackupError::UnhandledStreamCase(
					"record with no bucket open".into(),
				));
			};
			bucket.push(&record, cursor).await?;
		};

		match stop {
			Stop::EndOfStream => {
				if summary.records == 0 {
					return Err(BackupError::ExpectedStartOfSource);
				}
				if let Some(bucket) = active.take() {
					let result = bucket.close().await?;
					info!(key = %result.key, "bucket completed at end of stream");
					summary.completed.push(result);
				}
			}
			Stop::Shutdown => {
				if let Some(bucket) = active.take() {
					bucket.suspend().await?;
				}
			}
		}
		Ok(summary)
	}

	/// Prepare the sink for a new bucket, resolving any in-progress upload
	/// state left behind by an earlier run.
	async fn open_bucket(
		&self,
		assigner: &PeriodAssigner,
		first_record: &Record,
		summary: &mut BackupSummary,
	) -> Result<ActiveBucket<S::Cursor>, BackupError> {
		let anchor = assigner.key_anchor(first_record.timestamp);
		let key = keys::object_key(anchor, self.config.compression_kind())?;
		let state = self.query_upload_state(&key).await?;

		match (state.current, state.previous) {
			(Some(current), Some(previous)) => Err(BackupError::UnhandledStreamCase(format!(
				"both a current and a previous upload are in progress: {} and {}",
				current.key, previous.key,
			))),
			(Some(current), None) => {
				if matches!(self.config.policy, TimePolicy::PeriodFromFirst(_)) {
					// A first-record anchor can only collide with a prior
					// run that stopped before committing this same record.
					warn!(
						key = %current.key,
						"in-progress upload found under a first-record anchor, resuming it"
					);
				}
				info!(key = %current.key, parts = current.parts.len(), "resuming upload");
				Ok(self.resume_bucket(current))
			}
			(None, previous) => {
				if let Some(previous) = previous {
					if matches!(self.config.policy, TimePolicy::PeriodFromFirst(_)) {
						warn!(
							key = %previous.key,
							"dangling upload from a prior run found under a first-record anchor"
						);
					}
					let result = self.terminate_upload(previous).await?;
					summary.completed.push(result);
				}
				self.fresh_bucket(key).await
			}
		}
	}

	async fn query_upload_state(&self, key: &str) -> Result<UploadStateResult, BackupError> {
		let anchor = keys::stem_millis(key).ok_or_else(|| {
			BackupError::UnhandledStreamCase(format!("computed key does not parse: {key}"))
		})?;

		let mut current: Option<InProgressUpload> = None;
		let mut older: Vec<(i64, InProgressUpload)> = Vec::new();

		for upload in self.store.list_in_progress().await? {
			// Anchors are compared by parsed timestamp, not by key: the
			// extension varies with configuration and fractional seconds
			// break lexicographic order.
			let Some(upload_anchor) = keys::stem_millis(&upload.key) else {
				debug!(key = %upload.key, "ignoring unrelated in-progress upload");
				continue;
			};

			if upload_anchor == anchor {
				if current.is_some() {
					return Err(BackupError::UnhandledStreamCase(format!(
						"two in-progress uploads share the anchor of {key}"
					)));
				}
				current = Some(upload);
			} else if upload_anchor < anchor {
				older.push((upload_anchor, upload));
			} else {
				warn!(
					key = %upload.key,
					"in-progress upload is ahead of the current bucket, leaving it alone"
				);
			}
		}

		older.sort_by_key(|(upload_anchor, _)| *upload_anchor);
		let previous = older.pop().map(|(_, upload)| upload);
		for (_, stale) in &older {
			warn!(key = %stale.key, "older dangling upload left untouched");
		}

		Ok(UploadStateResult { current, previous })
	}

	async fn fresh_bucket(&self, key: String) -> Result<ActiveBucket<S::Cursor>, BackupError> {
		let upload = self.store.create_upload(&key).await?;
		Ok(ActiveBucket {
			framer: JsonFramer::new(key),
			compressor: ChunkCompressor::for_config(self.config.compression),
			sink: BucketSink::open(
				Arc::clone(&self.store),
				Arc::clone(&self.committer),
				upload,
				self.config.part_size,
			),
		})
	}

	fn resume_bucket(&self, current: InProgressUpload) -> ActiveBucket<S::Cursor> {
		let configured = self.config.compression_kind();
		if current.meta.compression != configured {
			warn!(
				key = %current.key,
				started_with = ?current.meta.compression,
				configured = ?configured,
				"resumed object keeps the compression it was started with"
			);
		}

		// The object's compression was fixed when its upload began; the run
		// configuration only contributes the gzip level.
		let compressor = match current.meta.compression {
			Some(CompressionKind::Gzip) => {
				ChunkCompressor::gzip(self.config.compression.and_then(|c| c.level))
			}
			None => ChunkCompressor::passthrough(),
		};

		// Only drop the array opener if some of the array actually reached
		// storage; an upload with no parts holds nothing to continue from.
		let framer = if current.has_parts() {
			JsonFramer::resuming(current.key.clone())
		} else {
			JsonFramer::new(current.key.clone())
		};

		ActiveBucket {
			framer,
			compressor,
			sink: BucketSink::open(
				Arc::clone(&self.store),
				Arc::clone(&self.committer),
				current,
				self.config.part_size,
			),
		}
	}

	/// Close out a dangling upload from an earlier run by repairing its
	/// trailing comma and completing it.
	async fn terminate_upload(&self, upload: InProgressUpload) -> Result<BackupResult, BackupError> {
		let terminator = match (upload.has_parts(), upload.meta.compression) {
			(true, Some(CompressionKind::Gzip)) => compress::gzip_member(ARRAY_TERMINATOR, None)?,
			(true, None) => Bytes::from_static(ARRAY_TERMINATOR),
			// Nothing was ever flushed, so there is no dangling comma to
			// repair; close the object as an array holding the sentinel.
			(false, Some(CompressionKind::Gzip)) => compress::gzip_member(b"[null]", None)?,
			(false, None) => Bytes::from_static(b"[null]"),
		};

		let part = self
			.store
			.upload_part(
				&upload.key,
				&upload.upload_id,
				upload.next_part_number(),
				terminator,
			)
			.await?;

		let mut parts = upload.parts;
		parts.push(part);
		let result = self
			.store
			.complete_upload(&upload.key, &upload.upload_id, &parts)
			.await?;
		info!(key = %result.key, "terminated dangling upload");
		Ok(result)
	}
}

/// Why the run loop stopped.
enum Stop {
	EndOfStream,
	Shutdown,
}

/// The stages owned by the bucket currently in flight.
struct ActiveBucket<C> {
	framer: JsonFramer<C>,
	compressor: ChunkCompressor,
	sink: BucketSink<C>,
}

impl<C> ActiveBucket<C> {
	async fn push(&mut self, record: &Record, cursor: C) -> Result<(), BackupError> {
		if let Some(chunk) = self.framer.push(record, cursor)? {
			self.forward(chunk).await?;
		}
		Ok(())
	}

	async fn forward(&mut self, chunk: FramedChunk<C>) -> Result<(), BackupError> {
		let (bytes, cursor) = chunk.into_parts();
		let bytes = self.compressor.transform(bytes)?;
		self.sink.write(bytes, Some(cursor)).await
	}

	/// The bucket boundary arrived: close the array and finalise the upload.
	async fn close(mut self) -> Result<BackupResult, BackupError> {
		let chunk = self.framer.end()?;
		self.forward(chunk).await?;
		let trailer = self.compressor.finish()?;
		if !trailer.is_empty() {
			self.sink.write(trailer, None).await?;
		}
		self.sink.finish().await
	}

	/// The run is stopping mid-bucket: flush what we hold and leave the
	/// upload in progress. The compressor is closed so the stored bytes end
	/// on a complete gzip member; a resuming run appends a fresh member.
	async fn suspend(mut self) -> Result<(), BackupError> {
		if let Some(chunk) = self.framer.suspend() {
			self.forward(chunk).await?;
		}
		let trailer = self.compressor.finish()?;
		if !trailer.is_empty() {
			self.sink.write(trailer, None).await?;
		}
		self.sink.suspend().await
	}
}
