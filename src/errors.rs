use thiserror::Error;

/// Errors surfaced by the backup pipeline.
///
/// Everything here is fatal to the run: the orchestrator cancels the pipeline
/// and leaves any in-progress multipart upload in place so the next run can
/// resume or terminate it.
#[derive(Debug, Error)]
pub enum BackupError {
	/// The upstream ended before yielding a single record, so neither the
	/// bucket anchor nor the first object key could be established.
	#[error("upstream ended before yielding any record")]
	ExpectedStartOfSource,

	/// An internal invariant was violated, with a diagnostic snapshot of the
	/// state that broke it.
	#[error("unhandled stream case: {0}")]
	UnhandledStreamCase(String),

	#[error("source failure")]
	Source(#[from] SourceError),

	#[error("storage failure")]
	Storage(#[from] StorageError),
}

/// Errors from the upstream record source or its cursor committer.
#[derive(Debug, Error)]
pub enum SourceError {
	/// The broker gave us a record without a timestamp; bucketing is
	/// impossible without one.
	#[error("record {topic}[{partition}]@{offset} has no broker timestamp")]
	MissingTimestamp {
		topic: String,
		partition: i32,
		offset: i64,
	},

	#[error("consumer driver error: {0}")]
	Driver(String),

	#[error("cursor commit failed: {0}")]
	Commit(String),
}

/// Errors from the object storage adapter.
///
/// The storage SDK's own retry policy applies before anything lands here, so
/// both variants have already exhausted local recovery.
#[derive(Debug, Error)]
pub enum StorageError {
	/// A part write failed after the SDK gave up retrying. No cursor in or
	/// after the failed part is committed.
	#[error("part upload failed: {0}")]
	PartFailed(String),

	/// A permanent refusal (auth, quota, missing bucket). The in-progress
	/// upload is left in place for later inspection.
	#[error("storage refused the request: {0}")]
	Permanent(String),
}
