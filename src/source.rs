use std::collections::VecDeque;

use async_trait::async_trait;

use crate::{errors::SourceError, record::Record};

/// The upstream record stream the pipeline consumes.
///
/// Records must arrive in non-decreasing timestamp order; the pipeline
/// assumes it and fails on a violation rather than mis-filing records. Each
/// record comes with an opaque cursor that, once committed, marks the record
/// consumed on the upstream side.
#[async_trait]
pub trait RecordSource: Send {
	type Cursor: Send + 'static;

	/// Next record, or `None` once the upstream is exhausted. Unbounded
	/// sources simply never return `None`.
	async fn poll_record(&mut self) -> Result<Option<(Record, Self::Cursor)>, SourceError>;
}

/// Commits consumed-record cursors back to the upstream.
///
/// Called by the sink only once every byte of the record behind the cursor
/// sits in a completed storage part.
#[async_trait]
pub trait CursorCommitter<C>: Send + Sync {
	async fn commit(&self, cursor: &C) -> Result<(), SourceError>;
}

/// A bounded source over a fixed set of records.
///
/// Used by the pipeline tests and handy for replaying a captured batch; a
/// real deployment uses the Kafka source.
#[derive(Debug)]
pub struct StaticSource<C> {
	records: VecDeque<(Record, C)>,
}

impl<C> StaticSource<C> {
	pub fn new(records: impl IntoIterator<Item = (Record, C)>) -> Self {
		Self {
			records: records.into_iter().collect(),
		}
	}
}

#[async_trait]
impl<C: Send + 'static> RecordSource for StaticSource<C> {
	type Cursor = C;

	async fn poll_record(&mut self) -> Result<Option<(Record, C)>, SourceError> {
		Ok(self.records.pop_front())
	}
}

/// A committer that collects cursors instead of talking to a broker. Backs
/// the pipeline tests' commit-ordering assertions.
#[derive(Debug)]
pub struct RecordingCommitter<C> {
	committed: std::sync::Mutex<Vec<C>>,
}

impl<C: Clone> RecordingCommitter<C> {
	pub fn new() -> Self {
		Self {
			committed: std::sync::Mutex::new(Vec::new()),
		}
	}

	/// Cursors committed so far, in commit order.
	pub fn committed(&self) -> Vec<C> {
		// A poisoned lock means a test already panicked; propagate.
		self.committed.lock().expect("committer lock poisoned").clone()
	}
}

impl<C: Clone> Default for RecordingCommitter<C> {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl<C: Clone + Send + Sync> CursorCommitter<C> for RecordingCommitter<C> {
	async fn commit(&self, cursor: &C) -> Result<(), SourceError> {
		self.committed
			.lock()
			.expect("committer lock poisoned")
			.push(cursor.clone());
		Ok(())
	}
}
