use crate::{config::TimePolicy, errors::BackupError};

/// Tags each record with the index of the time bucket it belongs to.
///
/// The first record seen fixes the anchor; every index after that is the
/// elapsed time since the anchor divided by the period, saturating at zero so
/// a slightly-early timestamp cannot wrap.
#[derive(Debug)]
pub struct PeriodAssigner {
	policy: TimePolicy,
	anchor: Option<i64>,
}

impl PeriodAssigner {
	pub fn new(policy: TimePolicy) -> Self {
		Self {
			policy,
			anchor: None,
		}
	}

	/// Bucket index for a record timestamp, in arrival order.
	pub fn assign(&mut self, timestamp: i64) -> u64 {
		let anchor = match self.anchor {
			Some(anchor) => anchor,
			None => {
				let anchor = self.policy.anchor_millis(timestamp);
				self.anchor = Some(anchor);
				anchor
			}
		};
		let elapsed = timestamp.saturating_sub(anchor).max(0);
		(elapsed / self.policy.period_millis()) as u64
	}

	/// The timestamp the object key for a bucket is derived from, given the
	/// first record of that bucket.
	pub fn key_anchor(&self, first_of_bucket: i64) -> i64 {
		self.policy.anchor_millis(first_of_bucket)
	}
}

/// Detects bucket boundaries along the tagged stream.
///
/// A boundary holds between adjacent records exactly when the bucket index
/// increases. Equal indices never produce a boundary; a decrease breaks the
/// monotonicity assumption and is fatal.
#[derive(Debug, Default)]
pub struct BoundaryDetector {
	last: Option<u64>,
}

impl BoundaryDetector {
	/// Observe the next record's bucket index. Returns whether an `End`
	/// marker must be emitted before this record's `Element`.
	pub fn boundary_before(&mut self, index: u64) -> Result<bool, BackupError> {
		let boundary = match self.last {
			None => false,
			Some(previous) if index == previous => false,
			Some(previous) if index > previous => true,
			Some(previous) => {
				return Err(BackupError::UnhandledStreamCase(format!(
					"bucket index went backwards: {previous} -> {index}"
				)));
			}
		};
		self.last = Some(index);
		Ok(boundary)
	}
}
