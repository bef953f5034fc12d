use std::time::Duration;

use clap::ValueEnum;

/// How records are sliced into time buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePolicy {
	/// Fixed-length periods anchored at the first record's timestamp.
	PeriodFromFirst(Duration),

	/// Calendar-unit slices anchored at the first record's timestamp rounded
	/// down to the unit, so object keys are stable across restarts.
	ChronoUnitSlice(SliceUnit),
}

impl TimePolicy {
	/// Length of one bucket in milliseconds. Sub-millisecond periods are
	/// clamped up to one millisecond.
	pub fn period_millis(&self) -> i64 {
		match self {
			Self::PeriodFromFirst(duration) => {
				i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
			}
			Self::ChronoUnitSlice(unit) => unit.millis(),
		}
	}

	/// The reference timestamp bucket indices are computed from, given the
	/// first record's timestamp.
	pub fn anchor_millis(&self, first_timestamp: i64) -> i64 {
		match self {
			Self::PeriodFromFirst(_) => first_timestamp,
			Self::ChronoUnitSlice(unit) => unit.truncate_millis(first_timestamp),
		}
	}
}

/// Calendar units usable with [`TimePolicy::ChronoUnitSlice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SliceUnit {
	Second,
	Minute,
	Hour,
	Day,
}

impl SliceUnit {
	pub fn millis(self) -> i64 {
		match self {
			Self::Second => 1_000,
			Self::Minute => 60 * 1_000,
			Self::Hour => 60 * 60 * 1_000,
			Self::Day => 24 * 60 * 60 * 1_000,
		}
	}

	/// Round an epoch-millis timestamp down to this unit.
	pub fn truncate_millis(self, timestamp: i64) -> i64 {
		timestamp - timestamp.rem_euclid(self.millis())
	}
}

/// Compression applied to new backup objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
	Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
	pub kind: CompressionKind,

	/// Gzip level 1 to 9, or the library default when unset.
	pub level: Option<u32>,
}

impl Compression {
	pub fn gzip(level: Option<u32>) -> Self {
		Self {
			kind: CompressionKind::Gzip,
			level,
		}
	}
}

/// Configuration for one backup run.
#[derive(Debug, Clone)]
pub struct BackupConfig {
	pub policy: TimePolicy,
	pub compression: Option<Compression>,

	/// Target size of buffered storage parts, in bytes. Clamped up to the
	/// storage minimum when the sink opens.
	pub part_size: usize,
}

impl BackupConfig {
	pub fn new(policy: TimePolicy) -> Self {
		Self {
			policy,
			compression: None,
			part_size: crate::storage::MINIMUM_MULTIPART_PART_SIZE.get() as usize,
		}
	}

	pub fn with_compression(mut self, compression: Compression) -> Self {
		self.compression = Some(compression);
		self
	}

	pub fn with_part_size(mut self, part_size: usize) -> Self {
		self.part_size = part_size;
		self
	}

	pub fn compression_kind(&self) -> Option<CompressionKind> {
		self.compression.map(|c| c.kind)
	}
}
