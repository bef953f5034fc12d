//! End-to-end pipeline scenarios against the in-memory store.
//!
//! Interrupted runs are modelled with a source that requests shutdown once
//! drained, like an idle consumer receiving SIGTERM; the store instance then
//! carries the dangling upload into the next run.

use std::{collections::VecDeque, io::Read, sync::Arc, time::Duration};

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use kafback::{
	config::{BackupConfig, Compression, SliceUnit, TimePolicy},
	errors::SourceError,
	pipeline::{Backup, BackupSummary},
	record::Record,
	source::{CursorCommitter, RecordSource, RecordingCommitter, StaticSource},
	storage::{memory::MemoryStore, ObjectStore},
};
use tokio_util::sync::CancellationToken;

fn record(offset: i64, timestamp: i64) -> (Record, i64) {
	(
		Record {
			topic: "events".into(),
			partition: 0,
			offset,
			key: None,
			value: Some(format!("dmFsdWUt{offset}")),
			timestamp,
		},
		offset,
	)
}

fn ser(record: &Record) -> String {
	serde_json::to_string(record).unwrap()
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	MultiGzDecoder::new(bytes).read_to_end(&mut out).unwrap();
	out
}

/// Source that cancels the shutdown token once its records are drained, then
/// parks forever. This reproduces a stop mid-bucket: the pipeline suspends
/// instead of closing the open array.
struct InterruptingSource {
	records: VecDeque<(Record, i64)>,
	shutdown: CancellationToken,
}

#[async_trait]
impl RecordSource for InterruptingSource {
	type Cursor = i64;

	async fn poll_record(&mut self) -> Result<Option<(Record, i64)>, SourceError> {
		match self.records.pop_front() {
			Some(pair) => Ok(Some(pair)),
			None => {
				self.shutdown.cancel();
				std::future::pending().await
			}
		}
	}
}

struct World {
	store: Arc<MemoryStore>,
	committer: Arc<RecordingCommitter<i64>>,
}

impl World {
	fn new() -> Self {
		Self {
			store: Arc::new(MemoryStore::new()),
			committer: Arc::new(RecordingCommitter::new()),
		}
	}

	/// Run to a clean end of stream.
	async fn run(&self, records: Vec<(Record, i64)>, config: BackupConfig) -> BackupSummary {
		Backup::new(
			StaticSource::new(records),
			Arc::clone(&self.store) as Arc<dyn ObjectStore>,
			Arc::clone(&self.committer) as Arc<dyn CursorCommitter<i64>>,
			config,
		)
		.run()
		.await
		.unwrap()
	}

	/// Run and stop mid-bucket after the given records.
	async fn run_interrupted(
		&self,
		records: Vec<(Record, i64)>,
		config: BackupConfig,
	) -> BackupSummary {
		let shutdown = CancellationToken::new();
		let source = InterruptingSource {
			records: records.into(),
			shutdown: shutdown.clone(),
		};
		Backup::new(
			source,
			Arc::clone(&self.store) as Arc<dyn ObjectStore>,
			Arc::clone(&self.committer) as Arc<dyn CursorCommitter<i64>>,
			config,
		)
		.with_shutdown(shutdown)
		.run()
		.await
		.unwrap()
	}
}

fn second_periods() -> BackupConfig {
	BackupConfig::new(TimePolicy::PeriodFromFirst(Duration::from_secs(1)))
}

fn hourly_slices() -> BackupConfig {
	BackupConfig::new(TimePolicy::ChronoUnitSlice(SliceUnit::Hour))
}

#[tokio::test]
async fn single_record_becomes_a_single_closed_object() {
	let world = World::new();
	let (r, c) = record(0, 1_000);
	world.run(vec![(r.clone(), c)], second_periods()).await;

	let objects = world.store.objects();
	assert_eq!(
		objects.keys().collect::<Vec<_>>(),
		vec!["1970-01-01T00:00:01Z.json"]
	);
	assert_eq!(
		String::from_utf8(objects["1970-01-01T00:00:01Z.json"].clone()).unwrap(),
		format!("[{}]", ser(&r))
	);
	assert!(world.store.in_progress_keys().is_empty());
}

#[tokio::test]
async fn records_split_into_objects_at_period_boundaries() {
	let world = World::new();
	let (r0, c0) = record(0, 0);
	let (r1, c1) = record(1, 500);
	let (r2, c2) = record(2, 1_500);
	world
		.run(vec![(r0.clone(), c0), (r1.clone(), c1), (r2.clone(), c2)], second_periods())
		.await;

	let objects = world.store.objects();
	assert_eq!(
		String::from_utf8(objects["1970-01-01T00:00:00Z.json"].clone()).unwrap(),
		format!("[{},{}]", ser(&r0), ser(&r1))
	);
	assert_eq!(
		String::from_utf8(objects["1970-01-01T00:00:01.500Z.json"].clone()).unwrap(),
		format!("[{}]", ser(&r2))
	);

	// Cursors commit strictly in record order.
	assert_eq!(world.committer.committed(), vec![0, 1, 2]);
}

#[tokio::test]
async fn interrupted_bucket_is_resumed_on_restart() {
	let world = World::new();
	let (r2, c2) = record(2, 1_500);

	let summary = world
		.run_interrupted(
			vec![record(0, 0), record(1, 500), (r2.clone(), c2)],
			second_periods(),
		)
		.await;
	assert_eq!(summary.completed.len(), 1);

	// The second bucket is dangling with an open array.
	let key = "1970-01-01T00:00:01.500Z.json";
	assert_eq!(world.store.in_progress_keys(), vec![key.to_string()]);
	let dangling = world.store.in_progress_bytes(key).unwrap();
	assert_eq!(
		String::from_utf8(dangling).unwrap(),
		format!("[{},", ser(&r2))
	);
	assert_eq!(world.committer.committed(), vec![0, 1, 2]);

	// Restart from the same upstream offset redelivers the record. The
	// upload is found as current, the array is not reopened, and the
	// redelivered copy lands after the stored prefix.
	world.run(vec![(r2.clone(), c2)], second_periods()).await;

	assert!(world.store.in_progress_keys().is_empty());
	let body = String::from_utf8(world.store.object(key).unwrap()).unwrap();
	assert_eq!(body, format!("[{},{}]", ser(&r2), ser(&r2)));

	let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
	assert_eq!(parsed.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn dangling_upload_is_terminated_by_the_next_run() {
	let world = World::new();
	let (r0, c0) = record(0, 1_000);
	world
		.run_interrupted(vec![(r0.clone(), c0)], second_periods())
		.await;

	let dangling = world
		.store
		.in_progress_bytes("1970-01-01T00:00:01Z.json")
		.unwrap();
	assert_eq!(
		String::from_utf8(dangling).unwrap(),
		format!("[{},", ser(&r0))
	);

	// A later run anchored at a later record finds the old upload as
	// previous and repairs it with the null sentinel.
	let (r1, c1) = record(1, 5_000);
	let summary = world.run(vec![(r1.clone(), c1)], second_periods()).await;
	assert_eq!(summary.completed.len(), 2);

	let repaired = String::from_utf8(
		world
			.store
			.object("1970-01-01T00:00:01Z.json")
			.unwrap(),
	)
	.unwrap();
	assert_eq!(repaired, format!("[{},null]", ser(&r0)));

	let parsed: serde_json::Value = serde_json::from_str(&repaired).unwrap();
	let elements = parsed.as_array().unwrap();
	assert_eq!(elements.len(), 2);
	assert!(elements[1].is_null());

	assert_eq!(
		String::from_utf8(world.store.object("1970-01-01T00:00:05Z.json").unwrap()).unwrap(),
		format!("[{}]", ser(&r1))
	);
}

#[tokio::test]
async fn hourly_slices_key_objects_by_hour() {
	let world = World::new();
	let (r0, c0) = record(0, 3_570_000);
	let (r1, c1) = record(1, 3_599_000);
	let (r2, c2) = record(2, 3_601_000);
	world
		.run(
			vec![(r0.clone(), c0), (r1.clone(), c1), (r2.clone(), c2)],
			hourly_slices(),
		)
		.await;

	let objects = world.store.objects();
	assert_eq!(
		String::from_utf8(objects["1970-01-01T00:00:00Z.json"].clone()).unwrap(),
		format!("[{},{}]", ser(&r0), ser(&r1))
	);
	assert_eq!(
		String::from_utf8(objects["1970-01-01T01:00:00Z.json"].clone()).unwrap(),
		format!("[{}]", ser(&r2))
	);
}

#[tokio::test]
async fn resumed_object_keeps_the_compression_it_started_with() {
	let world = World::new();
	let (r0, c0) = record(0, 600_000);

	// First run writes uncompressed and stops mid-bucket.
	world
		.run_interrupted(vec![(r0.clone(), c0)], hourly_slices())
		.await;
	assert_eq!(
		world.store.in_progress_keys(),
		vec!["1970-01-01T00:00:00Z.json".to_string()]
	);

	// Second run is configured for gzip. The dangling hour is continued
	// uncompressed under its original key; the next hour is gzipped.
	let (r1, c1) = record(1, 1_200_000);
	let (r2, c2) = record(2, 3_700_000);
	world
		.run(
			vec![(r1.clone(), c1), (r2.clone(), c2)],
			hourly_slices().with_compression(Compression::gzip(None)),
		)
		.await;

	let objects = world.store.objects();
	let plain = String::from_utf8(objects["1970-01-01T00:00:00Z.json"].clone()).unwrap();
	assert_eq!(plain, format!("[{},{}]", ser(&r0), ser(&r1)));
	assert!(!objects.contains_key("1970-01-01T00:00:00Z.json.gz"));

	let zipped = &objects["1970-01-01T01:00:00Z.json.gz"];
	assert_eq!(
		String::from_utf8(gunzip(zipped)).unwrap(),
		format!("[{}]", ser(&r2))
	);
}

#[tokio::test]
async fn gzip_objects_round_trip() {
	let world = World::new();
	let (r0, c0) = record(0, 0);
	let (r1, c1) = record(1, 500);
	let (r2, c2) = record(2, 1_500);
	world
		.run(
			vec![(r0.clone(), c0), (r1.clone(), c1), (r2.clone(), c2)],
			second_periods().with_compression(Compression::gzip(Some(6))),
		)
		.await;

	let objects = world.store.objects();
	assert_eq!(
		String::from_utf8(gunzip(&objects["1970-01-01T00:00:00Z.json.gz"])).unwrap(),
		format!("[{},{}]", ser(&r0), ser(&r1))
	);
	assert_eq!(
		String::from_utf8(gunzip(&objects["1970-01-01T00:00:01.500Z.json.gz"])).unwrap(),
		format!("[{}]", ser(&r2))
	);
}

#[tokio::test]
async fn concatenated_objects_replay_the_input() {
	let world = World::new();
	let input: Vec<_> = (0..9)
		.map(|n| record(n, n * 700))
		.collect();
	world.run(input.clone(), second_periods()).await;

	// Objects in key order, contents concatenated and null-stripped, must
	// replay the input record for record.
	let mut replayed = Vec::new();
	for (_, body) in world.store.objects() {
		let parsed: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
		for element in parsed {
			if element.is_null() {
				continue;
			}
			replayed.push(serde_json::from_value::<Record>(element).unwrap());
		}
	}
	let expected: Vec<Record> = input.into_iter().map(|(r, _)| r).collect();
	assert_eq!(replayed, expected);
}

#[tokio::test]
async fn rerunning_identical_input_rewrites_identical_objects() {
	let world = World::new();
	let input: Vec<_> = (0..5).map(|n| record(n, 3_600_000 + n * 1_800_000)).collect();

	world.run(input.clone(), hourly_slices()).await;
	let first = world.store.objects();

	world.run(input, hourly_slices()).await;
	let second = world.store.objects();

	assert_eq!(first, second);
}

#[tokio::test]
async fn cursors_never_outrun_completed_objects() {
	let world = World::new();
	let input: Vec<_> = (0..4).map(|n| record(n, n * 2_000)).collect();
	world
		.run_interrupted(input, second_periods())
		.await;

	// Every committed cursor's record must be found in storage, either in a
	// completed object or in the flushed prefix of the dangling upload.
	let mut stored = String::new();
	for (_, body) in world.store.objects() {
		stored.push_str(&String::from_utf8(body).unwrap());
	}
	for key in world.store.in_progress_keys() {
		stored.push_str(&String::from_utf8(world.store.in_progress_bytes(&key).unwrap()).unwrap());
	}

	for offset in world.committer.committed() {
		assert!(
			stored.contains(&format!("\"offset\":{offset}")),
			"cursor {offset} committed but its record is not durable"
		);
	}
}
