use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rdkafka::{
	consumer::{CommitMode, Consumer, StreamConsumer},
	ClientConfig, Message, Offset, TopicPartitionList,
};
use tracing::{debug, info};

use crate::{
	errors::SourceError,
	record::Record,
	source::{CursorCommitter, RecordSource},
};

/// Connection parameters for the topic being backed up.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
	pub brokers: String,
	pub topic: String,
	pub group_id: String,
}

/// Marks one consumed record for offset commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaCursor {
	pub topic: String,
	pub partition: i32,
	pub offset: i64,
}

/// Record source over a Kafka consumer group.
///
/// This source never ends on its own; the pipeline stops through its
/// shutdown token.
pub struct KafkaSource {
	consumer: Arc<StreamConsumer>,
}

/// The commit half of the consumer, shared with the sink.
pub struct KafkaCommitter {
	consumer: Arc<StreamConsumer>,
}

impl KafkaSource {
	/// Connect and subscribe.
	///
	/// Auto-commit stays disabled: the storage sink is the only committer,
	/// so the consumer group's offsets never run ahead of durable bytes.
	pub fn connect(config: &KafkaConfig) -> Result<(Self, KafkaCommitter), SourceError> {
		let consumer: StreamConsumer = ClientConfig::new()
			.set("bootstrap.servers", &config.brokers)
			.set("group.id", &config.group_id)
			.set("enable.auto.commit", "false")
			.set("auto.offset.reset", "earliest")
			.set("enable.partition.eof", "false")
			.create()
			.map_err(driver)?;

		consumer
			.subscribe(&[config.topic.as_str()])
			.map_err(driver)?;
		info!(topic = %config.topic, group = %config.group_id, "consumer subscribed");

		let consumer = Arc::new(consumer);
		Ok((
			Self {
				consumer: Arc::clone(&consumer),
			},
			KafkaCommitter { consumer },
		))
	}
}

#[async_trait]
impl RecordSource for KafkaSource {
	type Cursor = KafkaCursor;

	async fn poll_record(&mut self) -> Result<Option<(Record, KafkaCursor)>, SourceError> {
		let message = self.consumer.recv().await.map_err(driver)?;

		let timestamp = message.timestamp().to_millis().ok_or_else(|| {
			SourceError::MissingTimestamp {
				topic: message.topic().to_owned(),
				partition: message.partition(),
				offset: message.offset(),
			}
		})?;

		let record = Record {
			topic: message.topic().to_owned(),
			partition: message.partition(),
			offset: message.offset(),
			key: message.key().map(|key| BASE64.encode(key)),
			value: message.payload().map(|payload| BASE64.encode(payload)),
			timestamp,
		};
		debug!(
			topic = %record.topic,
			partition = record.partition,
			offset = record.offset,
			"record received"
		);

		let cursor = KafkaCursor {
			topic: record.topic.clone(),
			partition: record.partition,
			offset: record.offset,
		};
		Ok(Some((record, cursor)))
	}
}

#[async_trait]
impl CursorCommitter<KafkaCursor> for KafkaCommitter {
	async fn commit(&self, cursor: &KafkaCursor) -> Result<(), SourceError> {
		let mut offsets = TopicPartitionList::new();
		offsets
			.add_partition_offset(
				&cursor.topic,
				cursor.partition,
				Offset::Offset(cursor.offset + 1),
			)
			.map_err(commit_failed)?;

		// Sync commit sidesteps the librdkafka async-commit reordering
		// races at a negligible cost for this write rate.
		self.consumer
			.commit(&offsets, CommitMode::Sync)
			.map_err(commit_failed)?;
		debug!(
			topic = %cursor.topic,
			partition = cursor.partition,
			offset = cursor.offset,
			"cursor committed"
		);
		Ok(())
	}
}

fn driver(err: rdkafka::error::KafkaError) -> SourceError {
	SourceError::Driver(err.to_string())
}

fn commit_failed(err: rdkafka::error::KafkaError) -> SourceError {
	SourceError::Commit(err.to_string())
}
