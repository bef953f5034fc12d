use bytes::{BufMut, Bytes, BytesMut};

use crate::{
	errors::BackupError,
	record::Record,
};

/// One framed byte chunk of a bucket's JSON array, paired with the cursor of
/// the record it carries. Exactly one `Start` opens every bucket.
#[derive(Debug, PartialEq, Eq)]
pub enum FramedChunk<C> {
	Start { key: String, bytes: Bytes, ctx: C },
	Tail { bytes: Bytes, ctx: C },
}

impl<C> FramedChunk<C> {
	pub fn into_parts(self) -> (Bytes, C) {
		match self {
			Self::Start { bytes, ctx, .. } | Self::Tail { bytes, ctx } => (bytes, ctx),
		}
	}

	pub fn bytes(&self) -> &Bytes {
		match self {
			Self::Start { bytes, .. } | Self::Tail { bytes, .. } => bytes,
		}
	}
}

/// Frames one bucket's records as a single well-formed JSON array.
///
/// A record's own chunk cannot be cut until the framer knows what follows it:
/// another record closes it with a comma, the bucket boundary closes it with
/// the final bracket, and a cancelled run leaves a dangling comma for a later
/// run to resume or terminate. The framer therefore holds exactly one record
/// in flight.
///
/// Chunks map one-to-one onto records so that every byte acknowledged by the
/// sink advances exactly one cursor; chunks are never merged.
#[derive(Debug)]
pub struct JsonFramer<C> {
	key: String,

	/// Suppresses the leading bracket when the array is already open in a
	/// resumed upload.
	resume: bool,

	started: bool,
	pending: Option<(Bytes, C)>,
}

impl<C> JsonFramer<C> {
	pub fn new(key: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			resume: false,
			started: false,
			pending: None,
		}
	}

	/// A framer continuing an array that already has records in storage.
	pub fn resuming(key: impl Into<String>) -> Self {
		Self {
			resume: true,
			..Self::new(key)
		}
	}

	/// Feed the next record of the bucket. Releases the previous record's
	/// chunk, if one was in flight.
	pub fn push(&mut self, record: &Record, ctx: C) -> Result<Option<FramedChunk<C>>, BackupError> {
		let serialised = record.to_json()?;
		let released = self
			.pending
			.take()
			.map(|(bytes, pctx)| self.emit(bytes, pctx, b','));
		self.pending = Some((serialised, ctx));
		Ok(released)
	}

	/// The bucket boundary arrived: release the final chunk, closing the
	/// array.
	pub fn end(&mut self) -> Result<FramedChunk<C>, BackupError> {
		let (bytes, ctx) = self.pending.take().ok_or_else(|| {
			BackupError::UnhandledStreamCase("bucket boundary without a preceding record".into())
		})?;
		Ok(self.emit(bytes, ctx, b']'))
	}

	/// The run is stopping mid-bucket: release the in-flight chunk with a
	/// dangling comma. The array is repaired with a `null]` terminator by
	/// whichever run next touches this object.
	pub fn suspend(&mut self) -> Option<FramedChunk<C>> {
		self.pending
			.take()
			.map(|(bytes, ctx)| self.emit(bytes, ctx, b','))
	}

	fn emit(&mut self, serialised: Bytes, ctx: C, delimiter: u8) -> FramedChunk<C> {
		let first = !self.started;
		self.started = true;

		let mut buf = BytesMut::with_capacity(serialised.len() + 2);
		if first && !self.resume {
			buf.put_u8(b'[');
		}
		buf.extend_from_slice(&serialised);
		buf.put_u8(delimiter);

		if first {
			FramedChunk::Start {
				key: self.key.clone(),
				bytes: buf.freeze(),
				ctx,
			}
		} else {
			FramedChunk::Tail {
				bytes: buf.freeze(),
				ctx,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(offset: i64) -> Record {
		Record {
			topic: "t".into(),
			partition: 0,
			offset,
			key: None,
			value: None,
			timestamp: offset,
		}
	}

	fn text<C>(chunk: &FramedChunk<C>) -> String {
		String::from_utf8(chunk.bytes().to_vec()).unwrap()
	}

	#[test]
	fn single_record_then_boundary_is_one_closed_chunk() {
		let mut framer = JsonFramer::new("k.json");
		assert!(framer.push(&record(1), 1u32).unwrap().is_none());
		let chunk = framer.end().unwrap();
		assert!(matches!(chunk, FramedChunk::Start { .. }));
		let body = text(&chunk);
		assert!(body.starts_with('['));
		assert!(body.ends_with(']'));
	}

	#[test]
	fn single_record_then_suspension_dangles_a_comma() {
		let mut framer = JsonFramer::new("k.json");
		assert!(framer.push(&record(1), 1u32).unwrap().is_none());
		let chunk = framer.suspend().unwrap();
		let body = text(&chunk);
		assert!(body.starts_with('['));
		assert!(body.ends_with(','));
	}

	#[test]
	fn longer_bucket_frames_every_record_once() {
		let mut framer = JsonFramer::new("k.json");
		let mut chunks = Vec::new();
		for offset in 1..=3 {
			if let Some(chunk) = framer.push(&record(offset), offset).unwrap() {
				chunks.push(chunk);
			}
		}
		chunks.push(framer.end().unwrap());

		assert_eq!(chunks.len(), 3);
		assert!(matches!(chunks[0], FramedChunk::Start { .. }));
		assert!(matches!(chunks[1], FramedChunk::Tail { .. }));
		assert!(text(&chunks[0]).starts_with('['));
		assert!(text(&chunks[0]).ends_with(','));
		assert!(text(&chunks[1]).ends_with(','));
		assert!(text(&chunks[2]).ends_with(']'));

		let whole: String = chunks.iter().map(|c| text(c)).collect();
		let parsed: serde_json::Value = serde_json::from_str(&whole).unwrap();
		assert_eq!(parsed.as_array().unwrap().len(), 3);
	}

	#[test]
	fn resumed_framer_drops_the_leading_bracket() {
		let mut framer = JsonFramer::resuming("k.json");
		framer.push(&record(9), 9i64).unwrap();
		let chunk = framer.end().unwrap();
		assert!(matches!(chunk, FramedChunk::Start { .. }));
		let body = text(&chunk);
		assert!(body.starts_with('{'));
		assert!(body.ends_with(']'));
	}

	#[test]
	fn boundary_without_record_is_fatal() {
		let mut framer = JsonFramer::<u32>::new("k.json");
		assert!(matches!(
			framer.end(),
			Err(BackupError::UnhandledStreamCase(_))
		));
	}

	#[test]
	fn suspend_with_nothing_in_flight_is_quiet() {
		let mut framer = JsonFramer::<u32>::new("k.json");
		assert!(framer.suspend().is_none());
	}
}
