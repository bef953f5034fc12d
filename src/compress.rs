use std::io::Write;

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression as GzLevel};

use crate::{config::Compression, errors::BackupError};

/// Transforms a bucket's byte chunks before they reach the storage sink.
///
/// Gzip output is sync-flushed after every chunk so that all bytes derived
/// from a record have left the encoder before that record's cursor becomes
/// committable. Without the flush, a committed cursor could refer to bytes
/// still buffered in the deflate window.
#[derive(Debug)]
pub enum ChunkCompressor {
	Passthrough,
	Gzip(GzEncoder<Vec<u8>>),
}

impl ChunkCompressor {
	pub fn passthrough() -> Self {
		Self::Passthrough
	}

	pub fn gzip(level: Option<u32>) -> Self {
		Self::Gzip(GzEncoder::new(Vec::new(), gzip_level(level)))
	}

	/// A compressor matching the run configuration.
	pub fn for_config(compression: Option<Compression>) -> Self {
		match compression {
			None => Self::passthrough(),
			Some(c) => Self::gzip(c.level),
		}
	}

	/// Transform one chunk. For gzip, the returned bytes cover everything
	/// the encoder produced for this chunk, flush included.
	pub fn transform(&mut self, bytes: Bytes) -> Result<Bytes, BackupError> {
		match self {
			Self::Passthrough => Ok(bytes),
			Self::Gzip(encoder) => {
				encoder.write_all(&bytes).map_err(gzip_broke)?;
				encoder.flush().map_err(gzip_broke)?;
				Ok(Bytes::from(std::mem::take(encoder.get_mut())))
			}
		}
	}

	/// Close the stream, returning the gzip trailer bytes. Empty for the
	/// passthrough case.
	///
	/// Always called before the object completes or the run suspends, so
	/// every stored gzip member is self-contained and members appended by a
	/// later run concatenate into a valid multi-member stream.
	pub fn finish(self) -> Result<Bytes, BackupError> {
		match self {
			Self::Passthrough => Ok(Bytes::new()),
			Self::Gzip(encoder) => encoder
				.finish()
				.map(Bytes::from)
				.map_err(gzip_broke),
		}
	}
}

/// Gzip a complete buffer as one self-contained member. Used for the `null]`
/// terminator appended to dangling compressed uploads.
pub fn gzip_member(bytes: &[u8], level: Option<u32>) -> Result<Bytes, BackupError> {
	let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() + 32), gzip_level(level));
	encoder.write_all(bytes).map_err(gzip_broke)?;
	encoder.finish().map(Bytes::from).map_err(gzip_broke)
}

fn gzip_level(level: Option<u32>) -> GzLevel {
	level.map_or_else(GzLevel::default, GzLevel::new)
}

// Writing into a Vec cannot fail, so any error out of the encoder is an
// internal invariant violation.
fn gzip_broke(err: std::io::Error) -> BackupError {
	BackupError::UnhandledStreamCase(format!("gzip encoder failure: {err}"))
}

#[cfg(test)]
mod tests {
	use std::io::Read;

	use flate2::read::MultiGzDecoder;

	use super::*;

	fn gunzip(bytes: &[u8]) -> Vec<u8> {
		let mut out = Vec::new();
		MultiGzDecoder::new(bytes)
			.read_to_end(&mut out)
			.unwrap();
		out
	}

	#[test]
	fn passthrough_is_identity() {
		let mut compressor = ChunkCompressor::passthrough();
		let chunk = Bytes::from_static(b"[{\"a\":1},");
		assert_eq!(compressor.transform(chunk.clone()).unwrap(), chunk);
		assert!(compressor.finish().unwrap().is_empty());
	}

	#[test]
	fn chunked_gzip_round_trips() {
		let mut compressor = ChunkCompressor::gzip(None);
		let mut stored = Vec::new();
		for chunk in [&b"[{\"a\":1},"[..], b"{\"b\":2},", b"{\"c\":3}]"] {
			stored.extend_from_slice(&compressor.transform(Bytes::copy_from_slice(chunk)).unwrap());
		}
		stored.extend_from_slice(&compressor.finish().unwrap());
		assert_eq!(gunzip(&stored), b"[{\"a\":1},{\"b\":2},{\"c\":3}]");
	}

	#[test]
	fn every_chunk_is_flushed_out() {
		let mut compressor = ChunkCompressor::gzip(Some(9));
		let first = compressor
			.transform(Bytes::from_static(b"{\"offset\":1},"))
			.unwrap();
		assert!(!first.is_empty());
		let second = compressor
			.transform(Bytes::from_static(b"{\"offset\":2},"))
			.unwrap();
		assert!(!second.is_empty());
	}

	#[test]
	fn appended_members_decode_as_one_stream() {
		// A suspended upload's finished member followed by a terminator
		// member written by a later run.
		let mut compressor = ChunkCompressor::gzip(None);
		let mut stored = Vec::new();
		stored.extend_from_slice(&compressor.transform(Bytes::from_static(b"[{\"a\":1},")).unwrap());
		stored.extend_from_slice(&compressor.finish().unwrap());
		stored.extend_from_slice(&gzip_member(b"null]", None).unwrap());

		assert_eq!(gunzip(&stored), b"[{\"a\":1},null]");
	}

	#[test]
	fn levels_may_differ_within_an_object() {
		let mut stored = Vec::new();
		stored.extend_from_slice(&gzip_member(b"[1,", Some(1)).unwrap());
		stored.extend_from_slice(&gzip_member(b"2]", Some(9)).unwrap());
		assert_eq!(gunzip(&stored), b"[1,2]");
	}
}
