#![deny(rust_2018_idioms)]

pub mod aws;
pub mod bucketing;
pub mod compress;
pub mod config;
pub mod errors;
pub mod framing;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod keys;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod storage;

pub(crate) const APP_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));
