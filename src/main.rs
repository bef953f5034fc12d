use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use clap::{ArgAction, Parser};
use miette::{bail, IntoDiagnostic, Result};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use kafback::{
	aws::{self, AwsArgs},
	config::{BackupConfig, Compression, SliceUnit, TimePolicy},
	kafka::{KafkaConfig, KafkaSource},
	pipeline::Backup,
	source::CursorCommitter,
	storage::{s3::S3Store, ObjectStore},
};

/// Continuous Kafka topic backup to S3.
///
/// Consumes a topic and writes its records into time-sliced JSON array
/// objects, optionally gzipped. Interrupted uploads are resumed or repaired
/// on the next start, and consumer offsets are committed only once the bytes
/// behind them are durable in the bucket.
#[derive(Debug, Clone, Parser)]
#[command(
	author,
	version,
	after_help = "Want more detail? Try the long '--help' flag!",
	after_long_help = "Didn't expect this much output? Use the short '-h' flag to get short help."
)]
struct Args {
	/// Set diagnostic log level
	///
	/// This enables diagnostic logging, which is useful for investigating bugs. Use multiple
	/// times to increase verbosity. Goes up to '-vvvv'. Setting $RUST_LOG also works, and takes
	/// precedence.
	#[arg(long, short, action = ArgAction::Count)]
	verbose: u8,

	/// Kafka bootstrap servers, comma separated.
	#[arg(long, env = "KAFBACK_BROKERS", value_name = "HOSTS")]
	brokers: String,

	/// Topic to back up.
	#[arg(long, env = "KAFBACK_TOPIC", value_name = "TOPIC")]
	topic: String,

	/// Consumer group ID.
	///
	/// The group's committed offsets are the backup's consumed frontier, so
	/// use a group dedicated to this backup.
	#[arg(
		long,
		env = "KAFBACK_GROUP_ID",
		value_name = "GROUP",
		default_value = "kafback"
	)]
	group_id: String,

	/// S3 bucket receiving the backup objects.
	#[arg(long, env = "KAFBACK_BUCKET", value_name = "BUCKET")]
	bucket: String,

	/// Key prefix for backup objects within the bucket.
	#[arg(long, env = "KAFBACK_PREFIX", value_name = "PREFIX", default_value = "")]
	prefix: String,

	/// Length of one backup period, e.g. '15m' or '1h'.
	///
	/// Periods are anchored at the first record this run consumes, so object
	/// keys differ across restarts. Use '--slice' instead for keys that are
	/// stable across restarts.
	#[arg(
		long,
		value_name = "DURATION",
		conflicts_with = "slice",
		required_unless_present = "slice"
	)]
	period: Option<humantime::Duration>,

	/// Calendar unit to slice backup objects by.
	///
	/// Slices are anchored at the start of the unit, so a restart within the
	/// same slice resumes the same object.
	#[arg(long, value_name = "UNIT")]
	slice: Option<SliceUnit>,

	/// Compress backup objects with gzip.
	#[arg(long)]
	gzip: bool,

	/// Gzip compression level, between 1 and 9.
	#[arg(
		long,
		value_name = "LEVEL",
		value_parser = clap::value_parser!(u32).range(1..=9),
		requires = "gzip"
	)]
	gzip_level: Option<u32>,

	/// Target size of buffered upload parts, in bytes.
	///
	/// Clamped up to the S3 minimum part size. Larger parts mean fewer
	/// requests but more re-sent data when an upload is interrupted.
	#[arg(long, value_name = "BYTES")]
	part_size: Option<usize>,

	#[command(flatten)]
	aws: AwsArgs,
}

fn init_logging(verbose: u8) {
	let default_filter = match verbose {
		0 => "kafback=info",
		1 => "info,kafback=debug",
		2 => "debug",
		3 => "debug,kafback=trace",
		_ => "trace",
	};
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
		)
		.init();
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	init_logging(args.verbose);
	debug!(?args, "got arguments");

	let policy = match (args.period, args.slice) {
		(Some(period), None) => TimePolicy::PeriodFromFirst(period.into()),
		(None, Some(unit)) => TimePolicy::ChronoUnitSlice(unit),
		_ => bail!("exactly one of --period or --slice must be given"),
	};

	let mut config = BackupConfig::new(policy);
	if args.gzip {
		config = config.with_compression(Compression::gzip(args.gzip_level));
	}
	if let Some(part_size) = args.part_size {
		config = config.with_part_size(part_size);
	}

	let aws = aws::init(&args.aws).await;
	let store = Arc::new(S3Store::new(S3Client::new(&aws), args.bucket, args.prefix));

	let (source, committer) = KafkaSource::connect(&KafkaConfig {
		brokers: args.brokers,
		topic: args.topic,
		group_id: args.group_id,
	})
	.into_diagnostic()?;

	let backup = Backup::new(
		source,
		store as Arc<dyn ObjectStore>,
		Arc::new(committer) as Arc<dyn CursorCommitter<_>>,
		config,
	);
	let shutdown = backup.shutdown_token();

	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => {
					info!("received SIGINT, shutting down");
					shutdown.cancel();
				}
				Err(err) => {
					error!("unable to listen for shutdown signal: {err}");
				}
			}
		}
	});

	#[cfg(unix)]
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			use tokio::signal::unix::{signal, SignalKind};
			let mut sigterm =
				signal(SignalKind::terminate()).expect("failed to setup SIGTERM handler");
			sigterm.recv().await;
			info!("received SIGTERM, shutting down");
			shutdown.cancel();
		}
	});

	let summary = backup.run().await.into_diagnostic()?;
	info!(
		records = summary.records,
		objects = summary.completed.len(),
		"backup stopped"
	);
	Ok(())
}
