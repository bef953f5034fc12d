use aws_config::{
	default_provider::credentials::Builder, AppName, BehaviorVersion, ConfigLoader, Region,
	SdkConfig,
};
use aws_credential_types::Credentials;
use clap::Parser;

/// AWS credential and region options.
///
/// Include as `#[command(flatten)]` in an Args struct. Anything not given
/// here falls back to the usual SDK sources: environment variables, the
/// shared credentials file, or ambient credentials such as an EC2 instance
/// profile.
#[derive(Debug, Clone, Parser)]
pub struct AwsArgs {
	/// AWS Access Key ID.
	///
	/// Falls back to $AWS_ACCESS_KEY_ID, the AWS credentials file, or ambient credentials.
	#[arg(long, value_name = "KEY_ID")]
	pub aws_access_key_id: Option<String>,

	/// AWS Secret Access Key.
	///
	/// Falls back to $AWS_SECRET_ACCESS_KEY, the AWS credentials file, or ambient credentials.
	#[arg(long, value_name = "SECRET_KEY")]
	pub aws_secret_access_key: Option<String>,

	/// AWS Region, for both authentication and the bucket.
	///
	/// Falls back to $AWS_REGION, the AWS credentials file, or ambient configuration.
	#[arg(long, value_name = "REGION")]
	pub aws_region: Option<String>,

	/// AWS Session Token, when using temporary credentials.
	///
	/// Falls back to $AWS_SESSION_TOKEN.
	#[arg(long, value_name = "SESSION_TOKEN")]
	pub aws_session_token: Option<String>,
}

/// Get AWS config from the arguments, the environment, credentials files, or ambient sources.
pub async fn init(args: &AwsArgs) -> SdkConfig {
	let mut config = ConfigLoader::default()
		.behavior_version(BehaviorVersion::v2024_03_28())
		.app_name(AppName::new(crate::APP_NAME).unwrap());

	if let (Some(key_id), Some(secret)) = (&args.aws_access_key_id, &args.aws_secret_access_key) {
		// keep the full provider chain rather than just the given keys, so
		// ambient regions and sessions still apply
		let mut chain = Builder::default().with_custom_credential_source(
			"args",
			Credentials::from_keys(key_id, secret, args.aws_session_token.clone()),
		);
		if let Some(region) = &args.aws_region {
			chain = chain.region(Region::new(region.clone()));
		}
		config = config.credentials_provider(chain.build().await);
	} else if let Some(region) = &args.aws_region {
		config = config.region(Region::new(region.clone()));
	}

	config.load().await
}
