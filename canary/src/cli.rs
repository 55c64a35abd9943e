use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use secrecy::ExposeSecret;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::canary::CanarySession;
use crate::config::{Config, ConfigError, ConfigSecret, Overrides};
use crate::observability;
use crate::runner::Runner;
use crate::store::s3::{S3Store, S3StoreConfig};

/// Exit code for missing or malformed configuration.
pub const EXIT_CONFIG_ERROR: u8 = 12;

/// Canary monitor that performs repeated S3 bucket and object operations.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'f')]
    config: Option<PathBuf>,

    /// RGW endpoint (host:port)
    #[argh(option, short = 'r')]
    rgw: Option<String>,

    /// interval (secs) between cycles, default 60
    #[argh(option, short = 'i')]
    interval: Option<u64>,

    /// run time (mins), default is to run forever
    #[argh(option, short = 't')]
    time_limit: Option<u64>,

    /// S3 access key
    #[argh(option, short = 'a')]
    access_key: Option<ConfigSecret>,

    /// S3 secret key
    #[argh(option, short = 's')]
    secret_key: Option<ConfigSecret>,

    /// object size in bytes to upload/read, default 65536
    #[argh(option, short = 'o')]
    object_size: Option<usize>,

    /// number of objects to create in the canary bucket, default 1
    #[argh(option, short = 'c')]
    object_count: Option<usize>,

    /// name of the canary bucket, default "canary"
    #[argh(option, short = 'b')]
    bucket: Option<String>,

    #[argh(subcommand)]
    command: Option<Command>,
}

impl Args {
    fn overrides(&mut self) -> Overrides {
        Overrides {
            rgw: self.rgw.take(),
            access_key: self.access_key.take(),
            secret_key: self.secret_key.take(),
            interval: self.interval,
            time_limit: self.time_limit,
            object_size: self.object_size,
            object_count: self.object_count,
            bucket: self.bucket.take(),
        }
    }
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Cleanup(CleanupCommand),
    Version(VersionCommand),
}

/// run canary cycles until the time limit or an interrupt (default)
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// delete the canary bucket and its objects, then exit
///
/// Use this to remove state left behind by a crashed run without starting the canary.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "cleanup")]
struct CleanupCommand {}

/// print the canary version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let mut args: Args = argh::from_env();

    let cleanup_only = match args.command {
        // Special switch to just print the version and exit.
        Some(Command::Version(VersionCommand {})) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Cleanup(CleanupCommand {})) => true,
        Some(Command::Run(RunCommand {})) | None => false,
    };

    let overrides = args.overrides();
    let config = Config::load(args.config.as_deref(), &overrides)?;
    config.validate()?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config).context("failed to open log file")?;
    tracing::debug!(?config);

    let metrics_guard = observability::init_metrics(&config)?;

    let result = runtime.block_on(async move {
        if cleanup_only {
            cleanup(config).await
        } else {
            run(config).await
        }
    });

    // Flush metrics unconditionally before shutdown, even on error.
    runtime.block_on(async {
        if let Some(metrics_guard) = metrics_guard {
            metrics_guard.flush(None).await.ok();
        }
    });

    result
}

/// Maps a failure of [`execute`] to the process exit code.
pub fn exit_code(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ConfigError>().is_some() {
        ExitCode::from(EXIT_CONFIG_ERROR)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(config: Config) -> Result<()> {
    log_parameters(&config);
    tracing::info!("Started");

    let store = connect(&config)?;
    let session = CanarySession::open(Box::new(store), config.canary_options())
        .await
        .context("failed to clean up before the first cycle")?;

    let shutdown = CancellationToken::new();
    let runner = Runner::new(session, config.runner_options(), shutdown.clone()).run();
    tokio::pin!(runner);

    let outcome = tokio::select! {
        outcome = &mut runner => outcome?,
        // the runner observes the cancellation and cleans up before returning
        () = watch_signals(shutdown) => runner.await?,
    };

    tracing::info!(cycles = outcome.cycles, reason = ?outcome.reason, "Finished");
    Ok(())
}

async fn cleanup(config: Config) -> Result<()> {
    let store = connect(&config)?;
    let mut session = CanarySession::open(Box::new(store), config.canary_options())
        .await
        .context("failed to clean up")?;
    session.close().await?;

    tracing::info!(bucket = %config.bucket, "cleanup complete");
    Ok(())
}

fn connect(config: &Config) -> Result<S3Store> {
    let endpoint = config.endpoint()?;
    let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) else {
        return Err(ConfigError::MissingRequired(vec!["access-key", "secret-key"]).into());
    };

    let store = S3Store::connect(S3StoreConfig {
        endpoint: endpoint.url(config.secure),
        region: config.region.clone(),
        access_key: access_key.expose_secret().as_str(),
        secret_key: secret_key.expose_secret().as_str(),
        request_timeout: Some(Duration::from_secs(config.request_timeout)),
    })?;

    Ok(store)
}

fn log_parameters(config: &Config) {
    tracing::info!(
        rgw = config.rgw.as_deref().unwrap_or_default(),
        bucket = %config.bucket,
        interval = config.interval,
        time_limit = ?config.time_limit,
        object_size = config.object_size,
        object_count = config.object_count,
        "run time parameters"
    );
}

/// Cancels `shutdown` on SIGINT, SIGTERM or SIGHUP.
async fn watch_signals(shutdown: CancellationToken) {
    elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup())
        .await;

    tracing::info!("shutdown requested");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_flags() {
        let mut args = Args::from_args(
            &["canary"],
            &[
                "-r", "rgw.local:8080", "-a", "AKIA", "-s", "secret", "-i", "5", "-t", "2", "-o",
                "16", "-c", "3",
            ],
        )
        .unwrap();

        assert!(args.command.is_none());
        let overrides = args.overrides();
        assert_eq!(overrides.rgw.as_deref(), Some("rgw.local:8080"));
        assert_eq!(overrides.access_key.as_deref(), Some("AKIA"));
        assert_eq!(overrides.interval, Some(5));
        assert_eq!(overrides.time_limit, Some(2));
        assert_eq!(overrides.object_size, Some(16));
        assert_eq!(overrides.object_count, Some(3));
        assert_eq!(overrides.bucket, None);
    }

    #[test]
    fn parses_subcommand() {
        let args = Args::from_args(&["canary"], &["--bucket", "probe", "cleanup"]).unwrap();

        assert!(matches!(args.command, Some(Command::Cleanup(_))));
        assert_eq!(args.bucket.as_deref(), Some("probe"));
    }

    #[test]
    fn config_errors_get_distinct_exit_code() {
        let err = anyhow::Error::from(ConfigError::MissingRequired(vec!["rgw"]));
        assert_eq!(exit_code(&err), ExitCode::from(EXIT_CONFIG_ERROR));

        let err = anyhow::anyhow!("connection refused");
        assert_eq!(exit_code(&err), ExitCode::FAILURE);
    }
}
