use std::env;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::sync::Mutex;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::{Config, LogFormat, Logging};

/// Prefix of all Datadog metric names.
const METRICS_PREFIX: &str = "canary.";

pub fn init_metrics(config: &Config) -> io::Result<Option<merni::DatadogFlusher>> {
    config
        .metrics
        .datadog_key
        .as_ref()
        .map(|api_key| {
            let mut builder =
                merni::datadog(api_key.expose_secret().as_str()).prefix(METRICS_PREFIX);
            for (k, v) in &config.metrics.tags {
                builder = builder.global_tag(k, v);
            }
            builder.try_init()
        })
        .transpose()
}

pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry.dsn.as_ref()?;
    Some(sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        enable_logs: true,
        sample_rate: config.sentry.sample_rate,
        environment: config.sentry.environment.clone().map(Into::into),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

pub fn init_tracing(config: &Config) -> io::Result<()> {
    // Same as the default filter, except it converts warnings into events
    // and also sends everything at or above INFO as logs instead of breadcrumbs.
    let sentry_layer = config.sentry.dsn.as_ref().map(|_| {
        sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
            Level::ERROR | Level::WARN => {
                sentry_tracing::EventFilter::Event | sentry_tracing::EventFilter::Log
            }
            Level::INFO => sentry_tracing::EventFilter::Log,
            Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
        })
    });

    let (level, env_filter) = parse_rust_log(config.logging.level);
    let format = format_layer(&config.logging)?;

    tracing_subscriber::registry()
        .with(format.with_filter(level))
        .with(sentry_layer)
        .with(env_filter)
        .init();

    Ok(())
}

fn format_layer(logging: &Logging) -> io::Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), io::stderr().is_terminal()),
    };

    let format = match logging.format {
        LogFormat::Auto if ansi => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);

    Ok(match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.compact().boxed(),
        LogFormat::Auto | LogFormat::Simplified => layer.with_ansi(false).boxed(),
    })
}

/// Resolves the effective log level.
///
/// A `RUST_LOG` that parses as a plain level replaces the configured level. Otherwise it is used
/// literally, for users who know which overrides they want to run.
pub fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        canary=TRACE,\
        ",
    );

    (level, env_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_applies_without_rust_log() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let (level, _) = parse_rust_log(LevelFilter::DEBUG);
            assert_eq!(level, LevelFilter::DEBUG);

            Ok(())
        });
    }

    #[test]
    fn rust_log_level_overrides_config() {
        figment::Jail::expect_with(|jail| {
            jail.set_env(EnvFilter::DEFAULT_ENV, "warn");

            let (level, _) = parse_rust_log(LevelFilter::DEBUG);
            assert_eq!(level, LevelFilter::WARN);

            Ok(())
        });
    }

    #[test]
    fn log_file_is_opened_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canary.log");
        std::fs::write(&path, "previous run\n").unwrap();

        let logging = Logging {
            file: Some(path.clone()),
            format: LogFormat::Auto,
            ..Default::default()
        };
        format_layer(&logging).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous run\n");
    }
}
