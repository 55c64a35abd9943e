//! Configuration for the canary.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command-line flags
//! 2. Environment variables (prefixed with `CANARY__`)
//! 3. YAML configuration file (specified via `-f` or `--config`, otherwise `canary.yaml` in the
//!    working directory if it exists)
//! 4. Defaults
//!
//! # YAML Configuration File
//!
//! The file must consist of a single `config` section:
//!
//! ```yaml
//! config:
//!   rgw: rgw.example.com:8080
//!   access_key: ACCESSKEY
//!   secret_key: SECRETKEY
//!   interval: 30
//!   object_count: 4
//!
//!   logging:
//!     level: debug
//!     file: /var/log/canary.log
//! ```
//!
//! # Environment Variables
//!
//! Environment variables use `CANARY__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures, for example `CANARY__RGW=localhost:8080` or
//! `CANARY__LOGGING__LEVEL=debug`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::canary::{CanaryOptions, DEFAULT_BUCKET};
use crate::runner::RunnerOptions;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "CANARY__";

/// Configuration file read when no path is given and the file exists.
pub const DEFAULT_CONFIG_PATH: &str = "canary.yaml";

/// The only section a configuration file may contain.
const CONFIG_SECTION: &str = "config";

/// Errors that prevent the canary from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Endpoint or credentials are not configured.
    #[error("S3 credentials and RGW endpoint are required, missing: {}", .0.join(", "))]
    MissingRequired(Vec<&'static str>),

    /// The endpoint is not of the form `host:port`.
    #[error("invalid RGW endpoint `{0}`, expected host:port")]
    InvalidEndpoint(String),

    /// The configuration file exists but has no `config` section.
    #[error(
        "config file {} is not supported, it must contain a single `config` section",
        .0.display()
    )]
    UnsupportedFormat(PathBuf),

    /// The configuration file passed on the command line does not exist.
    #[error("config file {} does not exist", .0.display())]
    NotFound(PathBuf),

    /// Parsing or merging the configuration sources failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl FromStr for ConfigSecret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Address of the S3-compatible endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// The endpoint URL, using `https` if `secure` is set.
    pub fn url(&self, secure: bool) -> String {
        let scheme = if secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_owned());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  canary::metrics > Test:create_bucket secs=0.0123
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z  INFO canary::metrics: Test:create_bucket op=create_bucket secs=0.0123
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// Per-operation timings are logged at `INFO`, per-object progress at `DEBUG`. The `RUST_LOG`
    /// environment variable overrides this if set.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    pub format: LogFormat,

    /// File to append logs to instead of writing them to stderr.
    pub file: Option<PathBuf>,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            file: None,
        }
    }
}

/// Sentry error reporting.
///
/// Failed cycles are logged at `ERROR` and reported as Sentry events when a DSN is configured.
#[derive(Debug, Deserialize, Serialize)]
pub struct Sentry {
    /// Sentry DSN. Reporting is disabled when unset.
    pub dsn: Option<SecretBox<ConfigSecret>>,
    /// Environment name attached to events.
    pub environment: Option<String>,
    /// Fraction of error events sent, between `0.0` and `1.0`.
    pub sample_rate: f32,
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
        }
    }
}

/// Datadog metrics for operation latencies and sizes.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Metrics {
    /// Datadog API key. Metrics are disabled when unset.
    pub datadog_key: Option<SecretBox<ConfigSecret>>,
    /// Global tags applied to all metrics, such as the monitored cluster.
    pub tags: BTreeMap<String, String>,
}

/// Main configuration struct for the canary.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Endpoint of the S3-compatible gateway as `host:port`. Required.
    pub rgw: Option<String>,
    /// S3 access key. Required.
    pub access_key: Option<SecretBox<ConfigSecret>>,
    /// S3 secret key. Required.
    pub secret_key: Option<SecretBox<ConfigSecret>>,

    /// Seconds to wait between cycles.
    ///
    /// # Default
    ///
    /// `60`
    pub interval: u64,

    /// Total run time in minutes. The canary runs until interrupted when unset or `0`.
    pub time_limit: Option<u64>,

    /// Size of each object in bytes.
    ///
    /// # Default
    ///
    /// `65536`
    pub object_size: usize,

    /// Number of objects written, read and deleted per cycle.
    ///
    /// # Default
    ///
    /// `1`
    pub object_count: usize,

    /// Name of the bucket created and deleted every cycle. Anything in this bucket is deleted
    /// when the canary starts.
    ///
    /// # Default
    ///
    /// `"canary"`
    pub bucket: String,

    /// Region used to sign requests.
    ///
    /// # Default
    ///
    /// `"us-east-1"`
    pub region: String,

    /// Connect with `https` instead of `http`.
    pub secure: bool,

    /// Timeout of each S3 request in seconds.
    ///
    /// # Default
    ///
    /// `30`
    pub request_timeout: u64,

    pub logging: Logging,
    pub sentry: Sentry,
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        let session = CanaryOptions::default();
        Self {
            rgw: None,
            access_key: None,
            secret_key: None,

            interval: 60,
            time_limit: None,
            object_size: session.object_size,
            object_count: session.object_count,
            bucket: DEFAULT_BUCKET.to_owned(),

            region: "us-east-1".to_owned(),
            secure: false,
            request_timeout: 30,

            logging: Logging::default(),
            sentry: Sentry::default(),
            metrics: Metrics::default(),
        }
    }
}

/// Options given on the command line, which take precedence over all other sources.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<ConfigSecret>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<ConfigSecret>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. The `config` section of the YAML file at `path`, or of [`DEFAULT_CONFIG_PATH`] if no
    ///    path is given and that file exists
    /// 3. Environment variables (prefixed with `CANARY__`)
    /// 4. Command-line `overrides`
    ///
    /// The result is not validated, see [`Config::validate`].
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_owned())),
            Some(path) => Some(path.to_owned()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|path| path.exists()),
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            let file = Figment::from(Yaml::file_exact(&path));
            match file.find_value(CONFIG_SECTION) {
                Ok(_) => figment = figment.merge(file.focus(CONFIG_SECTION)),
                Err(err) if err.missing() => return Err(ConfigError::UnsupportedFormat(path)),
                Err(err) => return Err(err.into()),
            }
        }

        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        Ok(config)
    }

    /// Checks that endpoint and credentials are present and well-formed.
    ///
    /// Empty values count as missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let is_blank = |secret: &Option<SecretBox<ConfigSecret>>| {
            secret
                .as_ref()
                .is_none_or(|secret| secret.expose_secret().is_empty())
        };

        let missing: Vec<_> = [
            ("rgw", self.rgw.as_deref().is_none_or(str::is_empty)),
            ("access-key", is_blank(&self.access_key)),
            ("secret-key", is_blank(&self.secret_key)),
        ]
        .into_iter()
        .filter_map(|(name, missing)| missing.then_some(name))
        .collect();

        if !missing.is_empty() {
            return Err(ConfigError::MissingRequired(missing));
        }

        self.endpoint()?;
        Ok(())
    }

    /// The parsed endpoint address.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.rgw
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired(vec!["rgw"]))?
            .parse()
    }

    pub fn canary_options(&self) -> CanaryOptions {
        CanaryOptions {
            bucket: self.bucket.clone(),
            object_size: self.object_size,
            object_count: self.object_count,
        }
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            interval: Duration::from_secs(self.interval),
            time_limit: self
                .time_limit
                .filter(|&mins| mins > 0)
                .and_then(|mins| mins.checked_mul(60))
                .map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_without_sources() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &Overrides::default()).unwrap();

            assert_eq!(config.rgw, None);
            assert_eq!(config.interval, 60);
            assert_eq!(config.time_limit, None);
            assert_eq!(config.object_size, 65536);
            assert_eq!(config.object_count, 1);
            assert_eq!(config.bucket, "canary");
            assert_eq!(config.logging.level, LevelFilter::INFO);

            let Err(ConfigError::MissingRequired(missing)) = config.validate() else {
                panic!("expected missing options");
            };
            assert_eq!(missing, ["rgw", "access-key", "secret-key"]);

            Ok(())
        });
    }

    #[test]
    fn reads_default_file_from_working_directory() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_PATH,
                r#"
                config:
                    rgw: rgw.local:8080
                    access_key: AKIAEXAMPLE
                    secret_key: hunter2
                    time_limit: 5
                    object_count: 3
                    logging:
                        level: debug
                        format: json
                "#,
            )?;

            let config = Config::load(None, &Overrides::default()).unwrap();
            config.validate().unwrap();

            assert_eq!(config.rgw.as_deref(), Some("rgw.local:8080"));
            assert_eq!(
                config.access_key.unwrap().expose_secret().as_str(),
                "AKIAEXAMPLE"
            );
            assert_eq!(config.time_limit, Some(5));
            assert_eq!(config.object_count, 3);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            Ok(())
        });
    }

    #[test]
    fn file_without_config_section_is_unsupported() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            rgw: rgw.local:8080
            access_key: AKIAEXAMPLE
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let result = Config::load(Some(tempfile.path()), &Overrides::default());
            assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));

            Ok(())
        });
    }

    #[test]
    fn missing_explicit_file_fails() {
        figment::Jail::expect_with(|_jail| {
            let result = Config::load(Some(Path::new("nope.yaml")), &Overrides::default());
            assert!(matches!(result, Err(ConfigError::NotFound(_))));

            Ok(())
        });
    }

    #[test]
    fn flags_override_env_override_file() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            config:
                rgw: rgw.local:8080
                interval: 10
                object_size: 1024
                bucket: from-file
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("CANARY__INTERVAL", "20");
            jail.set_env("CANARY__BUCKET", "from-env");

            let overrides = Overrides {
                bucket: Some("from-flags".into()),
                secret_key: Some("hunter2".into()),
                ..Default::default()
            };
            let config = Config::load(Some(tempfile.path()), &overrides).unwrap();

            assert_eq!(config.rgw.as_deref(), Some("rgw.local:8080"));
            assert_eq!(config.object_size, 1024);
            assert_eq!(config.interval, 20);
            assert_eq!(config.bucket, "from-flags");
            assert_eq!(
                config.secret_key.unwrap().expose_secret().as_str(),
                "hunter2"
            );

            Ok(())
        });
    }

    #[test]
    fn empty_credentials_are_missing() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CANARY__ACCESS_KEY", "");

            let overrides = Overrides {
                rgw: Some("rgw.local:8080".into()),
                secret_key: Some("".into()),
                ..Default::default()
            };
            let config = Config::load(None, &overrides).unwrap();

            let Err(ConfigError::MissingRequired(missing)) = config.validate() else {
                panic!("expected missing options");
            };
            assert_eq!(missing, ["access-key", "secret-key"]);

            Ok(())
        });
    }

    #[test]
    fn empty_endpoint_is_missing() {
        let config = Config {
            rgw: Some(String::new()),
            access_key: Some(SecretBox::new(Box::new("AKIAEXAMPLE".into()))),
            secret_key: Some(SecretBox::new(Box::new("hunter2".into()))),
            ..Default::default()
        };

        let Err(ConfigError::MissingRequired(missing)) = config.validate() else {
            panic!("expected missing options");
        };
        assert_eq!(missing, ["rgw"]);
    }

    #[test]
    fn validates_endpoint() {
        assert_eq!(
            "rgw.local:8080".parse::<Endpoint>().unwrap(),
            Endpoint {
                host: "rgw.local".into(),
                port: 8080
            }
        );
        assert_eq!(
            "rgw.local:8080".parse::<Endpoint>().unwrap().url(false),
            "http://rgw.local:8080"
        );

        for invalid in ["rgw.local", ":8080", "rgw.local:http", "http://rgw.local:80"] {
            assert!(
                matches!(
                    invalid.parse::<Endpoint>(),
                    Err(ConfigError::InvalidEndpoint(_))
                ),
                "{invalid}"
            );
        }
    }

    #[test]
    fn secrets_are_redacted() {
        let overrides = Overrides {
            access_key: Some("AKIAEXAMPLE".into()),
            secret_key: Some("hunter2".into()),
            ..Default::default()
        };

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None, &overrides).unwrap();
            let debug = format!("{config:?}");
            assert!(!debug.contains("hunter2"));
            assert!(!debug.contains("AKIAEXAMPLE"));

            Ok(())
        });
    }

    #[test]
    fn time_limit_converts_to_minutes() {
        let config = Config {
            time_limit: Some(2),
            interval: 15,
            ..Default::default()
        };

        let options = config.runner_options();
        assert_eq!(options.interval, Duration::from_secs(15));
        assert_eq!(options.time_limit, Some(Duration::from_secs(120)));
    }

    #[test]
    fn zero_or_huge_time_limit_runs_forever() {
        for time_limit in [0, u64::MAX] {
            let config = Config {
                time_limit: Some(time_limit),
                ..Default::default()
            };
            assert_eq!(config.runner_options().time_limit, None, "{time_limit}");
        }
    }
}
