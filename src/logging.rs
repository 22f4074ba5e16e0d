//! Log output setup
//!
//! The output format is picked from a closed set by a configuration string;
//! verbosity comes from `RUST_LOG` with a fallback directive.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable read by [`init_logging_from_env`]
pub const LOG_FORMAT_ENV: &str = "MQTT_LOG_FORMAT";

/// Errors raised while installing the log subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoggingError {
	/// The format name is not one of `compact`, `full` or `pretty`
	#[error("Unknown log format '{value}'")]
	UnknownFormat {
		/// The rejected value
		value: String,
	},

	/// A global subscriber is already installed
	#[error("Logging already initialized: {0}")]
	AlreadyInitialized(String),
}

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
	/// One short line per event
	#[default]
	Compact,
	/// tracing-subscriber's default layout
	Full,
	/// Multi-line, human friendly
	Pretty,
}

impl LogFormat {
	/// Formatting layer for this layout
	pub fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync + 'static>
	where S: Subscriber + for<'a> LookupSpan<'a> {
		match self {
			| LogFormat::Compact => fmt::layer().compact().boxed(),
			| LogFormat::Full => fmt::layer().boxed(),
			| LogFormat::Pretty => fmt::layer().pretty().boxed(),
		}
	}
}

impl FromStr for LogFormat {
	type Err = LoggingError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value.trim().to_ascii_lowercase().as_str() {
			| "compact" => Ok(LogFormat::Compact),
			| "full" => Ok(LogFormat::Full),
			| "pretty" => Ok(LogFormat::Pretty),
			| _ => Err(LoggingError::UnknownFormat {
				value: value.to_string(),
			}),
		}
	}
}

/// Installs the global subscriber.
///
/// `default_directive` (e.g. `"info"` or `"mqtt_durable_client=debug"`)
/// applies when `RUST_LOG` is unset or invalid.
pub fn init_logging(
	format: LogFormat,
	default_directive: &str,
) -> Result<(), LoggingError> {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_directive));
	tracing_subscriber::registry()
		.with(filter)
		.with(format.layer())
		.try_init()
		.map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
}

/// Like [`init_logging`], with the format taken from `MQTT_LOG_FORMAT`
/// (compact when unset).
pub fn init_logging_from_env(default_directive: &str) -> Result<(), LoggingError> {
	let format = match env::var(LOG_FORMAT_ENV) {
		| Ok(value) => value.parse()?,
		| Err(_) => LogFormat::default(),
	};
	init_logging(format, default_directive)
}
