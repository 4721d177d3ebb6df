//! Service configuration.
//!
//! A transaction reads its hosting service name exactly once, at
//! construction, through the [`ServiceConfig`] capability. [`Config`] is the
//! stock implementation and can be loaded from YAML or from the environment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::handler::HandlerFailurePolicy;

pub const SERVICE_NAME_ENV: &str = "SERVICE_NAME";
pub const LOG_FILTER_ENV: &str = "LOG_FILTER";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Source of the hosting service name.
pub trait ServiceConfig: Send + Sync {
	/// Return the configured service name.
	///
	/// Failures are fatal to the caller; no local recovery is attempted.
	fn service_name(&self) -> Result<String, ConfigError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	/// Name of the hosting service, stamped onto every transaction
	#[serde(default)]
	pub service: String,

	/// What to do when an event handler fails during notification
	#[serde(default)]
	pub handler_failure_policy: HandlerFailurePolicy,

	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
	/// `EnvFilter` directive string, e.g. `info,reqtxn=debug`
	#[serde(default = "default_filter")]
	pub filter: String,

	#[serde(default)]
	pub format: LogFormat,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			filter: default_filter(),
			format: LogFormat::default(),
		}
	}
}

fn default_filter() -> String {
	"info".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

impl Config {
	pub fn new(service: impl Into<String>) -> Self {
		Self {
			service: service.into(),
			..Default::default()
		}
	}

	pub fn with_handler_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
		self.handler_failure_policy = policy;
		self
	}

	pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
		Ok(serde_yaml::from_str(contents)?)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let contents = fs_err::read_to_string(path.as_ref())?;
		Self::from_yaml_str(&contents)
	}

	/// Build a config from `SERVICE_NAME`, `LOG_FILTER` and `LOG_FORMAT`.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let mut config = Config {
			service: lookup(SERVICE_NAME_ENV).unwrap_or_default(),
			..Default::default()
		};
		if let Some(filter) = lookup(LOG_FILTER_ENV) {
			config.logging.filter = filter;
		}
		if let Some(format) = lookup(LOG_FORMAT_ENV) {
			config.logging.format = match format.to_ascii_lowercase().as_str() {
				"text" => LogFormat::Text,
				"json" => LogFormat::Json,
				other => {
					return Err(ConfigError::env(
						LOG_FORMAT_ENV,
						format!("unknown log format '{other}'"),
					));
				},
			};
		}
		Ok(config)
	}
}

impl ServiceConfig for Config {
	fn service_name(&self) -> Result<String, ConfigError> {
		if self.service.is_empty() {
			return Err(ConfigError::MissingServiceName);
		}
		Ok(self.service.clone())
	}
}
