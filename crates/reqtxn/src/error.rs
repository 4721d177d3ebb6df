// Error types for transaction context operations

use thiserror::Error;

use crate::handler::EventStatus;

/// Errors raised while loading or reading service configuration
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),

	#[error("service name is not configured")]
	MissingServiceName,

	#[error("environment variable '{name}' is invalid: {message}")]
	Env { name: String, message: String },
}

impl ConfigError {
	pub fn env(name: impl Into<String>, message: impl Into<String>) -> Self {
		Self::Env {
			name: name.into(),
			message: message.into(),
		}
	}
}

/// Errors surfaced by transaction construction, lookup and notification
#[derive(Error, Debug)]
pub enum TransactionError {
	#[error("failed to read service configuration: {0}")]
	Config(#[from] ConfigError),

	#[error("event handler failed for status {status}: {source}")]
	Handler {
		status: EventStatus,
		#[source]
		source: anyhow::Error,
	},

	#[error("no transaction registry is installed for the current execution context")]
	NoContext,
}

impl TransactionError {
	pub fn handler(status: EventStatus, source: anyhow::Error) -> Self {
		Self::Handler { status, source }
	}
}
