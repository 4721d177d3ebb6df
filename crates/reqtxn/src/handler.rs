//! Lifecycle event notification.
//!
//! Handlers are attached to a [`Transaction`] and receive its progress
//! events in registration order.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::transaction::Transaction;

/// Status reported alongside an event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
	InProgress,
	Success,
	Failure,
}

impl EventStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			EventStatus::InProgress => "IN_PROGRESS",
			EventStatus::Success => "SUCCESS",
			EventStatus::Failure => "FAILURE",
		}
	}
}

impl fmt::Display for EventStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// How a transaction reacts when a handler returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerFailurePolicy {
	/// Log the failure and keep notifying the remaining handlers
	#[default]
	Isolate,
	/// Stop at the first failure and return it to the caller
	Propagate,
}

/// Receiver of transaction lifecycle events.
pub trait EventHandler: Send + Sync {
	fn notify(
		&self,
		transaction: &Transaction,
		status: EventStatus,
		message: &Map<String, Value>,
	) -> anyhow::Result<()>;
}

/// Handler that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
	fn notify(
		&self,
		transaction: &Transaction,
		status: EventStatus,
		message: &Map<String, Value>,
	) -> anyhow::Result<()> {
		let payload = Value::Object(message.clone());
		info!(
			transaction_id = %transaction.id(),
			service = %transaction.service(),
			resource = ?transaction.resource(),
			verb = ?transaction.verb(),
			status = %status,
			message = %payload,
			"transaction event"
		);
		Ok(())
	}
}

/// Normalise an event payload: objects pass through, anything else is
/// wrapped as `{"message": "<text>"}`.
pub fn normalize_message(message: Value) -> Map<String, Value> {
	match message {
		Value::Object(map) => map,
		Value::String(s) => Map::from_iter([("message".to_string(), Value::String(s))]),
		other => Map::from_iter([("message".to_string(), Value::String(other.to_string()))]),
	}
}
