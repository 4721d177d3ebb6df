//! The per-request transaction.
//!
//! A [`Transaction`] carries the trace id and caller metadata of one logical
//! request, a stack of compensating actions that undo its partial side
//! effects, and the handlers that receive its progress events.
//!
//! Rollback here is best-effort cleanup: each compensating action is invoked
//! in reverse order of registration and a failing action never prevents the
//! remaining ones from running. There is no atomicity or isolation.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::TransactionError;
use crate::handler::{EventHandler, EventStatus, HandlerFailurePolicy, normalize_message};
use crate::trace::{IdGenerator, format_trace_id};

/// Metadata keys forwarded to downstream calls by [`Transaction::get_connection_meta`].
pub const CONNECTION_META_KEYS: [&str; 2] = ["token", "domain_id"];

/// Signature of a compensating function: positional args, keyword args.
pub type RollbackFn = dyn Fn(&[Value], &Map<String, Value>) -> anyhow::Result<()> + Send + Sync;

/// A recorded compensating action.
#[derive(Clone)]
pub struct Rollback {
	label: Option<String>,
	func: Arc<RollbackFn>,
	args: Vec<Value>,
	kwargs: Map<String, Value>,
}

impl Rollback {
	pub fn new<F>(func: F) -> Self
	where
		F: Fn(&[Value], &Map<String, Value>) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		Self {
			label: None,
			func: Arc::new(func),
			args: Vec::new(),
			kwargs: Map::new(),
		}
	}

	pub fn with_label(mut self, label: impl Into<String>) -> Self {
		self.label = Some(label.into());
		self
	}

	pub fn with_args(mut self, args: Vec<Value>) -> Self {
		self.args = args;
		self
	}

	pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
		self.kwargs = kwargs;
		self
	}

	pub fn label(&self) -> Option<&str> {
		self.label.as_deref()
	}

	fn invoke(&self) -> Result<(), RollbackFailure> {
		match catch_unwind(AssertUnwindSafe(|| (self.func)(&self.args, &self.kwargs))) {
			Ok(Ok(())) => Ok(()),
			Ok(Err(error)) => {
				// anyhow only records a backtrace when RUST_BACKTRACE asks for one
				let backtrace = match error.backtrace().status() {
					BacktraceStatus::Captured => error.backtrace().to_string(),
					_ => Backtrace::force_capture().to_string(),
				};
				Err(RollbackFailure { error, backtrace })
			},
			Err(payload) => {
				let backtrace = Backtrace::force_capture().to_string();
				let msg = payload
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| payload.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "unknown panic payload".to_string());
				Err(RollbackFailure {
					error: anyhow::anyhow!("compensating action panicked: {msg}"),
					backtrace,
				})
			},
		}
	}
}

/// A compensating action that returned an error or panicked.
struct RollbackFailure {
	error: anyhow::Error,
	backtrace: String,
}

impl fmt::Debug for Rollback {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Rollback")
			.field("label", &self.label)
			.field("args", &self.args)
			.field("kwargs", &self.kwargs)
			.finish_non_exhaustive()
	}
}

/// Construction parameters for a [`Transaction`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionParams {
	pub resource: Option<String>,
	pub verb: Option<String>,
	pub trace_id: Option<String>,
	pub meta: Option<Map<String, Value>>,
}

impl TransactionParams {
	pub fn new() -> Self {
		Self::default()
	}

	/// Shorthand for a resource/verb pair, e.g. `("identity.User", "create")`.
	pub fn operation(resource: impl Into<String>, verb: impl Into<String>) -> Self {
		Self {
			resource: Some(resource.into()),
			verb: Some(verb.into()),
			..Default::default()
		}
	}

	pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
		self.resource = Some(resource.into());
		self
	}

	pub fn with_verb(mut self, verb: impl Into<String>) -> Self {
		self.verb = Some(verb.into());
		self
	}

	pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
		self.trace_id = Some(trace_id.into());
		self
	}

	pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
		self.meta = Some(meta);
		self
	}
}

pub struct Transaction {
	id: String,
	service: String,
	resource: Option<String>,
	verb: Option<String>,
	meta: RwLock<Map<String, Value>>,
	// Newest first, so iteration order is execution order.
	rollbacks: Mutex<VecDeque<Rollback>>,
	event_handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
	handler_failure_policy: HandlerFailurePolicy,
}

impl Transaction {
	/// Build a transaction. Does not register it anywhere.
	///
	/// The service name is read from `config` once; a failure there is
	/// returned as [`TransactionError::Config`]. Without a supplied trace id
	/// a fresh one is drawn from `ids`.
	pub fn new(
		params: TransactionParams,
		config: &dyn ServiceConfig,
		ids: &dyn IdGenerator,
	) -> Result<Self, TransactionError> {
		let service = config.service_name()?;
		let TransactionParams {
			resource,
			verb,
			trace_id,
			meta,
		} = params;
		let id = match trace_id {
			Some(id) if !id.is_empty() => id,
			_ => format_trace_id(ids.new_trace_id()),
		};
		Ok(Self {
			id,
			service,
			resource,
			verb,
			meta: RwLock::new(meta.unwrap_or_default()),
			rollbacks: Mutex::new(VecDeque::new()),
			event_handlers: RwLock::new(Vec::new()),
			handler_failure_policy: HandlerFailurePolicy::default(),
		})
	}

	pub(crate) fn with_handler_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
		self.handler_failure_policy = policy;
		self
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn service(&self) -> &str {
		&self.service
	}

	pub fn resource(&self) -> Option<&str> {
		self.resource.as_deref()
	}

	pub fn verb(&self) -> Option<&str> {
		self.verb.as_deref()
	}

	pub fn handler_failure_policy(&self) -> HandlerFailurePolicy {
		self.handler_failure_policy
	}

	/// Record a compensating action. It runs before every action recorded earlier.
	pub fn add_rollback<F>(&self, func: F, args: Vec<Value>, kwargs: Map<String, Value>)
	where
		F: Fn(&[Value], &Map<String, Value>) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		self.push_rollback(Rollback::new(func).with_args(args).with_kwargs(kwargs));
	}

	pub fn push_rollback(&self, rollback: Rollback) {
		self.rollbacks.lock().push_front(rollback);
	}

	pub fn rollback_count(&self) -> usize {
		self.rollbacks.lock().len()
	}

	/// Run every compensating action, most recently added first.
	///
	/// Errors and panics from individual actions are logged and skipped
	/// over. This never fails and leaves the recorded actions in place.
	pub fn execute_rollback(&self) {
		let rollbacks: Vec<Rollback> = self.rollbacks.lock().iter().cloned().collect();
		debug!(
			transaction_id = %self.id,
			count = rollbacks.len(),
			"executing rollback"
		);

		for (idx, rollback) in rollbacks.iter().enumerate() {
			if let Err(e) = rollback.invoke() {
				info!(
					transaction = %self,
					transaction_id = %self.id,
					rollback_index = idx,
					rollback = ?rollback.label(),
					error = ?e.error,
					backtrace = %e.backtrace,
					"[ROLLBACK-ERROR] compensating action failed (continuing with remaining actions)"
				);
			}
		}
	}

	/// Snapshot copy of the metadata bag.
	pub fn meta(&self) -> Map<String, Value> {
		self.meta.read().clone()
	}

	pub fn set_meta(&self, key: impl Into<String>, value: impl Into<Value>) {
		self.meta.write().insert(key.into(), value.into());
	}

	pub fn get_meta(&self, key: &str) -> Option<Value> {
		self.meta.read().get(key).cloned()
	}

	pub fn get_meta_or(&self, key: &str, default: Value) -> Value {
		self.get_meta(key).unwrap_or(default)
	}

	/// Caller identity to forward on outbound connections, in fixed key order.
	pub fn get_connection_meta(&self) -> Vec<(&'static str, Option<Value>)> {
		CONNECTION_META_KEYS
			.iter()
			.map(|key| (*key, self.get_meta(key)))
			.collect()
	}

	pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
		self.event_handlers.write().push(handler);
	}

	pub fn event_handler_count(&self) -> usize {
		self.event_handlers.read().len()
	}

	/// Send an `IN_PROGRESS` event to every handler.
	pub fn notify_event(&self, message: impl Into<Value>) -> Result<(), TransactionError> {
		self.notify_status(EventStatus::InProgress, message)
	}

	/// Send an event with an explicit status to every handler, in
	/// registration order.
	pub fn notify_status(
		&self,
		status: EventStatus,
		message: impl Into<Value>,
	) -> Result<(), TransactionError> {
		let handlers = self.event_handlers.read().clone();
		if handlers.is_empty() {
			return Ok(());
		}
		let message = normalize_message(message.into());

		for (idx, handler) in handlers.iter().enumerate() {
			if let Err(e) = handler.notify(self, status, &message) {
				match self.handler_failure_policy {
					HandlerFailurePolicy::Propagate => {
						return Err(TransactionError::handler(status, e));
					},
					HandlerFailurePolicy::Isolate => {
						warn!(
							transaction_id = %self.id,
							handler_index = idx,
							status = %status,
							error = ?e,
							"event handler failed (continuing with remaining handlers)"
						);
					},
				}
			}
		}
		Ok(())
	}
}

impl fmt::Display for Transaction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"Transaction({}.{})",
			self.resource.as_deref().unwrap_or("-"),
			self.verb.as_deref().unwrap_or("-")
		)
	}
}

impl fmt::Debug for Transaction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Transaction")
			.field("id", &self.id)
			.field("service", &self.service)
			.field("resource", &self.resource)
			.field("verb", &self.verb)
			.field("rollbacks", &self.rollback_count())
			.field("event_handlers", &self.event_handler_count())
			.finish()
	}
}
