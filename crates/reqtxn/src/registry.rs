//! Execution-context-scoped transaction registry.
//!
//! A [`TransactionRegistry`] belongs to one execution context (one in-flight
//! request). It can be passed down explicitly, or installed as the
//! task-local registry with [`scope`] / [`sync_scope`] so that code deeper in
//! the call chain reaches it through the free functions in this module.
//!
//! Resolution of the "current" transaction prefers, in order: the trace id of
//! an active sampled span, an explicitly supplied trace id, the transaction
//! most recently created in this context, and finally a new transaction.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{Config, ServiceConfig};
use crate::error::TransactionError;
use crate::handler::{EventHandler, EventStatus, HandlerFailurePolicy};
use crate::trace::{IdGenerator, OtelTraceProvider, RandomIdGenerator, TraceProvider, format_trace_id};
use crate::transaction::{Transaction, TransactionParams};

tokio::task_local! {
	static CURRENT_REGISTRY: Arc<TransactionRegistry>;
}

#[derive(Default)]
struct Storage {
	transactions: HashMap<String, Arc<Transaction>>,
	// Id of the last transaction created in this context
	current: Option<String>,
}

pub struct TransactionRegistry {
	storage: Mutex<Storage>,
	config: Arc<dyn ServiceConfig>,
	tracer: Arc<dyn TraceProvider>,
	ids: Arc<dyn IdGenerator>,
	event_handlers: Vec<Arc<dyn EventHandler>>,
	handler_failure_policy: HandlerFailurePolicy,
}

pub struct TransactionRegistryBuilder {
	config: Arc<dyn ServiceConfig>,
	tracer: Arc<dyn TraceProvider>,
	ids: Arc<dyn IdGenerator>,
	event_handlers: Vec<Arc<dyn EventHandler>>,
	handler_failure_policy: HandlerFailurePolicy,
}

impl TransactionRegistryBuilder {
	pub fn trace_provider(mut self, tracer: Arc<dyn TraceProvider>) -> Self {
		self.tracer = tracer;
		self
	}

	pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
		self.ids = ids;
		self
	}

	/// Handler attached to every transaction this registry creates.
	pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.event_handlers.push(handler);
		self
	}

	pub fn handler_failure_policy(mut self, policy: HandlerFailurePolicy) -> Self {
		self.handler_failure_policy = policy;
		self
	}

	pub fn build(self) -> TransactionRegistry {
		TransactionRegistry {
			storage: Mutex::new(Storage::default()),
			config: self.config,
			tracer: self.tracer,
			ids: self.ids,
			event_handlers: self.event_handlers,
			handler_failure_policy: self.handler_failure_policy,
		}
	}
}

impl TransactionRegistry {
	/// Start building a registry that reads the service name from `config`.
	///
	/// Defaults: OpenTelemetry trace provider, random trace ids, no event
	/// handlers, isolated handler failures.
	pub fn builder(config: Arc<dyn ServiceConfig>) -> TransactionRegistryBuilder {
		TransactionRegistryBuilder {
			config,
			tracer: Arc::new(OtelTraceProvider),
			ids: Arc::new(RandomIdGenerator::default()),
			event_handlers: Vec::new(),
			handler_failure_policy: HandlerFailurePolicy::default(),
		}
	}

	/// Registry with defaults, taking the handler failure policy from `config`.
	pub fn from_config(config: Config) -> Self {
		let policy = config.handler_failure_policy;
		Self::builder(Arc::new(config))
			.handler_failure_policy(policy)
			.build()
	}

	/// Resolve the current transaction.
	///
	/// A sampled active span or an explicit `trace_id` is authoritative: a
	/// miss under either returns `Ok(None)` without creating anything.
	/// Otherwise the last transaction created in this context is returned,
	/// and failing that a new one is created when `create` is set.
	pub fn get_transaction(
		&self,
		trace_id: Option<&str>,
		create: bool,
	) -> Result<Option<Arc<Transaction>>, TransactionError> {
		let active = self.tracer.active_span_context();
		if active.sampled {
			let id = format_trace_id(active.trace_id);
			return Ok(self.storage.lock().transactions.get(&id).cloned());
		}
		if let Some(id) = trace_id {
			return Ok(self.storage.lock().transactions.get(id).cloned());
		}
		{
			let storage = self.storage.lock();
			if let Some(txn) = storage
				.current
				.as_ref()
				.and_then(|id| storage.transactions.get(id))
			{
				return Ok(Some(txn.clone()));
			}
		}
		if create {
			return self.create_transaction(TransactionParams::default()).map(Some);
		}
		Ok(None)
	}

	/// Construct a transaction and register it under its id.
	///
	/// Without a supplied trace id, the id of an active sampled span is used
	/// so later lookups under that span find this transaction. An existing
	/// entry with the same id is replaced.
	pub fn create_transaction(
		&self,
		mut params: TransactionParams,
	) -> Result<Arc<Transaction>, TransactionError> {
		if params.trace_id.as_deref().is_none_or(str::is_empty) {
			let active = self.tracer.active_span_context();
			if active.sampled {
				params.trace_id = Some(format_trace_id(active.trace_id));
			}
		}
		let txn = Transaction::new(params, self.config.as_ref(), self.ids.as_ref())?
			.with_handler_failure_policy(self.handler_failure_policy);
		for handler in &self.event_handlers {
			txn.add_event_handler(handler.clone());
		}
		let txn = Arc::new(txn);

		let mut storage = self.storage.lock();
		if storage
			.transactions
			.insert(txn.id().to_string(), txn.clone())
			.is_some()
		{
			debug!(transaction_id = %txn.id(), "replaced existing transaction");
		}
		storage.current = Some(txn.id().to_string());
		debug!(
			transaction_id = %txn.id(),
			service = %txn.service(),
			resource = ?txn.resource(),
			verb = ?txn.verb(),
			"created transaction"
		);
		Ok(txn)
	}

	/// Deregister the current transaction, if any.
	pub fn delete_transaction(&self) -> Result<(), TransactionError> {
		if let Some(txn) = self.get_transaction(None, false)? {
			self.remove(txn.id());
		}
		Ok(())
	}

	/// Deregister the transaction stored under `id`.
	pub fn remove(&self, id: &str) -> Option<Arc<Transaction>> {
		let mut storage = self.storage.lock();
		let removed = storage.transactions.remove(id);
		if storage.current.as_deref() == Some(id) {
			storage.current = None;
		}
		if removed.is_some() {
			debug!(transaction_id = %id, "deleted transaction");
		}
		removed
	}

	pub fn contains(&self, id: &str) -> bool {
		self.storage.lock().transactions.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.storage.lock().transactions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.storage.lock().transactions.is_empty()
	}

	/// Run `f` as one request: create the transaction, install this registry
	/// as the task-local one, and on return deregister the transaction.
	///
	/// When `f` fails the compensating actions run and handlers are told
	/// `FAILURE`; on success they are told `SUCCESS`. Notification errors on
	/// those final events are logged rather than returned. The transaction is
	/// deregistered even if the returned future is dropped or `f` panics.
	pub async fn run<F, Fut, T, E>(self: Arc<Self>, params: TransactionParams, f: F) -> Result<T, E>
	where
		F: FnOnce(Arc<Transaction>) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: From<TransactionError> + fmt::Display,
	{
		let guard = self.enter(params)?;
		let txn = guard.transaction().clone();
		let body_txn = txn.clone();
		let result = CURRENT_REGISTRY
			.scope(self.clone(), async move { f(body_txn).await })
			.await;

		match &result {
			Ok(_) => {
				if let Err(e) = txn.notify_status(EventStatus::Success, "completed") {
					warn!(transaction_id = %txn.id(), error = %e, "failed to report success");
				}
			},
			Err(e) => {
				txn.execute_rollback();
				if let Err(notify_err) = txn.notify_status(EventStatus::Failure, e.to_string()) {
					warn!(transaction_id = %txn.id(), error = %notify_err, "failed to report failure");
				}
			},
		}
		drop(guard);
		result
	}

	/// Create a transaction whose registration lasts as long as the guard.
	pub fn enter(&self, params: TransactionParams) -> Result<TransactionGuard<'_>, TransactionError> {
		let txn = self.create_transaction(params)?;
		Ok(TransactionGuard {
			registry: self,
			txn,
		})
	}
}

impl fmt::Debug for TransactionRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let storage = self.storage.lock();
		f.debug_struct("TransactionRegistry")
			.field("transactions", &storage.transactions.len())
			.field("current", &storage.current)
			.field("event_handlers", &self.event_handlers.len())
			.field("handler_failure_policy", &self.handler_failure_policy)
			.finish()
	}
}

/// Keeps a transaction registered until dropped.
pub struct TransactionGuard<'a> {
	registry: &'a TransactionRegistry,
	txn: Arc<Transaction>,
}

impl TransactionGuard<'_> {
	pub fn transaction(&self) -> &Arc<Transaction> {
		&self.txn
	}

	/// Run the compensating actions, then deregister.
	pub fn fail(self) {
		self.txn.execute_rollback();
	}
}

impl Deref for TransactionGuard<'_> {
	type Target = Transaction;

	fn deref(&self) -> &Transaction {
		&self.txn
	}
}

impl Drop for TransactionGuard<'_> {
	fn drop(&mut self) {
		self.registry.remove(self.txn.id());
	}
}

/// Run `fut` with `registry` installed as the task-local registry.
pub async fn scope<F: Future>(registry: Arc<TransactionRegistry>, fut: F) -> F::Output {
	CURRENT_REGISTRY.scope(registry, fut).await
}

/// Run `f` with `registry` installed as the registry for this thread.
pub fn sync_scope<F, R>(registry: Arc<TransactionRegistry>, f: F) -> R
where
	F: FnOnce() -> R,
{
	CURRENT_REGISTRY.sync_scope(registry, f)
}

/// The registry installed for the current execution context.
pub fn current_registry() -> Result<Arc<TransactionRegistry>, TransactionError> {
	CURRENT_REGISTRY
		.try_with(|r| r.clone())
		.map_err(|_| TransactionError::NoContext)
}

pub fn get_transaction(
	trace_id: Option<&str>,
	create: bool,
) -> Result<Option<Arc<Transaction>>, TransactionError> {
	current_registry()?.get_transaction(trace_id, create)
}

pub fn create_transaction(params: TransactionParams) -> Result<Arc<Transaction>, TransactionError> {
	current_registry()?.create_transaction(params)
}

pub fn delete_transaction() -> Result<(), TransactionError> {
	current_registry()?.delete_transaction()
}
