//! Per-request transaction context.
//!
//! A [`Transaction`] carries the trace id, caller metadata, compensating
//! actions and event handlers of one logical request. A
//! [`TransactionRegistry`] scoped to the request's execution context lets
//! code anywhere in the call chain retrieve the current transaction without
//! threading it through every signature.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reqtxn::{Config, TransactionError, TransactionParams, TransactionRegistry, registry};
//!
//! # async fn handle() -> Result<(), TransactionError> {
//! let txns = Arc::new(TransactionRegistry::from_config(Config::new("identity")));
//! txns
//! 	.run(TransactionParams::operation("identity.User", "create"), |txn| async move {
//! 		txn.set_meta("domain_id", "d1");
//! 		// Deeper in the call chain, without passing `txn` along:
//! 		let current = registry::get_transaction(None, false)?.expect("registered");
//! 		current.add_rollback(|_, _| Ok(()), vec![], Default::default());
//! 		Ok::<_, TransactionError>(())
//! 	})
//! 	.await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod telemetry;
pub mod trace;
pub mod transaction;

pub use config::{Config, LogFormat, LoggingConfig, ServiceConfig};
pub use error::{ConfigError, TransactionError};
pub use handler::{EventHandler, EventStatus, HandlerFailurePolicy, LogEventHandler};
pub use registry::{TransactionGuard, TransactionRegistry, TransactionRegistryBuilder};
pub use trace::{ActiveSpanContext, FixedTraceProvider, OtelTraceProvider, TraceProvider};
pub use transaction::{CONNECTION_META_KEYS, Rollback, Transaction, TransactionParams};
