// Integration tests for compensating actions at the request boundary

use std::sync::Arc;

use parking_lot::Mutex;
use reqtxn::registry;
use reqtxn::{
	Config, EventHandler, EventStatus, FixedTraceProvider, Transaction, TransactionError,
	TransactionParams, TransactionRegistry,
};
use serde_json::{Map, Value, json};

#[derive(Default)]
struct Recorder {
	events: Mutex<Vec<(EventStatus, Map<String, Value>)>>,
}

impl EventHandler for Recorder {
	fn notify(
		&self,
		_transaction: &Transaction,
		status: EventStatus,
		message: &Map<String, Value>,
	) -> anyhow::Result<()> {
		self.events.lock().push((status, message.clone()));
		Ok(())
	}
}

fn registry_with(recorder: Arc<Recorder>) -> Arc<TransactionRegistry> {
	Arc::new(
		TransactionRegistry::builder(Arc::new(Config::new("identity")))
			.trace_provider(Arc::new(FixedTraceProvider::not_sampled()))
			.event_handler(recorder)
			.build(),
	)
}

#[derive(Debug, thiserror::Error)]
enum ServiceError {
	#[error("user quota exceeded")]
	QuotaExceeded,
	#[error(transparent)]
	Transaction(#[from] TransactionError),
}

/// The identity.User/create scenario: a failed request undoes the user it created.
#[test]
fn test_failed_create_is_compensated_once() {
	let reg = registry_with(Arc::new(Recorder::default()));
	let undone = Arc::new(Mutex::new(Vec::new()));

	let txn = reg
		.create_transaction(TransactionParams::operation("identity.User", "create"))
		.unwrap();
	txn.set_meta("domain_id", "d1");

	let u = undone.clone();
	let mut kwargs = Map::new();
	kwargs.insert("user_id".to_string(), json!("u1"));
	txn.add_rollback(
		move |_, kwargs| {
			u.lock().push(kwargs["user_id"].clone());
			Ok(())
		},
		vec![],
		kwargs,
	);

	// The request fails after the user was created
	txn.execute_rollback();
	assert_eq!(*undone.lock(), vec![json!("u1")]);

	reg.delete_transaction().unwrap();
	assert!(reg.get_transaction(None, false).unwrap().is_none());
}

#[tokio::test]
async fn test_run_rolls_back_on_error() {
	let recorder = Arc::new(Recorder::default());
	let reg = registry_with(recorder.clone());
	let undone = Arc::new(Mutex::new(Vec::new()));

	let u = undone.clone();
	let result: Result<(), ServiceError> = reg
		.clone()
		.run(
			TransactionParams::operation("identity.User", "create"),
			|_txn| async move {
				// Handlers deep in the call chain find the transaction on their own
				let txn = registry::get_transaction(None, false)?.expect("transaction registered");
				for step in ["user", "role_binding"] {
					let u = u.clone();
					txn.add_rollback(
						move |_, _| {
							u.lock().push(step);
							Ok(())
						},
						vec![],
						Map::new(),
					);
				}
				txn.notify_event("created user")?;
				Err(ServiceError::QuotaExceeded)
			},
		)
		.await;

	assert!(matches!(result, Err(ServiceError::QuotaExceeded)));
	assert_eq!(*undone.lock(), vec!["role_binding", "user"]);
	assert!(reg.is_empty());

	let events = recorder.events.lock();
	assert_eq!(events.len(), 2);
	assert_eq!(events[0].0, EventStatus::InProgress);
	assert_eq!(events[0].1["message"], "created user");
	assert_eq!(events[1].0, EventStatus::Failure);
	assert_eq!(events[1].1["message"], "user quota exceeded");
}

#[tokio::test]
async fn test_run_success_skips_rollback() {
	let recorder = Arc::new(Recorder::default());
	let reg = registry_with(recorder.clone());
	let undone = Arc::new(Mutex::new(0));

	let u = undone.clone();
	let id = reg
		.clone()
		.run(TransactionParams::new().with_trace_id("req-7"), |txn| async move {
			txn.add_rollback(
				move |_, _| {
					*u.lock() += 1;
					Ok(())
				},
				vec![],
				Map::new(),
			);
			Ok::<_, ServiceError>(txn.id().to_string())
		})
		.await
		.unwrap();

	assert_eq!(id, "req-7");
	assert_eq!(*undone.lock(), 0);
	assert!(reg.is_empty());
	assert_eq!(recorder.events.lock()[0].0, EventStatus::Success);
}

#[test]
fn test_guard_fail_runs_rollback_then_deregisters() {
	let reg = registry_with(Arc::new(Recorder::default()));
	let undone = Arc::new(Mutex::new(false));

	let guard = reg.enter(TransactionParams::new()).unwrap();
	let u = undone.clone();
	guard.add_rollback(
		move |_, _| {
			*u.lock() = true;
			Ok(())
		},
		vec![],
		Map::new(),
	);
	assert_eq!(reg.len(), 1);

	guard.fail();

	assert!(*undone.lock());
	assert!(reg.is_empty());
}

#[test]
fn test_every_compensator_runs_once_despite_failures() {
	let reg = registry_with(Arc::new(Recorder::default()));
	let txn = reg.create_transaction(TransactionParams::new()).unwrap();
	let counts = Arc::new(Mutex::new(vec![0usize; 6]));

	for i in 0..6 {
		let c = counts.clone();
		txn.add_rollback(
			move |_, _| {
				c.lock()[i] += 1;
				if i % 2 == 0 {
					anyhow::bail!("compensator {i} failed");
				}
				Ok(())
			},
			vec![],
			Map::new(),
		);
	}
	txn.execute_rollback();

	assert_eq!(*counts.lock(), vec![1; 6]);
}

#[tokio::test]
async fn test_run_deregisters_on_timeout_and_panic() {
	let reg = registry_with(Arc::new(Recorder::default()));

	let timed_out = tokio::time::timeout(
		std::time::Duration::from_millis(10),
		reg.clone().run(TransactionParams::new(), |_txn| async {
			tokio::time::sleep(std::time::Duration::from_secs(10)).await;
			Ok::<_, ServiceError>(())
		}),
	)
	.await;
	assert!(timed_out.is_err());
	assert_eq!(reg.len(), 0);

	let task = tokio::spawn(reg.clone().run(TransactionParams::new(), |txn| async move {
		if txn.rollback_count() == 0 {
			panic!("request handler bug");
		}
		Ok::<_, ServiceError>(())
	}));
	assert!(task.await.unwrap_err().is_panic());
	assert_eq!(reg.len(), 0);
}
