// Tracing capability used to resolve the current transaction

use opentelemetry::Context;
use opentelemetry::trace::{TraceContextExt, TraceId};

pub use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

/// Snapshot of the span context that is active for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpanContext {
	/// Whether the tracing subsystem is recording this trace
	pub sampled: bool,
	pub trace_id: TraceId,
}

impl ActiveSpanContext {
	pub fn sampled(trace_id: TraceId) -> Self {
		Self {
			sampled: true,
			trace_id,
		}
	}

	pub fn not_sampled() -> Self {
		Self {
			sampled: false,
			trace_id: TraceId::INVALID,
		}
	}
}

/// Source of the active span context.
///
/// Queried on every lookup, so implementations must be cheap and free of
/// side effects.
pub trait TraceProvider: Send + Sync {
	fn active_span_context(&self) -> ActiveSpanContext;
}

/// Reads the span attached to the current OpenTelemetry [`Context`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OtelTraceProvider;

impl TraceProvider for OtelTraceProvider {
	fn active_span_context(&self) -> ActiveSpanContext {
		let cx = Context::current();
		let span = cx.span();
		let sc = span.span_context();
		ActiveSpanContext {
			sampled: sc.is_valid() && sc.is_sampled(),
			trace_id: sc.trace_id(),
		}
	}
}

/// Always reports the same span context.
#[derive(Debug, Clone, Copy)]
pub struct FixedTraceProvider(pub ActiveSpanContext);

impl FixedTraceProvider {
	pub fn not_sampled() -> Self {
		Self(ActiveSpanContext::not_sampled())
	}
}

impl TraceProvider for FixedTraceProvider {
	fn active_span_context(&self) -> ActiveSpanContext {
		self.0
	}
}

/// Canonical string form of a trace id: 32 lowercase hex characters.
pub fn format_trace_id(trace_id: TraceId) -> String {
	format!("{trace_id:032x}")
}
