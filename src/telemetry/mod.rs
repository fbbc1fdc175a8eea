//! Telemetry for bucket lifecycle and admission decisions.
//!
//! Buckets and the manager emit [`QuotaEvent`]s into a [`TelemetrySink`], which
//! is a `tower::Service<QuotaEvent>`. Emission is best-effort and never blocks a
//! bucket's processing step on a slow or failing sink.
//!
//! - **Lifecycle**: `Created`, `Terminated { reason }`
//! - **Admission**: `Refreshed`, `Denied`

pub mod events;
pub mod sinks;

pub use events::{QuotaEvent, TerminationReason};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
