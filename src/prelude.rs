//! Convenient re-exports for common quotabox types.
pub use crate::{
    bucket::{BucketHandle, Data, Decision, Usage},
    config::{BucketConfig, ConfigError},
    error::{LimitError, QuotaError},
    manager::BucketManager,
    middleware::QuotaLayer,
    telemetry::{LogSink, MemorySink, QuotaEvent, TelemetrySink},
};
