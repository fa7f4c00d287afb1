//! Core alarm evaluation engine: telemetry cache, durable rule/state store,
//! the dispatcher that fans telemetry out to rule evaluations, and the
//! evaluator implementing the violation state machine.
//!
//! This crate is transport-agnostic — it knows nothing about MQTT, config
//! files, or the CLI. Those live in the binaries that depend on it.

pub mod cache;
pub mod dispatcher;
pub mod emitter;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod store;

pub use cache::TelemetryCache;
pub use dispatcher::{Dispatcher, DispatcherMetrics, DEFAULT_INTAKE_CAPACITY, DEFAULT_WORKER_LANES};
pub use error::EngineError;
pub use model::{
    AlarmHistoryRecord, AlarmKind, AlarmRule, AlarmState, AlarmStatus, ComparisonOperator,
    Telemetry,
};
pub use store::Store;
