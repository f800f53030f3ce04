//! Foundational types shared across Syncline crates.
//!
//! Defines the configuration tree, the error taxonomy, the declarative
//! table-spec model, the row/value helpers, the retry-with-circuit-breaker
//! layer, and small filesystem/time utilities used by the sync runtime.

pub mod config;
pub mod error;
pub mod fsio;
pub mod retry;
pub mod spec;
pub mod time_utils;
pub mod value;

pub use config::{
    load_config, AppConfig, BreakerConfig, GatewayConfig, RetryConfig, RetryStrategy,
    ScheduleConfig, StoreConfig, SyncOptions,
};
pub use error::SyncError;
pub use fsio::write_text_atomic;
pub use retry::{CircuitBreaker, CircuitState, CircuitStatus, RetryCircuit};
pub use spec::{
    load_table_specs, CascadeTarget, FieldKind, FieldSpec, SpecSet, TableNature, TableSpec,
};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, now_iso};
pub use value::{row_i64, row_text, Row};
