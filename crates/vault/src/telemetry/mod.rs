//! Telemetry setup: structured JSON logs, plus OTLP traces and metrics when a
//! collector endpoint is configured.
//!
//! # Telemetry invariants
//!
//! - **No plaintext values or key material** may appear in any span
//!   attribute, metric label, or log field.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`); `RUST_LOG`
//!   takes precedence when set.

pub mod init;

pub use init::{init_telemetry, Telemetry};
