//! Core of the wanfail multi-WAN failover daemon.
//!
//! - [`config`]: TOML configuration, resolved and validated
//! - [`scoring`]: per-link quality scores and trend tracking
//! - [`telemetry`]: bounded in-memory sample history and audit log
//! - [`decision`]: eligibility, hysteresis, and switch decisions
//! - [`controller`]: applying a decision to the router's routing stack
//! - [`runtime`]: the tick loop tying it together

pub mod config;
pub mod controller;
pub mod decision;
pub mod runtime;
pub mod scoring;
pub mod telemetry;

pub use config::{ConfigError, FailoverConfig, Link};
pub use controller::{Controller, ControllerError, RouteBackend};
pub use decision::{DecisionEngine, Verdict};
pub use runtime::{Clock, CollectError, Collector, Supervisor, SupervisorError, SupervisorHandle};
pub use scoring::Scorer;
pub use telemetry::TelemetryStore;
