//! Shared types for the wanfail multi-WAN failover daemon.
//!
//! This crate contains:
//! - **Data models**: link classes, metrics samples, score sets, decisions
//! - **Protocol records**: telemetry samples, audit events, status snapshots,
//!   operator actions, notification intents
//! - **Metrics**: Prometheus text rendering of a status snapshot

pub mod metrics;
pub mod models;
pub mod protocol;

pub use models::{
    Adjustment, Decision, FactorLevel, LinkClass, LinkId, MetricKind, Metrics, QualityFactor,
    Reason, ScoreBreakdown, ScoreSet, SwitchKind,
};
pub use protocol::{
    Action, ActionReply, Event, EventKind, LinkPhase, LinkStatus, NotificationIntent, Outcome,
    RunState, Sample, Severity, StatusSnapshot, StoreStats,
};
