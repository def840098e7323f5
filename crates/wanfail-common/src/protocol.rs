//! Records exchanged between the failover core and its operators.
//!
//! The telemetry store holds [`Sample`]s and [`Event`]s, the supervisor
//! publishes [`StatusSnapshot`]s, the control API accepts [`Action`]s, and
//! every non-stable decision yields a [`NotificationIntent`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Decision, LinkClass, LinkId, Metrics, QualityFactor, Reason, ScoreBreakdown, ScoreSet,
    SwitchKind,
};

// ── Telemetry records ───────────────────────────────────────────────

/// One ingested observation with the scores it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub link: LinkId,
    pub timestamp: DateTime<Utc>,
    pub metrics: Metrics,
    pub scores: ScoreSet,
}

/// Result of handing a decision to the routing controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Decision did not require the controller.
    NotApplied,
    /// External routing state was changed and verified.
    Applied,
    /// Target was already active; nothing was mutated.
    AlreadyActive,
    /// Mutation or verification failed after retries.
    Failed { error: String },
    /// Tick interrupted by reload or shutdown before completion.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Applied | Outcome::AlreadyActive)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::NotApplied => write!(f, "not_applied"),
            Outcome::Applied => write!(f, "applied"),
            Outcome::AlreadyActive => write!(f, "already_active"),
            Outcome::Failed { error } => write!(f, "failed: {error}"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle position of a link in the decision state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    WarmingUp,
    Eligible,
    Ineligible,
    Disabled,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkPhase::WarmingUp => write!(f, "warming_up"),
            LinkPhase::Eligible => write!(f, "eligible"),
            LinkPhase::Ineligible => write!(f, "ineligible"),
            LinkPhase::Disabled => write!(f, "disabled"),
        }
    }
}

/// Current quality run of a link, relative to its class thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Within restore thresholds.
    Good,
    /// Between restore and fail thresholds.
    Marginal,
    /// At or past fail thresholds.
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Decision {
        decision: Decision,
        outcome: Outcome,
    },
    Eligibility {
        link: LinkId,
        phase: LinkPhase,
        cause: String,
    },
    LinkAdded {
        link: LinkId,
    },
    LinkRemoved {
        link: LinkId,
    },
    ConfigReloaded {
        changes: Vec<String>,
    },
    ConfigRejected {
        error: String,
    },
}

/// One audit-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number assigned by the store.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub id: LinkId,
    pub class: LinkClass,
    pub iface: String,
    pub weight: u32,
    /// Position among eligible links, 1-based.
    pub rank: Option<usize>,
    pub phase: LinkPhase,
    pub eligible: bool,
    pub primary: bool,
    pub run: Option<RunState>,
    pub run_since: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub missed: u32,
    pub scores: Option<ScoreSet>,
    pub breakdown: Option<ScoreBreakdown>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub samples: BTreeMap<LinkId, usize>,
    pub events: usize,
    pub estimated_bytes: usize,
    pub max_bytes: usize,
    pub compactions: u64,
}

/// Consistent view of one completed tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub tick: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub primary: Option<LinkId>,
    pub no_eligible: bool,
    pub last_decision: Option<Decision>,
    pub links: Vec<LinkStatus>,
    pub store: StoreStats,
}

impl StatusSnapshot {
    pub fn link(&self, id: &str) -> Option<&LinkStatus> {
        self.links.iter().find(|l| l.id == id)
    }
}

// ── Operator actions ────────────────────────────────────────────────

/// Manual request accepted by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Switch away from the current primary, optionally to a given link.
    Failover {
        #[serde(default)]
        to: Option<LinkId>,
    },
    /// Return to the most preferred eligible link.
    Restore,
    /// Re-evaluate immediately and reset the predictive rate limiter.
    Recheck,
    Disable {
        link: LinkId,
    },
    Enable {
        link: LinkId,
    },
    SetLogLevel {
        level: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    pub accepted: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl ActionReply {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
            decision: None,
            outcome: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
            decision: None,
            outcome: None,
        }
    }
}

// ── Notifications ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What an external notifier should tell a human. Delivery is not our job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub kind: SwitchKind,
    pub reason: Reason,
    pub from: Option<LinkId>,
    pub to: Option<LinkId>,
    pub outcome: Outcome,
    pub no_eligible: bool,
    pub quality_factors: BTreeMap<LinkId, Vec<QualityFactor>>,
    pub message: String,
}

impl NotificationIntent {
    pub fn from_decision(decision: &Decision, outcome: &Outcome) -> Self {
        let severity = if decision.no_eligible {
            Severity::Critical
        } else if matches!(outcome, Outcome::Failed { .. }) {
            Severity::Warning
        } else {
            match (decision.reason, decision.kind) {
                (Reason::Predictive, _) | (_, SwitchKind::Failover) => Severity::Warning,
                _ => Severity::Info,
            }
        };

        let from = decision.from.as_deref().unwrap_or("none");
        let to = decision.to.as_deref().unwrap_or("none");
        let message = if decision.no_eligible {
            format!("no eligible uplink, keeping {from}")
        } else {
            format!(
                "{} {from} -> {to} ({}, delta {:.1}): {outcome}",
                decision.kind, decision.reason, decision.delta
            )
        };

        Self {
            timestamp: decision.timestamp,
            severity,
            kind: decision.kind,
            reason: decision.reason,
            from: decision.from.clone(),
            to: decision.to.clone(),
            outcome: outcome.clone(),
            no_eligible: decision.no_eligible,
            quality_factors: decision.quality_factors.clone(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    // ─── Actions ────────────────────────────────────────────────────────

    #[test]
    fn action_parses_tagged_json() {
        let a: Action = serde_json::from_str(r#"{"action":"failover","to":"wwan"}"#).unwrap();
        assert_eq!(a, Action::Failover { to: Some("wwan".into()) });

        let a: Action = serde_json::from_str(r#"{"action":"failover"}"#).unwrap();
        assert_eq!(a, Action::Failover { to: None });

        let a: Action = serde_json::from_str(r#"{"action":"set_log_level","level":"debug"}"#).unwrap();
        assert_eq!(a, Action::SetLogLevel { level: "debug".into() });
    }

    // ─── Events ─────────────────────────────────────────────────────────

    #[test]
    fn event_flattens_kind() {
        let ev = Event {
            seq: 7,
            timestamp: t0(),
            kind: EventKind::ConfigRejected { error: "bad alpha".into() },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "config_rejected");
        assert_eq!(json["seq"], 7);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn outcome_success_covers_noop() {
        assert!(Outcome::Applied.is_success());
        assert!(Outcome::AlreadyActive.is_success());
        assert!(!Outcome::Failed { error: "x".into() }.is_success());
        assert!(!Outcome::Cancelled.is_success());
    }

    // ─── Notifications ──────────────────────────────────────────────────

    #[test]
    fn failover_intent_is_warning() {
        let d = Decision::switch(
            t0(),
            Some("starlink".into()),
            "wwan".into(),
            Reason::Threshold,
            SwitchKind::Failover,
            14.2,
        );
        let intent = NotificationIntent::from_decision(&d, &Outcome::Applied);
        assert_eq!(intent.severity, Severity::Warning);
        assert!(intent.message.contains("starlink -> wwan"));
    }

    #[test]
    fn no_eligible_intent_is_critical() {
        let mut d = Decision::stable(t0(), Some("starlink".into()));
        d.no_eligible = true;
        let intent = NotificationIntent::from_decision(&d, &Outcome::NotApplied);
        assert_eq!(intent.severity, Severity::Critical);
    }

    #[test]
    fn failback_intent_is_info() {
        let d = Decision::switch(
            t0(),
            Some("wwan".into()),
            "starlink".into(),
            Reason::Threshold,
            SwitchKind::Failback,
            11.0,
        );
        let intent = NotificationIntent::from_decision(&d, &Outcome::Applied);
        assert_eq!(intent.severity, Severity::Info);
    }
}
