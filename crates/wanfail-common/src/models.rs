//! Data model shared by the failover core and the agent.
//!
//! Samples are produced by collectors, scores and decisions by the core.
//! Everything here is plain data: serializable, immutable once built, and
//! free of I/O so it can travel over the control API unchanged.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable name of an uplink (`starlink`, `wwan0`, ...).
pub type LinkId = CompactString;

// ── Link class ──────────────────────────────────────────────────────

/// Physical kind of uplink, fixed when the link is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkClass {
    Satellite,
    Cellular,
    Wifi,
    Lan,
    Generic,
}

impl LinkClass {
    pub const ALL: [LinkClass; 5] = [
        LinkClass::Satellite,
        LinkClass::Cellular,
        LinkClass::Wifi,
        LinkClass::Lan,
        LinkClass::Generic,
    ];

    /// Tie-break preference when two links share score and weight.
    /// Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            LinkClass::Lan => 5,
            LinkClass::Satellite => 4,
            LinkClass::Cellular => 3,
            LinkClass::Wifi => 2,
            LinkClass::Generic => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkClass::Satellite => "satellite",
            LinkClass::Cellular => "cellular",
            LinkClass::Wifi => "wifi",
            LinkClass::Lan => "lan",
            LinkClass::Generic => "generic",
        }
    }
}

impl std::fmt::Display for LinkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "satellite" | "starlink" => Ok(LinkClass::Satellite),
            "cellular" => Ok(LinkClass::Cellular),
            "wifi" => Ok(LinkClass::Wifi),
            "lan" => Ok(LinkClass::Lan),
            "generic" | "other" => Ok(LinkClass::Generic),
            other => Err(format!("unknown link class: {other}")),
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────

/// One observation of a link, as reported by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,

    /// Fraction of sky obstructed, in percent (satellite).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obstruction_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrp_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsrq_db: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sinr_db: Option<f64>,
    /// Received signal strength (Wi-Fi).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_dbm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr_db: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roaming: Option<bool>,
}

impl Metrics {
    pub fn new(timestamp: DateTime<Utc>, latency_ms: f64, loss_pct: f64, jitter_ms: f64) -> Self {
        Self {
            timestamp,
            latency_ms,
            loss_pct,
            jitter_ms,
            obstruction_pct: None,
            rsrp_dbm: None,
            rsrq_db: None,
            sinr_db: None,
            signal_dbm: None,
            snr_db: None,
            roaming: None,
        }
    }

    pub fn with_obstruction(mut self, pct: f64) -> Self {
        self.obstruction_pct = Some(pct);
        self
    }

    pub fn with_cellular(mut self, rsrp_dbm: f64, rsrq_db: f64, sinr_db: f64) -> Self {
        self.rsrp_dbm = Some(rsrp_dbm);
        self.rsrq_db = Some(rsrq_db);
        self.sinr_db = Some(sinr_db);
        self
    }

    pub fn with_wifi(mut self, signal_dbm: f64, snr_db: Option<f64>) -> Self {
        self.signal_dbm = Some(signal_dbm);
        self.snr_db = snr_db;
        self
    }

    pub fn with_roaming(mut self, roaming: bool) -> Self {
        self.roaming = Some(roaming);
        self
    }
}

// ── Scores ──────────────────────────────────────────────────────────

/// The four-tier score of one link after one ingested sample.
///
/// Every field is in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSet {
    pub instant: f64,
    pub ewma: f64,
    pub window_avg: f64,
    #[serde(rename = "final")]
    pub final_score: f64,
}

impl ScoreSet {
    /// Blend weights for instant, ewma and window average.
    pub const BLEND: (f64, f64, f64) = (0.30, 0.50, 0.20);

    pub fn blend(instant: f64, ewma: f64, window_avg: f64) -> Self {
        let (wi, we, ww) = Self::BLEND;
        let final_score = (wi * instant + we * ewma + ww * window_avg).clamp(0.0, 100.0);
        Self {
            instant,
            ewma,
            window_avg,
            final_score,
        }
    }
}

/// How an instant score was assembled, for operators asking "why?".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub class_weight: f64,
    pub latency: f64,
    pub loss: f64,
    pub jitter: f64,
    pub obstruction: f64,
    pub penalties: Vec<Adjustment>,
    pub bonuses: Vec<Adjustment>,
}

/// A named penalty or bonus applied to an instant score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub name: String,
    pub points: f64,
}

// ── Decisions ───────────────────────────────────────────────────────

/// Why a decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Stable,
    Threshold,
    Predictive,
    Manual,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Stable => write!(f, "stable"),
            Reason::Threshold => write!(f, "threshold"),
            Reason::Predictive => write!(f, "predictive"),
            Reason::Manual => write!(f, "manual"),
        }
    }
}

/// Direction of a switch, independent of what triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    /// No change of primary.
    Hold,
    /// First primary chosen after startup.
    Initial,
    /// Away from a failing or degrading primary.
    Failover,
    /// Back to a preferred link that has recovered.
    Failback,
}

impl std::fmt::Display for SwitchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchKind::Hold => write!(f, "hold"),
            SwitchKind::Initial => write!(f, "initial"),
            SwitchKind::Failover => write!(f, "failover"),
            SwitchKind::Failback => write!(f, "failback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Loss,
    Jitter,
    Obstruction,
    Sinr,
    Signal,
    Availability,
}

/// Which side of a threshold a metric landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorLevel {
    /// At or beyond the fail threshold.
    Fail,
    /// Within the restore threshold.
    Healthy,
    /// Rising faster than the configured trend rate.
    Trend,
    /// Link stopped reporting or was disabled.
    Unavailable,
}

/// One metric that contributed to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityFactor {
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
    pub level: FactorLevel,
}

/// One evaluation outcome of the decision engine.
///
/// `from == to` means no change. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub from: Option<LinkId>,
    pub to: Option<LinkId>,
    pub reason: Reason,
    pub kind: SwitchKind,
    /// Final-score advantage of `to` over `from` at decision time.
    pub delta: f64,
    /// Set when no link was eligible and the previous primary was kept.
    #[serde(default)]
    pub no_eligible: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quality_factors: BTreeMap<LinkId, Vec<QualityFactor>>,
}

impl Decision {
    pub fn stable(timestamp: DateTime<Utc>, current: Option<LinkId>) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp,
            from: current.clone(),
            to: current,
            reason: Reason::Stable,
            kind: SwitchKind::Hold,
            delta: 0.0,
            no_eligible: false,
            quality_factors: BTreeMap::new(),
        }
    }

    pub fn switch(
        timestamp: DateTime<Utc>,
        from: Option<LinkId>,
        to: LinkId,
        reason: Reason,
        kind: SwitchKind,
        delta: f64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp,
            from,
            to: Some(to),
            reason,
            kind,
            delta,
            no_eligible: false,
            quality_factors: BTreeMap::new(),
        }
    }

    /// Whether this decision asks for a change of primary.
    pub fn is_switch(&self) -> bool {
        self.to.is_some() && self.from != self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn link_class_roundtrips_through_str() {
        for class in LinkClass::ALL {
            let parsed: LinkClass = class.to_string().parse().unwrap();
            assert_eq!(parsed, class);
        }
        assert_eq!("starlink".parse::<LinkClass>().unwrap(), LinkClass::Satellite);
        assert!("dialup".parse::<LinkClass>().is_err());
    }

    #[test]
    fn lan_outranks_everything() {
        let top = LinkClass::ALL.iter().max_by_key(|c| c.priority()).unwrap();
        assert_eq!(*top, LinkClass::Lan);
    }

    #[test]
    fn blend_uses_fixed_weights() {
        let s = ScoreSet::blend(50.0, 80.0, 100.0);
        assert!((s.final_score - (15.0 + 40.0 + 20.0)).abs() < 1e-9);
    }

    #[test]
    fn stable_decision_is_not_a_switch() {
        let d = Decision::stable(t0(), Some("wan".into()));
        assert!(!d.is_switch());
        assert_eq!(d.reason, Reason::Stable);

        let s = Decision::switch(
            t0(),
            Some("wan".into()),
            "wwan".into(),
            Reason::Threshold,
            SwitchKind::Failover,
            12.0,
        );
        assert!(s.is_switch());
    }

    #[test]
    fn score_set_serializes_final_field() {
        let json = serde_json::to_value(ScoreSet::blend(10.0, 10.0, 10.0)).unwrap();
        assert!(json.get("final").is_some());
    }

    #[test]
    fn optional_metrics_are_omitted() {
        let m = Metrics::new(t0(), 40.0, 0.0, 2.0);
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("obstruction_pct"));

        let back: Metrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
