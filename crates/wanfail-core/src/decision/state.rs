//! Per-link eligibility bookkeeping.
//!
//! `warming_up → eligible ↔ ineligible`, with `disabled` reachable from any
//! phase by operator action or `detect = "disable"`. A link becomes eligible
//! only after `min_uptime` of continuous reporting; missing
//! `missed_sample_limit` ticks in a row makes it ineligible until it reports
//! again and re-warms.

use chrono::{DateTime, TimeDelta, Utc};
use wanfail_common::{LinkPhase, Metrics, RunState};

use crate::config::Detect;

/// A phase change worth recording in the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: LinkPhase,
    pub to: LinkPhase,
    pub cause: String,
}

#[derive(Debug, Clone)]
pub struct LinkState {
    pub phase: LinkPhase,
    /// Start of the current uninterrupted reporting stretch.
    pub up_since: Option<DateTime<Utc>>,
    pub run: Option<RunState>,
    /// When the current good/marginal/bad run began.
    pub since: Option<DateTime<Utc>>,
    /// No switch to this link before this instant; for the primary, no
    /// switch away from it either.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub misses: u32,
    pub disabled: bool,
    pub last_sample: Option<DateTime<Utc>>,
    pub last_metrics: Option<Metrics>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            phase: LinkPhase::WarmingUp,
            up_since: None,
            run: None,
            since: None,
            cooldown_until: None,
            last_change: None,
            misses: 0,
            disabled: false,
            last_sample: None,
            last_metrics: None,
        }
    }
}

impl LinkState {
    pub fn eligible(&self) -> bool {
        self.phase == LinkPhase::Eligible
    }

    /// How long the current run has lasted at `now`.
    pub fn run_for(&self, now: DateTime<Utc>) -> TimeDelta {
        self.since.map(|s| now - s).unwrap_or(TimeDelta::zero())
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Record a fresh sample classified as `run`.
    pub fn observe(
        &mut self,
        m: &Metrics,
        run: RunState,
        detect: Detect,
        min_uptime: TimeDelta,
    ) -> Option<Transition> {
        let at = m.timestamp;
        self.misses = 0;
        self.last_sample = Some(at);
        self.last_metrics = Some(m.clone());
        if self.run != Some(run) {
            self.run = Some(run);
            self.since = Some(at);
        }

        let from = self.phase;
        if self.disabled || detect == Detect::Disable {
            return self.enter(LinkPhase::Disabled, "disabled by configuration");
        }

        if matches!(from, LinkPhase::Ineligible | LinkPhase::Disabled) || self.up_since.is_none() {
            self.up_since = Some(at);
            self.phase = LinkPhase::WarmingUp;
        }

        if self.phase == LinkPhase::WarmingUp {
            let up = self.up_since.map(|u| at - u).unwrap_or(TimeDelta::zero());
            if detect == Detect::Force || up >= min_uptime {
                self.phase = LinkPhase::Eligible;
            }
        }

        (self.phase != from).then(|| Transition {
            from,
            to: self.phase,
            cause: match self.phase {
                LinkPhase::Eligible if detect == Detect::Force => "forced eligible".into(),
                LinkPhase::Eligible => format!("up for {}s", min_uptime.num_seconds()),
                _ => "reporting again".into(),
            },
        })
    }

    /// Record a tick without a sample.
    pub fn miss(&mut self, limit: u32) -> Option<Transition> {
        self.misses = self.misses.saturating_add(1);
        if self.misses < limit || matches!(self.phase, LinkPhase::Ineligible | LinkPhase::Disabled)
        {
            return None;
        }
        self.up_since = None;
        self.run = None;
        self.since = None;
        let cause = format!("{} consecutive missed samples", self.misses);
        self.enter(LinkPhase::Ineligible, cause)
    }

    /// Operator disable/enable. Re-enabled links warm up again.
    pub fn set_disabled(&mut self, disabled: bool) -> Option<Transition> {
        self.disabled = disabled;
        if disabled {
            return self.enter(LinkPhase::Disabled, "disabled by operator");
        }
        if self.phase != LinkPhase::Disabled {
            return None;
        }
        self.up_since = None;
        self.enter(LinkPhase::WarmingUp, "enabled by operator")
    }

    fn enter(&mut self, to: LinkPhase, cause: impl Into<String>) -> Option<Transition> {
        let from = self.phase;
        if from == to {
            return None;
        }
        self.phase = to;
        Some(Transition {
            from,
            to,
            cause: cause.into(),
        })
    }
}
