//! # Decision Engine
//!
//! Ranks eligible links once per tick and decides whether the primary
//! should move. A switch needs the candidate to lead by `switch_margin` and
//! one of:
//!
//! - **failover**: the primary has been in a bad run for `fail_min_duration`
//!   (or is not eligible at all),
//! - **failback**: the candidate is preferred over the primary and has been
//!   in a good run for `restore_min_duration`,
//! - **predictive**: the primary shows a sustained degrading trend, at most
//!   once per `rate_limit_factor × fail_min_duration`.
//!
//! Cooldowns on both ends gate every automatic switch. The primary pointer
//! moves only when [`DecisionEngine::commit`] sees a successful outcome.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use wanfail_common::{
    Decision, FactorLevel, LinkId, LinkPhase, MetricKind, Metrics, Outcome, QualityFactor, Reason,
    RunState, SwitchKind,
};

use super::state::{LinkState, Transition};
use crate::config::{FailoverConfig, Link, Thresholds};
use crate::scoring::Scorer;
use crate::telemetry::store::to_delta;

/// A decision plus whether it belongs in the audit log.
///
/// Every switch attempt is audited; a stable decision only when it enters
/// the "no eligible link" condition.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub decision: Decision,
    pub audit: bool,
}

impl Verdict {
    fn quiet(decision: Decision) -> Self {
        Self {
            decision,
            audit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManualError {
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
    #[error("link {0} is disabled")]
    Disabled(LinkId),
    #[error("link {0} has not reported any sample")]
    NoData(LinkId),
    #[error("no eligible link to switch to")]
    NoCandidate,
}

#[derive(Debug, Default)]
pub struct DecisionEngine {
    states: BTreeMap<LinkId, LinkState>,
    primary: Option<LinkId>,
    last_predictive: Option<DateTime<Utc>>,
    no_eligible: bool,
    /// Whether any link has been eligible since startup. Startup warmup is
    /// not an outage.
    seen_eligible: bool,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary(&self) -> Option<&LinkId> {
        self.primary.as_ref()
    }

    pub fn state(&self, link: &str) -> Option<&LinkState> {
        self.states.get(link)
    }

    pub fn no_eligible(&self) -> bool {
        self.no_eligible
    }

    /// Take over a primary found active in the routing layer at startup.
    pub fn adopt(&mut self, link: LinkId) {
        self.primary = Some(link);
    }

    /// Track exactly the configured links. Returns `(added, removed)`.
    ///
    /// A removed primary stays the primary pointer until something else is
    /// promoted; it is treated as ineligible meanwhile.
    pub fn sync_links(&mut self, cfg: &FailoverConfig) -> (Vec<LinkId>, Vec<LinkId>) {
        let removed: Vec<LinkId> = self
            .states
            .keys()
            .filter(|id| cfg.link(id).is_none())
            .cloned()
            .collect();
        for id in &removed {
            self.states.remove(id);
        }
        let mut added = Vec::new();
        for link in &cfg.links {
            if !self.states.contains_key(&link.id) {
                self.states.insert(link.id.clone(), LinkState::default());
                added.push(link.id.clone());
            }
        }
        (added, removed)
    }

    pub fn observe(&mut self, cfg: &FailoverConfig, link: &Link, m: &Metrics) -> Option<Transition> {
        let run = cfg.thresholds.for_class(link.class).classify(m);
        let min_uptime = to_delta(cfg.min_uptime_for(link));
        self.states
            .entry(link.id.clone())
            .or_default()
            .observe(m, run, link.detect, min_uptime)
    }

    pub fn miss(&mut self, cfg: &FailoverConfig, link: &Link) -> Option<Transition> {
        self.states
            .entry(link.id.clone())
            .or_default()
            .miss(cfg.decision.missed_sample_limit)
    }

    pub fn set_disabled(
        &mut self,
        link: &str,
        disabled: bool,
    ) -> Result<Option<Transition>, ManualError> {
        self.states
            .get_mut(link)
            .map(|s| s.set_disabled(disabled))
            .ok_or_else(|| ManualError::UnknownLink(link.into()))
    }

    pub fn reset_predictive(&mut self) {
        self.last_predictive = None;
    }

    /// Eligible links with scores, best first: final score, then weight,
    /// then class priority, then id.
    pub fn ranking<'a>(&self, cfg: &'a FailoverConfig, scorer: &Scorer) -> Vec<(&'a Link, f64)> {
        let mut ranked: Vec<(&Link, f64)> = cfg
            .links
            .iter()
            .filter(|l| self.states.get(&l.id).is_some_and(LinkState::eligible))
            .filter_map(|l| scorer.scores(&l.id).map(|s| (l, s.final_score)))
            .collect();
        ranked.sort_by(|(a, fa), (b, fb)| {
            fb.total_cmp(fa)
                .then_with(|| b.preference().cmp(&a.preference()))
                .then_with(|| a.id.cmp(&b.id))
        });
        ranked
    }

    /// Run one evaluation.
    pub fn evaluate(&mut self, cfg: &FailoverConfig, scorer: &Scorer, now: DateTime<Utc>) -> Verdict {
        let ranked = self.ranking(cfg, scorer);

        let Some(&(top, top_final)) = ranked.first() else {
            return self.none_eligible(cfg, now);
        };
        self.seen_eligible = true;
        if self.no_eligible {
            info!(link = %top.id, "eligible link available again");
            self.no_eligible = false;
        }

        let Some(current) = self.primary.clone() else {
            info!(link = %top.id, score = top_final, "initial primary selected");
            let mut d = Decision::switch(
                now,
                None,
                top.id.clone(),
                Reason::Threshold,
                SwitchKind::Initial,
                top_final,
            );
            self.add_candidate_factors(cfg, top, &mut d);
            return Verdict {
                decision: d,
                audit: true,
            };
        };

        if current == top.id {
            return Verdict::quiet(Decision::stable(now, Some(current)));
        }

        let cur_link = cfg.link(&current);
        let cur_state = self.states.get(&current);
        let cur_up = cur_link.is_some() && cur_state.is_some_and(LinkState::eligible);
        let cur_final = if cur_up {
            scorer.scores(&current).map_or(0.0, |s| s.final_score)
        } else {
            0.0
        };
        let delta = top_final - cur_final;
        if delta < cfg.decision.switch_margin {
            return Verdict::quiet(Decision::stable(now, Some(current)));
        }

        let Some(top_state) = self.states.get(&top.id) else {
            return Verdict::quiet(Decision::stable(now, Some(current)));
        };

        let failing = !cur_up
            || cur_state.is_some_and(|s| {
                s.run == Some(RunState::Bad)
                    && s.run_for(now) >= to_delta(cfg.decision.fail_min_duration)
            });
        let recovered = cur_link.is_some_and(|c| top.preference() > c.preference())
            && top_state.run == Some(RunState::Good)
            && top_state.run_for(now) >= to_delta(cfg.decision.restore_min_duration);

        let signals = match cur_link {
            Some(l) if cur_up && !failing && !recovered => scorer.trend_signals(l),
            _ => Vec::new(),
        };
        let predictive_ready = self
            .last_predictive
            .is_none_or(|at| now - at >= to_delta(cfg.predictive_rate_limit()));

        let (reason, kind) = if failing {
            (Reason::Threshold, SwitchKind::Failover)
        } else if recovered {
            (Reason::Threshold, SwitchKind::Failback)
        } else if !signals.is_empty() && predictive_ready {
            (Reason::Predictive, SwitchKind::Failover)
        } else {
            debug!(
                current = %current,
                candidate = %top.id,
                delta,
                "candidate leads but no switch path is open"
            );
            return Verdict::quiet(Decision::stable(now, Some(current)));
        };

        let cur_cooling = cur_state.is_some_and(|s| s.in_cooldown(now));
        if cur_cooling || top_state.in_cooldown(now) {
            debug!(
                current = %current,
                candidate = %top.id,
                cur_cooling,
                "switch held back by cooldown"
            );
            return Verdict::quiet(Decision::stable(now, Some(current)));
        }

        let mut d = Decision::switch(now, Some(current.clone()), top.id.clone(), reason, kind, delta);
        match cur_link {
            Some(l) if cur_up => {
                let mut factors = self.threshold_factors(cfg, l, false);
                factors.extend(signals);
                d.quality_factors.insert(current.clone(), factors);
            }
            _ => {
                d.quality_factors
                    .insert(current.clone(), vec![self.unavailable(cfg, &current)]);
            }
        }
        self.add_candidate_factors(cfg, top, &mut d);

        if reason == Reason::Predictive {
            self.last_predictive = Some(now);
        }
        info!(
            from = %current,
            to = %top.id,
            %reason,
            %kind,
            delta,
            "switch decided"
        );
        Verdict {
            decision: d,
            audit: true,
        }
    }

    /// Operator-requested failover, bypassing hysteresis and cooldowns.
    pub fn manual_failover(
        &mut self,
        cfg: &FailoverConfig,
        scorer: &Scorer,
        to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Decision, ManualError> {
        let target = match to {
            Some(id) => self.manual_target(cfg, id)?,
            None => self
                .ranking(cfg, scorer)
                .into_iter()
                .find(|(l, _)| self.primary.as_ref() != Some(&l.id))
                .map(|(l, _)| l)
                .ok_or(ManualError::NoCandidate)?,
        };
        Ok(self.manual_decision(scorer, target, SwitchKind::Failover, now))
    }

    /// Operator-requested return to the most preferred eligible link.
    pub fn manual_restore(
        &mut self,
        cfg: &FailoverConfig,
        scorer: &Scorer,
        now: DateTime<Utc>,
    ) -> Result<Decision, ManualError> {
        let target = self
            .ranking(cfg, scorer)
            .into_iter()
            .max_by(|(a, fa), (b, fb)| {
                a.preference()
                    .cmp(&b.preference())
                    .then_with(|| fa.total_cmp(fb))
            })
            .map(|(l, _)| l)
            .ok_or(ManualError::NoCandidate)?;
        Ok(self.manual_decision(scorer, target, SwitchKind::Failback, now))
    }

    /// Apply the result of handing `decision` to the controller.
    ///
    /// Only a successful outcome moves the primary and stamps cooldowns.
    pub fn commit(
        &mut self,
        cfg: &FailoverConfig,
        decision: &Decision,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) {
        if !decision.is_switch() {
            return;
        }
        if !outcome.is_success() {
            warn!(
                from = ?decision.from,
                to = ?decision.to,
                %outcome,
                "switch not applied, primary unchanged"
            );
            return;
        }
        let Some(to) = decision.to.clone() else {
            return;
        };
        let cooldown_until = |id: &str| {
            cfg.link(id)
                .and_then(|l| now.checked_add_signed(to_delta(cfg.cooldown_for(l))))
        };

        if let Some(from) = self.primary.take() {
            let until = cooldown_until(&from);
            if let Some(s) = self.states.get_mut(&from) {
                s.last_change = Some(now);
                s.cooldown_until = until;
            }
        }
        let until = cooldown_until(&to);
        if let Some(s) = self.states.get_mut(&to) {
            s.last_change = Some(now);
            s.cooldown_until = until;
        }
        self.primary = Some(to);
    }

    // ─── Internal ───────────────────────────────────────────────────────

    fn none_eligible(&mut self, cfg: &FailoverConfig, now: DateTime<Utc>) -> Verdict {
        let entered = !self.no_eligible && self.seen_eligible;
        self.no_eligible = true;

        let mut d = Decision::stable(now, self.primary.clone());
        d.no_eligible = true;
        for link in &cfg.links {
            d.quality_factors
                .insert(link.id.clone(), vec![self.unavailable(cfg, &link.id)]);
        }
        if entered {
            warn!(primary = ?self.primary, "no eligible link, keeping current primary");
        }
        Verdict {
            decision: d,
            audit: entered,
        }
    }

    fn manual_target<'a>(&self, cfg: &'a FailoverConfig, id: &str) -> Result<&'a Link, ManualError> {
        let link = cfg
            .link(id)
            .ok_or_else(|| ManualError::UnknownLink(id.into()))?;
        let state = self
            .states
            .get(id)
            .ok_or_else(|| ManualError::NoData(id.into()))?;
        if state.disabled || state.phase == LinkPhase::Disabled {
            return Err(ManualError::Disabled(id.into()));
        }
        if state.last_sample.is_none() {
            return Err(ManualError::NoData(id.into()));
        }
        Ok(link)
    }

    fn manual_decision(
        &self,
        scorer: &Scorer,
        target: &Link,
        kind: SwitchKind,
        now: DateTime<Utc>,
    ) -> Decision {
        let score = |id: &str| scorer.scores(id).map_or(0.0, |s| s.final_score);
        if self.primary.as_ref() == Some(&target.id) {
            let mut d = Decision::stable(now, self.primary.clone());
            d.reason = Reason::Manual;
            return d;
        }
        let delta = score(&target.id) - self.primary.as_deref().map_or(0.0, score);
        info!(
            from = ?self.primary,
            to = %target.id,
            %kind,
            "manual switch requested"
        );
        Decision::switch(
            now,
            self.primary.clone(),
            target.id.clone(),
            Reason::Manual,
            kind,
            delta,
        )
    }

    fn add_candidate_factors(&self, cfg: &FailoverConfig, link: &Link, d: &mut Decision) {
        let factors = self.threshold_factors(cfg, link, true);
        if !factors.is_empty() {
            d.quality_factors.insert(link.id.clone(), factors);
        }
    }

    /// Latency and loss against the link's class thresholds: fail crossings
    /// for the link being left, healthy readings for the one chosen.
    fn threshold_factors(&self, cfg: &FailoverConfig, link: &Link, healthy: bool) -> Vec<QualityFactor> {
        let Some(m) = self.states.get(&link.id).and_then(|s| s.last_metrics.as_ref()) else {
            return Vec::new();
        };
        let t: Thresholds = cfg.thresholds.for_class(link.class);
        let checks = [
            (MetricKind::Latency, m.latency_ms, t.fail_latency_ms, t.restore_latency_ms),
            (MetricKind::Loss, m.loss_pct, t.fail_loss_pct, t.restore_loss_pct),
        ];
        checks
            .into_iter()
            .filter_map(|(metric, value, fail, restore)| {
                if healthy && value <= restore {
                    Some(QualityFactor {
                        metric,
                        value,
                        threshold: restore,
                        level: FactorLevel::Healthy,
                    })
                } else if !healthy && !(value < fail) {
                    Some(QualityFactor {
                        metric,
                        value,
                        threshold: fail,
                        level: FactorLevel::Fail,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn unavailable(&self, cfg: &FailoverConfig, id: &str) -> QualityFactor {
        QualityFactor {
            metric: MetricKind::Availability,
            value: self.states.get(id).map_or(0.0, |s| f64::from(s.misses)),
            threshold: f64::from(cfg.decision.missed_sample_limit),
            level: FactorLevel::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryStore;
    use chrono::TimeDelta;
    use wanfail_common::LinkClass;

    fn t(i: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(i)
    }

    struct Bench {
        cfg: FailoverConfig,
        scorer: Scorer,
        store: TelemetryStore,
        engine: DecisionEngine,
    }

    impl Bench {
        fn new(links: Vec<Link>) -> Self {
            let cfg = FailoverConfig {
                links,
                ..FailoverConfig::default()
            };
            let mut engine = DecisionEngine::new();
            engine.sync_links(&cfg);
            Self {
                scorer: Scorer::new(cfg.scoring.clone(), cfg.predictive.clone()),
                store: TelemetryStore::new(&cfg.telemetry),
                engine,
                cfg,
            }
        }

        /// Feed one tick; `None` metrics mean a missed sample.
        fn tick(&mut self, i: i64, samples: &[(&str, Option<Metrics>)]) -> Verdict {
            for (id, m) in samples {
                let link = self.cfg.link(id).unwrap().clone();
                match m {
                    Some(m) => {
                        self.scorer.ingest(&link, m.clone(), &mut self.store);
                        self.engine.observe(&self.cfg, &link, m);
                    }
                    None => {
                        self.engine.miss(&self.cfg, &link);
                    }
                }
            }
            let v = self.engine.evaluate(&self.cfg, &self.scorer, t(i));
            self.engine
                .commit(&self.cfg, &v.decision, &Outcome::Applied, t(i));
            v
        }
    }

    fn good(i: i64) -> Option<Metrics> {
        Some(Metrics::new(t(i), 40.0, 0.0, 0.0))
    }

    fn backup(i: i64) -> Option<Metrics> {
        Some(Metrics::new(t(i), 90.0, 2.0, 0.0))
    }

    fn bad(i: i64) -> Option<Metrics> {
        Some(Metrics::new(t(i), 1800.0, 8.0, 0.0))
    }

    fn pair() -> Bench {
        Bench::new(vec![
            Link::new("starlink", LinkClass::Satellite, "wan"),
            Link::new("lte", LinkClass::Cellular, "mob1s1a1"),
        ])
    }

    /// Warm both links for 60 ticks; starlink becomes primary at tick 20.
    fn warmed() -> Bench {
        let mut b = pair();
        for i in 0..60 {
            b.tick(i, &[("starlink", good(i)), ("lte", backup(i))]);
        }
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("starlink"));
        b
    }

    // ─── Initial selection ──────────────────────────────────────────────

    #[test]
    fn initial_selection_after_warmup() {
        let mut b = pair();
        for i in 0..20 {
            let v = b.tick(i, &[("starlink", good(i)), ("lte", backup(i))]);
            assert!(!v.decision.is_switch(), "tick {i}");
            assert!(v.decision.no_eligible);
        }
        let v = b.tick(20, &[("starlink", good(20)), ("lte", backup(20))]);
        assert_eq!(v.decision.kind, SwitchKind::Initial);
        assert_eq!(v.decision.to.as_deref(), Some("starlink"));
        assert!(v.audit);
        assert!(!b.engine.no_eligible());
    }

    #[test]
    fn warmup_is_not_an_outage() {
        let mut b = pair();
        for i in 0..20 {
            let v = b.tick(i, &[("starlink", good(i)), ("lte", backup(i))]);
            assert!(v.decision.no_eligible);
            assert!(!v.audit);
        }
    }

    #[test]
    fn no_eligible_audited_once() {
        let mut b = warmed();
        let verdicts: Vec<Verdict> = (60..70)
            .map(|i| b.tick(i, &[("starlink", None), ("lte", None)]))
            .collect();
        assert_eq!(verdicts.iter().filter(|v| v.audit).count(), 1);
        // third miss makes both ineligible
        assert!(verdicts[2].audit && verdicts[2].decision.no_eligible);
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("starlink"));
        assert!(!verdicts[9].decision.is_switch());
    }

    // ─── Threshold path ─────────────────────────────────────────────────

    #[test]
    fn failover_waits_for_fail_min_duration() {
        let mut b = warmed();
        let mut switched_at = None;
        for k in 1..=12 {
            let i = 59 + k;
            let v = b.tick(i, &[("starlink", bad(i)), ("lte", backup(i))]);
            if v.decision.is_switch() {
                assert_eq!(v.decision.kind, SwitchKind::Failover);
                assert_eq!(v.decision.reason, Reason::Threshold);
                let f = &v.decision.quality_factors["starlink"];
                assert!(f.iter().any(|q| q.metric == MetricKind::Loss && q.level == FactorLevel::Fail));
                switched_at = Some(k);
                break;
            }
        }
        let k = switched_at.expect("no failover");
        assert!((10..=12).contains(&k), "failover on bad tick {k}");
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("lte"));
    }

    #[test]
    fn short_blip_never_fails_over() {
        let mut b = warmed();
        for i in 60..69 {
            let v = b.tick(i, &[("starlink", bad(i)), ("lte", backup(i))]);
            assert!(!v.decision.is_switch());
        }
        for i in 69..200 {
            let v = b.tick(i, &[("starlink", good(i)), ("lte", backup(i))]);
            assert!(!v.decision.is_switch(), "tick {i}");
        }
    }

    #[test]
    fn within_margin_stays_stable() {
        let mut b = Bench::new(vec![
            Link::new("a", LinkClass::Generic, "wan"),
            Link::new("b", LinkClass::Generic, "wan2"),
        ]);
        // loss 1.67% costs 5 points: a and b alternate 80/75
        let lossy = |i: i64| Some(Metrics::new(t(i), 40.0, 10.0 / 6.0, 0.0));
        for i in 0..20 {
            b.tick(i, &[("a", good(i)), ("b", lossy(i))]);
        }
        for i in 20..200 {
            let (ma, mb) = if i % 7 < 3 { (good(i), lossy(i)) } else { (lossy(i), good(i)) };
            let v = b.tick(i, &[("a", ma), ("b", mb)]);
            if i > 20 {
                assert_eq!(v.decision.reason, Reason::Stable, "tick {i}");
            }
        }
    }

    #[test]
    fn failback_after_restore_duration() {
        let mut b = warmed();
        for i in 60..80 {
            b.tick(i, &[("starlink", bad(i)), ("lte", backup(i))]);
        }
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("lte"));

        let mut back = None;
        for i in 80..200 {
            let v = b.tick(i, &[("starlink", good(i)), ("lte", backup(i))]);
            if v.decision.is_switch() {
                assert_eq!(v.decision.kind, SwitchKind::Failback);
                back = Some(i);
                break;
            }
        }
        // good run starts at 80, restore_min_duration is 30 s
        let i = back.expect("no failback");
        assert!(i >= 110, "failback at {i}");
    }

    // ─── Gates ──────────────────────────────────────────────────────────

    #[test]
    fn cooldown_blocks_switch_away_from_new_primary() {
        let mut b = Bench::new(vec![
            Link::new("a", LinkClass::Satellite, "wan"),
            Link::new("b", LinkClass::Cellular, "wan2"),
            Link::new("c", LinkClass::Lan, "eth0"),
        ]);
        for i in 0..60 {
            b.tick(i, &[("a", good(i)), ("b", backup(i)), ("c", bad(i))]);
        }
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("a"));

        let mut switched = None;
        for i in 60..80 {
            let v = b.tick(i, &[("a", bad(i)), ("b", backup(i)), ("c", bad(i))]);
            if v.decision.is_switch() {
                switched = Some(i);
                break;
            }
        }
        let s = switched.unwrap();
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("b"));

        // b now degrades hard and c recovers: still no switch during cooldown
        for i in s + 1..s + 30 {
            let v = b.tick(i, &[("a", bad(i)), ("b", bad(i)), ("c", good(i))]);
            assert!(!v.decision.is_switch(), "flap at {i}");
        }
        let v = b.tick(s + 30, &[("a", bad(s + 30)), ("b", bad(s + 30)), ("c", good(s + 30))]);
        assert!(v.decision.is_switch());
        assert_eq!(v.decision.to.as_deref(), Some("c"));
    }

    #[test]
    fn failed_apply_keeps_primary() {
        let mut b = warmed();
        for i in 60..75 {
            for (id, m) in [("starlink", bad(i)), ("lte", backup(i))] {
                let link = b.cfg.link(id).unwrap().clone();
                let m = m.unwrap();
                b.scorer.ingest(&link, m.clone(), &mut b.store);
                b.engine.observe(&b.cfg, &link, &m);
            }
            let v = b.engine.evaluate(&b.cfg, &b.scorer, t(i));
            b.engine.commit(
                &b.cfg,
                &v.decision,
                &Outcome::Failed { error: "verify".into() },
                t(i),
            );
        }
        assert_eq!(b.engine.primary().map(|p| p.as_str()), Some("starlink"));
    }

    #[test]
    fn silent_primary_is_replaced() {
        let mut b = warmed();
        let mut switched = None;
        for i in 60..70 {
            let v = b.tick(i, &[("starlink", None), ("lte", backup(i))]);
            if v.decision.is_switch() {
                let f = &v.decision.quality_factors["starlink"];
                assert_eq!(f[0].level, FactorLevel::Unavailable);
                switched = Some(i);
                break;
            }
        }
        // three misses: ineligible on the third
        assert_eq!(switched, Some(62));
    }

    // ─── Predictive ─────────────────────────────────────────────────────

    #[test]
    fn rising_latency_triggers_predictive_switch() {
        let mut b = warmed();
        // isolate the trend path from the margin
        b.cfg.decision.switch_margin = 0.0;
        let mut hit = None;
        for k in 0..10 {
            let i = 60 + k;
            // ramps 100 ms per tick, loss still under the fail threshold
            let m = Some(Metrics::new(t(i), 200.0 + 100.0 * k as f64, 3.0, 0.0));
            let v = b.tick(i, &[("starlink", m), ("lte", backup(i))]);
            if v.decision.is_switch() {
                hit = Some(v.decision);
                break;
            }
        }
        let d = hit.expect("no predictive switch");
        assert_eq!(d.reason, Reason::Predictive);
        assert!(d.quality_factors["starlink"].iter().any(|q| q.level == FactorLevel::Trend));
    }

    // ─── Manual ─────────────────────────────────────────────────────────

    #[test]
    fn manual_switches_ignore_cooldown() {
        let mut b = warmed();
        let d = b
            .engine
            .manual_failover(&b.cfg, &b.scorer, None, t(60))
            .unwrap();
        assert_eq!(d.reason, Reason::Manual);
        assert_eq!(d.to.as_deref(), Some("lte"));
        b.engine.commit(&b.cfg, &d, &Outcome::Applied, t(60));

        let d = b.engine.manual_restore(&b.cfg, &b.scorer, t(61)).unwrap();
        assert_eq!(d.to.as_deref(), Some("starlink"));
        assert_eq!(d.kind, SwitchKind::Failback);
    }

    #[test]
    fn manual_rejects_unknown_and_disabled() {
        let mut b = warmed();
        assert_eq!(
            b.engine.manual_failover(&b.cfg, &b.scorer, Some("dsl"), t(60)),
            Err(ManualError::UnknownLink("dsl".into()))
        );
        b.engine.set_disabled("lte", true).unwrap();
        assert_eq!(
            b.engine.manual_failover(&b.cfg, &b.scorer, Some("lte"), t(60)),
            Err(ManualError::Disabled("lte".into()))
        );
        assert_eq!(
            b.engine.manual_failover(&b.cfg, &b.scorer, None, t(60)),
            Err(ManualError::NoCandidate)
        );
    }

    #[test]
    fn manual_to_current_primary_is_noop() {
        let mut b = warmed();
        let d = b
            .engine
            .manual_failover(&b.cfg, &b.scorer, Some("starlink"), t(60))
            .unwrap();
        assert!(!d.is_switch());
        assert_eq!(d.reason, Reason::Manual);
    }

    // ─── Links ──────────────────────────────────────────────────────────

    #[test]
    fn sync_links_reports_changes() {
        let mut b = pair();
        let mut cfg = b.cfg.clone();
        cfg.links.retain(|l| l.id != "lte");
        cfg.links.push(Link::new("wifi", LinkClass::Wifi, "wwan"));
        let (added, removed) = b.engine.sync_links(&cfg);
        assert_eq!(added, vec![LinkId::from("wifi")]);
        assert_eq!(removed, vec![LinkId::from("lte")]);
        assert!(b.engine.state("lte").is_none());
    }
}
