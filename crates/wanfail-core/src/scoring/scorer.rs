use std::collections::HashMap;

use wanfail_common::{
    Adjustment, LinkClass, LinkId, Metrics, QualityFactor, Sample, ScoreBreakdown, ScoreSet,
};

use super::ewma::Ewma;
use super::trend::TrendTracker;
use crate::config::{Link, PredictiveConfig, ScoringConfig};
use crate::telemetry::TelemetryStore;
use crate::telemetry::store::to_delta;

/// Rolling score state of one link.
#[derive(Debug, Clone)]
struct LinkScore {
    ewma: Ewma,
    weak_signal_run: u32,
    scores: Option<ScoreSet>,
    breakdown: ScoreBreakdown,
    trend: TrendTracker,
}

/// Turns samples into score sets.
///
/// The window average is read back from the [`TelemetryStore`]; the scorer
/// only keeps the EWMA, the weak-signal run length and the trend window.
#[derive(Debug)]
pub struct Scorer {
    scoring: ScoringConfig,
    predictive: PredictiveConfig,
    links: HashMap<LinkId, LinkScore>,
}

impl Scorer {
    pub fn new(scoring: ScoringConfig, predictive: PredictiveConfig) -> Self {
        Self {
            scoring,
            predictive,
            links: HashMap::new(),
        }
    }

    /// Swap tuning in place; EWMAs and trend windows carry over.
    pub fn reconfigure(&mut self, scoring: ScoringConfig, predictive: PredictiveConfig) {
        for state in self.links.values_mut() {
            state.ewma.set_alpha(scoring.ewma_alpha);
            state.trend.resize(predictive.trend_samples);
        }
        self.scoring = scoring;
        self.predictive = predictive;
    }

    pub fn forget(&mut self, link: &str) {
        self.links.remove(link);
    }

    pub fn scores(&self, link: &str) -> Option<ScoreSet> {
        self.links.get(link).and_then(|s| s.scores)
    }

    pub fn breakdown(&self, link: &str) -> Option<&ScoreBreakdown> {
        self.links.get(link).map(|s| &s.breakdown)
    }

    /// Degrading trends on `link`, empty if none or predictive is off.
    pub fn trend_signals(&self, link: &Link) -> Vec<QualityFactor> {
        if !self.predictive.enabled {
            return Vec::new();
        }
        self.links
            .get(&link.id)
            .map(|s| s.trend.signals(link.class, &self.predictive))
            .unwrap_or_default()
    }

    /// A gap in reporting breaks any trend in progress.
    pub fn note_gap(&mut self, link: &str) {
        if let Some(s) = self.links.get_mut(link) {
            s.trend.clear();
        }
    }

    /// Score one sample, record it in `store`, and return the new set.
    ///
    /// Samples older than the link's newest stored sample are scored but not
    /// stored; callers filter those out before getting here.
    pub fn ingest(&mut self, link: &Link, metrics: Metrics, store: &mut TelemetryStore) -> ScoreSet {
        let state = self
            .links
            .entry(link.id.clone())
            .or_insert_with(|| LinkScore {
                ewma: Ewma::new(self.scoring.ewma_alpha),
                weak_signal_run: 0,
                scores: None,
                breakdown: ScoreBreakdown::default(),
                trend: TrendTracker::new(self.predictive.trend_samples),
            });

        let weak = link.class == LinkClass::Wifi
            && metrics
                .signal_dbm
                .is_some_and(|s| s < self.scoring.penalties.weak_signal_dbm);
        state.weak_signal_run = if weak { state.weak_signal_run + 1 } else { 0 };

        let (instant, breakdown) = instant_score(&self.scoring, link, &metrics, state.weak_signal_run);
        let ewma = state.ewma.update(instant).clamp(0.0, 100.0);

        let since = metrics.timestamp - to_delta(self.scoring.history_window);
        let (sum, n) = store.instant_totals(&link.id, since);
        let window_avg = ((sum + instant) / (n + 1) as f64).clamp(0.0, 100.0);

        let scores = ScoreSet::blend(instant, ewma, window_avg);
        state.trend.push(&metrics);
        state.scores = Some(scores);
        state.breakdown = breakdown;

        store.put_sample(Sample {
            link: link.id.clone(),
            timestamp: metrics.timestamp,
            metrics,
            scores,
        });
        scores
    }
}

/// `class_weight − Σ weight·badness − penalties + bonuses`, clamped to
/// `[0, 100]`.
pub fn instant_score(
    cfg: &ScoringConfig,
    link: &Link,
    m: &Metrics,
    weak_signal_run: u32,
) -> (f64, ScoreBreakdown) {
    let w = &cfg.weights;
    let p = &cfg.penalties;

    let mut b = ScoreBreakdown {
        class_weight: cfg.class_weight(link.class),
        latency: w.latency * cfg.latency.badness(m.latency_ms),
        loss: w.loss * cfg.loss.badness(m.loss_pct),
        jitter: w.jitter * cfg.jitter.badness(m.jitter_ms),
        obstruction: m
            .obstruction_pct
            .map(|o| w.obstruction * cfg.obstruction.badness(o))
            .unwrap_or(0.0),
        penalties: Vec::new(),
        bonuses: Vec::new(),
    };

    if link.class == LinkClass::Cellular && m.roaming == Some(true) && !link.prefer_roaming {
        b.penalties.push(Adjustment {
            name: "roaming".into(),
            points: p.roaming,
        });
    }
    if weak_signal_run >= p.weak_signal_samples {
        b.penalties.push(Adjustment {
            name: "weak_signal".into(),
            points: p.weak_signal,
        });
    }
    if link.metered && p.metered > 0.0 {
        b.penalties.push(Adjustment {
            name: "metered".into(),
            points: p.metered,
        });
    }

    let strong = match link.class {
        LinkClass::Cellular => m.sinr_db.is_some_and(|s| s >= p.strong_sinr_db),
        LinkClass::Wifi => m.signal_dbm.is_some_and(|s| s >= p.strong_signal_dbm),
        _ => false,
    };
    if strong && p.strong_signal_bonus > 0.0 {
        b.bonuses.push(Adjustment {
            name: "strong_signal".into(),
            points: p.strong_signal_bonus,
        });
    }

    let penalties: f64 = b.penalties.iter().map(|a| a.points).sum();
    let bonuses: f64 = b.bonuses.iter().map(|a| a.points).sum();
    let raw = b.class_weight - b.latency - b.loss - b.jitter - b.obstruction - penalties + bonuses;
    let score = if raw.is_finite() { raw.clamp(0.0, 100.0) } else { 0.0 };
    (score, b)
}
