//! Trend detection for predictive failover.
//!
//! A [`TrendTracker`] keeps the last few raw samples of one link plus
//! Kalman-smoothed leading indicators. [`TrendTracker::signals`] reports the
//! metrics that are degrading fast enough to justify switching before a hard
//! threshold is crossed. A single step change is never a trend: the slope
//! must be carried by a majority of rising steps.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use wanfail_common::{FactorLevel, LinkClass, MetricKind, Metrics, QualityFactor};

use super::kalman::{KalmanConfig, KalmanFilter};
use crate::config::PredictiveConfig;

#[derive(Debug, Clone, Copy)]
struct TrendPoint {
    at: DateTime<Utc>,
    latency_ms: f64,
    loss_pct: f64,
    jitter_ms: f64,
}

#[derive(Debug, Clone)]
pub struct TrendTracker {
    points: VecDeque<TrendPoint>,
    capacity: usize,
    obstruction: KalmanFilter,
    obstruction_rates: VecDeque<f64>,
    sinr: KalmanFilter,
}

impl TrendTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            obstruction: KalmanFilter::new(KalmanConfig::for_obstruction()),
            obstruction_rates: VecDeque::with_capacity(capacity),
            sinr: KalmanFilter::new(KalmanConfig::for_sinr()),
        }
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(2);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        while self.obstruction_rates.len() > self.capacity {
            self.obstruction_rates.pop_front();
        }
    }

    pub fn push(&mut self, m: &Metrics) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(TrendPoint {
            at: m.timestamp,
            latency_ms: m.latency_ms,
            loss_pct: m.loss_pct,
            jitter_ms: m.jitter_ms,
        });

        if let Some(o) = m.obstruction_pct {
            self.obstruction.update(o);
            if self.obstruction_rates.len() == self.capacity {
                self.obstruction_rates.pop_front();
            }
            self.obstruction_rates.push_back(self.obstruction.rate());
        }
        if let Some(sinr) = m.sinr_db {
            self.sinr.update(sinr);
        }
    }

    /// Forget raw history after a gap so stale points do not fake a slope.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Degrading metrics for a link of `class`. Empty means no trigger.
    pub fn signals(&self, class: LinkClass, cfg: &PredictiveConfig) -> Vec<QualityFactor> {
        let mut out = Vec::new();
        if self.points.len() >= cfg.trend_samples {
            let start = self.points.len() - cfg.trend_samples;
            let recent: Vec<TrendPoint> = self.points.iter().skip(start).copied().collect();
            let t0 = recent[0].at;
            let series = |f: fn(&TrendPoint) -> f64| -> Vec<(f64, f64)> {
                recent
                    .iter()
                    .map(|p| ((p.at - t0).num_milliseconds() as f64 / 1000.0, f(p)))
                    .collect()
            };

            for (metric, rate, values) in [
                (
                    MetricKind::Latency,
                    cfg.latency_rate_ms_per_s,
                    series(|p| p.latency_ms),
                ),
                (MetricKind::Loss, cfg.loss_rate_pct_per_s, series(|p| p.loss_pct)),
                (
                    MetricKind::Jitter,
                    cfg.jitter_rate_ms_per_s,
                    series(|p| p.jitter_ms),
                ),
            ] {
                if let Some(slope) = sustained_slope(&values, rate) {
                    out.push(QualityFactor {
                        metric,
                        value: slope,
                        threshold: rate,
                        level: FactorLevel::Trend,
                    });
                }
            }
        }

        match class {
            LinkClass::Satellite => {
                let accel = self.obstruction_accel(cfg.trend_samples).unwrap_or(0.0);
                if accel > cfg.obstruction_accel && self.obstruction.rate() > 0.0 {
                    out.push(QualityFactor {
                        metric: MetricKind::Obstruction,
                        value: accel,
                        threshold: cfg.obstruction_accel,
                        level: FactorLevel::Trend,
                    });
                }
            }
            LinkClass::Cellular => {
                let rate = self.sinr.rate();
                if self.sinr.samples() >= cfg.trend_samples as u64 && rate < -cfg.sinr_drop_rate_db
                {
                    out.push(QualityFactor {
                        metric: MetricKind::Sinr,
                        value: rate,
                        threshold: -cfg.sinr_drop_rate_db,
                        level: FactorLevel::Trend,
                    });
                }
            }
            _ => {}
        }
        out
    }

    /// Change of the smoothed obstruction rate across the window.
    fn obstruction_accel(&self, window: usize) -> Option<f64> {
        if self.obstruction_rates.len() < window {
            return None;
        }
        let first = self.obstruction_rates[self.obstruction_rates.len() - window];
        let last = *self.obstruction_rates.back()?;
        Some(last - first)
    }

    /// Obstruction level projected one window ahead.
    pub fn projected_obstruction(&self, window: usize) -> Option<f64> {
        (self.obstruction.samples() > 0).then(|| self.obstruction.project(window as u32))
    }
}

/// Least-squares slope per second of `(t, value)` points, if it exceeds
/// `rate` and a strict majority of consecutive steps rise.
pub fn sustained_slope(points: &[(f64, f64)], rate: f64) -> Option<f64> {
    if points.len() < 3 || points.iter().any(|(t, v)| !t.is_finite() || !v.is_finite()) {
        return None;
    }

    let steps = points.len() - 1;
    let rising = points.windows(2).filter(|w| w[1].1 > w[0].1).count();
    if rising * 2 <= steps {
        return None;
    }

    let n = points.len() as f64;
    let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_v = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var) = (0.0, 0.0);
    for &(t, v) in points {
        cov += (t - mean_t) * (v - mean_v);
        var += (t - mean_t) * (t - mean_t);
    }
    if var <= f64::EPSILON {
        return None;
    }
    let slope = cov / var;
    (slope > rate).then_some(slope)
}
