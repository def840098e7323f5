use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;
use wanfail_common::{Event, EventKind, LinkId, Sample, StoreStats};

use super::ring::SampleRing;
use crate::config::TelemetryConfig;

/// Accounted size of one allocated sample slot.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

pub(crate) fn to_delta(d: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Bounded per-link sample rings plus a shared audit log.
///
/// The memory cap counts allocated ring capacity, not just retained
/// samples. A [`put_sample`](Self::put_sample) that has to grow a ring
/// compacts first, so the allocation never goes over the cap.
#[derive(Debug)]
pub struct TelemetryStore {
    rings: BTreeMap<LinkId, SampleRing>,
    events: VecDeque<Event>,
    next_seq: u64,
    retention: TimeDelta,
    max_bytes: usize,
    max_events: usize,
    compactions: u64,
}

impl TelemetryStore {
    pub fn new(cfg: &TelemetryConfig) -> Self {
        Self {
            rings: BTreeMap::new(),
            events: VecDeque::new(),
            next_seq: 1,
            retention: to_delta(cfg.retention),
            max_bytes: cfg.max_ram_bytes,
            max_events: cfg.max_events,
            compactions: 0,
        }
    }

    pub fn reconfigure(&mut self, cfg: &TelemetryConfig) {
        self.retention = to_delta(cfg.retention);
        self.max_bytes = cfg.max_ram_bytes;
        self.max_events = cfg.max_events;
        self.trim_events(None);
        self.enforce_cap(0);
    }

    // ── Samples ─────────────────────────────────────────────────

    /// Append a sample. Returns `false` if it is older than the link's
    /// newest sample and was dropped.
    pub fn put_sample(&mut self, sample: Sample) -> bool {
        let cutoff = sample.timestamp.checked_sub_signed(self.retention);
        let ring = self.rings.entry(sample.link.clone()).or_default();
        if let Some(cutoff) = cutoff {
            ring.evict_before(cutoff);
        }
        if !ring.accepts(&sample) {
            return false;
        }
        let growth = ring.growth();
        if growth > 0 {
            self.enforce_cap(growth);
        }
        self.rings.entry(sample.link.clone()).or_default().push(sample)
    }

    /// Samples of `link` at or after `since`, oldest first.
    pub fn history(&self, link: &str, since: DateTime<Utc>) -> Vec<Sample> {
        self.rings
            .get(link)
            .map(|r| r.since(since).cloned().collect())
            .unwrap_or_default()
    }

    /// Sum and count of instant scores of `link` at or after `since`.
    pub fn instant_totals(&self, link: &str, since: DateTime<Utc>) -> (f64, usize) {
        self.rings
            .get(link)
            .map(|r| {
                r.since(since)
                    .fold((0.0, 0), |(sum, n), s| (sum + s.scores.instant, n + 1))
            })
            .unwrap_or((0.0, 0))
    }

    pub fn latest(&self, link: &str) -> Option<&Sample> {
        self.rings.get(link).and_then(SampleRing::newest)
    }

    pub fn remove_link(&mut self, link: &str) {
        self.rings.remove(link);
    }

    /// Time-based eviction across all rings and the event log.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) {
        if let Some(cutoff) = now.checked_sub_signed(self.retention) {
            for ring in self.rings.values_mut() {
                if ring.evict_before(cutoff) > 0 {
                    ring.shrink();
                }
            }
        }
        self.trim_events(Some(now));
    }

    pub fn estimated_bytes(&self) -> usize {
        self.allocated_slots().saturating_mul(SAMPLE_BYTES)
    }

    fn allocated_slots(&self) -> usize {
        self.rings.values().map(SampleRing::capacity).sum()
    }

    // ── Events ──────────────────────────────────────────────────

    /// Append an audit event and return its sequence number.
    pub fn put_event(&mut self, timestamp: DateTime<Utc>, kind: EventKind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back(Event {
            seq,
            timestamp,
            kind,
        });
        self.trim_events(Some(timestamp));
        seq
    }

    /// Most recent events first.
    pub fn events(&self, limit: usize) -> Vec<Event> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    fn trim_events(&mut self, now: Option<DateTime<Utc>>) {
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        if let Some(cutoff) = now.and_then(|n| n.checked_sub_signed(self.retention)) {
            while self.events.front().is_some_and(|e| e.timestamp < cutoff) {
                self.events.pop_front();
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            samples: self
                .rings
                .iter()
                .map(|(id, r)| (id.clone(), r.len()))
                .collect(),
            events: self.events.len(),
            estimated_bytes: self.estimated_bytes(),
            max_bytes: self.max_bytes,
            compactions: self.compactions,
        }
    }

    // ── Internal ────────────────────────────────────────────────

    fn over_budget(&self, reserve: usize) -> bool {
        (self.allocated_slots() + reserve).saturating_mul(SAMPLE_BYTES) > self.max_bytes
    }

    /// Make room for `reserve` more slots. Spare capacity goes first, then
    /// the oldest half of every ring is downsampled, doubling the stride
    /// while still over budget.
    fn enforce_cap(&mut self, reserve: usize) {
        if !self.over_budget(reserve) {
            return;
        }
        for ring in self.rings.values_mut() {
            ring.shrink();
        }

        let mut stride = 2usize;
        while self.over_budget(reserve) {
            let removed: usize = self
                .rings
                .values_mut()
                .map(|r| {
                    let n = r.thin_oldest_half(stride);
                    r.shrink();
                    n
                })
                .sum();

            if removed > 0 {
                self.compactions += 1;
                debug!(
                    stride,
                    removed,
                    bytes = self.estimated_bytes(),
                    "telemetry store downsampled"
                );
                stride = stride.saturating_mul(2);
                continue;
            }

            // Rings too short to thin: drop the oldest sample of the largest.
            let Some(largest) = self.rings.values_mut().max_by_key(|r| r.len()) else {
                break;
            };
            if !largest.pop_oldest() {
                break;
            }
            largest.shrink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wanfail_common::{Metrics, ScoreSet};

    fn t(i: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(i)
    }

    fn sample(link: &str, i: i64, instant: f64) -> Sample {
        Sample {
            link: link.into(),
            timestamp: t(i),
            metrics: Metrics::new(t(i), 40.0, 0.0, 1.0),
            scores: ScoreSet::blend(instant, instant, instant),
        }
    }

    fn store(retention_s: u64, max_samples: usize, max_events: usize) -> TelemetryStore {
        TelemetryStore::new(&TelemetryConfig {
            retention: Duration::from_secs(retention_s),
            max_ram_bytes: max_samples * SAMPLE_BYTES,
            max_events,
        })
    }

    // ─── History ────────────────────────────────────────────────────────

    #[test]
    fn history_is_ascending_and_filtered() {
        let mut s = store(3600, 1000, 10);
        for i in 0..20 {
            assert!(s.put_sample(sample("wan", i, 90.0)));
        }
        let h = s.history("wan", t(15));
        assert_eq!(h.len(), 5);
        assert!(h.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(s.history("lte", t(0)).is_empty());
    }

    #[test]
    fn stale_sample_rejected() {
        let mut s = store(3600, 1000, 10);
        s.put_sample(sample("wan", 5, 90.0));
        assert!(!s.put_sample(sample("wan", 4, 90.0)));
        assert_eq!(s.stats().samples["wan"], 1);
    }

    #[test]
    fn retention_evicts_oldest() {
        let mut s = store(10, 1000, 10);
        for i in 0..30 {
            s.put_sample(sample("wan", i, 90.0));
        }
        let h = s.history("wan", t(0));
        assert_eq!(h.first().unwrap().timestamp, t(19));
        assert_eq!(h.len(), 11);

        s.evict_expired(t(100));
        assert!(s.history("wan", t(0)).is_empty());
        assert_eq!(s.estimated_bytes(), 0);
    }

    #[test]
    fn instant_totals_over_window() {
        let mut s = store(3600, 1000, 10);
        for i in 0..10 {
            s.put_sample(sample("wan", i, i as f64 * 10.0));
        }
        let (sum, n) = s.instant_totals("wan", t(7));
        assert_eq!(n, 3);
        assert!((sum - 240.0).abs() < 1e-9);
    }

    // ─── RAM cap ────────────────────────────────────────────────────────

    #[test]
    fn ram_cap_holds_and_keeps_full_span() {
        let mut s = store(24 * 3600, 500, 10);
        for i in 0..20_000 {
            s.put_sample(sample("starlink", i, 90.0));
            s.put_sample(sample("lte", i, 80.0));
            assert!(s.estimated_bytes() <= 500 * SAMPLE_BYTES);
        }

        for link in ["starlink", "lte"] {
            let h = s.history(link, t(0));
            assert!(!h.is_empty());
            assert!(h.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert_eq!(h.first().unwrap().timestamp, t(0), "{link} lost its oldest sample");
            assert_eq!(h.last().unwrap().timestamp, t(19_999));

            // recent data stays dense, old data is coarse
            let recent = s.history(link, t(19_900)).len();
            assert!(recent >= 50, "recent {recent}");
        }
        assert!(s.stats().compactions > 0);
    }

    fn allocated(s: &TelemetryStore) -> usize {
        s.rings.values().map(|r| r.capacity() * SAMPLE_BYTES).sum()
    }

    #[test]
    fn ram_cap_counts_capacity_under_uneven_load() {
        let cap = 500 * SAMPLE_BYTES;
        let mut s = store(24 * 3600, 500, 10);
        for i in 0..10_000 {
            s.put_sample(sample("starlink", i, 90.0));
            assert!(allocated(&s) <= cap);
        }

        // Starlink held the whole budget; three more links join.
        let links = ["starlink", "lte", "wifi", "lan"];
        for i in 10_000..15_000 {
            for link in links {
                s.put_sample(sample(link, i, 80.0));
                let allocated = allocated(&s);
                assert!(allocated <= cap, "allocated {allocated} over cap {cap}");
                assert_eq!(s.estimated_bytes(), allocated);
            }
        }

        for link in links {
            let h = s.history(link, t(0));
            assert!(!h.is_empty(), "{link} has no history");
            assert!(h.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert_eq!(h.last().unwrap().timestamp, t(14_999));
        }
        assert_eq!(s.history("starlink", t(0))[0].timestamp, t(0));
    }

    #[test]
    fn expiry_releases_capacity() {
        let mut s = store(60, 1000, 10);
        for i in 0..200 {
            s.put_sample(sample("wan", i, 90.0));
        }
        s.evict_expired(t(200));
        assert_eq!(s.stats().samples["wan"], 60);
        assert_eq!(s.estimated_bytes(), 60 * SAMPLE_BYTES);
    }

    #[test]
    fn tiny_budget_falls_back_to_eviction() {
        let mut s = store(3600, 2, 10);
        for i in 0..10 {
            s.put_sample(sample("a", i, 90.0));
            s.put_sample(sample("b", i, 90.0));
            s.put_sample(sample("c", i, 90.0));
            assert!(s.estimated_bytes() <= 2 * SAMPLE_BYTES);
        }
    }

    #[test]
    fn removing_link_releases_budget() {
        let mut s = store(3600, 100, 10);
        for i in 0..10 {
            s.put_sample(sample("wan", i, 90.0));
        }
        s.remove_link("wan");
        assert_eq!(s.estimated_bytes(), 0);
    }

    // ─── Events ─────────────────────────────────────────────────────────

    #[test]
    fn events_newest_first_and_bounded() {
        let mut s = store(3600, 100, 3);
        for i in 0..5 {
            s.put_event(t(i), EventKind::ConfigReloaded { changes: vec![format!("n{i}")] });
        }
        let ev = s.events(10);
        assert_eq!(ev.len(), 3);
        assert_eq!(ev[0].seq, 5);
        assert_eq!(ev[2].seq, 3);
        assert_eq!(s.events(1).len(), 1);
    }

    #[test]
    fn events_expire_with_retention() {
        let mut s = store(60, 100, 100);
        s.put_event(t(0), EventKind::ConfigRejected { error: "x".into() });
        s.put_event(t(120), EventKind::ConfigRejected { error: "y".into() });
        let ev = s.events(10);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].timestamp, t(120));
    }
}
