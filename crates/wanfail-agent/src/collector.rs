//! Metric collectors: an ICMP probe for real uplinks and a random walk for
//! `--simulate` mode.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use wanfail_common::{LinkClass, LinkId, Metrics};
use wanfail_core::{CollectError, Collector, Link};

const DEFAULT_TARGET: &str = "1.1.1.1";

/// Whichever collector the agent was started with.
pub enum AgentCollector {
    Ping(PingCollector),
    Sim(SimCollector),
}

impl Collector for AgentCollector {
    async fn collect(&self, link: &Link, now: DateTime<Utc>) -> Result<Metrics, CollectError> {
        match self {
            AgentCollector::Ping(c) => c.collect(link, now).await,
            AgentCollector::Sim(c) => c.collect(link, now).await,
        }
    }
}

// ── Ping output ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rtt {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    /// Only iputils reports a deviation.
    pub mdev: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub rtt: Option<Rtt>,
}

impl PingStats {
    pub fn loss_pct(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        f64::from(lost) * 100.0 / f64::from(self.transmitted)
    }

    /// A probe with no replies reports `no_reply_ms` as its latency.
    pub fn to_metrics(&self, now: DateTime<Utc>, no_reply_ms: f64) -> Metrics {
        let (latency, jitter) = match self.rtt {
            Some(rtt) => (rtt.avg, rtt.mdev.unwrap_or((rtt.max - rtt.min) / 2.0)),
            None => (no_reply_ms, 0.0),
        };
        Metrics::new(now, latency, self.loss_pct(), jitter)
    }
}

/// Parse the summary of `ping -q`, iputils or busybox flavour.
pub fn parse_ping(text: &str) -> Result<PingStats, CollectError> {
    let mut counts = None;
    let mut rtt = None;

    for line in text.lines().map(str::trim) {
        if line.contains("packets transmitted") {
            counts = Some(parse_counts(line)?);
        } else if line.starts_with("rtt") || line.starts_with("round-trip") {
            rtt = Some(parse_rtt(line)?);
        }
    }

    let (transmitted, received) =
        counts.ok_or_else(|| CollectError::Parse("no packet summary".into()))?;
    Ok(PingStats {
        transmitted,
        received,
        rtt: rtt.filter(|_| received > 0),
    })
}

fn leading_number(field: &str) -> Option<u32> {
    field.split_whitespace().next()?.parse().ok()
}

fn parse_counts(line: &str) -> Result<(u32, u32), CollectError> {
    let mut fields = line.split(',').map(str::trim);
    let transmitted = fields.next().and_then(leading_number);
    let received = fields
        .find(|f| f.contains("received"))
        .and_then(leading_number);
    match (transmitted, received) {
        (Some(t), Some(r)) => Ok((t, r)),
        _ => Err(CollectError::Parse(format!("bad packet summary: {line}"))),
    }
}

fn parse_rtt(line: &str) -> Result<Rtt, CollectError> {
    let bad = || CollectError::Parse(format!("bad rtt line: {line}"));
    let (_, values) = line.split_once('=').ok_or_else(bad)?;
    let values = values.trim().trim_end_matches("ms").trim();
    let nums = values
        .split('/')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad())?;
    match nums[..] {
        [min, avg, max] => Ok(Rtt {
            min,
            avg,
            max,
            mdev: None,
        }),
        [min, avg, max, mdev] => Ok(Rtt {
            min,
            avg,
            max,
            mdev: Some(mdev),
        }),
        _ => Err(bad()),
    }
}

// ── Ping probe ──────────────────────────────────────────────────────

/// Probes each link with the system `ping`, bound to the link's device.
#[derive(Debug, Clone)]
pub struct PingCollector {
    count: u32,
    wait: Duration,
}

impl Default for PingCollector {
    fn default() -> Self {
        Self {
            count: 3,
            wait: Duration::from_secs(1),
        }
    }
}

impl PingCollector {
    fn args(&self, link: &Link) -> Vec<String> {
        vec![
            "-q".into(),
            "-n".into(),
            "-c".into(),
            self.count.to_string(),
            "-W".into(),
            self.wait.as_secs().max(1).to_string(),
            "-I".into(),
            link.route_device().to_string(),
            link.target.as_deref().unwrap_or(DEFAULT_TARGET).to_string(),
        ]
    }
}

impl Collector for PingCollector {
    async fn collect(&self, link: &Link, now: DateTime<Utc>) -> Result<Metrics, CollectError> {
        let out = tokio::process::Command::new("ping")
            .args(self.args(link))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollectError::Probe(format!("failed to start ping: {e}")))?;

        // 0: replies, 1: no replies (summary still printed), anything else is
        // a usage or interface error.
        if !matches!(out.status.code(), Some(0 | 1)) {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(CollectError::Probe(if stderr.is_empty() {
                format!("ping exited with {}", out.status)
            } else {
                stderr
            }));
        }

        let stats = parse_ping(&String::from_utf8_lossy(&out.stdout))?;
        let no_reply_ms = self.wait.as_secs_f64() * 1000.0;
        Ok(stats.to_metrics(now, no_reply_ms))
    }
}

// ── Simulation ──────────────────────────────────────────────────────

/// Chance per sample that a healthy link starts a degradation episode.
const EPISODE_CHANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
struct SimLink {
    class: LinkClass,
    /// Samples left in the current episode.
    episode: u32,
    /// 0 healthy, 1 unusable.
    severity: f64,
    obstruction: f64,
}

impl SimLink {
    fn new(class: LinkClass) -> Self {
        Self {
            class,
            episode: 0,
            severity: 0.0,
            obstruction: 0.0,
        }
    }

    fn base_latency(&self) -> f64 {
        match self.class {
            LinkClass::Lan => 5.0,
            LinkClass::Wifi => 20.0,
            LinkClass::Generic => 30.0,
            LinkClass::Satellite => 45.0,
            LinkClass::Cellular => 60.0,
        }
    }

    fn step(&mut self, rng: &mut impl Rng, now: DateTime<Utc>) -> Metrics {
        if self.episode > 0 {
            self.episode -= 1;
            if self.episode == 0 {
                self.severity = 0.0;
            }
        } else if rng.random_bool(EPISODE_CHANCE) {
            self.episode = rng.random_range(10..40);
            self.severity = rng.random_range(0.3..1.0);
        }

        let s = self.severity;
        let base = self.base_latency();
        let latency = base + rng.random_range(0.0..base * 0.3) + s * 1500.0;
        let loss = if s > 0.0 {
            s * rng.random_range(2.0..12.0)
        } else if rng.random_bool(0.05) {
            rng.random_range(0.0..1.0)
        } else {
            0.0
        };
        let jitter = base * 0.1 + rng.random_range(0.0..5.0) + s * 80.0;
        let m = Metrics::new(now, latency, loss, jitter);

        match self.class {
            LinkClass::Satellite => {
                let target = s * 15.0 + rng.random_range(0.0..3.0);
                self.obstruction += (target - self.obstruction) * 0.3;
                m.with_obstruction(self.obstruction)
            }
            LinkClass::Cellular => m.with_cellular(
                -90.0 - s * 25.0 + rng.random_range(-3.0..3.0),
                -10.0 - s * 8.0 + rng.random_range(-1.0..1.0),
                12.0 - s * 15.0 + rng.random_range(-2.0..2.0),
            ),
            LinkClass::Wifi => m.with_wifi(
                -60.0 - s * 25.0 + rng.random_range(-3.0..3.0),
                Some(30.0 - s * 20.0),
            ),
            LinkClass::Lan | LinkClass::Generic => m,
        }
    }
}

/// Fake metrics for local development: class-typical baselines with random
/// degradation episodes lasting tens of samples.
#[derive(Debug, Default)]
pub struct SimCollector {
    links: Mutex<HashMap<LinkId, SimLink>>,
}

impl SimCollector {
    fn sample(&self, link: &Link, now: DateTime<Utc>) -> Metrics {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let sim = links
            .entry(link.id.clone())
            .or_insert_with(|| SimLink::new(link.class));
        sim.class = link.class;
        sim.step(&mut rand::rng(), now)
    }
}

impl Collector for SimCollector {
    async fn collect(&self, link: &Link, now: DateTime<Utc>) -> Result<Metrics, CollectError> {
        Ok(self.sample(link, now))
    }
}
