use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use wanfail_common::{LinkClass, LinkId, Metrics, RunState};

use crate::scoring::Band;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wanfail/wanfail.toml";

/// Longest link id a [`LinkId`] stores inline. Samples carry their link id,
/// so longer ids would put heap allocations outside the telemetry budget.
pub const MAX_LINK_ID_LEN: usize = std::mem::size_of::<LinkId>();

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ── Input (as written on disk) ──────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FailoverConfigInput {
    pub version: u32,
    pub main: MainInput,
    pub scoring: ScoringInput,
    pub thresholds: ThresholdsInput,
    pub predictive: PredictiveInput,
    pub telemetry: TelemetryInput,
    pub controller: ControllerInput,
    pub links: Vec<LinkInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MainInput {
    pub tick_ms: Option<u64>,
    pub collect_timeout_ms: Option<u64>,
    pub switch_margin: Option<f64>,
    pub min_uptime_s: Option<u64>,
    pub cooldown_s: Option<u64>,
    pub fail_min_duration_s: Option<u64>,
    pub restore_min_duration_s: Option<u64>,
    pub missed_sample_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScoringInput {
    pub ewma_alpha: Option<f64>,
    pub history_window_s: Option<u64>,
    pub latency_ok_ms: Option<f64>,
    pub latency_bad_ms: Option<f64>,
    pub loss_ok_pct: Option<f64>,
    pub loss_bad_pct: Option<f64>,
    pub jitter_ok_ms: Option<f64>,
    pub jitter_bad_ms: Option<f64>,
    pub obstruction_ok_pct: Option<f64>,
    pub obstruction_bad_pct: Option<f64>,
    pub weight_latency: Option<f64>,
    pub weight_loss: Option<f64>,
    pub weight_jitter: Option<f64>,
    pub weight_obstruction: Option<f64>,
    pub class_weights: BTreeMap<LinkClass, f64>,
    pub roaming_penalty: Option<f64>,
    pub weak_signal_penalty: Option<f64>,
    pub weak_signal_dbm: Option<f64>,
    pub weak_signal_samples: Option<u32>,
    pub metered_penalty: Option<f64>,
    pub strong_signal_bonus: Option<f64>,
    pub strong_sinr_db: Option<f64>,
    pub strong_signal_dbm: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThresholdsInput {
    pub fail_loss_pct: Option<f64>,
    pub fail_latency_ms: Option<f64>,
    pub restore_loss_pct: Option<f64>,
    pub restore_latency_ms: Option<f64>,
    pub satellite: Option<ThresholdOverrideInput>,
    pub cellular: Option<ThresholdOverrideInput>,
    pub wifi: Option<ThresholdOverrideInput>,
    pub lan: Option<ThresholdOverrideInput>,
    pub generic: Option<ThresholdOverrideInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThresholdOverrideInput {
    pub fail_loss_pct: Option<f64>,
    pub fail_latency_ms: Option<f64>,
    pub restore_loss_pct: Option<f64>,
    pub restore_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PredictiveInput {
    pub enabled: Option<bool>,
    pub trend_samples: Option<usize>,
    pub latency_rate_ms_per_s: Option<f64>,
    pub loss_rate_pct_per_s: Option<f64>,
    pub jitter_rate_ms_per_s: Option<f64>,
    pub obstruction_accel: Option<f64>,
    pub sinr_drop_rate_db: Option<f64>,
    pub rate_limit_factor: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryInput {
    pub retention_hours: Option<u64>,
    pub max_ram_mb: Option<u64>,
    pub max_events: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControllerInput {
    pub backend: Option<BackendKind>,
    pub dry_run: Option<bool>,
    pub attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub mwan3_primary_metric: Option<u32>,
    pub mwan3_backup_metric: Option<u32>,
    pub route_primary_metric: Option<u32>,
    pub route_backup_metric: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub id: String,
    pub class: Option<LinkClass>,
    pub iface: Option<String>,
    pub device: Option<String>,
    pub member: Option<String>,
    pub weight: Option<u32>,
    pub min_uptime_s: Option<u64>,
    pub cooldown_s: Option<u64>,
    pub detect: Option<Detect>,
    pub prefer_roaming: Option<bool>,
    pub metered: Option<bool>,
    pub target: Option<String>,
}

// ── Resolved ────────────────────────────────────────────────────────

fn ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn opt_ms<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

/// How a link takes part in selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detect {
    /// Eligible once warmed up.
    #[default]
    Auto,
    /// Never eligible.
    Disable,
    /// Eligible on first sample, no warmup.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Multi-WAN policy members (mwan3).
    #[default]
    Mwan3,
    /// Interface route metrics via netifd.
    Route,
}

/// One candidate uplink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub class: LinkClass,
    /// Logical interface name (`wan`, `wwan`).
    pub iface: String,
    /// Kernel device carrying the default route (`eth1`, `wwan0`).
    pub device: Option<String>,
    /// Policy member name in the multi-WAN subsystem.
    pub member: Option<String>,
    pub weight: u32,
    #[serde(serialize_with = "opt_ms")]
    pub min_uptime: Option<Duration>,
    #[serde(serialize_with = "opt_ms")]
    pub cooldown: Option<Duration>,
    pub detect: Detect,
    pub prefer_roaming: bool,
    pub metered: bool,
    pub target: Option<String>,
}

impl Link {
    pub const DEFAULT_WEIGHT: u32 = 50;

    pub fn new(id: impl Into<LinkId>, class: LinkClass, iface: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class,
            iface: iface.into(),
            device: None,
            member: None,
            weight: Self::DEFAULT_WEIGHT,
            min_uptime: None,
            cooldown: None,
            detect: Detect::Auto,
            prefer_roaming: false,
            metered: false,
            target: None,
        }
    }

    pub fn route_device(&self) -> &str {
        self.device.as_deref().unwrap_or(&self.iface)
    }

    pub fn policy_member(&self) -> &str {
        self.member.as_deref().unwrap_or(&self.iface)
    }

    /// Operator preference: weight, then class priority. Higher wins.
    pub fn preference(&self) -> (u32, u8) {
        (self.weight, self.class.priority())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionConfig {
    pub switch_margin: f64,
    #[serde(serialize_with = "ms")]
    pub min_uptime: Duration,
    #[serde(serialize_with = "ms")]
    pub cooldown: Duration,
    #[serde(serialize_with = "ms")]
    pub fail_min_duration: Duration,
    #[serde(serialize_with = "ms")]
    pub restore_min_duration: Duration,
    pub missed_sample_limit: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            switch_margin: 10.0,
            min_uptime: Duration::from_secs(20),
            cooldown: Duration::from_secs(30),
            fail_min_duration: Duration::from_secs(10),
            restore_min_duration: Duration::from_secs(30),
            missed_sample_limit: 3,
        }
    }
}

/// Fail/restore thresholds for one link class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub fail_loss_pct: f64,
    pub fail_latency_ms: f64,
    pub restore_loss_pct: f64,
    pub restore_latency_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fail_loss_pct: 5.0,
            fail_latency_ms: 1200.0,
            restore_loss_pct: 1.0,
            restore_latency_ms: 800.0,
        }
    }
}

impl Thresholds {
    /// Place a sample relative to the thresholds. Non-finite readings fail.
    pub fn classify(&self, m: &Metrics) -> RunState {
        let loss = finite_or_inf(m.loss_pct);
        let latency = finite_or_inf(m.latency_ms);
        if loss >= self.fail_loss_pct || latency >= self.fail_latency_ms {
            RunState::Bad
        } else if loss <= self.restore_loss_pct && latency <= self.restore_latency_ms {
            RunState::Good
        } else {
            RunState::Marginal
        }
    }

    fn apply(mut self, o: &ThresholdOverrideInput) -> Self {
        if let Some(v) = o.fail_loss_pct {
            self.fail_loss_pct = v;
        }
        if let Some(v) = o.fail_latency_ms {
            self.fail_latency_ms = v;
        }
        if let Some(v) = o.restore_loss_pct {
            self.restore_loss_pct = v;
        }
        if let Some(v) = o.restore_latency_ms {
            self.restore_latency_ms = v;
        }
        self
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        let all = [
            self.fail_loss_pct,
            self.fail_latency_ms,
            self.restore_loss_pct,
            self.restore_latency_ms,
        ];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid(format!("{scope}: thresholds must be non-negative numbers")));
        }
        if self.restore_loss_pct > self.fail_loss_pct
            || self.restore_latency_ms > self.fail_latency_ms
        {
            return Err(invalid(format!(
                "{scope}: restore thresholds must not be looser than fail thresholds"
            )));
        }
        Ok(())
    }
}

fn finite_or_inf(v: f64) -> f64 {
    if v.is_finite() { v } else { f64::INFINITY }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThresholdConfig {
    pub global: Thresholds,
    pub per_class: BTreeMap<LinkClass, Thresholds>,
}

impl ThresholdConfig {
    pub fn for_class(&self, class: LinkClass) -> Thresholds {
        self.per_class.get(&class).copied().unwrap_or(self.global)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricWeights {
    pub latency: f64,
    pub loss: f64,
    pub jitter: f64,
    pub obstruction: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            latency: 25.0,
            loss: 30.0,
            jitter: 15.0,
            obstruction: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Penalties {
    pub roaming: f64,
    pub weak_signal: f64,
    pub weak_signal_dbm: f64,
    pub weak_signal_samples: u32,
    pub metered: f64,
    pub strong_signal_bonus: f64,
    pub strong_sinr_db: f64,
    pub strong_signal_dbm: f64,
}

impl Default for Penalties {
    fn default() -> Self {
        Self {
            roaming: 10.0,
            weak_signal: 10.0,
            weak_signal_dbm: -75.0,
            weak_signal_samples: 3,
            metered: 0.0,
            strong_signal_bonus: 5.0,
            strong_sinr_db: 20.0,
            strong_signal_dbm: -55.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringConfig {
    pub ewma_alpha: f64,
    #[serde(serialize_with = "ms")]
    pub history_window: Duration,
    pub latency: Band,
    pub loss: Band,
    pub jitter: Band,
    pub obstruction: Band,
    pub weights: MetricWeights,
    pub class_weights: BTreeMap<LinkClass, f64>,
    pub penalties: Penalties,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.2,
            history_window: Duration::from_secs(600),
            latency: Band::new(50.0, 1500.0),
            loss: Band::new(0.0, 10.0),
            jitter: Band::new(5.0, 200.0),
            obstruction: Band::new(0.0, 10.0),
            weights: MetricWeights::default(),
            class_weights: default_class_weights(),
            penalties: Penalties::default(),
        }
    }
}

fn default_class_weights() -> BTreeMap<LinkClass, f64> {
    BTreeMap::from([
        (LinkClass::Lan, 100.0),
        (LinkClass::Satellite, 95.0),
        (LinkClass::Cellular, 88.0),
        (LinkClass::Wifi, 85.0),
        (LinkClass::Generic, 80.0),
    ])
}

impl ScoringConfig {
    pub fn class_weight(&self, class: LinkClass) -> f64 {
        self.class_weights.get(&class).copied().unwrap_or(80.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Samples a slope must span before it counts as sustained.
    pub trend_samples: usize,
    pub latency_rate_ms_per_s: f64,
    pub loss_rate_pct_per_s: f64,
    pub jitter_rate_ms_per_s: f64,
    /// Change of smoothed obstruction velocity across the trend window.
    pub obstruction_accel: f64,
    /// Smoothed SINR fall per sample that counts as a leading indicator.
    pub sinr_drop_rate_db: f64,
    /// Triggers fire at most once per `rate_limit_factor × fail_min_duration`.
    pub rate_limit_factor: u32,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trend_samples: 5,
            latency_rate_ms_per_s: 10.0,
            loss_rate_pct_per_s: 0.5,
            jitter_rate_ms_per_s: 5.0,
            obstruction_accel: 0.5,
            sinr_drop_rate_db: 1.5,
            rate_limit_factor: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryConfig {
    #[serde(serialize_with = "ms")]
    pub retention: Duration,
    pub max_ram_bytes: usize,
    pub max_events: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            max_ram_bytes: 16 * 1024 * 1024,
            max_events: 500,
        }
    }
}

/// Bounded exponential backoff for convergence checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(serialize_with = "ms")]
    pub base_delay: Duration,
    #[serde(serialize_with = "ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricPair {
    pub primary: u32,
    pub backup: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerConfig {
    pub backend: BackendKind,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    #[serde(serialize_with = "ms")]
    pub command_timeout: Duration,
    pub mwan3: MetricPair,
    pub route: MetricPair,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mwan3,
            dry_run: false,
            retry: RetryPolicy::default(),
            command_timeout: Duration::from_secs(10),
            mwan3: MetricPair {
                primary: 1,
                backup: 10,
            },
            route: MetricPair {
                primary: 10,
                backup: 100,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverConfig {
    pub version: u32,
    #[serde(serialize_with = "ms")]
    pub tick: Duration,
    #[serde(serialize_with = "ms")]
    pub collect_timeout: Duration,
    pub decision: DecisionConfig,
    pub thresholds: ThresholdConfig,
    pub scoring: ScoringConfig,
    pub predictive: PredictiveConfig,
    pub telemetry: TelemetryConfig,
    pub controller: ControllerConfig,
    pub links: Vec<Link>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            tick: Duration::from_millis(1500),
            collect_timeout: Duration::from_secs(3),
            decision: DecisionConfig::default(),
            thresholds: ThresholdConfig::default(),
            scoring: ScoringConfig::default(),
            predictive: PredictiveConfig::default(),
            telemetry: TelemetryConfig::default(),
            controller: ControllerConfig::default(),
            links: Vec::new(),
        }
    }
}

// ── Resolution ──────────────────────────────────────────────────────

fn secs(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_secs).unwrap_or(default)
}

fn millis(v: Option<u64>, default: Duration) -> Duration {
    v.map(Duration::from_millis).unwrap_or(default)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl FailoverConfigInput {
    pub fn resolve(self) -> Result<FailoverConfig, ConfigError> {
        let d = FailoverConfig::default();

        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(invalid(format!("unsupported config version {version}")));
        }

        let m = self.main;
        let tick = millis(m.tick_ms, d.tick);
        if tick.is_zero() {
            return Err(invalid("main.tick_ms must be greater than zero"));
        }
        let collect_timeout = millis(m.collect_timeout_ms, d.collect_timeout);
        if collect_timeout.is_zero() {
            return Err(invalid("main.collect_timeout_ms must be greater than zero"));
        }
        let decision = DecisionConfig {
            switch_margin: m.switch_margin.unwrap_or(d.decision.switch_margin),
            min_uptime: secs(m.min_uptime_s, d.decision.min_uptime),
            cooldown: secs(m.cooldown_s, d.decision.cooldown),
            fail_min_duration: secs(m.fail_min_duration_s, d.decision.fail_min_duration),
            restore_min_duration: secs(m.restore_min_duration_s, d.decision.restore_min_duration),
            missed_sample_limit: m
                .missed_sample_limit
                .unwrap_or(d.decision.missed_sample_limit)
                .max(1),
        };
        if !(0.0..=100.0).contains(&decision.switch_margin) {
            return Err(invalid("main.switch_margin must be within 0..=100"));
        }

        let thresholds = resolve_thresholds(self.thresholds)?;
        let scoring = resolve_scoring(self.scoring, d.scoring)?;
        let predictive = resolve_predictive(self.predictive, d.predictive)?;

        let t = self.telemetry;
        let max_ram_mb = t
            .max_ram_mb
            .unwrap_or((d.telemetry.max_ram_bytes / (1024 * 1024)) as u64);
        if max_ram_mb == 0 {
            return Err(invalid("telemetry.max_ram_mb must be greater than zero"));
        }
        let telemetry = TelemetryConfig {
            retention: t
                .retention_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(d.telemetry.retention),
            max_ram_bytes: (max_ram_mb as usize).saturating_mul(1024 * 1024),
            max_events: t.max_events.unwrap_or(d.telemetry.max_events).max(1),
        };

        let c = self.controller;
        let controller = ControllerConfig {
            backend: c.backend.unwrap_or(d.controller.backend),
            dry_run: c.dry_run.unwrap_or(d.controller.dry_run),
            retry: RetryPolicy {
                attempts: c.attempts.unwrap_or(d.controller.retry.attempts).max(1),
                base_delay: millis(c.base_delay_ms, d.controller.retry.base_delay),
                max_delay: millis(c.max_delay_ms, d.controller.retry.max_delay),
            },
            command_timeout: millis(c.command_timeout_ms, d.controller.command_timeout),
            mwan3: MetricPair {
                primary: c.mwan3_primary_metric.unwrap_or(d.controller.mwan3.primary),
                backup: c.mwan3_backup_metric.unwrap_or(d.controller.mwan3.backup),
            },
            route: MetricPair {
                primary: c.route_primary_metric.unwrap_or(d.controller.route.primary),
                backup: c.route_backup_metric.unwrap_or(d.controller.route.backup),
            },
        };
        if controller.retry.max_delay < controller.retry.base_delay {
            return Err(invalid("controller.max_delay_ms must be >= base_delay_ms"));
        }
        if controller.mwan3.primary >= controller.mwan3.backup
            || controller.route.primary >= controller.route.backup
        {
            return Err(invalid("controller primary metric must be lower than backup metric"));
        }

        let mut used = HashSet::new();
        let mut links = Vec::with_capacity(self.links.len());
        for link in self.links {
            let id = link.id.trim();
            if id.is_empty() {
                return Err(invalid("link without id"));
            }
            if id.len() > MAX_LINK_ID_LEN {
                return Err(invalid(format!(
                    "link id {id} is longer than {MAX_LINK_ID_LEN} bytes"
                )));
            }
            if !used.insert(id.to_string()) {
                return Err(invalid(format!("duplicate link id {id}")));
            }
            let Some(iface) = non_empty(link.iface) else {
                return Err(invalid(format!("link {id} has no iface")));
            };
            links.push(Link {
                id: LinkId::from(id),
                class: link.class.unwrap_or(LinkClass::Generic),
                iface,
                device: non_empty(link.device),
                member: non_empty(link.member),
                weight: link.weight.unwrap_or(Link::DEFAULT_WEIGHT),
                min_uptime: link.min_uptime_s.map(Duration::from_secs),
                cooldown: link.cooldown_s.map(Duration::from_secs),
                detect: link.detect.unwrap_or_default(),
                prefer_roaming: link.prefer_roaming.unwrap_or(false),
                metered: link.metered.unwrap_or(false),
                target: non_empty(link.target),
            });
        }

        Ok(FailoverConfig {
            version,
            tick,
            collect_timeout,
            decision,
            thresholds,
            scoring,
            predictive,
            telemetry,
            controller,
            links,
        })
    }
}

fn resolve_thresholds(t: ThresholdsInput) -> Result<ThresholdConfig, ConfigError> {
    let global = Thresholds::default().apply(&ThresholdOverrideInput {
        fail_loss_pct: t.fail_loss_pct,
        fail_latency_ms: t.fail_latency_ms,
        restore_loss_pct: t.restore_loss_pct,
        restore_latency_ms: t.restore_latency_ms,
    });
    global.validate("thresholds")?;

    let mut per_class = BTreeMap::new();
    for (class, o) in [
        (LinkClass::Satellite, t.satellite),
        (LinkClass::Cellular, t.cellular),
        (LinkClass::Wifi, t.wifi),
        (LinkClass::Lan, t.lan),
        (LinkClass::Generic, t.generic),
    ] {
        if let Some(o) = o {
            let resolved = global.apply(&o);
            resolved.validate(&format!("thresholds.{class}"))?;
            per_class.insert(class, resolved);
        }
    }
    Ok(ThresholdConfig { global, per_class })
}

fn resolve_scoring(s: ScoringInput, d: ScoringConfig) -> Result<ScoringConfig, ConfigError> {
    let ewma_alpha = s.ewma_alpha.unwrap_or(d.ewma_alpha);
    if !(ewma_alpha > 0.0 && ewma_alpha <= 1.0) {
        return Err(invalid("scoring.ewma_alpha must be within (0, 1]"));
    }

    let band = |name: &str, ok: Option<f64>, bad: Option<f64>, def: Band| {
        let b = Band::new(ok.unwrap_or(def.ok), bad.unwrap_or(def.bad));
        if !(b.ok.is_finite() && b.bad.is_finite()) || b.ok >= b.bad {
            return Err(invalid(format!("scoring.{name}: ok threshold must be below bad")));
        }
        Ok(b)
    };

    let weights = MetricWeights {
        latency: s.weight_latency.unwrap_or(d.weights.latency),
        loss: s.weight_loss.unwrap_or(d.weights.loss),
        jitter: s.weight_jitter.unwrap_or(d.weights.jitter),
        obstruction: s.weight_obstruction.unwrap_or(d.weights.obstruction),
    };
    if [weights.latency, weights.loss, weights.jitter, weights.obstruction]
        .iter()
        .any(|w| !w.is_finite() || *w < 0.0)
    {
        return Err(invalid("scoring weights must be non-negative"));
    }

    let mut class_weights = d.class_weights;
    for (class, w) in s.class_weights {
        if !(0.0..=100.0).contains(&w) {
            return Err(invalid(format!("scoring.class_weights.{class} must be within 0..=100")));
        }
        class_weights.insert(class, w);
    }

    let p = d.penalties;
    let penalties = Penalties {
        roaming: s.roaming_penalty.unwrap_or(p.roaming),
        weak_signal: s.weak_signal_penalty.unwrap_or(p.weak_signal),
        weak_signal_dbm: s.weak_signal_dbm.unwrap_or(p.weak_signal_dbm),
        weak_signal_samples: s.weak_signal_samples.unwrap_or(p.weak_signal_samples).max(1),
        metered: s.metered_penalty.unwrap_or(p.metered),
        strong_signal_bonus: s.strong_signal_bonus.unwrap_or(p.strong_signal_bonus),
        strong_sinr_db: s.strong_sinr_db.unwrap_or(p.strong_sinr_db),
        strong_signal_dbm: s.strong_signal_dbm.unwrap_or(p.strong_signal_dbm),
    };

    Ok(ScoringConfig {
        ewma_alpha,
        history_window: secs(s.history_window_s, d.history_window),
        latency: band("latency", s.latency_ok_ms, s.latency_bad_ms, d.latency)?,
        loss: band("loss", s.loss_ok_pct, s.loss_bad_pct, d.loss)?,
        jitter: band("jitter", s.jitter_ok_ms, s.jitter_bad_ms, d.jitter)?,
        obstruction: band(
            "obstruction",
            s.obstruction_ok_pct,
            s.obstruction_bad_pct,
            d.obstruction,
        )?,
        weights,
        class_weights,
        penalties,
    })
}

fn resolve_predictive(
    p: PredictiveInput,
    d: PredictiveConfig,
) -> Result<PredictiveConfig, ConfigError> {
    let out = PredictiveConfig {
        enabled: p.enabled.unwrap_or(d.enabled),
        trend_samples: p.trend_samples.unwrap_or(d.trend_samples),
        latency_rate_ms_per_s: p.latency_rate_ms_per_s.unwrap_or(d.latency_rate_ms_per_s),
        loss_rate_pct_per_s: p.loss_rate_pct_per_s.unwrap_or(d.loss_rate_pct_per_s),
        jitter_rate_ms_per_s: p.jitter_rate_ms_per_s.unwrap_or(d.jitter_rate_ms_per_s),
        obstruction_accel: p.obstruction_accel.unwrap_or(d.obstruction_accel),
        sinr_drop_rate_db: p.sinr_drop_rate_db.unwrap_or(d.sinr_drop_rate_db),
        rate_limit_factor: p.rate_limit_factor.unwrap_or(d.rate_limit_factor),
    };
    if out.trend_samples < 3 {
        return Err(invalid("predictive.trend_samples must be at least 3"));
    }
    let rates = [
        out.latency_rate_ms_per_s,
        out.loss_rate_pct_per_s,
        out.jitter_rate_ms_per_s,
        out.obstruction_accel,
        out.sinr_drop_rate_db,
    ];
    if rates.iter().any(|r| !r.is_finite() || *r <= 0.0) {
        return Err(invalid("predictive rates must be positive"));
    }
    Ok(out)
}

impl FailoverConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(FailoverConfig::default());
        }
        let parsed: FailoverConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn link(&self, id: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn min_uptime_for(&self, link: &Link) -> Duration {
        link.min_uptime.unwrap_or(self.decision.min_uptime)
    }

    pub fn cooldown_for(&self, link: &Link) -> Duration {
        link.cooldown.unwrap_or(self.decision.cooldown)
    }

    /// Minimum spacing between predictive triggers.
    pub fn predictive_rate_limit(&self) -> Duration {
        self.decision
            .fail_min_duration
            .checked_mul(self.predictive.rate_limit_factor)
            .unwrap_or(Duration::MAX)
    }

    /// Human-readable `key: old -> new` lines for every changed setting.
    pub fn diff(&self, other: &FailoverConfig) -> Vec<String> {
        let before = flatten(self);
        let after = flatten(other);

        let mut out = Vec::new();
        for (key, old) in &before {
            match after.get(key) {
                Some(new) if new == old => {}
                Some(new) => out.push(format!("{key}: {old} -> {new}")),
                None => out.push(format!("{key}: {old} -> (removed)")),
            }
        }
        for (key, new) in &after {
            if !before.contains_key(key) {
                out.push(format!("{key}: (unset) -> {new}"));
            }
        }
        out
    }
}

fn flatten(cfg: &FailoverConfig) -> BTreeMap<String, String> {
    let mut value = serde_json::to_value(cfg).unwrap_or(serde_json::Value::Null);
    // Key links by id so reordering does not show up as a change.
    if let Some(obj) = value.as_object_mut() {
        if let Some(serde_json::Value::Array(links)) = obj.remove("links") {
            let by_id = links
                .into_iter()
                .filter_map(|l| {
                    let id = l.get("id")?.as_str()?.to_string();
                    Some((id, l))
                })
                .collect::<serde_json::Map<_, _>>();
            obj.insert("links".into(), serde_json::Value::Object(by_id));
        }
    }
    let mut out = BTreeMap::new();
    flatten_into(&mut out, String::new(), &value);
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(out, key, v);
            }
        }
        other => {
            out.insert(prefix, other.to_string());
        }
    }
}
