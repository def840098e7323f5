//! Tick-loop integration tests.
//!
//! Drives a real `Supervisor` against a scripted collector and an in-memory
//! routing backend on a paused tokio clock, so tens of seconds of ticks run
//! instantly and deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wanfail_common::{
    Action, EventKind, LinkPhase, Metrics, NotificationIntent, Outcome, Severity, SwitchKind,
};
use wanfail_core::config::RetryPolicy;
use wanfail_core::{
    Clock, CollectError, Collector, Controller, ControllerError, FailoverConfig, Link,
    RouteBackend, Supervisor, SupervisorHandle,
};

// ────────────────────────────────────────────────────────────────
// Fakes
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Links {
    /// `(latency_ms, loss_pct)` per link id; absent links fail to answer.
    quality: Mutex<HashMap<String, (f64, f64)>>,
    delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
struct FakeCollector(Arc<Links>);

impl FakeCollector {
    fn set(&self, link: &str, latency_ms: f64, loss_pct: f64) {
        self.0
            .quality
            .lock()
            .unwrap()
            .insert(link.to_string(), (latency_ms, loss_pct));
    }

    fn cut(&self, link: &str) {
        self.0.quality.lock().unwrap().remove(link);
    }

    fn slow_down(&self, delay: Duration) {
        *self.0.delay.lock().unwrap() = delay;
    }
}

impl Collector for FakeCollector {
    async fn collect(&self, link: &Link, now: DateTime<Utc>) -> Result<Metrics, CollectError> {
        let delay = *self.0.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let quality = self.0.quality.lock().unwrap().get(link.id.as_str()).copied();
        quality
            .map(|(latency, loss)| Metrics::new(now, latency, loss, 3.0))
            .ok_or_else(|| CollectError::Probe("unreachable".into()))
    }
}

#[derive(Default)]
struct Routing {
    active: Mutex<Option<String>>,
    /// Promotions are accepted but never take effect.
    stuck: AtomicBool,
    promotions: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct FakeRouting(Arc<Routing>);

impl FakeRouting {
    fn active_on(iface: &str) -> Self {
        let r = Self::default();
        *r.0.active.lock().unwrap() = Some(iface.to_string());
        r
    }

    fn current(&self) -> Option<String> {
        self.0.active.lock().unwrap().clone()
    }

    fn promotions(&self) -> Vec<String> {
        self.0.promotions.lock().unwrap().clone()
    }
}

impl RouteBackend for FakeRouting {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn target<'a>(&self, link: &'a Link) -> &'a str {
        &link.iface
    }

    async fn active(&self) -> Result<Option<String>, ControllerError> {
        Ok(self.0.active.lock().unwrap().clone())
    }

    async fn promote(&self, link: &Link, _links: &[Link]) -> Result<usize, ControllerError> {
        self.0.promotions.lock().unwrap().push(link.id.to_string());
        if !self.0.stuck.load(Ordering::SeqCst) {
            *self.0.active.lock().unwrap() = Some(link.iface.clone());
        }
        Ok(1)
    }
}

// ────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────

const CONFIG: &str = r#"
    [main]
    tick_ms = 1000
    collect_timeout_ms = 500

    [[links]]
    id = "starlink"
    class = "satellite"
    iface = "wan"

    [[links]]
    id = "lte"
    class = "cellular"
    iface = "mob1s1a1"
"#;

struct Rig {
    handle: SupervisorHandle,
    collector: FakeCollector,
    routing: FakeRouting,
    clock: Clock,
    intents: mpsc::Receiver<NotificationIntent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn config() -> FailoverConfig {
    FailoverConfig::from_toml_str(CONFIG).unwrap()
}

fn start(cfg: FailoverConfig, routing: FakeRouting) -> Rig {
    let collector = FakeCollector::default();
    collector.set("starlink", 40.0, 0.0);
    collector.set("lte", 45.0, 0.0);

    let retry = RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(200),
    };
    let controller = Controller::new(routing.clone(), retry, false);
    let clock = Clock::starting_at(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
    let (intent_tx, intents) = mpsc::channel(64);
    let (supervisor, handle) = Supervisor::new(cfg, collector.clone(), controller);
    let supervisor = supervisor.with_clock(clock).with_notifications(intent_tx);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor.run(shutdown_rx));
    Rig {
        handle,
        collector,
        routing,
        clock,
        intents,
        shutdown,
        task,
    }
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn decisions(handle: &SupervisorHandle) -> Vec<(SwitchKind, Option<String>, Outcome)> {
    let mut events = handle.events(500).await.unwrap();
    events.reverse();
    events
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::Decision { decision, outcome } => Some((
                decision.kind,
                decision.to.map(|t| t.to_string()),
                outcome,
            )),
            _ => None,
        })
        .collect()
}

fn primary(handle: &SupervisorHandle) -> Option<String> {
    handle.status().primary.as_ref().map(|p| p.to_string())
}

// ────────────────────────────────────────────────────────────────
// 1. Startup
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn adopts_active_link_and_stays_quiet() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(30_500).await;

    let status = rig.handle.status();
    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));
    assert!(status.links.iter().all(|l| l.eligible));
    assert_eq!(status.link("starlink").unwrap().rank, Some(1));
    assert_eq!(status.link("lte").unwrap().rank, Some(2));
    assert!(decisions(&rig.handle).await.is_empty());
    assert!(rig.routing.promotions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn selects_initial_primary_after_warmup() {
    let mut rig = start(config(), FakeRouting::default());

    advance(10_500).await;
    assert_eq!(primary(&rig.handle), None);
    assert_eq!(rig.handle.status().link("lte").unwrap().phase, LinkPhase::WarmingUp);

    advance(10_000).await;
    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));
    assert_eq!(rig.routing.current().as_deref(), Some("wan"));
    assert_eq!(
        decisions(&rig.handle).await,
        vec![(SwitchKind::Initial, Some("starlink".into()), Outcome::Applied)]
    );
    let intent = rig.intents.try_recv().unwrap();
    assert_eq!(intent.kind, SwitchKind::Initial);
    assert_eq!(intent.severity, Severity::Info);
}

// ────────────────────────────────────────────────────────────────
// 2. Failover
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sustained_degradation_fails_over() {
    let mut rig = start(config(), FakeRouting::active_on("wan"));
    advance(30_500).await;

    rig.collector.set("starlink", 2000.0, 20.0);
    advance(8_000).await;
    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));

    advance(5_000).await;
    assert_eq!(primary(&rig.handle).as_deref(), Some("lte"));
    assert_eq!(rig.routing.current().as_deref(), Some("mob1s1a1"));
    assert_eq!(rig.routing.promotions(), vec!["lte".to_string()]);

    let log = decisions(&rig.handle).await;
    assert_eq!(
        log,
        vec![(SwitchKind::Failover, Some("lte".into()), Outcome::Applied)]
    );
    let intent = rig.intents.try_recv().unwrap();
    assert_eq!(intent.severity, Severity::Warning);
    assert!(intent.quality_factors.contains_key("starlink"));
}

#[tokio::test(start_paused = true)]
async fn unconverged_switch_keeps_primary() {
    let routing = FakeRouting::active_on("wan");
    routing.0.stuck.store(true, Ordering::SeqCst);
    let rig = start(config(), routing);
    advance(30_500).await;

    rig.collector.set("starlink", 2000.0, 20.0);
    advance(13_000).await;

    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));
    let log = decisions(&rig.handle).await;
    assert!(log.len() >= 2, "{log:?}");
    assert!(
        log.iter()
            .all(|(_, to, outcome)| to.as_deref() == Some("lte")
                && matches!(outcome, Outcome::Failed { .. }))
    );
    assert!(rig.routing.promotions().len() >= 2);
}

#[tokio::test(start_paused = true)]
async fn silent_link_becomes_ineligible() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(30_500).await;

    rig.collector.cut("lte");
    advance(3_000).await;

    let status = rig.handle.status();
    let lte = status.link("lte").unwrap();
    assert_eq!(lte.phase, LinkPhase::Ineligible);
    assert_eq!(lte.rank, None);

    let events = rig.handle.events(10).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::Eligibility { link, phase: LinkPhase::Ineligible, .. } if link == "lte"
    )));
}

#[tokio::test(start_paused = true)]
async fn external_route_change_is_reverted() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(5_500).await;

    // Someone else promotes the cellular modem.
    *rig.routing.0.active.lock().unwrap() = Some("mob1s1a1".into());
    advance(15_000).await;

    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));
    assert_eq!(rig.routing.current().as_deref(), Some("wan"));
    assert_eq!(rig.routing.promotions(), vec!["starlink".to_string()]);
    assert!(decisions(&rig.handle).await.is_empty());
}

// ────────────────────────────────────────────────────────────────
// 3. Push ingestion
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pushed_sample_replaces_pull() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(500).await;

    let mut m = Metrics::new(rig.clock.now(), 123.0, 0.0, 3.0);
    m.obstruction_pct = Some(1.5);
    rig.handle.push("starlink", m).unwrap();
    rig.handle
        .push("ghost", Metrics::new(rig.clock.now(), 1.0, 0.0, 0.0))
        .unwrap();
    advance(1_000).await;

    let origin = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let history = rig.handle.history("starlink", origin).await.unwrap().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].metrics.latency_ms, 40.0);
    assert_eq!(history[1].metrics.latency_ms, 123.0);
    assert_eq!(history[1].metrics.obstruction_pct, Some(1.5));

    assert_eq!(rig.handle.history("ghost", origin).await.unwrap(), None);
}

// ────────────────────────────────────────────────────────────────
// 4. Operator actions
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn manual_failover_and_disable() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(25_500).await;

    let reply = rig
        .handle
        .action(Action::Failover {
            to: Some("lte".into()),
        })
        .await
        .unwrap();
    assert!(reply.accepted, "{}", reply.message);
    assert_eq!(reply.outcome, Some(Outcome::Applied));
    assert_eq!(primary(&rig.handle).as_deref(), Some("lte"));
    assert_eq!(rig.routing.current().as_deref(), Some("mob1s1a1"));

    // Already primary.
    let reply = rig
        .handle
        .action(Action::Failover {
            to: Some("lte".into()),
        })
        .await
        .unwrap();
    assert!(reply.accepted);
    assert_eq!(reply.outcome, Some(Outcome::AlreadyActive));

    let reply = rig
        .handle
        .action(Action::Disable {
            link: "starlink".into(),
        })
        .await
        .unwrap();
    assert!(reply.accepted);
    assert_eq!(
        rig.handle.status().link("starlink").unwrap().phase,
        LinkPhase::Disabled
    );

    let reply = rig.handle.action(Action::Restore).await.unwrap();
    assert!(reply.accepted, "{}", reply.message);
    assert_eq!(reply.outcome, Some(Outcome::AlreadyActive));

    let reply = rig
        .handle
        .action(Action::Failover {
            to: Some("starlink".into()),
        })
        .await
        .unwrap();
    assert!(!reply.accepted);

    let reply = rig
        .handle
        .action(Action::Failover {
            to: Some("wifi".into()),
        })
        .await
        .unwrap();
    assert!(!reply.accepted);
    assert!(reply.message.contains("wifi"));

    let reply = rig
        .handle
        .action(Action::SetLogLevel {
            level: "debug".into(),
        })
        .await
        .unwrap();
    assert!(!reply.accepted);
}

#[tokio::test(start_paused = true)]
async fn recheck_runs_a_tick_immediately() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(2_500).await;
    let before = rig.handle.status().tick;

    let reply = rig.handle.action(Action::Recheck).await.unwrap();
    assert!(reply.accepted);
    assert_eq!(rig.handle.status().tick, before + 1);
}

// ────────────────────────────────────────────────────────────────
// 5. Reload
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reload_applies_diff_between_ticks() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(30_500).await;

    let mut cfg = config();
    cfg.decision.switch_margin = 15.0;
    cfg.links.retain(|l| l.id != "lte");
    cfg.links
        .push(Link::new("wifi", wanfail_common::LinkClass::Wifi, "wwan"));

    let changes = rig.handle.reload(cfg.clone()).await.unwrap();
    assert!(changes.contains(&"decision.switch_margin: 10.0 -> 15.0".to_string()));

    let status = rig.handle.status();
    let ids: Vec<&str> = status.links.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["starlink", "wifi"]);
    assert_eq!(primary(&rig.handle).as_deref(), Some("starlink"));

    let origin = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    assert_eq!(rig.handle.history("lte", origin).await.unwrap(), None);

    let events = rig.handle.events(10).await.unwrap();
    let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
    assert!(matches!(kinds[0], EventKind::ConfigReloaded { .. }));
    assert!(kinds.iter().any(|k| matches!(k, EventKind::LinkAdded { link } if link == "wifi")));
    assert!(kinds.iter().any(|k| matches!(k, EventKind::LinkRemoved { link } if link == "lte")));

    // Same config again: nothing to do.
    assert!(rig.handle.reload(cfg).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reload_cancels_slow_collection() {
    let mut cfg = config();
    cfg.collect_timeout = Duration::from_secs(5);
    let rig = start(cfg.clone(), FakeRouting::active_on("wan"));
    advance(500).await;
    rig.collector.slow_down(Duration::from_secs(4));
    advance(1_000).await;

    // Tick 2 is waiting on the collectors.
    cfg.decision.cooldown = Duration::from_secs(60);
    let changes = rig.handle.reload(cfg).await.unwrap();
    assert!(!changes.is_empty());

    let status = rig.handle.status();
    assert_eq!(status.tick, 2);
    // Only tick 1 (before the slowdown took effect) produced samples.
    assert!(status.links.iter().all(|l| l.scores.is_some()));
    let origin = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let history = rig.handle.history("starlink", origin).await.unwrap().unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_reload_is_recorded() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(1_500).await;

    rig.handle.reject("invalid config: duplicate link id lte").await.unwrap();
    let events = rig.handle.events(1).await.unwrap();
    assert!(matches!(
        &events[0].kind,
        EventKind::ConfigRejected { error } if error.contains("duplicate")
    ));
}

// ────────────────────────────────────────────────────────────────
// 6. Shutdown
// ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_loop() {
    let rig = start(config(), FakeRouting::active_on("wan"));
    advance(2_500).await;

    rig.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), rig.task)
        .await
        .expect("supervisor did not stop")
        .unwrap();
    assert!(rig.handle.events(1).await.is_err());
}
