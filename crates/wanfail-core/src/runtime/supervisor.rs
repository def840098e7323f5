use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use wanfail_common::{
    Action, ActionReply, Decision, EventKind, LinkId, LinkPhase, LinkStatus, Metrics,
    NotificationIntent, Outcome, StatusSnapshot,
};

use super::clock::Clock;
use super::collector::{CollectError, Collector};
use super::handle::{Command, SupervisorHandle};
use crate::config::FailoverConfig;
use crate::controller::{Controller, RouteBackend};
use crate::decision::{DecisionEngine, LinkState, ManualError, Transition};
use crate::scoring::Scorer;
use crate::telemetry::TelemetryStore;
use crate::telemetry::store::to_delta;

const COMMAND_QUEUE: usize = 64;
/// Ticks between checks that the routing layer still agrees with the primary.
const DRIFT_CHECK_TICKS: u64 = 20;

type Collected = HashMap<LinkId, Result<Metrics, CollectError>>;

/// Owns every piece of mutable failover state and runs the tick loop.
///
/// One tick: collect from every link (concurrently, each under
/// `collect_timeout`), score and record what arrived, evaluate, apply a
/// switch if one was decided, publish a snapshot. Commands from
/// [`SupervisorHandle`]s are serviced between ticks, so a reload never lands
/// mid-evaluation.
pub struct Supervisor<C, B> {
    cfg: FailoverConfig,
    collector: C,
    controller: Controller<B>,
    scorer: Scorer,
    store: TelemetryStore,
    engine: DecisionEngine,
    clock: Clock,
    tick: u64,
    last_decision: Option<Decision>,
    /// Pushed samples waiting for the next tick.
    pushed: HashMap<LinkId, Metrics>,
    snapshot: Arc<ArcSwap<StatusSnapshot>>,
    commands: mpsc::Receiver<Command>,
    interrupt: Arc<Notify>,
    notifications: Option<mpsc::Sender<NotificationIntent>>,
}

impl<C: Collector, B: RouteBackend> Supervisor<C, B> {
    pub fn new(
        cfg: FailoverConfig,
        collector: C,
        controller: Controller<B>,
    ) -> (Self, SupervisorHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let snapshot = Arc::new(ArcSwap::from_pointee(StatusSnapshot::default()));
        let interrupt = Arc::new(Notify::new());
        let handle = SupervisorHandle {
            snapshot: snapshot.clone(),
            tx,
            interrupt: interrupt.clone(),
        };

        let mut engine = DecisionEngine::new();
        engine.sync_links(&cfg);
        let supervisor = Self {
            scorer: Scorer::new(cfg.scoring.clone(), cfg.predictive.clone()),
            store: TelemetryStore::new(&cfg.telemetry),
            cfg,
            collector,
            controller,
            engine,
            clock: Clock::start(),
            tick: 0,
            last_decision: None,
            pushed: HashMap::new(),
            snapshot,
            commands,
            interrupt,
            notifications: None,
        };
        supervisor.publish();
        (supervisor, handle)
    }

    /// Send a [`NotificationIntent`] for every audited decision to `tx`.
    /// Intents are dropped, not queued, when the receiver falls behind.
    pub fn with_notifications(mut self, tx: mpsc::Sender<NotificationIntent>) -> Self {
        self.notifications = Some(tx);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until `shutdown` turns true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            links = self.cfg.links.len(),
            tick_ms = self.cfg.tick.as_millis() as u64,
            backend = self.controller.backend().name(),
            "supervisor started"
        );
        self.adopt_active().await;
        self.publish();

        let mut period = self.cfg.tick;
        let mut interval = tick_interval(period);
        let mut commands_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle(cmd, &mut shutdown).await,
                    None => commands_open = false,
                },
                _ = interval.tick() => self.run_tick(&mut shutdown).await,
            }
            if self.cfg.tick != period {
                period = self.cfg.tick;
                interval = tick_interval(period);
            }
        }
        info!(ticks = self.tick, "supervisor stopped");
    }

    // ── Tick ────────────────────────────────────────────────────

    async fn run_tick(&mut self, shutdown: &mut watch::Receiver<bool>) {
        self.tick += 1;
        let now = self.clock.now();
        self.store.evict_expired(now);

        let Some(collected) = self.gather(now, shutdown).await else {
            debug!(tick = self.tick, "tick interrupted during collection");
            return;
        };
        self.ingest(now, collected);

        let verdict = self.engine.evaluate(&self.cfg, &self.scorer, now);
        if verdict.decision.is_switch() {
            self.execute(verdict.decision, shutdown).await;
        } else {
            if verdict.audit {
                self.audit(&verdict.decision, &Outcome::NotApplied);
            }
            self.last_decision = Some(verdict.decision);
            if self.tick % DRIFT_CHECK_TICKS == 0 {
                self.reconcile(shutdown).await;
            }
        }
        self.publish();
    }

    /// Re-promote the primary if something outside the daemon moved the
    /// default route. `apply` is idempotent, so an agreeing backend costs one
    /// read.
    async fn reconcile(&mut self, shutdown: &mut watch::Receiver<bool>) {
        if self.cfg.controller.dry_run {
            return;
        }
        let Some(primary) = self.engine.primary().and_then(|id| self.cfg.link(id)) else {
            return;
        };
        let apply = self.controller.apply(primary, &self.cfg.links);
        let interrupted = self.interrupt.notified();
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = interrupted => return,
            r = apply => r,
        };
        match result {
            Ok(Outcome::Applied) => {
                warn!(link = %primary.id, "routing drifted away from primary, re-applied");
            }
            Ok(_) => debug!(link = %primary.id, "routing agrees with primary"),
            Err(e) => warn!(link = %primary.id, error = %e, "could not re-apply primary"),
        }
    }

    /// Pushed samples win over pulls. `None` when a reload or shutdown cut
    /// the collection short; pushes are kept for the next tick then.
    async fn gather(
        &mut self,
        now: DateTime<Utc>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Collected> {
        let pushed = std::mem::take(&mut self.pushed);
        let timeout = self.cfg.collect_timeout;

        let pulled = {
            let collector = &self.collector;
            let pulls = self
                .cfg
                .links
                .iter()
                .filter(|l| !pushed.contains_key(&l.id))
                .map(|link| async move {
                    let r = match tokio::time::timeout(timeout, collector.collect(link, now)).await
                    {
                        Ok(r) => r,
                        Err(_) => Err(CollectError::Timeout(timeout)),
                    };
                    (link.id.clone(), r)
                });
            let interrupted = self.interrupt.notified();
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                _ = interrupted => None,
                results = join_all(pulls) => Some(results),
            }
        };

        match pulled {
            Some(results) => {
                let mut collected: Collected = results.into_iter().collect();
                collected.extend(pushed.into_iter().map(|(id, m)| (id, Ok(m))));
                Some(collected)
            }
            None => {
                for (id, m) in pushed {
                    self.pushed.entry(id).or_insert(m);
                }
                None
            }
        }
    }

    fn ingest(&mut self, now: DateTime<Utc>, mut collected: Collected) {
        let max_age = to_delta(self.cfg.tick + self.cfg.collect_timeout);
        let mut transitions = Vec::new();

        for link in &self.cfg.links {
            let last = self.engine.state(&link.id).and_then(|s| s.last_sample);
            let fresh = match collected.remove(&link.id) {
                Some(Ok(m)) if last.is_some_and(|t| m.timestamp <= t) => {
                    debug!(link = %link.id, ts = %m.timestamp, "sample not newer than last, ignored");
                    None
                }
                Some(Ok(m)) if now - m.timestamp > max_age => {
                    debug!(link = %link.id, ts = %m.timestamp, "sample too old, ignored");
                    None
                }
                Some(Ok(m)) => Some(m),
                Some(Err(e)) => {
                    debug!(link = %link.id, error = %e, "collection failed");
                    None
                }
                None => None,
            };

            let transition = match fresh {
                Some(m) => {
                    let scores = self.scorer.ingest(link, m.clone(), &mut self.store);
                    debug!(
                        link = %link.id,
                        instant = scores.instant,
                        ewma = scores.ewma,
                        final_score = scores.final_score,
                        "scored"
                    );
                    self.engine.observe(&self.cfg, link, &m)
                }
                None => {
                    self.scorer.note_gap(&link.id);
                    self.engine.miss(&self.cfg, link)
                }
            };
            if let Some(t) = transition {
                transitions.push((link.id.clone(), t));
            }
        }

        for (link, t) in transitions {
            self.record_transition(now, link, t);
        }
    }

    /// Hand a switch to the controller and commit the result.
    async fn execute(&mut self, decision: Decision, shutdown: &mut watch::Receiver<bool>) -> Outcome {
        let outcome = match decision.to.as_deref().and_then(|id| self.cfg.link(id)) {
            None => Outcome::Failed {
                error: "target link is not configured".into(),
            },
            Some(target) => {
                let apply = self.controller.apply(target, &self.cfg.links);
                let interrupted = self.interrupt.notified();
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => Outcome::Cancelled,
                    _ = interrupted => Outcome::Cancelled,
                    r = apply => match r {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(to = %target.id, error = %e, "switch failed");
                            Outcome::Failed { error: e.to_string() }
                        }
                    },
                }
            }
        };

        self.engine
            .commit(&self.cfg, &decision, &outcome, self.clock.now());
        self.audit(&decision, &outcome);
        self.last_decision = Some(decision);
        outcome
    }

    fn audit(&mut self, decision: &Decision, outcome: &Outcome) {
        if let Some(tx) = &self.notifications {
            if let Err(e) = tx.try_send(NotificationIntent::from_decision(decision, outcome)) {
                debug!(error = %e, "notification intent dropped");
            }
        }
        self.store.put_event(
            decision.timestamp,
            EventKind::Decision {
                decision: decision.clone(),
                outcome: outcome.clone(),
            },
        );
    }

    fn record_transition(&mut self, now: DateTime<Utc>, link: LinkId, t: Transition) {
        if t.to == LinkPhase::Ineligible {
            warn!(link = %link, from = %t.from, cause = %t.cause, "link ineligible");
        } else {
            info!(link = %link, from = %t.from, to = %t.to, cause = %t.cause, "link phase changed");
        }
        self.store.put_event(
            now,
            EventKind::Eligibility {
                link,
                phase: t.to,
                cause: t.cause,
            },
        );
    }

    // ── Commands ────────────────────────────────────────────────

    async fn handle(&mut self, cmd: Command, shutdown: &mut watch::Receiver<bool>) {
        match cmd {
            Command::History { link, since, reply } => {
                let samples = self
                    .cfg
                    .link(&link)
                    .map(|_| self.store.history(&link, since));
                let _ = reply.send(samples);
            }
            Command::Events { limit, reply } => {
                let _ = reply.send(self.store.events(limit));
            }
            Command::Action { action, reply } => {
                let r = self.act(action, shutdown).await;
                let _ = reply.send(r);
            }
            Command::Reload { config, reply } => {
                let changes = self.reload(*config);
                let _ = reply.send(changes);
            }
            Command::Rejected { error } => {
                warn!(%error, "config reload rejected, keeping current config");
                self.store
                    .put_event(self.clock.now(), EventKind::ConfigRejected { error });
            }
            Command::Push { link, metrics } => {
                if self.cfg.link(&link).is_some() {
                    self.pushed.insert(link, metrics);
                } else {
                    debug!(%link, "push for unknown link ignored");
                }
            }
        }
    }

    async fn act(&mut self, action: Action, shutdown: &mut watch::Receiver<bool>) -> ActionReply {
        let now = self.clock.now();
        match action {
            Action::Failover { to } => {
                let d = self
                    .engine
                    .manual_failover(&self.cfg, &self.scorer, to.as_deref(), now);
                self.manual(d, shutdown).await
            }
            Action::Restore => {
                let d = self.engine.manual_restore(&self.cfg, &self.scorer, now);
                self.manual(d, shutdown).await
            }
            Action::Recheck => {
                self.engine.reset_predictive();
                self.run_tick(shutdown).await;
                ActionReply {
                    decision: self.last_decision.clone(),
                    ..ActionReply::accepted("re-evaluated")
                }
            }
            Action::Disable { link } => self.set_disabled(link, true, now),
            Action::Enable { link } => self.set_disabled(link, false, now),
            Action::SetLogLevel { .. } => ActionReply::rejected("log level is managed by the agent"),
        }
    }

    async fn manual(
        &mut self,
        decision: Result<Decision, ManualError>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ActionReply {
        let decision = match decision {
            Ok(d) => d,
            Err(e) => {
                info!(error = %e, "manual action rejected");
                return ActionReply::rejected(e.to_string());
            }
        };
        if !decision.is_switch() {
            return ActionReply {
                decision: Some(decision),
                outcome: Some(Outcome::AlreadyActive),
                ..ActionReply::accepted("already primary")
            };
        }

        let outcome = self.execute(decision.clone(), shutdown).await;
        self.publish();
        let reply = if outcome.is_success() {
            ActionReply::accepted(format!(
                "switched to {}",
                decision.to.as_deref().unwrap_or("none")
            ))
        } else {
            ActionReply::rejected(format!("switch not applied: {outcome}"))
        };
        ActionReply {
            decision: Some(decision),
            outcome: Some(outcome),
            ..reply
        }
    }

    fn set_disabled(&mut self, link: LinkId, disabled: bool, now: DateTime<Utc>) -> ActionReply {
        let verb = if disabled { "disabled" } else { "enabled" };
        match self.engine.set_disabled(&link, disabled) {
            Err(e) => ActionReply::rejected(e.to_string()),
            Ok(transition) => {
                info!(%link, "link {verb} by operator");
                if let Some(t) = transition {
                    self.record_transition(now, link.clone(), t);
                }
                self.publish();
                ActionReply::accepted(format!("{link} {verb}"))
            }
        }
    }

    // ── Reload ──────────────────────────────────────────────────

    fn reload(&mut self, new: FailoverConfig) -> Vec<String> {
        let changes = self.cfg.diff(&new);
        if changes.is_empty() {
            info!("config reloaded, no changes");
            return changes;
        }
        for change in &changes {
            info!(%change, "config changed");
        }

        self.scorer
            .reconfigure(new.scoring.clone(), new.predictive.clone());
        self.store.reconfigure(&new.telemetry);
        self.controller.reconfigure(&new.controller);

        let now = self.clock.now();
        let (added, removed) = self.engine.sync_links(&new);
        for link in removed {
            info!(%link, "link removed");
            self.scorer.forget(&link);
            self.store.remove_link(&link);
            self.pushed.remove(&link);
            self.store.put_event(now, EventKind::LinkRemoved { link });
        }
        for link in added {
            info!(%link, "link added");
            self.store.put_event(now, EventKind::LinkAdded { link });
        }

        self.cfg = new;
        self.store.put_event(
            now,
            EventKind::ConfigReloaded {
                changes: changes.clone(),
            },
        );
        self.publish();
        changes
    }

    // ── Snapshot ────────────────────────────────────────────────

    async fn adopt_active(&mut self) {
        match self.controller.active_link(&self.cfg.links).await {
            Ok(Some(link)) => {
                info!(link = %link.id, "adopting active link as primary");
                self.engine.adopt(link.id.clone());
            }
            Ok(None) => info!("no configured link is active yet"),
            Err(e) => warn!(error = %e, "could not read active link at startup"),
        }
    }

    fn publish(&self) {
        let ranked = self.engine.ranking(&self.cfg, &self.scorer);
        let primary = self.engine.primary();
        let links = self
            .cfg
            .links
            .iter()
            .map(|link| {
                let state = self.engine.state(&link.id);
                LinkStatus {
                    id: link.id.clone(),
                    class: link.class,
                    iface: link.iface.clone(),
                    weight: link.weight,
                    rank: ranked
                        .iter()
                        .position(|(l, _)| l.id == link.id)
                        .map(|p| p + 1),
                    phase: state.map_or(LinkPhase::WarmingUp, |s| s.phase),
                    eligible: state.is_some_and(LinkState::eligible),
                    primary: primary == Some(&link.id),
                    run: state.and_then(|s| s.run),
                    run_since: state.and_then(|s| s.since),
                    cooldown_until: state.and_then(|s| s.cooldown_until),
                    last_change: state.and_then(|s| s.last_change),
                    missed: state.map_or(0, |s| s.misses),
                    scores: self.scorer.scores(&link.id),
                    breakdown: self.scorer.breakdown(&link.id).cloned(),
                    metrics: state.and_then(|s| s.last_metrics.clone()),
                }
            })
            .collect();

        self.snapshot.store(Arc::new(StatusSnapshot {
            tick: self.tick,
            updated_at: Some(self.clock.now()),
            primary: primary.cloned(),
            no_eligible: self.engine.no_eligible(),
            last_decision: self.last_decision.clone(),
            links,
            store: self.store.stats(),
        }));
    }
}

fn tick_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
