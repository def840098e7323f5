//! Multi-WAN policy backend (mwan3).
//!
//! Members come from `uci show mwan3`, online state from
//! `ubus call mwan3 status`. The active member is the online member with the
//! lowest metric; promotion rewrites member metrics so the target has the
//! primary metric and everything else the backup metric.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use tracing::{debug, info};

use super::command::CommandRunner;
use super::{ControllerError, RouteBackend};
use crate::config::{ControllerConfig, Link, MetricPair};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mwan3Member {
    pub name: String,
    pub interface: Option<String>,
    pub metric: Option<u32>,
}

/// Parse `uci show mwan3` into its `member` sections, in name order.
pub fn parse_members(text: &str) -> Vec<Mwan3Member> {
    let mut sections: BTreeMap<String, (bool, Mwan3Member)> = BTreeMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
        let mut parts = key.split('.');
        if parts.next() != Some("mwan3") {
            continue;
        }
        let Some(name) = parts.next() else {
            continue;
        };
        let entry = sections.entry(name.to_string()).or_insert_with(|| {
            (
                false,
                Mwan3Member {
                    name: name.to_string(),
                    interface: None,
                    metric: None,
                },
            )
        });
        match parts.next() {
            None => entry.0 = value == "member",
            Some("interface") => entry.1.interface = Some(value.to_string()),
            Some("metric") => entry.1.metric = value.parse().ok(),
            Some(_) => {}
        }
    }
    sections
        .into_values()
        .filter_map(|(is_member, m)| is_member.then_some(m))
        .collect()
}

#[derive(Debug, Deserialize)]
struct Mwan3Status {
    #[serde(default)]
    interfaces: HashMap<String, Mwan3InterfaceStatus>,
}

#[derive(Debug, Deserialize)]
struct Mwan3InterfaceStatus {
    #[serde(default)]
    status: String,
}

/// Interfaces `ubus call mwan3 status` reports as online.
pub fn parse_online(json: &str) -> Result<HashSet<String>, ControllerError> {
    let status: Mwan3Status = serde_json::from_str(json).map_err(|e| ControllerError::Parse {
        command: "ubus call mwan3 status".into(),
        detail: e.to_string(),
    })?;
    Ok(status
        .interfaces
        .into_iter()
        .filter(|(_, s)| s.status == "online")
        .map(|(name, _)| name)
        .collect())
}

/// Online member with the lowest metric; ties go to the first by name.
pub fn active_member(members: &[Mwan3Member], online: &HashSet<String>) -> Option<String> {
    members
        .iter()
        .filter(|m| m.interface.as_ref().is_some_and(|i| online.contains(i)))
        .filter_map(|m| m.metric.map(|metric| (metric, &m.name)))
        .min()
        .map(|(_, name)| name.clone())
}

#[derive(Debug, Clone)]
pub struct Mwan3Backend<R> {
    runner: R,
    metrics: MetricPair,
}

impl<R: CommandRunner> Mwan3Backend<R> {
    pub fn new(runner: R, metrics: MetricPair) -> Self {
        Self { runner, metrics }
    }

    async fn members(&self) -> Result<Vec<Mwan3Member>, ControllerError> {
        let text = self.runner.output("uci", &["show", "mwan3"]).await?;
        Ok(parse_members(&text))
    }
}

impl<R: CommandRunner> RouteBackend for Mwan3Backend<R> {
    fn name(&self) -> &'static str {
        "mwan3"
    }

    fn target<'a>(&self, link: &'a Link) -> &'a str {
        link.policy_member()
    }

    async fn active(&self) -> Result<Option<String>, ControllerError> {
        let members = self.members().await?;
        let status = self.runner.output("ubus", &["call", "mwan3", "status"]).await?;
        let online = parse_online(&status)?;
        Ok(active_member(&members, &online))
    }

    async fn promote(&self, link: &Link, _links: &[Link]) -> Result<usize, ControllerError> {
        let target = link.policy_member();
        let members = self.members().await?;
        if !members.iter().any(|m| m.name == target) {
            return Err(ControllerError::UnknownTarget(target.to_string()));
        }

        let mut writes = 0;
        for m in &members {
            let want = if m.name == target {
                self.metrics.primary
            } else {
                self.metrics.backup
            };
            if m.metric == Some(want) {
                continue;
            }
            let assignment = format!("mwan3.{}.metric={want}", m.name);
            self.runner.output("uci", &["set", &assignment]).await?;
            writes += 1;
        }

        if writes == 0 {
            debug!(member = target, "member metrics already optimal, skipping reload");
            return Ok(0);
        }
        self.runner.output("uci", &["commit", "mwan3"]).await?;
        self.runner.output("/etc/init.d/mwan3", &["reload"]).await?;
        info!(member = target, writes, "mwan3 member metrics updated");
        Ok(writes)
    }

    fn reconfigure(&mut self, cfg: &ControllerConfig) {
        self.metrics = cfg.mwan3;
    }
}
