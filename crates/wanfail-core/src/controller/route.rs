//! Route-metric fallback backend.
//!
//! Sets `network.<iface>.metric` through uci, reloads netifd, and reads the
//! kernel's default routes back to see which device won.

use tracing::info;

use super::command::CommandRunner;
use super::{ControllerError, RouteBackend};
use crate::config::{ControllerConfig, Link, MetricPair};

/// Device of the lowest-metric default route in `ip -4 route show default`
/// output. Routes without a metric count as metric 0.
pub fn default_route_device(text: &str) -> Option<String> {
    text.lines()
        .filter(|l| l.trim_start().starts_with("default"))
        .filter_map(|line| {
            let mut dev = None;
            let mut metric = 0u32;
            let mut words = line.split_whitespace();
            while let Some(w) = words.next() {
                match w {
                    "dev" => dev = words.next(),
                    "metric" => metric = words.next().and_then(|m| m.parse().ok()).unwrap_or(0),
                    _ => {}
                }
            }
            dev.map(|d| (metric, d))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, dev)| dev.to_string())
}

#[derive(Debug, Clone)]
pub struct RouteMetricBackend<R> {
    runner: R,
    metrics: MetricPair,
}

impl<R: CommandRunner> RouteMetricBackend<R> {
    pub fn new(runner: R, metrics: MetricPair) -> Self {
        Self { runner, metrics }
    }
}

impl<R: CommandRunner> RouteBackend for RouteMetricBackend<R> {
    fn name(&self) -> &'static str {
        "route"
    }

    fn target<'a>(&self, link: &'a Link) -> &'a str {
        link.route_device()
    }

    async fn active(&self) -> Result<Option<String>, ControllerError> {
        let text = self
            .runner
            .output("ip", &["-4", "route", "show", "default"])
            .await?;
        Ok(default_route_device(&text))
    }

    async fn promote(&self, link: &Link, links: &[Link]) -> Result<usize, ControllerError> {
        let mut writes = 0;
        for other in links {
            let metric = if other.id == link.id {
                self.metrics.primary
            } else {
                self.metrics.backup
            };
            let assignment = format!("network.{}.metric={metric}", other.iface);
            self.runner.output("uci", &["set", &assignment]).await?;
            writes += 1;
        }
        if !links.iter().any(|l| l.id == link.id) {
            let assignment = format!("network.{}.metric={}", link.iface, self.metrics.primary);
            self.runner.output("uci", &["set", &assignment]).await?;
            writes += 1;
        }
        self.runner.output("uci", &["commit", "network"]).await?;
        self.runner.output("ubus", &["call", "network", "reload"]).await?;
        info!(iface = %link.iface, writes, "route metrics updated");
        Ok(writes)
    }

    fn reconfigure(&mut self, cfg: &ControllerConfig) {
        self.metrics = cfg.route;
    }
}
