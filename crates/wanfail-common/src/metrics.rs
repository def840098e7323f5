//! Prometheus metrics rendering for link scores.
//!
//! Renders a [`StatusSnapshot`] in Prometheus text exposition format so the
//! agent can serve it on `/metrics`.

use std::fmt::Write;

use crate::protocol::{LinkStatus, StatusSnapshot};

/// Render a status snapshot as Prometheus text exposition format.
pub fn render_prometheus(status: &StatusSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    // ── Per-link gauges ─────────────────────────────────────────

    let _ = writeln!(
        out,
        "# HELP wanfail_link_score Link quality score (0-100) per tier."
    );
    let _ = writeln!(out, "# TYPE wanfail_link_score gauge");
    for l in &status.links {
        let Some(s) = l.scores else { continue };
        for (tier, value) in [
            ("instant", s.instant),
            ("ewma", s.ewma),
            ("window", s.window_avg),
            ("final", s.final_score),
        ] {
            let _ = writeln!(
                out,
                "wanfail_link_score{{{},tier=\"{tier}\"}} {value:.3}",
                labels(l)
            );
        }
    }

    gauge(
        &mut out,
        "wanfail_link_latency_ms",
        "Last observed latency in milliseconds.",
        status,
        |l| l.metrics.as_ref().map(|m| m.latency_ms),
    );
    gauge(
        &mut out,
        "wanfail_link_loss_pct",
        "Last observed packet loss in percent.",
        status,
        |l| l.metrics.as_ref().map(|m| m.loss_pct),
    );
    gauge(
        &mut out,
        "wanfail_link_jitter_ms",
        "Last observed jitter in milliseconds.",
        status,
        |l| l.metrics.as_ref().map(|m| m.jitter_ms),
    );
    gauge(
        &mut out,
        "wanfail_link_eligible",
        "Whether the link may be selected as primary (1) or not (0).",
        status,
        |l| Some(if l.eligible { 1.0 } else { 0.0 }),
    );
    gauge(
        &mut out,
        "wanfail_link_primary",
        "Whether the link is the current primary.",
        status,
        |l| Some(if l.primary { 1.0 } else { 0.0 }),
    );
    gauge(
        &mut out,
        "wanfail_link_missed_samples",
        "Consecutive ticks without a sample.",
        status,
        |l| Some(f64::from(l.missed)),
    );

    // ── Daemon gauges ───────────────────────────────────────────

    let _ = writeln!(out, "# HELP wanfail_no_eligible_link Set when every link is ineligible.");
    let _ = writeln!(out, "# TYPE wanfail_no_eligible_link gauge");
    let _ = writeln!(out, "wanfail_no_eligible_link {}", u8::from(status.no_eligible));

    let _ = writeln!(out, "# HELP wanfail_store_bytes Estimated telemetry store size.");
    let _ = writeln!(out, "# TYPE wanfail_store_bytes gauge");
    let _ = writeln!(out, "wanfail_store_bytes {}", status.store.estimated_bytes);

    let _ = writeln!(out, "# HELP wanfail_store_compactions_total Downsampling passes performed.");
    let _ = writeln!(out, "# TYPE wanfail_store_compactions_total counter");
    let _ = writeln!(out, "wanfail_store_compactions_total {}", status.store.compactions);

    let _ = writeln!(out, "# HELP wanfail_ticks_total Completed evaluation ticks.");
    let _ = writeln!(out, "# TYPE wanfail_ticks_total counter");
    let _ = writeln!(out, "wanfail_ticks_total {}", status.tick);

    out
}

fn labels(l: &LinkStatus) -> String {
    format!(
        "link=\"{}\",class=\"{}\",iface=\"{}\"",
        l.id, l.class, l.iface
    )
}

fn gauge(
    out: &mut String,
    name: &str,
    help: &str,
    status: &StatusSnapshot,
    value: impl Fn(&LinkStatus) -> Option<f64>,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    for l in &status.links {
        if let Some(v) = value(l) {
            let _ = writeln!(out, "{name}{{{}}} {v:.3}", labels(l));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinkClass, ScoreSet};
    use crate::protocol::LinkPhase;

    fn link(id: &str, primary: bool) -> LinkStatus {
        LinkStatus {
            id: id.into(),
            class: LinkClass::Satellite,
            iface: "wan".into(),
            weight: 50,
            rank: Some(1),
            phase: LinkPhase::Eligible,
            eligible: true,
            primary,
            run: None,
            run_since: None,
            cooldown_until: None,
            last_change: None,
            missed: 0,
            scores: Some(ScoreSet::blend(90.0, 90.0, 90.0)),
            breakdown: None,
            metrics: None,
        }
    }

    #[test]
    fn renders_score_tiers() {
        let status = StatusSnapshot {
            tick: 3,
            links: vec![link("starlink", true)],
            ..Default::default()
        };
        let text = render_prometheus(&status);
        assert!(text.contains(
            "wanfail_link_score{link=\"starlink\",class=\"satellite\",iface=\"wan\",tier=\"final\"} 90.000"
        ));
        assert!(text.contains("wanfail_link_primary{link=\"starlink\",class=\"satellite\",iface=\"wan\"} 1.000"));
        assert!(text.contains("wanfail_ticks_total 3"));
    }

    #[test]
    fn links_without_metrics_skip_metric_gauges() {
        let status = StatusSnapshot {
            links: vec![link("wwan", false)],
            ..Default::default()
        };
        let text = render_prometheus(&status);
        assert!(!text.contains("wanfail_link_latency_ms{"));
        assert!(text.contains("# TYPE wanfail_link_latency_ms gauge"));
    }
}
