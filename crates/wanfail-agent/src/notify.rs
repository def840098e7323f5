//! Notification sink. Delivery (push, webhook, SMS) belongs to whatever
//! tails the log; this task only makes each intent visible.

use tokio::sync::mpsc;
use tracing::{info, warn};
use wanfail_common::{NotificationIntent, Severity};

/// Drain intents until every sender is gone. Returns how many were seen.
pub async fn run(mut rx: mpsc::Receiver<NotificationIntent>) -> u64 {
    let mut seen = 0;
    while let Some(intent) = rx.recv().await {
        seen += 1;
        log(&intent);
    }
    seen
}

fn log(intent: &NotificationIntent) {
    let from = intent.from.as_deref().unwrap_or("none");
    let to = intent.to.as_deref().unwrap_or("none");
    match intent.severity {
        Severity::Critical | Severity::Warning => warn!(
            severity = ?intent.severity,
            kind = %intent.kind,
            reason = %intent.reason,
            from,
            to,
            outcome = %intent.outcome,
            no_eligible = intent.no_eligible,
            "{}",
            intent.message
        ),
        Severity::Info => info!(
            kind = %intent.kind,
            reason = %intent.reason,
            from,
            to,
            outcome = %intent.outcome,
            "{}",
            intent.message
        ),
    }
}
