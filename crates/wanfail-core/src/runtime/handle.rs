use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use wanfail_common::{Action, ActionReply, Event, LinkId, Metrics, Sample, StatusSnapshot};

use crate::config::FailoverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("supervisor is not running")]
    Stopped,
    #[error("supervisor command queue is full")]
    Busy,
}

/// Requests serviced by the tick loop between ticks.
#[derive(Debug)]
pub(crate) enum Command {
    History {
        link: LinkId,
        since: DateTime<Utc>,
        reply: oneshot::Sender<Option<Vec<Sample>>>,
    },
    Events {
        limit: usize,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Action {
        action: Action,
        reply: oneshot::Sender<ActionReply>,
    },
    Reload {
        config: Box<FailoverConfig>,
        reply: oneshot::Sender<Vec<String>>,
    },
    Rejected {
        error: String,
    },
    Push {
        link: LinkId,
        metrics: Metrics,
    },
}

/// Cheap, cloneable access to a running supervisor.
///
/// Status reads never wait on the tick loop; everything else is queued and
/// answered between ticks.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pub(crate) snapshot: Arc<ArcSwap<StatusSnapshot>>,
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) interrupt: Arc<Notify>,
}

impl SupervisorHandle {
    /// Last published snapshot. Always a complete tick.
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.snapshot.load_full()
    }

    /// Stored samples for `link` since `since`; `None` for an unknown link.
    pub async fn history(
        &self,
        link: impl Into<LinkId>,
        since: DateTime<Utc>,
    ) -> Result<Option<Vec<Sample>>, SupervisorError> {
        let link = link.into();
        self.request(|reply| Command::History { link, since, reply })
            .await
    }

    /// Most recent audit events, newest first.
    pub async fn events(&self, limit: usize) -> Result<Vec<Event>, SupervisorError> {
        self.request(|reply| Command::Events { limit, reply }).await
    }

    pub async fn action(&self, action: Action) -> Result<ActionReply, SupervisorError> {
        self.request(|reply| Command::Action { action, reply }).await
    }

    /// Swap in a new configuration. Cancels the tick in flight, then applies
    /// between ticks and returns the diff.
    pub async fn reload(&self, config: FailoverConfig) -> Result<Vec<String>, SupervisorError> {
        self.interrupt.notify_waiters();
        self.request(|reply| Command::Reload {
            config: Box::new(config),
            reply,
        })
        .await
    }

    /// Record a configuration that failed to load. The running config stays.
    pub async fn reject(&self, error: impl Into<String>) -> Result<(), SupervisorError> {
        self.tx
            .send(Command::Rejected {
                error: error.into(),
            })
            .await
            .map_err(|_| SupervisorError::Stopped)
    }

    /// Hand in a sample for `link`. It replaces the pull for the next tick.
    pub fn push(&self, link: impl Into<LinkId>, metrics: Metrics) -> Result<(), SupervisorError> {
        self.tx
            .try_send(Command::Push {
                link: link.into(),
                metrics,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SupervisorError::Busy,
                mpsc::error::TrySendError::Closed(_) => SupervisorError::Stopped,
            })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }
}
