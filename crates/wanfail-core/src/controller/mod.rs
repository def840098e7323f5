//! # Controller Apply Layer
//!
//! Makes a decision take effect in the router's own routing stack.
//! [`Controller::apply`] is idempotent: it reads the active link first and
//! returns [`Outcome::AlreadyActive`] without touching anything when the
//! target already carries traffic. Otherwise it promotes the target and polls
//! until the backend reports it active, with bounded exponential backoff.
//! Nothing is rolled back on failure; the next tick re-applies if the
//! target is still the best link.

pub mod backoff;
pub mod command;
pub mod mwan3;
pub mod route;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use wanfail_common::Outcome;

pub use command::{CommandRunner, TokioCommandRunner};
pub use mwan3::Mwan3Backend;
pub use route::RouteMetricBackend;

use crate::config::{BackendKind, ControllerConfig, Link, RetryPolicy};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },
    #[error("{0} is not known to the routing backend")]
    UnknownTarget(String),
    #[error("routing did not converge on {expected}, last observed {observed}")]
    NotConverged { expected: String, observed: String },
}

/// One way of steering the default route.
pub trait RouteBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Identifier this backend reports for `link` from [`active`](Self::active).
    fn target<'a>(&self, link: &'a Link) -> &'a str;

    /// Identifier of whatever currently carries the default route.
    fn active(&self) -> impl Future<Output = Result<Option<String>, ControllerError>> + Send;

    /// Make `link` preferred over every other link in `links`. Returns the
    /// number of settings written.
    fn promote(
        &self,
        link: &Link,
        links: &[Link],
    ) -> impl Future<Output = Result<usize, ControllerError>> + Send;

    /// Pick up changed settings after a config reload.
    fn reconfigure(&mut self, _cfg: &ControllerConfig) {}
}

/// The configured backend.
#[derive(Debug, Clone)]
pub enum Backend<R> {
    Mwan3(Mwan3Backend<R>),
    Route(RouteMetricBackend<R>),
}

impl<R: CommandRunner> Backend<R> {
    pub fn from_config(cfg: &ControllerConfig, runner: R) -> Self {
        match cfg.backend {
            BackendKind::Mwan3 => Backend::Mwan3(Mwan3Backend::new(runner, cfg.mwan3)),
            BackendKind::Route => Backend::Route(RouteMetricBackend::new(runner, cfg.route)),
        }
    }
}

impl<R: CommandRunner> RouteBackend for Backend<R> {
    fn name(&self) -> &'static str {
        match self {
            Backend::Mwan3(b) => b.name(),
            Backend::Route(b) => b.name(),
        }
    }

    fn target<'a>(&self, link: &'a Link) -> &'a str {
        match self {
            Backend::Mwan3(b) => b.target(link),
            Backend::Route(b) => b.target(link),
        }
    }

    async fn active(&self) -> Result<Option<String>, ControllerError> {
        match self {
            Backend::Mwan3(b) => b.active().await,
            Backend::Route(b) => b.active().await,
        }
    }

    async fn promote(&self, link: &Link, links: &[Link]) -> Result<usize, ControllerError> {
        match self {
            Backend::Mwan3(b) => b.promote(link, links).await,
            Backend::Route(b) => b.promote(link, links).await,
        }
    }

    fn reconfigure(&mut self, cfg: &ControllerConfig) {
        match (self, cfg.backend) {
            (Backend::Mwan3(b), BackendKind::Mwan3) => b.reconfigure(cfg),
            (Backend::Route(b), BackendKind::Route) => b.reconfigure(cfg),
            (current, wanted) => warn!(
                current = current.name(),
                ?wanted,
                "controller backend change takes effect after restart"
            ),
        }
    }
}

pub struct Controller<B> {
    backend: B,
    retry: RetryPolicy,
    dry_run: bool,
}

impl Controller<Backend<TokioCommandRunner>> {
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        let runner = TokioCommandRunner::new(cfg.command_timeout);
        Self::new(Backend::from_config(cfg, runner), cfg.retry, cfg.dry_run)
    }
}

impl<B: RouteBackend> Controller<B> {
    pub fn new(backend: B, retry: RetryPolicy, dry_run: bool) -> Self {
        Self {
            backend,
            retry,
            dry_run,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn reconfigure(&mut self, cfg: &ControllerConfig) {
        self.retry = cfg.retry;
        self.dry_run = cfg.dry_run;
        self.backend.reconfigure(cfg);
    }

    /// The configured link currently carrying the default route, if any.
    pub async fn active_link<'a>(&self, links: &'a [Link]) -> Result<Option<&'a Link>, ControllerError> {
        let active = self.backend.active().await?;
        Ok(active.and_then(|a| links.iter().find(|l| self.backend.target(l) == a)))
    }

    /// Converge the routing layer on `target`.
    pub async fn apply(&self, target: &Link, links: &[Link]) -> Result<Outcome, ControllerError> {
        let want = self.backend.target(target);
        let backend = self.backend.name();

        if self.dry_run {
            info!(backend, link = %target.id, target = want, "dry run: would promote");
            return Ok(Outcome::Applied);
        }

        match self.backend.active().await {
            Ok(Some(active)) if active == want => {
                debug!(backend, link = %target.id, "already active, nothing to do");
                return Ok(Outcome::AlreadyActive);
            }
            Ok(active) => debug!(backend, ?active, target = want, "promoting"),
            Err(e) => warn!(backend, error = %e, "could not read active link, promoting anyway"),
        }

        self.backend.promote(target, links).await?;

        let backend_ref = &self.backend;
        backoff::retry(&self.retry, "verify", move |_| async move {
            match backend_ref.active().await {
                Ok(Some(active)) if active == want => Ok(()),
                Ok(active) => Err(ControllerError::NotConverged {
                    expected: want.to_string(),
                    observed: active.unwrap_or_else(|| "no active link".into()),
                }),
                Err(e) => Err(e),
            }
        })
        .await?;

        info!(backend, link = %target.id, target = want, "switch applied");
        Ok(Outcome::Applied)
    }
}
