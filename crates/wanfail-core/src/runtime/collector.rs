use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use wanfail_common::Metrics;

use crate::config::Link;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectError {
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("unparseable probe output: {0}")]
    Parse(String),
}

/// Pull-side source of link metrics.
///
/// Called once per link per tick, concurrently across links and bounded by
/// `collect_timeout`. A slow or failing link only costs itself a missed
/// sample.
pub trait Collector: Send + Sync {
    fn collect(
        &self,
        link: &Link,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Metrics, CollectError>> + Send;
}
