//! Scoring & aggregation.
//!
//! Raw [`Metrics`](wanfail_common::Metrics) become a four-tier
//! [`ScoreSet`](wanfail_common::ScoreSet) per link: an instant score from
//! normalised badness, an EWMA, a window average read back from the
//! telemetry store, and their fixed blend. Trend tracking for predictive
//! failover lives beside it.

pub mod ewma;
pub mod kalman;
pub mod normalize;
pub mod scorer;
pub mod trend;

pub use ewma::Ewma;
pub use kalman::{KalmanConfig, KalmanFilter};
pub use normalize::Band;
pub use scorer::Scorer;
pub use trend::TrendTracker;
