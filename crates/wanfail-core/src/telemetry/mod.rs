//! Telemetry & audit store.
//!
//! RAM-resident only: every sample and event is lost on restart. Flash wear
//! on embedded routers rules out writing tick-rate data to disk.

pub mod ring;
pub mod store;

pub use ring::SampleRing;
pub use store::{SAMPLE_BYTES, TelemetryStore};
