//! # Tick Loop
//!
//! The [`Supervisor`] is the single owner of scores, link states, the
//! primary pointer and the telemetry store. Everything outside it talks
//! through a [`SupervisorHandle`]: status reads come from an atomically
//! swapped snapshot, everything else is a queued command.

pub mod clock;
pub mod collector;
pub mod handle;
pub mod supervisor;

pub use clock::Clock;
pub use collector::{CollectError, Collector};
pub use handle::{SupervisorError, SupervisorHandle};
pub use supervisor::Supervisor;
