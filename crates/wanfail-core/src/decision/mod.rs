//! Link eligibility and primary selection.

pub mod engine;
pub mod state;

pub use engine::{DecisionEngine, ManualError, Verdict};
pub use state::{LinkState, Transition};
