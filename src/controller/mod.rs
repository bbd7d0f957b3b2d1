//! Top-level epoch loop: plan, gate, dispatch, drain, feedback, stop.

mod continuous;

pub use continuous::{ContinuousController, EpochSummary, MissionOutcome};
