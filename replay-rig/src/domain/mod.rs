//! Domain layer for replay-rig.
//!
//! Jobs as callers describe them and the states the scheduler tracks for them.

pub mod job;
pub mod state;

pub use job::ReplayJob;
pub use state::{JobState, RunState, Stage, StepState};
