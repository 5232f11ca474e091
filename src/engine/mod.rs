//! The iteration loop and its control surface.

mod control;
mod loop_engine;
mod state;

pub use control::{ControlCommand, EngineHandle};
pub use loop_engine::{EngineConfig, LoopEngine};
pub use state::{EngineState, IterationRecord, LoopStatus};
