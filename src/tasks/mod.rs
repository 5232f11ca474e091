//! Task plan access.

mod json_plan;
mod source;

pub use json_plan::{DEFAULT_PLAN_FILE, JsonPlanSource};
pub use source::{Task, TaskSource};
