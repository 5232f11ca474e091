use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A unit of work handed to the agent for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Reader/writer for the task plan the engine works through.
pub trait TaskSource: Send {
    /// Next actionable task, ignoring ids in `exclude`.
    fn next_task(&self, exclude: &HashSet<String>) -> Option<Task>;

    /// Mark a task as done and persist the change.
    fn complete_task(&mut self, id: &str) -> Result<()>;

    /// `(complete, total)`
    fn counts(&self) -> (usize, usize);

    /// Re-read the plan if it changed on disk. Returns true when it did.
    fn refresh(&mut self) -> Result<bool>;

    /// Backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }
}
