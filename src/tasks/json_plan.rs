//! `prd.json`-style plan files.
//!
//! ```json
//! {"name": "...", "userStories": [
//!   {"id": "US-001", "title": "...", "description": "...", "passes": false,
//!    "priority": 1, "dependsOn": []}
//! ]}
//! ```
//!
//! Unknown fields are preserved across rewrites.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::source::{Task, TaskSource};
use crate::error::{RalphError, Result};

pub const DEFAULT_PLAN_FILE: &str = "prd.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    user_stories: Vec<UserStory>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserStory {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    passes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl UserStory {
    fn to_task(&self) -> Task {
        Task::new(&self.id, &self.title).with_description(&self.description)
    }
}

/// Task source backed by a JSON plan file.
#[derive(Debug)]
pub struct JsonPlanSource {
    path: PathBuf,
    document: PlanDocument,
    digest: String,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl JsonPlanSource {
    /// Load the plan at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (document, digest) = Self::load(&path)?;
        debug!("Loaded plan {:?} with {} stories", path, document.user_stories.len());
        Ok(Self { path, document, digest })
    }

    fn load(path: &Path) -> Result<(PlanDocument, String)> {
        let bytes = fs::read(path).map_err(|e| RalphError::TaskSource(format!("Failed to read {:?}: {}", path, e)))?;
        let document: PlanDocument = serde_json::from_slice(&bytes)
            .map_err(|e| RalphError::TaskSource(format!("Invalid plan {:?}: {}", path, e)))?;
        Ok((document, digest(&bytes)))
    }

    /// Plan name, if the file declares one.
    pub fn name(&self) -> Option<&str> {
        self.document.name.as_deref()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.document.user_stories.iter().map(UserStory::to_task).collect()
    }

    pub fn is_complete(&self, id: &str) -> bool {
        self.document.user_stories.iter().any(|s| s.id == id && s.passes)
    }

    fn save(&mut self) -> Result<()> {
        let mut json = serde_json::to_string_pretty(&self.document)?;
        json.push('\n');
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        self.digest = digest(json.as_bytes());
        Ok(())
    }
}

impl TaskSource for JsonPlanSource {
    fn next_task(&self, exclude: &HashSet<String>) -> Option<Task> {
        let passing: HashSet<&str> = self
            .document
            .user_stories
            .iter()
            .filter(|s| s.passes)
            .map(|s| s.id.as_str())
            .collect();

        self.document
            .user_stories
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.passes && !exclude.contains(&s.id))
            .filter(|(_, s)| s.depends_on.iter().all(|dep| passing.contains(dep.as_str())))
            // Lowest priority first, unprioritized last, file order breaks ties
            .min_by_key(|(index, s)| (s.priority.is_none(), s.priority, *index))
            .map(|(_, s)| s.to_task())
    }

    fn complete_task(&mut self, id: &str) -> Result<()> {
        // Never rewrite over edits made since the last load
        self.refresh()?;
        let story = self
            .document
            .user_stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RalphError::TaskSource(format!("Unknown task: {}", id)))?;
        if story.passes {
            return Ok(());
        }
        story.passes = true;
        self.save()?;
        info!("Marked {} as passing", id);
        Ok(())
    }

    fn counts(&self) -> (usize, usize) {
        let total = self.document.user_stories.len();
        let complete = self.document.user_stories.iter().filter(|s| s.passes).count();
        (complete, total)
    }

    fn refresh(&mut self) -> Result<bool> {
        let bytes = fs::read(&self.path)?;
        let current = digest(&bytes);
        if current == self.digest {
            return Ok(false);
        }
        let (document, digest) = Self::load(&self.path)?;
        self.document = document;
        self.digest = digest;
        info!("Plan {:?} changed on disk, reloaded", self.path);
        Ok(true)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plan(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join(DEFAULT_PLAN_FILE);
        fs::write(&path, json).unwrap();
        path
    }

    const PLAN: &str = r#"{
        "name": "demo",
        "branchName": "ralph/demo",
        "userStories": [
            {"id": "US-003", "title": "Third", "priority": 3, "passes": false},
            {"id": "US-001", "title": "First", "description": "do it", "priority": 1, "passes": false},
            {"id": "US-002", "title": "Second", "priority": 2, "passes": false, "dependsOn": ["US-001"]}
        ]
    }"#;

    #[test]
    fn test_next_task_lowest_priority() {
        let dir = TempDir::new().unwrap();
        let source = JsonPlanSource::open(write_plan(&dir, PLAN)).unwrap();
        let task = source.next_task(&HashSet::new()).unwrap();
        assert_eq!(task.id, "US-001");
        assert_eq!(task.description, "do it");
        assert_eq!(source.counts(), (0, 3));
        assert_eq!(source.name(), Some("demo"));
    }

    #[test]
    fn test_dependencies_block_until_passing() {
        let dir = TempDir::new().unwrap();
        let mut source = JsonPlanSource::open(write_plan(&dir, PLAN)).unwrap();

        let exclude = HashSet::from(["US-001".to_string()]);
        // US-002 depends on US-001, so US-003 comes next
        assert_eq!(source.next_task(&exclude).unwrap().id, "US-003");

        source.complete_task("US-001").unwrap();
        assert_eq!(source.next_task(&HashSet::new()).unwrap().id, "US-002");
        assert_eq!(source.counts(), (1, 3));
    }

    #[test]
    fn test_complete_persists_and_keeps_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, PLAN);
        let mut source = JsonPlanSource::open(&path).unwrap();
        source.complete_task("US-001").unwrap();

        let reloaded = JsonPlanSource::open(&path).unwrap();
        assert!(reloaded.is_complete("US-001"));
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["branchName"], "ralph/demo");
        assert_eq!(raw["userStories"][2]["dependsOn"][0], "US-001");
    }

    #[test]
    fn test_all_passing_has_no_next_task() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(
            &dir,
            r#"{"userStories": [{"id": "A", "title": "a", "passes": true}]}"#,
        );
        let source = JsonPlanSource::open(path).unwrap();
        assert!(source.next_task(&HashSet::new()).is_none());
        assert_eq!(source.counts(), (1, 1));
    }

    #[test]
    fn test_unknown_task_is_error() {
        let dir = TempDir::new().unwrap();
        let mut source = JsonPlanSource::open(write_plan(&dir, PLAN)).unwrap();
        assert!(matches!(source.complete_task("nope"), Err(RalphError::TaskSource(_))));
    }

    #[test]
    fn test_refresh_detects_external_edit_only() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, PLAN);
        let mut source = JsonPlanSource::open(&path).unwrap();

        assert!(!source.refresh().unwrap());
        source.complete_task("US-001").unwrap();
        // Our own write is not a modification
        assert!(!source.refresh().unwrap());

        fs::write(&path, r#"{"userStories": [{"id": "X", "title": "x"}]}"#).unwrap();
        assert!(source.refresh().unwrap());
        assert_eq!(source.counts(), (0, 1));
    }

    #[test]
    fn test_complete_keeps_stories_added_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, PLAN);
        let mut source = JsonPlanSource::open(&path).unwrap();

        let mut raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw["userStories"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"id": "US-004", "title": "Added by agent", "passes": false}));
        fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        source.complete_task("US-001").unwrap();
        assert_eq!(source.counts(), (1, 4));

        let reloaded = JsonPlanSource::open(&path).unwrap();
        assert!(reloaded.is_complete("US-001"));
        assert!(reloaded.tasks().iter().any(|t| t.id == "US-004"));
    }

    #[test]
    fn test_invalid_plan() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, "not json");
        assert!(matches!(JsonPlanSource::open(path), Err(RalphError::TaskSource(_))));
    }
}
