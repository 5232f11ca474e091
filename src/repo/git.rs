//! Repository observation: what the agent committed during an iteration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::{RalphError, Result};

/// The empty tree object, used as the diff base for a repository with no commits yet.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Repository state before an iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSnapshot {
    /// HEAD commit, None outside a repository or before the first commit
    pub head: Option<String>,
}

/// What changed between a snapshot and now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoChanges {
    pub commits: u32,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[async_trait]
pub trait RepoObserver: Send + Sync {
    async fn snapshot(&self) -> RepoSnapshot;

    async fn changes_since(&self, snapshot: &RepoSnapshot) -> RepoChanges;
}

/// Observes a git working tree by shelling out to `git`.
#[derive(Debug, Clone)]
pub struct GitObserver {
    repo_root: PathBuf,
}

impl GitObserver {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RalphError::Process(format!("git {} failed: {}", args.join(" "), stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn head(&self) -> Option<String> {
        match self.git(&["rev-parse", "--verify", "-q", "HEAD"]).await {
            Ok(head) if !head.is_empty() => Some(head),
            Ok(_) => None,
            Err(e) => {
                debug!("No HEAD in {:?}: {}", self.repo_root, e);
                None
            }
        }
    }
}

#[async_trait]
impl RepoObserver for GitObserver {
    async fn snapshot(&self) -> RepoSnapshot {
        RepoSnapshot { head: self.head().await }
    }

    async fn changes_since(&self, snapshot: &RepoSnapshot) -> RepoChanges {
        let Some(head) = self.head().await else {
            return RepoChanges::default();
        };
        if snapshot.head.as_deref() == Some(head.as_str()) {
            return RepoChanges::default();
        }

        let (range, base) = match snapshot.head.as_deref() {
            Some(before) => (format!("{}..{}", before, head), before.to_string()),
            None => (head.clone(), EMPTY_TREE.to_string()),
        };

        let commits = match self.git(&["rev-list", "--count", range.as_str()]).await {
            Ok(count) => count.parse().unwrap_or(0),
            Err(e) => {
                debug!("Failed to count commits: {}", e);
                0
            }
        };
        let (lines_added, lines_removed) = match self.git(&["diff", "--shortstat", base.as_str(), head.as_str()]).await {
            Ok(stat) => parse_shortstat(&stat),
            Err(e) => {
                debug!("Failed to diff: {}", e);
                (0, 0)
            }
        };

        RepoChanges {
            commits,
            lines_added,
            lines_removed,
        }
    }
}

/// Parse ` 3 files changed, 10 insertions(+), 2 deletions(-)` into `(added, removed)`.
pub fn parse_shortstat(stat: &str) -> (u64, u64) {
    let mut added = 0;
    let mut removed = 0;
    for part in stat.split(',') {
        let mut words = part.split_whitespace();
        let (Some(count), Some(kind)) = (words.next(), words.next()) else {
            continue;
        };
        let Ok(count) = count.parse::<u64>() else {
            continue;
        };
        if kind.starts_with("insertion") {
            added = count;
        } else if kind.starts_with("deletion") {
            removed = count;
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_shortstat() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)"),
            (10, 2)
        );
        assert_eq!(parse_shortstat(" 1 file changed, 1 insertion(+)"), (1, 0));
        assert_eq!(parse_shortstat(" 1 file changed, 4 deletions(-)"), (0, 4));
        assert_eq!(parse_shortstat(""), (0, 0));
    }

    #[tokio::test]
    async fn test_outside_repository_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let observer = GitObserver::new(dir.path());
        let snapshot = observer.snapshot().await;
        assert_eq!(snapshot.head, None);
        assert_eq!(observer.changes_since(&snapshot).await, RepoChanges::default());
    }

    async fn run_git(dir: &Path, args: &[&str]) -> bool {
        Command::new("git")
            .args(["-c", "user.name=ralph", "-c", "user.email=ralph@localhost", "-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_counts_commits_and_lines() {
        let dir = TempDir::new().unwrap();
        if !run_git(dir.path(), &["init", "-q"]).await {
            // git not installed
            return;
        }
        let observer = GitObserver::new(dir.path());

        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        assert!(run_git(dir.path(), &["add", "."]).await);
        assert!(run_git(dir.path(), &["commit", "-q", "-m", "first"]).await);

        let before = observer.snapshot().await;
        assert!(before.head.is_some());

        std::fs::write(dir.path().join("a.txt"), "one\nthree\nfour\n").unwrap();
        assert!(run_git(dir.path(), &["commit", "-q", "-am", "second"]).await);

        let changes = observer.changes_since(&before).await;
        assert_eq!(changes.commits, 1);
        assert_eq!(changes.lines_added, 2);
        assert_eq!(changes.lines_removed, 1);
    }
}
