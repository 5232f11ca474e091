mod git;

pub use git::{GitObserver, RepoChanges, RepoObserver, RepoSnapshot, parse_shortstat};
