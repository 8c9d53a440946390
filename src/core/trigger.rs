//! Trigger evaluation - does an incoming event start a run?

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

/// Kind of repository event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Commits pushed to a ref
    Push,
    /// Run requested by hand
    Manual,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Manual => "manual",
        }
    }
}

/// An incoming repository event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,

    /// Target ref, either `refs/heads/<branch>` or a bare branch name
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Triggering commit
    pub sha: String,

    /// `owner/repo` of the repository the event came from
    #[serde(default)]
    pub repository: Option<String>,

    /// Files touched by the push, when known
    #[serde(default)]
    pub changed_paths: Option<Vec<String>>,
}

impl Event {
    /// A push event for a ref and commit
    pub fn push(git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Push,
            git_ref: git_ref.into(),
            sha: sha.into(),
            repository: None,
            changed_paths: None,
        }
    }

    /// A manual dispatch against a ref and commit
    pub fn manual(git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Manual,
            ..Self::push(git_ref, sha)
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = Some(paths);
        self
    }

    /// Branch name targeted by the event, `None` for tag refs
    pub fn branch(&self) -> Option<&str> {
        if self.git_ref.starts_with(TAG_PREFIX) {
            return None;
        }
        Some(self.git_ref.strip_prefix(BRANCH_PREFIX).unwrap_or(&self.git_ref))
    }
}

/// Filters applied to push events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFilter {
    /// Branch globs; empty matches every branch
    #[serde(default)]
    pub branches: Vec<String>,

    /// Path globs; empty disables path filtering
    #[serde(default)]
    pub paths: Vec<String>,
}

/// The `on:` section of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    #[serde(default)]
    pub push: Option<PushFilter>,

    #[serde(default)]
    pub manual: bool,
}

impl TriggerRule {
    /// Decide whether `event` starts a run
    pub fn matches(&self, event: &Event) -> bool {
        match event.kind {
            EventKind::Manual => self.manual,
            EventKind::Push => match &self.push {
                Some(filter) => filter.matches(event),
                None => false,
            },
        }
    }

    /// Whether any event can match at all
    pub fn is_empty(&self) -> bool {
        self.push.is_none() && !self.manual
    }

    /// All glob patterns, for validation
    pub fn patterns(&self) -> impl Iterator<Item = &String> {
        self.push
            .iter()
            .flat_map(|p| p.branches.iter().chain(p.paths.iter()))
    }
}

impl PushFilter {
    fn matches(&self, event: &Event) -> bool {
        let Some(branch) = event.branch() else {
            return false;
        };

        if !self.branches.is_empty() && !self.branches.iter().any(|p| glob_matches(p, branch)) {
            return false;
        }

        match (&event.changed_paths, self.paths.is_empty()) {
            (Some(changed), false) => changed
                .iter()
                .any(|path| self.paths.iter().any(|p| glob_matches(p, path))),
            _ => true,
        }
    }
}

fn glob_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Match a branch or path against a glob; invalid patterns never match
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches_with(value, glob_options()))
        .unwrap_or(false)
}
