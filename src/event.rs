//! Push event payload and the deploy/ignore decision

use serde_json::Value;
use std::collections::BTreeSet;

/// The subset of a GitHub push payload the receiver cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushEvent {
    pub git_ref: String,
    pub commits: Vec<Commit>,
    pub pusher_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

impl Commit {
    pub fn from_json(value: &Value) -> Self {
        Self {
            added: string_list(value.get("added")),
            modified: string_list(value.get("modified")),
            removed: string_list(value.get("removed")),
        }
    }
}

impl PushEvent {
    /// Extract the push fields from a decoded payload. Missing or
    /// mistyped fields become empty values, never an error.
    pub fn from_json(payload: &Value) -> Self {
        let git_ref = payload
            .get("ref")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();
        let commits = payload
            .get("commits")
            .and_then(|c| c.as_array())
            .map(|commits| commits.iter().map(Commit::from_json).collect())
            .unwrap_or_default();
        let pusher_name = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(String::from);

        Self {
            git_ref,
            commits,
            pusher_name,
        }
    }

    /// Union of added, modified and removed paths across all commits.
    pub fn changed_paths(&self) -> BTreeSet<&str> {
        self.commits
            .iter()
            .flat_map(|c| c.added.iter().chain(&c.modified).chain(&c.removed))
            .map(String::as_str)
            .collect()
    }

    pub fn pusher_name(&self) -> &str {
        self.pusher_name.as_deref().unwrap_or("unknown")
    }
}

/// Outcome of filtering a push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Deploy,
    Ignore(String),
}

impl FilterDecision {
    pub fn is_deploy(&self) -> bool {
        matches!(self, FilterDecision::Deploy)
    }
}

/// Decide whether a push warrants a deployment, with the reason when it doesn't.
pub fn evaluate(event: &PushEvent, target_branch: &str, watched_prefix: &str) -> FilterDecision {
    let expected_ref = format!("refs/heads/{}", target_branch);
    if event.git_ref != expected_ref {
        return FilterDecision::Ignore(format!("not {} branch", target_branch));
    }

    if !event
        .changed_paths()
        .iter()
        .any(|path| path.starts_with(watched_prefix))
    {
        return FilterDecision::Ignore(format!("no changes under {}", watched_prefix));
    }

    FilterDecision::Deploy
}

pub fn should_deploy(event: &PushEvent, target_branch: &str, watched_prefix: &str) -> bool {
    evaluate(event, target_branch, watched_prefix).is_deploy()
}
