//! Captured trigger events and the rows they become.

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger categories the archive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Issues,
    IssueComment,
    PullRequest,
    PullRequestReview,
    PullRequestReviewComment,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Issues,
        EventKind::IssueComment,
        EventKind::PullRequest,
        EventKind::PullRequestReview,
        EventKind::PullRequestReviewComment,
    ];

    /// The name GitHub uses for this trigger (`GITHUB_EVENT_NAME`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Issues => "issues",
            EventKind::IssueComment => "issue_comment",
            EventKind::PullRequest => "pull_request",
            EventKind::PullRequestReview => "pull_request_review",
            EventKind::PullRequestReviewComment => "pull_request_review_comment",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a trigger name is outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedKind(pub String);

impl fmt::Display for UnsupportedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported event type: {}", self.0)
    }
}

impl std::error::Error for UnsupportedKind {}

impl FromStr for EventKind {
    type Err = UnsupportedKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Exact match only: GitHub event names are lowercase snake_case.
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnsupportedKind(s.to_string()))
    }
}

/// Newtype for the client-generated record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// A fresh random (v4) identifier, independent of any local state.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: RecordId,
    /// ISO-8601 UTC, millisecond precision, `Z` suffix.
    pub timestamp: String,
    pub kind: EventKind,
    /// Payload serialized as compact JSON, stored verbatim.
    pub event: String,
}

impl EventRecord {
    /// Build a record stamped with a new identifier and the current time.
    pub fn capture(kind: EventKind, payload: &serde_json::Value) -> Self {
        Self {
            id: RecordId::generate(),
            timestamp: now_iso8601(),
            kind,
            event: payload.to_string(),
        }
    }

    /// The payload parsed back into a JSON value.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.event)
    }

    /// Commit message for the published unit carrying this record.
    pub fn commit_message(&self) -> String {
        format!("Capturing event {} (id: {})", self.kind, self.id)
    }
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
