//! Termination data model: the single terminal classification of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::Lifecycle;
use crate::phase::PhaseInfo;

/// Total classification of how a run ends.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    #[default]
    None,
    Completed,
    Stopped,
    Interrupted,
    Failed,
    Error,
}

/// User-supplied failure payload attached to a `FailedRun` signal.
///
/// Structured the same shape as `RunError` (category + message) because both
/// describe "why did this phase stop", but they are semantically distinct:
/// a `Fault` is a domain-level failure the phase itself detected and reported;
/// a `RunError` is metadata about an exception the Phaser caught on the way
/// out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub category: String,
    pub message: String,
}

impl Fault {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Metadata describing an unexpected (unclassified) error the Phaser caught.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RunError {
    pub category: String,
    pub message: String,
}

impl RunError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// `(status, finished_at, failure?, error?)` — the terminal record of a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TerminationInfo {
    pub status: TerminationStatus,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Fault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl TerminationInfo {
    pub fn new(status: TerminationStatus, finished_at: DateTime<Utc>) -> Self {
        Self {
            status,
            finished_at,
            failure: None,
            error: None,
        }
    }

    pub fn with_failure(mut self, failure: Fault) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Full externally-visible snapshot of a Phaser's run.
#[derive(Clone, Debug, PartialEq)]
pub struct Run {
    pub phases: Vec<PhaseInfo>,
    pub lifecycle: Lifecycle,
    pub termination: Option<TerminationInfo>,
}
