//! Job state machine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job state
///
/// ```text
/// pending --claim--> processing --success--> completed
/// processing --failure, attempts <= max_retries--> pending
/// processing --failure, attempts >  max_retries--> dead
/// dead --operator retry--> pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (possibly not before `next_run_at`)
    Pending,

    /// Claimed by exactly one worker
    Processing,

    /// Finished successfully
    Completed,

    /// Retries exhausted, parked in the dead letter queue
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Dead)
                | (Dead, Pending)
        )
    }

    /// Terminal states never change without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known job state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(pub String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}
