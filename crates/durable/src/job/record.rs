//! Job records, submissions and partial updates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JobState;

/// Retry ceiling applied when a submission does not carry one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Durable job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,

    /// Execution attempts that failed so far
    pub attempts: u32,

    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Not claimable before this instant when set
    pub next_run_at: Option<DateTime<Utc>>,

    /// Output of the most recent attempt (success or failure text)
    pub last_error: Option<String>,
}

impl Job {
    /// Whether the job may be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.map_or(true, |at| at <= now)
    }
}

/// Submission validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("job JSON is invalid: {0}")]
    InvalidJson(String),

    #[error("job JSON must include '{0}'")]
    MissingField(&'static str),

    #[error("invalid '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A job submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse a JSON submission such as `{"id": "job1", "command": "echo hi"}`.
    ///
    /// Unknown fields are ignored.
    pub fn from_json(input: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(input).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ValidationError::InvalidJson(
                "expected a JSON object".to_string(),
            ));
        };

        let id = required_string(&fields, "id")?;
        let command = required_string(&fields, "command")?;

        let max_retries = match fields.get("max_retries") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = v
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| ValidationError::InvalidField {
                        field: "max_retries",
                        reason: format!("expected a non-negative integer, got {v}"),
                    })?;
                Some(n)
            }
        };

        Ok(Self {
            id,
            command,
            max_retries,
        })
    }
}

fn required_string(
    fields: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

/// Partial update applied by `JobStore::update_state`
///
/// `updated_at` is always refreshed; the optional fields are only written when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub state: JobState,
    pub attempts: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobUpdate {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            attempts: None,
            next_run_at: None,
            last_error: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn with_last_error(mut self, last_error: impl Into<String>) -> Self {
        self.last_error = Some(last_error.into());
        self
    }

    /// Apply to an in-memory record.
    pub(crate) fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        job.state = self.state;
        job.updated_at = now;
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(at) = self.next_run_at {
            job.next_run_at = Some(at);
        }
        if let Some(err) = &self.last_error {
            job.last_error = Some(err.clone());
        }
    }
}
