//! Job state machine and the status value object.
//!
//! Valid moves: `Pending -> Processing -> Completed`, and
//! `Pending | Processing -> Failed`. `Completed` and `Failed` are terminal.
//! A poll may skip intermediate states (`Pending -> Completed`), but a job
//! never moves backwards.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a backend job (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position in the lifecycle; terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(DomainError::validation(format!("unknown job state: {other:?}"))),
        }
    }
}

/// Last known status of a job.
///
/// Replaced wholesale on every successful poll; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    /// 0-100. Pinned to 100 on `Completed`; meaningless on `Failed`.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Display only; never used for control flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn new(state: JobState, progress: u8) -> Self {
        Self {
            state,
            progress,
            message: None,
            updated_at: None,
        }
        .normalized()
    }

    /// Status of a freshly submitted job.
    pub fn pending() -> Self {
        Self::new(JobState::Pending, 0)
    }

    /// Terminal failure with a human-readable reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(JobState::Failed, 0).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Clamp progress into range and pin completed jobs to 100%.
    pub fn normalized(mut self) -> Self {
        self.progress = self.progress.min(100);
        if self.state == JobState::Completed {
            self.progress = 100;
        }
        self
    }

    /// Reject moves out of a terminal state and any state regression.
    pub fn check_transition(&self, next: &JobStatus) -> Result<(), DomainError> {
        let invalid = DomainError::InvalidTransition {
            from: self.state,
            to: next.state,
        };
        if self.state.is_terminal() {
            // Re-reporting the same terminal state is not a transition.
            return if self.state == next.state { Ok(()) } else { Err(invalid) };
        }
        if next.state.rank() < self.state.rank() {
            return Err(invalid);
        }
        Ok(())
    }

    /// Compute the status to store when `next` follows `self`.
    ///
    /// Progress never decreases while the job is in flight; a lower value
    /// reported by the backend keeps the previous progress.
    pub fn advance_to(&self, next: JobStatus) -> Result<JobStatus, DomainError> {
        self.check_transition(&next)?;
        let mut next = next.normalized();
        if !next.state.is_terminal() && next.progress < self.progress {
            tracing::warn!(
                state = %next.state,
                previous = self.progress,
                reported = next.progress,
                "progress regressed; keeping previous value"
            );
            next.progress = self.progress;
        }
        Ok(next)
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status(state: JobState, progress: u8) -> JobStatus {
        JobStatus::new(state, progress)
    }

    #[test]
    fn parses_states_case_insensitively() {
        assert_eq!("Processing".parse::<JobState>().unwrap(), JobState::Processing);
        assert_eq!("failed".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("queued".parse::<JobState>().is_err());
    }

    #[test]
    fn completed_is_pinned_to_one_hundred() {
        assert_eq!(status(JobState::Completed, 10).progress, 100);
        assert_eq!(status(JobState::Processing, 250).progress, 100);
    }

    #[test]
    fn forward_moves_are_accepted() {
        let pending = JobStatus::pending();
        assert!(pending.check_transition(&status(JobState::Processing, 45)).is_ok());
        assert!(pending.check_transition(&status(JobState::Completed, 100)).is_ok());
        assert!(pending.check_transition(&status(JobState::Failed, 0)).is_ok());
        assert!(status(JobState::Processing, 45)
            .check_transition(&status(JobState::Failed, 0))
            .is_ok());
    }

    #[test]
    fn regressions_are_rejected() {
        let completed = status(JobState::Completed, 100);
        let err = completed
            .check_transition(&status(JobState::Processing, 50))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: JobState::Completed,
                to: JobState::Processing,
            }
        );

        assert!(status(JobState::Processing, 10)
            .check_transition(&JobStatus::pending())
            .is_err());
        assert!(status(JobState::Failed, 0)
            .check_transition(&status(JobState::Completed, 100))
            .is_err());
    }

    #[test]
    fn same_terminal_state_is_not_a_transition() {
        let failed = JobStatus::failed("boom");
        assert!(failed.check_transition(&JobStatus::failed("boom again")).is_ok());
    }

    #[test]
    fn progress_never_moves_backwards_in_flight() {
        let current = status(JobState::Processing, 60);
        let next = current.advance_to(status(JobState::Processing, 40)).unwrap();
        assert_eq!(next.progress, 60);

        let done = current.advance_to(status(JobState::Completed, 0)).unwrap();
        assert_eq!(done.progress, 100);
    }

    #[test]
    fn serializes_in_camel_case() {
        let json = serde_json::to_value(status(JobState::Processing, 45).with_message("transcribing"))
            .unwrap();
        assert_eq!(json["state"], "processing");
        assert_eq!(json["progress"], 45);
        assert_eq!(json["message"], "transcribing");
        assert!(json.get("updatedAt").is_none());
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop_oneof![
            Just(JobState::Pending),
            Just(JobState::Processing),
            Just(JobState::Completed),
            Just(JobState::Failed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn accepted_transitions_never_leave_terminal_states(
            from in any_state(),
            to in any_state(),
            p1 in 0u8..=100,
            p2 in 0u8..=100,
        ) {
            let current = status(from, p1);
            if let Ok(next) = current.advance_to(status(to, p2)) {
                prop_assert!(next.state.rank() >= current.state.rank());
                if current.is_terminal() {
                    prop_assert_eq!(next.state, current.state);
                }
                if !next.is_terminal() {
                    prop_assert!(next.progress >= current.progress);
                }
            }
        }
    }
}
