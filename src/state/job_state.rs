/// Crawl job status definitions
///
/// A job is one traversal of a catalogue. Its status only moves forward during
/// a run; reopening a finished job is an explicit operator or rediscovery step.
use std::fmt;

/// Lifecycle status of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Created but never started
    Pending,

    /// Being walked by a scheduler (or interrupted while being walked)
    Running,

    /// Every page under the job reached a terminal status
    Completed,

    /// No page of the job could ever be discovered
    Failed,
}

impl JobStatus {
    /// Returns true if the job needs no further scheduling
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a scheduler should pick this job up
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Checks whether a transition happens in the normal forward direction
    ///
    /// Staying in the same status is allowed so status writes stay idempotent.
    /// Terminal jobs only leave their status through [`JobStatus::can_reopen`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// Returns true if a rediscovery pass or requeue may move this job back to running
    pub fn can_reopen(&self) -> bool {
        self.is_terminal()
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a status from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_no_regression() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_reopen_only_terminal() {
        assert!(JobStatus::Completed.can_reopen());
        assert!(JobStatus::Failed.can_reopen());
        assert!(!JobStatus::Running.can_reopen());
        assert!(!JobStatus::Pending.can_reopen());
    }

    #[test]
    fn test_from_db_string() {
        assert_eq!(
            JobStatus::from_db_string("completed"),
            Some(JobStatus::Completed)
        );
        assert_eq!(JobStatus::from_db_string("done"), None);
        assert_eq!(format!("{}", JobStatus::Running), "running");
    }
}
