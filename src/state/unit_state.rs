/// Status definitions for listing pages and items
///
/// Pages and items share the claim mechanics of the progress store but have
/// different terminal sets: an item distinguishes a retryable failure from a
/// terminal one, while a page is simply completed or failed once settled.
use std::fmt;

/// Status of one listing page within a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageStatus {
    /// Discovered, listing not fetched yet
    Pending,

    /// Listing being fetched, or items under it still outstanding
    Running,

    /// All owned items succeeded
    Completed,

    /// Listing fetch exhausted its retries, or an owned item failed terminally
    Failed,
}

impl PageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

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

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Status of one item awaiting its detail fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    // ===== Active States =====
    /// Discovered on a listing page, not yet fetched
    Pending,

    /// Claimed by a scheduler
    Running,

    /// Last attempt failed, attempts remain
    Failed,

    // ===== Terminal States =====
    /// Detail page fetched and handed off
    Success,

    /// Attempts exhausted or a permanent error was seen
    FailedTerminal,
}

impl ItemStatus {
    /// Returns true if no further automatic attempt will be made
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::FailedTerminal)
    }

    /// Returns true if the item may still be claimed
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Failed)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Success => "success",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "success" => Some(Self::Success),
            "failed_terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }

    /// Returns all possible item states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Running,
            Self::Failed,
            Self::Success,
            Self::FailedTerminal,
        ]
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
