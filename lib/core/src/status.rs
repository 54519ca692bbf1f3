//! Run status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle status of a workflow run or of a single step within it.
///
/// A run moves from `Waiting` to `Running` and then to exactly one of the
/// terminal statuses. `Unchanged` is the terminal status of a run whose
/// transform produced no new dataset version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run is recorded but the transform has not begun.
    #[default]
    Waiting,
    /// Transform is executing.
    Running,
    /// Transform finished and committed a new version.
    Succeeded,
    /// Transform finished with an error.
    Failed,
    /// Transform finished without producing changes.
    Unchanged,
    /// Run (or step) was skipped entirely.
    Skipped,
}

impl RunStatus {
    /// Returns true if this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Unchanged | Self::Skipped
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unchanged => "unchanged",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an unrecognized status name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError {
    /// The unrecognized input.
    pub input: String,
}

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized run status: {}", self.input)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for RunStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "unchanged" => Ok(Self::Unchanged),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseStatusError {
                input: other.to_string(),
            }),
        }
    }
}
