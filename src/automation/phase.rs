use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of an application run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationPhase {
    Provisioning,
    Navigating,
    Analyzing,
    Filling,
    Uploading,
    Reviewing,
    Submitting,
    Verifying,
    WaitingHuman,
    Completed,
    Failed,
}

use ApplicationPhase::*;

impl ApplicationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provisioning => "provisioning",
            Navigating => "navigating",
            Analyzing => "analyzing",
            Filling => "filling",
            Uploading => "uploading",
            Reviewing => "reviewing",
            Submitting => "submitting",
            Verifying => "verifying",
            WaitingHuman => "waiting_human",
            Completed => "completed",
            Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Completed | Failed)
    }

    /// Phases reachable from `self` in one step.
    pub fn allowed_next(&self) -> &'static [ApplicationPhase] {
        match self {
            Provisioning => &[Navigating, Failed],
            Navigating => &[Analyzing, WaitingHuman, Failed],
            Analyzing => &[Filling, Navigating, WaitingHuman, Failed],
            Filling => &[Uploading, Reviewing, Submitting, Failed],
            Uploading => &[Filling, Reviewing, Submitting, Failed],
            Reviewing => &[Filling, Submitting, WaitingHuman, Failed],
            Submitting => &[Verifying, Navigating, WaitingHuman, Failed],
            Verifying => &[Completed, Analyzing, WaitingHuman, Failed],
            WaitingHuman => &[Navigating, Analyzing, Filling, Reviewing, Submitting, Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, to: ApplicationPhase) -> bool {
        self.allowed_next().contains(&to)
    }
}

impl fmt::Display for ApplicationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Provisioning),
            "navigating" => Ok(Navigating),
            "analyzing" => Ok(Analyzing),
            "filling" => Ok(Filling),
            "uploading" => Ok(Uploading),
            "reviewing" => Ok(Reviewing),
            "submitting" => Ok(Submitting),
            "verifying" => Ok(Verifying),
            "waiting_human" => Ok(WaitingHuman),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// One recorded edge in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: ApplicationPhase,
    pub to: ApplicationPhase,
    pub trigger: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
