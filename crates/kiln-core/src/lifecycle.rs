use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one package within an orchestration run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    Pending,
    Fetching,
    Validating,
    Configuring,
    Building,
    Packaging,
    Complete,
    Failed,
}

impl PackageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PackageState::Complete | PackageState::Failed)
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PackageState::Pending => "pending",
            PackageState::Fetching => "fetching",
            PackageState::Validating => "validating",
            PackageState::Configuring => "configuring",
            PackageState::Building => "building",
            PackageState::Packaging => "packaging",
            PackageState::Complete => "complete",
            PackageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(from: PackageState, to: PackageState) -> Result<(), CoreError> {
    use PackageState::{
        Building, Complete, Configuring, Failed, Fetching, Packaging, Pending, Validating,
    };

    let valid = matches!(
        (from, to),
        (Pending, Fetching)
            | (Fetching, Validating)
            | (Validating, Configuring)
            | (Configuring, Building | Complete)
            | (Building, Packaging)
            | (Packaging, Complete)
    ) || (to == Failed && !from.is_terminal());

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
