//! Deployment targets
//!
//! Each target environment carries the gate that must be passed before the
//! deployment script is invoked.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Environment a deployment is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployTarget {
    Development,
    Staging,
    Production,
}

/// What has to happen before a deployment may start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreDeployGate {
    /// Deploy immediately
    Direct,
    /// Block until an external actor approves
    RequiresApproval,
}

impl DeployTarget {
    /// All known targets, in promotion order
    pub const ALL: [DeployTarget; 3] = [
        DeployTarget::Development,
        DeployTarget::Staging,
        DeployTarget::Production,
    ];

    /// Name passed to the deployment script
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployTarget::Development => "development",
            DeployTarget::Staging => "staging",
            DeployTarget::Production => "production",
        }
    }

    /// Gate guarding deployments to this target
    pub fn pre_deploy_gate(&self) -> PreDeployGate {
        match self {
            DeployTarget::Development | DeployTarget::Staging => PreDeployGate::Direct,
            DeployTarget::Production => PreDeployGate::RequiresApproval,
        }
    }
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployTarget {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeployTarget::ALL
            .into_iter()
            .find(|target| target.as_str() == s)
            .ok_or_else(|| {
                PipelineError::invalid_parameter(
                    "ENVIRONMENT",
                    format!(
                        "'{}' is not one of development, staging, production",
                        s
                    ),
                )
            })
    }
}
