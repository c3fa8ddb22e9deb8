//! Errors surfaced by a partition run.

use crate::installer::InstallFailure;
use crate::orchestrator::{Recovery, RunReport};
use crate::provider::{ProviderError, SubnetId, VpcId};

/// Why a partition run did not complete cleanly.
///
/// `Input` and `Discovery` happen before any mutation. `Installation` and
/// `Restoration` mean the environment may still be partitioned; both carry the
/// identifiers needed to finish recovery by hand.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error(
        "discovery failed for {vpc} in {availability_zone}{}: {cause}",
        subnet_suffix(.subnet)
    )]
    Discovery {
        vpc: VpcId,
        availability_zone: String,
        subnet: Option<SubnetId>,
        cause: ProviderError,
    },

    #[error("{failure}{}", recovery_suffix(.recovery))]
    Installation {
        failure: Box<InstallFailure>,
        recovery: Option<Recovery>,
    },

    #[error("{}", restoration_summary(.0))]
    Restoration(Box<RunReport>),
}

impl PartitionError {
    pub fn input(message: impl Into<String>) -> Self {
        PartitionError::Input(message.into())
    }

    /// Whether the environment may have been left partitioned.
    pub fn is_partial_failure(&self) -> bool {
        match self {
            PartitionError::Input(_) | PartitionError::Discovery { .. } => false,
            PartitionError::Installation { failure, recovery } => {
                !failure.installed.is_empty()
                    && !recovery.as_ref().is_some_and(|r| r.restore.is_complete())
            }
            PartitionError::Restoration(_) => true,
        }
    }
}

fn subnet_suffix(subnet: &Option<SubnetId>) -> String {
    subnet
        .as_ref()
        .map(|s| format!(" (subnet {})", s))
        .unwrap_or_default()
}

fn restoration_summary(report: &RunReport) -> String {
    format!(
        "restoration failed for {} of {} association(s); {} still denies their traffic",
        report.restore.failed.len(),
        report.restore.attempted(),
        report.injected_acl
    )
}

fn recovery_suffix(recovery: &Option<Recovery>) -> String {
    match recovery {
        Some(r) if r.restore.is_complete() => {
            format!("; rolled back {} rebind(s)", r.restore.restored.len())
        }
        Some(r) => format!(
            "; rollback left {} association(s) on the partition ACL",
            r.restore.failed.len()
        ),
        None => String::new(),
    }
}
