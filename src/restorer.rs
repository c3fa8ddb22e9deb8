//! Partition restoration and cleanup.

use crate::checkpoint::Checkpoint;
use crate::provider::{AclId, AssociationId, ControlPlane, ProviderError, SubnetId};
use serde::Serialize;
use tracing::{error, info, warn};

/// A subnet put back on its original ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoredBinding {
    pub subnet_id: SubnetId,
    /// Id issued by the restoring rebind.
    pub association_id: AssociationId,
    pub acl_id: AclId,
}

/// A subnet still bound to the partition ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreFailure {
    pub subnet_id: SubnetId,
    /// Still valid: the failed rebind did not consume it.
    pub association_id: AssociationId,
    pub original_acl_id: AclId,
    pub cause: ProviderError,
}

/// Outcome of restoring every installed association.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: Vec<RestoredBinding>,
    pub failed: Vec<RestoreFailure>,
}

impl RestoreReport {
    /// No association is left on the partition ACL.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.restored.len() + self.failed.len()
    }
}

/// What happened to the partition ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupStatus {
    Deleted,
    /// Not attempted: subnets still reference the ACL.
    Skipped { still_referenced: usize },
    Failed { cause: ProviderError },
}

impl CleanupStatus {
    pub fn is_deleted(&self) -> bool {
        matches!(self, CleanupStatus::Deleted)
    }
}

/// Rebind every installed association back to its original ACL.
///
/// Takes the mapping by value: each rebind consumes its key. A failed entry
/// does not stop the rest.
pub async fn restore<P>(plane: &P, installed: Checkpoint) -> RestoreReport
where
    P: ControlPlane + ?Sized,
{
    info!(associations = installed.len(), "Restoring original network ACLs");
    let mut report = RestoreReport::default();

    for (association, binding) in installed {
        match plane
            .replace_acl_association(&association, &binding.original_acl_id)
            .await
        {
            Ok(new_association) => {
                info!(
                    subnet = %binding.subnet_id,
                    association = %new_association,
                    acl = %binding.original_acl_id,
                    "Subnet restored"
                );
                report.restored.push(RestoredBinding {
                    subnet_id: binding.subnet_id,
                    association_id: new_association,
                    acl_id: binding.original_acl_id,
                });
            }
            Err(cause) => {
                error!(
                    subnet = %binding.subnet_id,
                    association = %association,
                    original_acl = %binding.original_acl_id,
                    error = %cause,
                    "Failed to restore subnet"
                );
                report.failed.push(RestoreFailure {
                    subnet_id: binding.subnet_id,
                    association_id: association,
                    original_acl_id: binding.original_acl_id,
                    cause,
                });
            }
        }
    }

    if report.is_complete() {
        info!(restored = report.restored.len(), "All subnets restored");
    } else {
        error!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Restoration incomplete"
        );
    }
    report
}

/// Delete the partition ACL once `report` shows nothing references it.
pub async fn cleanup<P>(plane: &P, acl: &AclId, report: &RestoreReport) -> CleanupStatus
where
    P: ControlPlane + ?Sized,
{
    if !report.is_complete() {
        warn!(
            acl = %acl,
            still_referenced = report.failed.len(),
            "Leaving partition ACL in place"
        );
        return CleanupStatus::Skipped {
            still_referenced: report.failed.len(),
        };
    }

    match plane.delete_network_acl(acl).await {
        Ok(()) => {
            info!(acl = %acl, "Partition ACL deleted");
            CleanupStatus::Deleted
        }
        Err(cause) => {
            warn!(acl = %acl, error = %cause, "Failed to delete partition ACL");
            CleanupStatus::Failed { cause }
        }
    }
}
