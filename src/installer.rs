//! Partition installation: deny-all ACL plus association rebinds.

use crate::checkpoint::Checkpoint;
use crate::provider::{
    AclId, AclRuleEntry, AssociationId, ControlPlane, ProviderError, SubnetId, TrafficDirection,
    VpcId,
};
use serde::Serialize;
use std::fmt;
use std::iter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// An installed partition.
#[derive(Debug, Clone)]
pub struct Installation {
    /// The injected deny-all ACL.
    pub acl_id: AclId,
    /// New association id -> original ACL, for every rebound subnet.
    pub installed: Checkpoint,
    /// Entries never rebound because the run was cancelled.
    pub pending: Checkpoint,
}

impl Installation {
    /// Whether installation stopped early on cancellation.
    pub fn interrupted(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// The installation step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallStep {
    CreateAcl,
    AddEntry {
        direction: TrafficDirection,
        rule_number: u16,
    },
    Rebind {
        association: AssociationId,
        subnet: SubnetId,
    },
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStep::CreateAcl => write!(f, "creating the partition ACL"),
            InstallStep::AddEntry {
                direction,
                rule_number,
            } => write!(f, "adding {} deny rule {}", direction, rule_number),
            InstallStep::Rebind {
                association,
                subnet,
            } => write!(f, "rebinding {} of subnet {}", association, subnet),
        }
    }
}

/// Installation stopped part way.
///
/// `installed` holds exactly the rebinds that completed, keyed by their new
/// association ids. `pending` holds the entries never rebound, starting with
/// the one that failed; their association ids are still valid.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error(
    "installation failed while {step}: {cause} ({}{})",
    partitioned_count(.installed),
    acl_suffix(.injected_acl)
)]
pub struct InstallFailure {
    pub step: InstallStep,
    pub injected_acl: Option<AclId>,
    pub installed: Checkpoint,
    pub pending: Checkpoint,
    pub cause: ProviderError,
}

fn partitioned_count(installed: &Checkpoint) -> String {
    format!("{} subnet(s) partitioned", installed.len())
}

fn acl_suffix(acl: &Option<AclId>) -> String {
    acl.as_ref()
        .map(|a| format!(" behind {}", a))
        .unwrap_or_default()
}

impl InstallFailure {
    /// Subnet whose rebind failed, if the failure was a rebind.
    pub fn failed_subnet(&self) -> Option<&SubnetId> {
        match &self.step {
            InstallStep::Rebind { subnet, .. } => Some(subnet),
            _ => None,
        }
    }
}

/// Create the partition ACL in `vpc` and move every checkpointed association
/// onto it.
///
/// Rebinds run in checkpoint order and stop at the first failure. The token is
/// checked before each rebind; once it fires, the remaining entries are handed
/// back untouched in [`Installation::pending`].
pub async fn install<P>(
    plane: &P,
    vpc: &VpcId,
    checkpoint: Checkpoint,
    rules: &[AclRuleEntry],
    cancel: &CancellationToken,
) -> Result<Installation, InstallFailure>
where
    P: ControlPlane + ?Sized,
{
    let acl_id = match plane.create_network_acl(vpc).await {
        Ok(id) => id,
        Err(cause) => {
            error!(vpc = %vpc, error = %cause, "Failed to create partition ACL");
            return Err(InstallFailure {
                step: InstallStep::CreateAcl,
                injected_acl: None,
                installed: Checkpoint::new(),
                pending: checkpoint,
                cause,
            });
        }
    };
    info!(vpc = %vpc, acl = %acl_id, "Created partition ACL");

    for entry in rules {
        if let Err(cause) = plane.create_acl_entry(&acl_id, entry).await {
            error!(
                acl = %acl_id,
                direction = %entry.direction,
                rule_number = entry.rule_number,
                error = %cause,
                "Failed to add deny rule"
            );
            return Err(InstallFailure {
                step: InstallStep::AddEntry {
                    direction: entry.direction,
                    rule_number: entry.rule_number,
                },
                injected_acl: Some(acl_id),
                installed: Checkpoint::new(),
                pending: checkpoint,
                cause,
            });
        }
        info!(
            acl = %acl_id,
            direction = %entry.direction,
            rule_number = entry.rule_number,
            cidr = %entry.cidr_block,
            "Added deny rule"
        );
    }

    let mut installed = Checkpoint::new();
    let mut remaining = checkpoint.into_iter();
    while let Some((association, binding)) = remaining.next() {
        if cancel.is_cancelled() {
            let pending: Checkpoint =
                iter::once((association, binding)).chain(remaining).collect();
            warn!(
                rebound = installed.len(),
                skipped = pending.len(),
                "Installation cancelled"
            );
            return Ok(Installation {
                acl_id,
                installed,
                pending,
            });
        }

        match plane.replace_acl_association(&association, &acl_id).await {
            Ok(new_association) => {
                info!(
                    subnet = %binding.subnet_id,
                    association = %association,
                    new_association = %new_association,
                    original_acl = %binding.original_acl_id,
                    "Subnet partitioned"
                );
                // The old id is dead from here on; only the new one is kept.
                installed.insert(new_association, binding.subnet_id, binding.original_acl_id);
            }
            Err(cause) => {
                error!(
                    subnet = %binding.subnet_id,
                    association = %association,
                    rebound = installed.len(),
                    error = %cause,
                    "Failed to rebind subnet to partition ACL"
                );
                let step = InstallStep::Rebind {
                    association: association.clone(),
                    subnet: binding.subnet_id.clone(),
                };
                let pending = iter::once((association, binding)).chain(remaining).collect();
                return Err(InstallFailure {
                    step,
                    injected_acl: Some(acl_id),
                    installed,
                    pending,
                    cause,
                });
            }
        }
    }

    info!(
        acl = %acl_id,
        subnets = installed.len(),
        "Availability zone partition installed"
    );
    Ok(Installation {
        acl_id,
        installed,
        pending: Checkpoint::new(),
    })
}
