//! Blast radius discovery.

use crate::checkpoint::Checkpoint;
use crate::error::PartitionError;
use crate::provider::{ControlPlane, Subnet, VpcId};
use tracing::{debug, info, warn};

/// Subnets in scope and the checkpoint of their current ACL bindings.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub subnets: Vec<Subnet>,
    pub checkpoint: Checkpoint,
}

impl Discovery {
    /// Nothing to partition.
    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }
}

/// Find the subnets of `vpc` in `availability_zone` and record, for each, the
/// association binding it and the ACL it currently uses.
///
/// Read only. When no subnet matches, returns an empty [`Discovery`] without
/// querying associations.
pub async fn discover<P>(
    plane: &P,
    vpc: &VpcId,
    availability_zone: &str,
) -> Result<Discovery, PartitionError>
where
    P: ControlPlane + ?Sized,
{
    let subnets = plane
        .describe_subnets(vpc, availability_zone)
        .await
        .map_err(|cause| PartitionError::Discovery {
            vpc: vpc.clone(),
            availability_zone: availability_zone.to_string(),
            subnet: None,
            cause,
        })?;

    if subnets.is_empty() {
        info!(vpc = %vpc, availability_zone, "No subnets in availability zone");
        return Ok(Discovery::default());
    }

    info!(
        vpc = %vpc,
        availability_zone,
        subnets = ?subnets.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        "Discovered subnets"
    );

    let mut checkpoint = Checkpoint::new();
    for subnet in &subnets {
        let associations = plane
            .describe_acl_associations(vpc, &subnet.id)
            .await
            .map_err(|cause| PartitionError::Discovery {
                vpc: vpc.clone(),
                availability_zone: availability_zone.to_string(),
                subnet: Some(subnet.id.clone()),
                cause,
            })?;

        let before = checkpoint.len();
        // Shared ACLs list their other subnets too.
        for association in associations.into_iter().filter(|a| a.subnet_id == subnet.id) {
            debug!(
                subnet = %subnet.id,
                association = %association.id,
                acl = %association.acl_id,
                "Captured ACL association"
            );
            checkpoint.insert(association.id, association.subnet_id, association.acl_id);
        }

        if checkpoint.len() == before {
            warn!(subnet = %subnet.id, "Subnet has no network ACL association, skipping");
        }
    }

    info!(
        associations = checkpoint.len(),
        checkpoint = ?checkpoint,
        "Captured recovery checkpoint"
    );
    Ok(Discovery {
        subnets,
        checkpoint,
    })
}
