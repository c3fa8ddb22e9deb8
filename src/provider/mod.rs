//! Control plane abstraction for network ACL operations.
//!
//! The partition run only ever talks to the cloud through [`ControlPlane`].
//! Two implementations ship with the crate:
//! - [`memory::InMemoryControlPlane`] - deterministic, with scripted faults
//! - `aws::Ec2ControlPlane` - the AWS EC2 API (feature `aws`)

#[cfg(feature = "aws")]
pub mod aws;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// VPC identifier.
    VpcId
);
id_type!(
    /// Subnet identifier.
    SubnetId
);
id_type!(
    /// Network ACL identifier.
    AclId
);
id_type!(
    /// Network ACL association identifier.
    ///
    /// Single use: the control plane invalidates it on every rebind and hands
    /// back a new one.
    AssociationId
);

/// A subnet as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub vpc_id: VpcId,
    pub availability_zone: String,
    pub cidr_block: Option<String>,
}

/// Binding of one subnet to one network ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclAssociation {
    pub id: AssociationId,
    pub acl_id: AclId,
    pub subnet_id: SubnetId,
}

/// Traffic direction of an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficDirection {
    Ingress,
    Egress,
}

impl TrafficDirection {
    pub fn is_egress(self) -> bool {
        matches!(self, TrafficDirection::Egress)
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficDirection::Ingress => f.write_str("ingress"),
            TrafficDirection::Egress => f.write_str("egress"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

/// Protocol value meaning "all protocols".
pub const ALL_PROTOCOLS: &str = "-1";

/// Rule number of the implicit default rule; entries must sort before it.
pub const DEFAULT_RULE_NUMBER: u16 = 32767;

/// A single network ACL rule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclRuleEntry {
    pub direction: TrafficDirection,
    pub cidr_block: String,
    pub protocol: String,
    /// `None` covers all ports.
    pub port_range: Option<PortRange>,
    /// Lower numbers are evaluated first.
    pub rule_number: u16,
    pub action: RuleAction,
}

impl AclRuleEntry {
    /// Entry dropping all traffic in `direction` for `cidr_block`.
    pub fn deny_all(direction: TrafficDirection, rule_number: u16, cidr_block: &str) -> Self {
        Self {
            direction,
            cidr_block: cidr_block.to_string(),
            protocol: ALL_PROTOCOLS.to_string(),
            port_range: None,
            rule_number,
            action: RuleAction::Deny,
        }
    }
}

/// Failure reported by a control plane call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} response is missing {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

impl ProviderError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        ProviderError::Request {
            operation,
            message: message.into(),
        }
    }
}

/// Network ACL control plane.
///
/// Calls are issued one at a time by the orchestrator. Implementations own any
/// retry or backoff policy; callers treat every error as final for the step.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// List subnets of `vpc` located in `availability_zone`.
    async fn describe_subnets(
        &self,
        vpc: &VpcId,
        availability_zone: &str,
    ) -> Result<Vec<Subnet>, ProviderError>;

    /// List ACL associations of the ACLs bound to `subnet`.
    ///
    /// May include associations of other subnets sharing the same ACL.
    async fn describe_acl_associations(
        &self,
        vpc: &VpcId,
        subnet: &SubnetId,
    ) -> Result<Vec<AclAssociation>, ProviderError>;

    /// Create an empty network ACL in `vpc`.
    async fn create_network_acl(&self, vpc: &VpcId) -> Result<AclId, ProviderError>;

    /// Add a rule entry to `acl`.
    async fn create_acl_entry(&self, acl: &AclId, entry: &AclRuleEntry)
        -> Result<(), ProviderError>;

    /// Point `association` at `acl`, returning the new association id.
    async fn replace_acl_association(
        &self,
        association: &AssociationId,
        acl: &AclId,
    ) -> Result<AssociationId, ProviderError>;

    /// Delete `acl`. Fails while any subnet is still associated with it.
    async fn delete_network_acl(&self, acl: &AclId) -> Result<(), ProviderError>;
}
