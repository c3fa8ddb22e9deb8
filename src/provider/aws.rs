//! AWS EC2 implementation of [`ControlPlane`].

use super::{
    AclAssociation, AclId, AclRuleEntry, AssociationId, ControlPlane, ProviderError, RuleAction,
    Subnet, SubnetId, VpcId,
};
use async_trait::async_trait;
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::{self as ec2, Filter};
use aws_sdk_ec2::Client;
use tracing::debug;

/// Network ACL control plane backed by the EC2 API.
///
/// Retries and credentials are handled by the SDK configuration.
pub struct Ec2ControlPlane {
    client: Client,
}

impl Ec2ControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration.
    ///
    /// `region` overrides the region resolved from the environment.
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        debug!(region = ?config.region(), "Loaded AWS configuration");
        Self::new(Client::new(&config))
    }
}

fn filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn sdk_error<E>(operation: &'static str, err: E) -> ProviderError
where
    E: std::error::Error + 'static,
{
    ProviderError::request(operation, DisplayErrorContext(err).to_string())
}

fn required<'a>(
    operation: &'static str,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ProviderError> {
    value.ok_or(ProviderError::MissingField { operation, field })
}

#[async_trait]
impl ControlPlane for Ec2ControlPlane {
    async fn describe_subnets(
        &self,
        vpc: &VpcId,
        availability_zone: &str,
    ) -> Result<Vec<Subnet>, ProviderError> {
        const OP: &str = "DescribeSubnets";
        let output = self
            .client
            .describe_subnets()
            .filters(filter("vpc-id", vpc.as_str()))
            .filters(filter("availability-zone", availability_zone))
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        output
            .subnets()
            .iter()
            .map(|s| {
                Ok(Subnet {
                    id: SubnetId::from(required(OP, "SubnetId", s.subnet_id())?),
                    vpc_id: s.vpc_id().map(VpcId::from).unwrap_or_else(|| vpc.clone()),
                    availability_zone: s
                        .availability_zone()
                        .unwrap_or(availability_zone)
                        .to_string(),
                    cidr_block: s.cidr_block().map(str::to_string),
                })
            })
            .collect()
    }

    async fn describe_acl_associations(
        &self,
        vpc: &VpcId,
        subnet: &SubnetId,
    ) -> Result<Vec<AclAssociation>, ProviderError> {
        const OP: &str = "DescribeNetworkAcls";
        let output = self
            .client
            .describe_network_acls()
            .filters(filter("vpc-id", vpc.as_str()))
            .filters(filter("association.subnet-id", subnet.as_str()))
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        let mut associations = Vec::new();
        for acl in output.network_acls() {
            for association in acl.associations() {
                associations.push(AclAssociation {
                    id: AssociationId::from(required(
                        OP,
                        "NetworkAclAssociationId",
                        association.network_acl_association_id(),
                    )?),
                    acl_id: AclId::from(required(
                        OP,
                        "NetworkAclId",
                        association.network_acl_id().or(acl.network_acl_id()),
                    )?),
                    subnet_id: SubnetId::from(required(OP, "SubnetId", association.subnet_id())?),
                });
            }
        }
        Ok(associations)
    }

    async fn create_network_acl(&self, vpc: &VpcId) -> Result<AclId, ProviderError> {
        const OP: &str = "CreateNetworkAcl";
        let output = self
            .client
            .create_network_acl()
            .vpc_id(vpc.as_str())
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        let id = required(
            OP,
            "NetworkAcl.NetworkAclId",
            output.network_acl().and_then(|acl| acl.network_acl_id()),
        )?;
        Ok(AclId::from(id))
    }

    async fn create_acl_entry(
        &self,
        acl: &AclId,
        entry: &AclRuleEntry,
    ) -> Result<(), ProviderError> {
        const OP: &str = "CreateNetworkAclEntry";
        let action = match entry.action {
            RuleAction::Allow => ec2::RuleAction::Allow,
            RuleAction::Deny => ec2::RuleAction::Deny,
        };
        let port_range = entry.port_range.map(|range| {
            ec2::PortRange::builder()
                .from(i32::from(range.from))
                .to(i32::from(range.to))
                .build()
        });

        self.client
            .create_network_acl_entry()
            .network_acl_id(acl.as_str())
            .rule_number(i32::from(entry.rule_number))
            .egress(entry.direction.is_egress())
            .protocol(entry.protocol.as_str())
            .cidr_block(entry.cidr_block.as_str())
            .set_port_range(port_range)
            .rule_action(action)
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;
        Ok(())
    }

    async fn replace_acl_association(
        &self,
        association: &AssociationId,
        acl: &AclId,
    ) -> Result<AssociationId, ProviderError> {
        const OP: &str = "ReplaceNetworkAclAssociation";
        let output = self
            .client
            .replace_network_acl_association()
            .association_id(association.as_str())
            .network_acl_id(acl.as_str())
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        let id = required(OP, "NewAssociationId", output.new_association_id())?;
        Ok(AssociationId::from(id))
    }

    async fn delete_network_acl(&self, acl: &AclId) -> Result<(), ProviderError> {
        const OP: &str = "DeleteNetworkAcl";
        self.client
            .delete_network_acl()
            .network_acl_id(acl.as_str())
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;
        Ok(())
    }
}
