//! In-memory control plane.
//!
//! Behaves like the real thing where it matters to a partition run:
//! association ids are replaced on every rebind, rule numbers are unique per
//! direction, and an ACL cannot be deleted while a subnet still uses it.
//! Individual calls can be scripted to fail.

use super::{
    AclAssociation, AclId, AclRuleEntry, AssociationId, ControlPlane, ProviderError, Subnet,
    SubnetId, VpcId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Control plane operations, used for fault scripting and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeSubnets,
    DescribeAclAssociations,
    CreateNetworkAcl,
    CreateAclEntry,
    ReplaceAclAssociation,
    DeleteNetworkAcl,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::DescribeSubnets => "DescribeSubnets",
            Operation::DescribeAclAssociations => "DescribeNetworkAcls",
            Operation::CreateNetworkAcl => "CreateNetworkAcl",
            Operation::CreateAclEntry => "CreateNetworkAclEntry",
            Operation::ReplaceAclAssociation => "ReplaceNetworkAclAssociation",
            Operation::DeleteNetworkAcl => "DeleteNetworkAcl",
        }
    }

    /// Whether the operation changes control plane state.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            Operation::DescribeSubnets | Operation::DescribeAclAssociations
        )
    }
}

struct AclRecord {
    vpc_id: VpcId,
    entries: Vec<AclRuleEntry>,
}

#[derive(Default)]
struct State {
    subnets: Vec<Subnet>,
    acls: BTreeMap<AclId, AclRecord>,
    associations: BTreeMap<AssociationId, AclAssociation>,
    next_acl: u32,
    next_association: u32,
    calls: Vec<Operation>,
    /// Operation -> 1-based call numbers that fail.
    faults: HashMap<Operation, Vec<usize>>,
}

impl State {
    /// Record a call and decide whether it is scripted to fail.
    fn enter(&mut self, op: Operation) -> Result<(), ProviderError> {
        self.calls.push(op);
        let nth = self.calls.iter().filter(|c| **c == op).count();
        if self.faults.get(&op).is_some_and(|n| n.contains(&nth)) {
            debug!(operation = op.name(), call = nth, "Injecting scripted failure");
            return Err(ProviderError::request(
                op.name(),
                format!("scripted failure on call {}", nth),
            ));
        }
        Ok(())
    }

    fn fresh_acl_id(&mut self) -> AclId {
        self.next_acl += 1;
        AclId::new(format!("acl-mem{:05}", self.next_acl))
    }

    fn fresh_association_id(&mut self) -> AssociationId {
        self.next_association += 1;
        AssociationId::new(format!("aclassoc-mem{:05}", self.next_association))
    }
}

/// Deterministic in-memory [`ControlPlane`].
#[derive(Default)]
pub struct InMemoryControlPlane {
    state: Mutex<State>,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zone with `subnets` subnets sharing one default ACL.
    pub fn with_zone(vpc: &str, availability_zone: &str, subnets: usize) -> Self {
        let plane = Self::new();
        let default_acl = format!("acl-{}-default", vpc);
        for n in 1..=subnets {
            plane.add_subnet(
                vpc,
                availability_zone,
                &format!("subnet-{}-{}", availability_zone, n),
                &default_acl,
                &format!("aclassoc-{}-{}", availability_zone, n),
            );
        }
        plane
    }

    /// Builder form of [`InMemoryControlPlane::add_subnet`].
    pub fn with_subnet(
        self,
        vpc: &str,
        availability_zone: &str,
        subnet: &str,
        acl: &str,
        association: &str,
    ) -> Self {
        self.add_subnet(vpc, availability_zone, subnet, acl, association);
        self
    }

    /// Register a subnet bound to `acl` through `association`.
    ///
    /// The ACL is created on first use.
    pub fn add_subnet(
        &self,
        vpc: &str,
        availability_zone: &str,
        subnet: &str,
        acl: &str,
        association: &str,
    ) {
        let mut state = self.lock();
        let vpc_id = VpcId::from(vpc);
        let acl_id = AclId::from(acl);
        state
            .acls
            .entry(acl_id.clone())
            .or_insert_with(|| AclRecord {
                vpc_id: vpc_id.clone(),
                entries: Vec::new(),
            });
        state.subnets.push(Subnet {
            id: SubnetId::from(subnet),
            vpc_id,
            availability_zone: availability_zone.to_string(),
            cidr_block: None,
        });
        let association_id = AssociationId::from(association);
        state.associations.insert(
            association_id.clone(),
            AclAssociation {
                id: association_id,
                acl_id,
                subnet_id: SubnetId::from(subnet),
            },
        );
    }

    /// Make the `nth` call (1-based) of `op` fail.
    pub fn fail_on(self, op: Operation, nth: usize) -> Self {
        self.lock().faults.entry(op).or_default().push(nth);
        self
    }

    /// ACL currently bound to `subnet`.
    pub fn acl_for_subnet(&self, subnet: &SubnetId) -> Option<AclId> {
        self.lock()
            .associations
            .values()
            .find(|a| &a.subnet_id == subnet)
            .map(|a| a.acl_id.clone())
    }

    /// Association currently binding `subnet`.
    pub fn association_for_subnet(&self, subnet: &SubnetId) -> Option<AssociationId> {
        self.lock()
            .associations
            .values()
            .find(|a| &a.subnet_id == subnet)
            .map(|a| a.id.clone())
    }

    pub fn acl_exists(&self, acl: &AclId) -> bool {
        self.lock().acls.contains_key(acl)
    }

    pub fn acl_count(&self) -> usize {
        self.lock().acls.len()
    }

    pub fn acl_entries(&self, acl: &AclId) -> Vec<AclRuleEntry> {
        self.lock()
            .acls
            .get(acl)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn mutating_calls(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.is_mutating()).count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn describe_subnets(
        &self,
        vpc: &VpcId,
        availability_zone: &str,
    ) -> Result<Vec<Subnet>, ProviderError> {
        let mut state = self.lock();
        state.enter(Operation::DescribeSubnets)?;
        Ok(state
            .subnets
            .iter()
            .filter(|s| &s.vpc_id == vpc && s.availability_zone == availability_zone)
            .cloned()
            .collect())
    }

    async fn describe_acl_associations(
        &self,
        vpc: &VpcId,
        subnet: &SubnetId,
    ) -> Result<Vec<AclAssociation>, ProviderError> {
        let mut state = self.lock();
        state.enter(Operation::DescribeAclAssociations)?;

        let bound: Vec<&AclId> = state
            .associations
            .values()
            .filter(|a| &a.subnet_id == subnet)
            .map(|a| &a.acl_id)
            .filter(|acl| state.acls.get(*acl).is_some_and(|r| &r.vpc_id == vpc))
            .collect();

        // Like the real API, every association of a matching ACL comes back.
        Ok(state
            .associations
            .values()
            .filter(|a| bound.contains(&&a.acl_id))
            .cloned()
            .collect())
    }

    async fn create_network_acl(&self, vpc: &VpcId) -> Result<AclId, ProviderError> {
        let mut state = self.lock();
        state.enter(Operation::CreateNetworkAcl)?;
        let id = state.fresh_acl_id();
        state.acls.insert(
            id.clone(),
            AclRecord {
                vpc_id: vpc.clone(),
                entries: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn create_acl_entry(
        &self,
        acl: &AclId,
        entry: &AclRuleEntry,
    ) -> Result<(), ProviderError> {
        let op = Operation::CreateAclEntry;
        let mut state = self.lock();
        state.enter(op)?;
        let record = state
            .acls
            .get_mut(acl)
            .ok_or_else(|| ProviderError::request(op.name(), format!("unknown ACL {}", acl)))?;
        if record
            .entries
            .iter()
            .any(|e| e.direction == entry.direction && e.rule_number == entry.rule_number)
        {
            return Err(ProviderError::request(
                op.name(),
                format!(
                    "rule number {} already used for {} on {}",
                    entry.rule_number, entry.direction, acl
                ),
            ));
        }
        record.entries.push(entry.clone());
        Ok(())
    }

    async fn replace_acl_association(
        &self,
        association: &AssociationId,
        acl: &AclId,
    ) -> Result<AssociationId, ProviderError> {
        let op = Operation::ReplaceAclAssociation;
        let mut state = self.lock();
        state.enter(op)?;
        if !state.acls.contains_key(acl) {
            return Err(ProviderError::request(op.name(), format!("unknown ACL {}", acl)));
        }
        let old = state.associations.remove(association).ok_or_else(|| {
            ProviderError::request(op.name(), format!("unknown association {}", association))
        })?;
        let id = state.fresh_association_id();
        state.associations.insert(
            id.clone(),
            AclAssociation {
                id: id.clone(),
                acl_id: acl.clone(),
                subnet_id: old.subnet_id,
            },
        );
        Ok(id)
    }

    async fn delete_network_acl(&self, acl: &AclId) -> Result<(), ProviderError> {
        let op = Operation::DeleteNetworkAcl;
        let mut state = self.lock();
        state.enter(op)?;
        if !state.acls.contains_key(acl) {
            return Err(ProviderError::request(op.name(), format!("unknown ACL {}", acl)));
        }
        let in_use = state.associations.values().filter(|a| &a.acl_id == acl).count();
        if in_use > 0 {
            return Err(ProviderError::request(
                op.name(),
                format!("{} is still associated with {} subnet(s)", acl, in_use),
            ));
        }
        state.acls.remove(acl);
        Ok(())
    }
}
