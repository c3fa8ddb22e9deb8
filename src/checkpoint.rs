//! Recovery checkpoint: association id -> original ACL.

use crate::provider::{AclId, AssociationId, SubnetId};
use serde::Serialize;
use std::collections::btree_map::{self, BTreeMap};

/// What an association binds and which ACL to put back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub subnet_id: SubnetId,
    /// ACL the subnet used before the partition.
    pub original_acl_id: AclId,
}

/// Ordered mapping from association id to [`Binding`].
///
/// Keys are only valid until the association is rebound. Each stage takes the
/// checkpoint by value, consumes it while rebinding, and builds a new one keyed
/// by the ids the control plane returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Checkpoint {
    entries: BTreeMap<AssociationId, Binding>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding. Returns the previous binding for `association`, if any.
    pub fn insert(
        &mut self,
        association: AssociationId,
        subnet_id: SubnetId,
        original_acl_id: AclId,
    ) -> Option<Binding> {
        self.entries.insert(
            association,
            Binding {
                subnet_id,
                original_acl_id,
            },
        )
    }

    pub fn contains(&self, association: &AssociationId) -> bool {
        self.entries.contains_key(association)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, AssociationId, Binding> {
        self.entries.iter()
    }

    /// Binding recorded for `subnet`, with its association id.
    pub fn find_subnet(&self, subnet: &SubnetId) -> Option<(&AssociationId, &Binding)> {
        self.entries.iter().find(|(_, b)| &b.subnet_id == subnet)
    }
}

impl IntoIterator for Checkpoint {
    type Item = (AssociationId, Binding);
    type IntoIter = btree_map::IntoIter<AssociationId, Binding>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Checkpoint {
    type Item = (&'a AssociationId, &'a Binding);
    type IntoIter = btree_map::Iter<'a, AssociationId, Binding>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(AssociationId, Binding)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (AssociationId, Binding)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
