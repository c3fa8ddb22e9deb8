//! End-to-end partition run.

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::discovery::discover;
use crate::error::PartitionError;
use crate::hold::{hold, HoldOutcome};
use crate::installer::{install, InstallFailure};
use crate::provider::{AclId, ControlPlane, VpcId};
use crate::restorer::{cleanup, restore, CleanupStatus, RestoreReport};
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Discovering,
    Installing,
    Holding,
    Restoring,
    Cleanup,
    Succeeded,
    /// The environment may be left partitioned.
    PartiallyFailed,
    /// Stopped early with nothing left partitioned.
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Discovering => "discovering",
            RunState::Installing => "installing",
            RunState::Holding => "holding",
            RunState::Restoring => "restoring",
            RunState::Cleanup => "cleanup",
            RunState::Succeeded => "succeeded",
            RunState::PartiallyFailed => "partially-failed",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Summary of a run that got as far as installing the partition.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub injected_acl: AclId,
    /// Subnets that were partitioned.
    pub partitioned: usize,
    /// Entries never partitioned because the run was cancelled.
    pub skipped: Checkpoint,
    pub hold: HoldOutcome,
    pub restore: RestoreReport,
    pub cleanup: CleanupStatus,
}

impl RunReport {
    /// Whether an operator cut the run short.
    pub fn interrupted(&self) -> bool {
        !self.skipped.is_empty() || matches!(self.hold, HoldOutcome::Cancelled { .. })
    }
}

/// Rollback performed after a failed installation.
#[derive(Debug, Clone, Serialize)]
pub struct Recovery {
    pub restore: RestoreReport,
    pub cleanup: CleanupStatus,
}

/// How a run finished.
#[derive(Debug)]
pub enum RunOutcome {
    /// No subnet matched the target; nothing was touched.
    NothingToPartition,
    /// Dry run: the checkpoint that would have driven the partition.
    DryRun { plan: Checkpoint },
    Completed(RunReport),
}

/// Drives discovery, installation, hold, restoration and cleanup in order.
///
/// Owns the checkpoint for the duration of the run. No call is retried.
pub struct Orchestrator<P> {
    plane: P,
    config: Config,
    cancel: CancellationToken,
    state: RunState,
}

impl<P: ControlPlane> Orchestrator<P> {
    pub fn new(plane: P, config: Config) -> Self {
        Self {
            plane,
            config,
            cancel: CancellationToken::new(),
            state: RunState::Idle,
        }
    }

    /// Use `token` to cut the hold short or stop installation early.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn control_plane(&self) -> &P {
        &self.plane
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state change");
        self.state = next;
    }

    /// Run the partition end to end.
    pub async fn run(&mut self) -> Result<RunOutcome, PartitionError> {
        if let Err(err) = self.config.validate() {
            self.transition(RunState::Aborted);
            return Err(err);
        }

        let vpc = VpcId::new(self.config.target.vpc_id.trim());
        let availability_zone = self.config.target.availability_zone.trim().to_string();

        self.transition(RunState::Discovering);
        let discovered = discover(&self.plane, &vpc, &availability_zone).await;
        let discovery = match discovered {
            Ok(discovery) => discovery,
            Err(err) => {
                self.transition(RunState::Aborted);
                return Err(err);
            }
        };

        if discovery.is_empty() || discovery.checkpoint.is_empty() {
            info!(vpc = %vpc, availability_zone = %availability_zone, "Nothing to partition");
            self.transition(RunState::Succeeded);
            return Ok(RunOutcome::NothingToPartition);
        }

        if self.config.settings.dry_run {
            info!(
                vpc = %vpc,
                availability_zone = %availability_zone,
                associations = discovery.checkpoint.len(),
                "Dry run, no ACL changes made"
            );
            self.transition(RunState::Succeeded);
            return Ok(RunOutcome::DryRun {
                plan: discovery.checkpoint,
            });
        }

        self.transition(RunState::Installing);
        let rules = self.config.partition.deny_rules();
        let installed =
            install(&self.plane, &vpc, discovery.checkpoint, &rules, &self.cancel).await;
        let installation = match installed {
            Ok(installation) => installation,
            Err(failure) => return Err(self.recover_installation(failure).await),
        };

        let hold_outcome = if installation.interrupted() {
            HoldOutcome::Skipped
        } else {
            self.transition(RunState::Holding);
            hold(self.config.partition.duration, &self.cancel).await
        };

        self.transition(RunState::Restoring);
        let partitioned = installation.installed.len();
        let restore_report = restore(&self.plane, installation.installed).await;

        self.transition(RunState::Cleanup);
        let cleanup_status = cleanup(&self.plane, &installation.acl_id, &restore_report).await;

        let report = RunReport {
            injected_acl: installation.acl_id,
            partitioned,
            skipped: installation.pending,
            hold: hold_outcome,
            restore: restore_report,
            cleanup: cleanup_status,
        };

        if !report.restore.is_complete() {
            self.transition(RunState::PartiallyFailed);
            return Err(PartitionError::Restoration(Box::new(report)));
        }

        if let CleanupStatus::Failed { cause } = &report.cleanup {
            warn!(
                acl = %report.injected_acl,
                error = %cause,
                "Partition ACL leaked, delete it manually"
            );
        }
        info!(
            subnets = report.partitioned,
            interrupted = report.interrupted(),
            "Availability zone partition run complete"
        );
        self.transition(RunState::Succeeded);
        Ok(RunOutcome::Completed(report))
    }

    /// Decide what to undo after a failed installation.
    ///
    /// An ACL that no subnet uses yet is always deleted. Completed rebinds are
    /// only put back when `rollback_on_failure` is set; otherwise the error
    /// carries everything needed to restore them by hand.
    async fn recover_installation(&mut self, failure: InstallFailure) -> PartitionError {
        let recovery = match &failure.injected_acl {
            None => None,
            Some(acl) if failure.installed.is_empty() => {
                let restore_report = RestoreReport::default();
                let cleanup_status = cleanup(&self.plane, acl, &restore_report).await;
                Some(Recovery {
                    restore: restore_report,
                    cleanup: cleanup_status,
                })
            }
            Some(acl) if self.config.settings.rollback_on_failure => {
                warn!(
                    acl = %acl,
                    rebound = failure.installed.len(),
                    "Rolling back partial partition"
                );
                let restore_report = restore(&self.plane, failure.installed.clone()).await;
                let cleanup_status = cleanup(&self.plane, acl, &restore_report).await;
                Some(Recovery {
                    restore: restore_report,
                    cleanup: cleanup_status,
                })
            }
            Some(acl) => {
                error!(
                    acl = %acl,
                    partitioned = ?failure.installed,
                    "Subnets left partitioned; restore each association to its original ACL"
                );
                None
            }
        };

        let err = PartitionError::Installation {
            failure: Box::new(failure),
            recovery,
        };
        if err.is_partial_failure() {
            self.transition(RunState::PartiallyFailed);
        } else {
            self.transition(RunState::Aborted);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PartitionSettings, Settings, TargetConfig};
    use crate::installer::InstallStep;
    use crate::provider::memory::{InMemoryControlPlane, Operation};
    use crate::provider::{
        AclAssociation, AclRuleEntry, AssociationId, ProviderError, RuleAction, Subnet, SubnetId,
        TrafficDirection,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn config(duration: Duration) -> Config {
        Config {
            target: TargetConfig {
                vpc_id: "v1".to_string(),
                availability_zone: "az-1".to_string(),
                region: None,
            },
            partition: PartitionSettings {
                duration,
                ..PartitionSettings::default()
            },
            settings: Settings::default(),
        }
    }

    fn two_subnets() -> InMemoryControlPlane {
        InMemoryControlPlane::new()
            .with_subnet("v1", "az-1", "s1", "acl-orig", "a1")
            .with_subnet("v1", "az-1", "s2", "acl-orig", "a2")
    }

    /// Fires `token` once the `nth` partition rebind has gone through, the way
    /// an operator interrupt would land mid-install.
    struct InterruptAfterRebind {
        inner: InMemoryControlPlane,
        token: CancellationToken,
        nth: usize,
    }

    #[async_trait]
    impl ControlPlane for InterruptAfterRebind {
        async fn describe_subnets(
            &self,
            vpc: &VpcId,
            availability_zone: &str,
        ) -> Result<Vec<Subnet>, ProviderError> {
            self.inner.describe_subnets(vpc, availability_zone).await
        }

        async fn describe_acl_associations(
            &self,
            vpc: &VpcId,
            subnet: &SubnetId,
        ) -> Result<Vec<AclAssociation>, ProviderError> {
            self.inner.describe_acl_associations(vpc, subnet).await
        }

        async fn create_network_acl(&self, vpc: &VpcId) -> Result<AclId, ProviderError> {
            self.inner.create_network_acl(vpc).await
        }

        async fn create_acl_entry(
            &self,
            acl: &AclId,
            entry: &AclRuleEntry,
        ) -> Result<(), ProviderError> {
            self.inner.create_acl_entry(acl, entry).await
        }

        async fn replace_acl_association(
            &self,
            association: &AssociationId,
            acl: &AclId,
        ) -> Result<AssociationId, ProviderError> {
            let result = self.inner.replace_acl_association(association, acl).await;
            if self.inner.call_count(Operation::ReplaceAclAssociation) == self.nth {
                self.token.cancel();
            }
            result
        }

        async fn delete_network_acl(&self, acl: &AclId) -> Result<(), ProviderError> {
            self.inner.delete_network_acl(acl).await
        }
    }

    #[tokio::test]
    async fn test_end_to_end_partition_and_restore() {
        let mut orchestrator = Orchestrator::new(two_subnets(), config(Duration::ZERO));
        let outcome = assert_ok!(orchestrator.run().await);

        let report = match outcome {
            RunOutcome::Completed(report) => report,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(orchestrator.state(), RunState::Succeeded);
        assert_eq!(report.partitioned, 2);
        assert_eq!(report.hold, HoldOutcome::Elapsed);
        assert!(report.restore.is_complete());
        assert_eq!(report.cleanup, CleanupStatus::Deleted);
        assert!(!report.interrupted());

        let plane = orchestrator.control_plane();
        for subnet in ["s1", "s2"] {
            let subnet = SubnetId::from(subnet);
            assert_eq!(plane.acl_for_subnet(&subnet), Some(AclId::from("acl-orig")));
            // Same ACL, different association id
            let association = plane.association_for_subnet(&subnet).unwrap();
            assert!(association.as_str() != "a1" && association.as_str() != "a2");
        }
        assert!(!plane.acl_exists(&report.injected_acl));
        assert_eq!(plane.acl_count(), 1);

        assert_eq!(
            plane.calls(),
            vec![
                Operation::DescribeSubnets,
                Operation::DescribeAclAssociations,
                Operation::DescribeAclAssociations,
                Operation::CreateNetworkAcl,
                Operation::CreateAclEntry,
                Operation::CreateAclEntry,
                Operation::ReplaceAclAssociation,
                Operation::ReplaceAclAssociation,
                Operation::ReplaceAclAssociation,
                Operation::ReplaceAclAssociation,
                Operation::DeleteNetworkAcl,
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_acl_denies_both_directions() {
        let plane = two_subnets().fail_on(Operation::DeleteNetworkAcl, 1);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));
        let outcome = assert_ok!(orchestrator.run().await);

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        // Cleanup failure alone does not fail the run
        assert!(matches!(report.cleanup, CleanupStatus::Failed { .. }));
        assert_eq!(orchestrator.state(), RunState::Succeeded);

        let entries = orchestrator.control_plane().acl_entries(&report.injected_acl);
        assert_eq!(entries.len(), 2);
        for direction in [TrafficDirection::Egress, TrafficDirection::Ingress] {
            let entry = entries.iter().find(|e| e.direction == direction).unwrap();
            assert_eq!(entry.action, RuleAction::Deny);
            assert_eq!(entry.cidr_block, "0.0.0.0/0");
        }
    }

    #[tokio::test]
    async fn test_empty_scope_makes_no_changes() {
        let plane = InMemoryControlPlane::with_zone("v1", "az-2", 3);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));

        let outcome = assert_ok!(orchestrator.run().await);
        assert!(matches!(outcome, RunOutcome::NothingToPartition));
        assert_eq!(orchestrator.state(), RunState::Succeeded);
        assert_eq!(orchestrator.control_plane().mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_makes_no_calls() {
        let mut config = config(Duration::ZERO);
        config.target.availability_zone = String::new();
        let mut orchestrator = Orchestrator::new(two_subnets(), config);

        let err = assert_err!(orchestrator.run().await);
        assert!(matches!(err, PartitionError::Input(_)));
        assert_eq!(orchestrator.state(), RunState::Aborted);
        assert!(orchestrator.control_plane().calls().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts_before_mutation() {
        let plane = two_subnets().fail_on(Operation::DescribeAclAssociations, 2);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));

        let err = assert_err!(orchestrator.run().await);
        assert!(matches!(err, PartitionError::Discovery { .. }));
        assert_eq!(orchestrator.state(), RunState::Aborted);
        assert_eq!(orchestrator.control_plane().mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_returns_plan_only() {
        let mut config = config(Duration::ZERO);
        config.settings.dry_run = true;
        let mut orchestrator = Orchestrator::new(two_subnets(), config);

        let outcome = assert_ok!(orchestrator.run().await);
        let RunOutcome::DryRun { plan } = outcome else {
            panic!("expected a dry run");
        };
        assert_eq!(plan.len(), 2);
        assert!(plan.contains(&"a1".into()));
        assert_eq!(orchestrator.control_plane().mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_install_failure_reports_partial_state() {
        let plane = InMemoryControlPlane::with_zone("v1", "az-1", 4)
            .fail_on(Operation::ReplaceAclAssociation, 3);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));

        let err = assert_err!(orchestrator.run().await);
        assert!(err.is_partial_failure());
        assert_eq!(orchestrator.state(), RunState::PartiallyFailed);

        let PartitionError::Installation { failure, recovery } = err else {
            panic!("expected an installation error");
        };
        assert!(recovery.is_none());
        assert_eq!(failure.installed.len(), 2);
        assert_eq!(failure.failed_subnet(), Some(&SubnetId::from("subnet-az-1-3")));

        // Operator-driven recovery: nothing was touched after the failure
        let plane = orchestrator.control_plane();
        assert_eq!(plane.call_count(Operation::ReplaceAclAssociation), 3);
        assert_eq!(plane.call_count(Operation::DeleteNetworkAcl), 0);
        let acl = failure.injected_acl.clone().unwrap();
        for (association, binding) in &failure.installed {
            assert_eq!(plane.acl_for_subnet(&binding.subnet_id), Some(acl.clone()));
            assert_eq!(
                plane.association_for_subnet(&binding.subnet_id).as_ref(),
                Some(association)
            );
        }
    }

    #[tokio::test]
    async fn test_install_failure_with_rollback() {
        let plane = InMemoryControlPlane::with_zone("v1", "az-1", 3)
            .fail_on(Operation::ReplaceAclAssociation, 2);
        let mut config = config(Duration::ZERO);
        config.settings.rollback_on_failure = true;
        let mut orchestrator = Orchestrator::new(plane, config);

        let err = assert_err!(orchestrator.run().await);
        assert!(!err.is_partial_failure());
        assert_eq!(orchestrator.state(), RunState::Aborted);
        let PartitionError::Installation { failure, recovery } = err else {
            panic!("expected an installation error");
        };
        let recovery = recovery.unwrap();
        assert_eq!(failure.installed.len(), 1);
        assert_eq!(recovery.restore.restored.len(), 1);
        assert_eq!(recovery.cleanup, CleanupStatus::Deleted);

        let plane = orchestrator.control_plane();
        for n in 1..=3 {
            let subnet = SubnetId::from(format!("subnet-az-1-{}", n));
            assert_eq!(plane.acl_for_subnet(&subnet), Some(AclId::from("acl-v1-default")));
        }
        assert_eq!(plane.acl_count(), 1);
    }

    #[tokio::test]
    async fn test_rule_failure_deletes_unused_acl() {
        let plane = two_subnets().fail_on(Operation::CreateAclEntry, 1);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));

        let err = assert_err!(orchestrator.run().await);
        assert!(!err.is_partial_failure());
        assert_eq!(orchestrator.state(), RunState::Aborted);
        let PartitionError::Installation { failure, recovery } = err else {
            panic!("expected an installation error");
        };
        assert!(matches!(failure.step, InstallStep::AddEntry { .. }));
        assert_eq!(recovery.unwrap().cleanup, CleanupStatus::Deleted);
        assert_eq!(orchestrator.control_plane().acl_count(), 1);
        assert_eq!(
            orchestrator
                .control_plane()
                .call_count(Operation::ReplaceAclAssociation),
            0
        );
    }

    #[tokio::test]
    async fn test_restore_failure_is_partial_failure() {
        // Rebinds 1-2 partition, 3-4 restore; the second restore fails.
        let plane = two_subnets().fail_on(Operation::ReplaceAclAssociation, 4);
        let mut orchestrator = Orchestrator::new(plane, config(Duration::ZERO));

        let err = assert_err!(orchestrator.run().await);
        assert!(err.is_partial_failure());
        assert_eq!(orchestrator.state(), RunState::PartiallyFailed);

        let PartitionError::Restoration(report) = err else {
            panic!("expected a restoration error");
        };
        assert_eq!(report.restore.restored.len(), 1);
        assert_eq!(report.restore.failed.len(), 1);
        assert_eq!(report.cleanup, CleanupStatus::Skipped { still_referenced: 1 });
        assert_eq!(
            orchestrator.control_plane().call_count(Operation::DeleteNetworkAcl),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_hold_restores_early() {
        let mut orchestrator = Orchestrator::new(two_subnets(), config(Duration::from_secs(3600)));
        let token = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        let outcome = assert_ok!(orchestrator.run().await);
        assert!(start.elapsed() < Duration::from_secs(3600));

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert!(report.interrupted());
        assert!(matches!(report.hold, HoldOutcome::Cancelled { .. }));
        assert!(report.restore.is_complete());
        assert_eq!(report.cleanup, CleanupStatus::Deleted);
    }

    #[tokio::test]
    async fn test_cancelled_before_install_skips_hold() {
        let token = CancellationToken::new();
        token.cancel();
        let mut orchestrator =
            Orchestrator::new(two_subnets(), config(Duration::from_secs(3600)))
                .with_cancellation(token);

        let outcome = assert_ok!(orchestrator.run().await);
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert_eq!(report.hold, HoldOutcome::Skipped);
        assert_eq!(report.partitioned, 0);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.cleanup, CleanupStatus::Deleted);

        let plane = orchestrator.control_plane();
        assert_eq!(plane.acl_for_subnet(&"s1".into()), Some("acl-orig".into()));
        assert_eq!(plane.call_count(Operation::ReplaceAclAssociation), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_mid_install_restores_rebound_subnets() {
        let token = CancellationToken::new();
        let plane = InterruptAfterRebind {
            inner: InMemoryControlPlane::with_zone("v1", "az-1", 4),
            token: token.clone(),
            nth: 2,
        };
        let mut orchestrator = Orchestrator::new(plane, config(Duration::from_secs(3600)))
            .with_cancellation(token);

        let start = tokio::time::Instant::now();
        let outcome = assert_ok!(orchestrator.run().await);
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(orchestrator.state(), RunState::Succeeded);

        let RunOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert!(report.interrupted());
        assert_eq!(report.hold, HoldOutcome::Skipped);
        assert_eq!(report.partitioned, 2);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.restore.restored.len(), 2);
        assert!(report.restore.is_complete());
        assert_eq!(report.cleanup, CleanupStatus::Deleted);

        let plane = &orchestrator.control_plane().inner;
        // Two partition rebinds, two restores, nothing for the skipped pair
        assert_eq!(plane.call_count(Operation::ReplaceAclAssociation), 4);
        for n in 1..=4 {
            let subnet = SubnetId::from(format!("subnet-az-1-{}", n));
            assert_eq!(plane.acl_for_subnet(&subnet), Some(AclId::from("acl-v1-default")));
        }
        for (association, binding) in &report.skipped {
            assert_eq!(
                plane.association_for_subnet(&binding.subnet_id).as_ref(),
                Some(association)
            );
        }
        assert!(!plane.acl_exists(&report.injected_acl));
        assert_eq!(plane.acl_count(), 1);
    }
}
