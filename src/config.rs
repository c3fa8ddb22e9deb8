//! Configuration types for an availability zone partition run.

use crate::error::PartitionError;
use crate::provider::{AclRuleEntry, TrafficDirection, DEFAULT_RULE_NUMBER};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for a partition run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// What to partition.
    pub target: TargetConfig,
    /// How to partition it.
    pub partition: PartitionSettings,
    /// Run behaviour.
    pub settings: Settings,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// Not validated here: the command line may still fill in the target.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PartitionError> {
        self.target.validate()?;
        self.partition.validate()
    }
}

/// The VPC and availability zone to partition.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    pub vpc_id: String,
    pub availability_zone: String,
    /// Falls back to the ambient AWS configuration.
    pub region: Option<String>,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.vpc_id.trim().is_empty() {
            return Err(PartitionError::input("vpc id is required"));
        }
        if self.availability_zone.trim().is_empty() {
            return Err(PartitionError::input("availability zone is required"));
        }
        if self.region.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(PartitionError::input("region cannot be blank"));
        }
        Ok(())
    }
}

/// Longest hold accepted.
pub const MAX_HOLD_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Partition ACL shape and hold time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PartitionSettings {
    /// How long the partition is held.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Rule number of the egress deny entry.
    pub egress_rule_number: u16,
    /// Rule number of the ingress deny entry.
    pub ingress_rule_number: u16,
    /// Traffic blocked in both directions.
    pub cidr_block: String,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            egress_rule_number: 100,
            ingress_rule_number: 101,
            cidr_block: "0.0.0.0/0".to_string(),
        }
    }
}

impl PartitionSettings {
    pub fn validate(&self) -> Result<(), PartitionError> {
        if self.duration > MAX_HOLD_DURATION {
            return Err(PartitionError::input(format!(
                "duration {} exceeds the maximum of {}",
                humantime::format_duration(self.duration),
                humantime::format_duration(MAX_HOLD_DURATION)
            )));
        }

        for (direction, number) in [
            (TrafficDirection::Egress, self.egress_rule_number),
            (TrafficDirection::Ingress, self.ingress_rule_number),
        ] {
            if number == 0 || number >= DEFAULT_RULE_NUMBER {
                return Err(PartitionError::input(format!(
                    "{} rule number must be between 1 and {}, got {}",
                    direction,
                    DEFAULT_RULE_NUMBER - 1,
                    number
                )));
            }
        }

        if self.egress_rule_number == self.ingress_rule_number {
            return Err(PartitionError::input(format!(
                "egress and ingress rule numbers must differ, both are {}",
                self.egress_rule_number
            )));
        }

        if !is_ipv4_cidr(&self.cidr_block) {
            return Err(PartitionError::input(format!(
                "invalid IPv4 CIDR block '{}'",
                self.cidr_block
            )));
        }

        Ok(())
    }

    /// The egress and ingress deny entries, in install order.
    pub fn deny_rules(&self) -> Vec<AclRuleEntry> {
        vec![
            AclRuleEntry::deny_all(
                TrafficDirection::Egress,
                self.egress_rule_number,
                &self.cidr_block,
            ),
            AclRuleEntry::deny_all(
                TrafficDirection::Ingress,
                self.ingress_rule_number,
                &self.cidr_block,
            ),
        ]
    }
}

fn is_ipv4_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

/// Run behaviour.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Discover and report the plan without touching any ACL.
    pub dry_run: bool,
    /// Put back completed rebinds when installation fails part way.
    pub rollback_on_failure: bool,
}
