//! Availability zone network partition for chaos engineering.
//!
//! Cuts every subnet of one VPC availability zone off the network by moving
//! its network ACL association onto a deny-all ACL, holds the partition, then
//! puts every association back and deletes the injected ACL.
//!
//! # Run stages
//!
//! 1. [`discovery`] - find subnets and checkpoint their current ACLs
//! 2. [`installer`] - create the deny-all ACL and rebind each subnet to it
//! 3. [`hold`] - wait, unless cancelled
//! 4. [`restorer`] - rebind each subnet to its original ACL, delete the injected one
//!
//! [`Orchestrator`] sequences the stages and owns the [`Checkpoint`].
//!
//! # Safety Controls
//!
//! - Association ids are never reused after a rebind
//! - Restoration runs even when the hold is cancelled
//! - The injected ACL is only deleted once nothing references it
//! - Dry run mode
//! - Optional rollback when installation fails part way

pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hold;
pub mod installer;
pub mod orchestrator;
pub mod provider;
pub mod restorer;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use error::PartitionError;
pub use orchestrator::{Orchestrator, RunOutcome, RunState};
pub use provider::ControlPlane;
