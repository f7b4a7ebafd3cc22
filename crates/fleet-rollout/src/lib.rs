//! fleet-rollout: rolling updates of deployments.
//!
//! - [`strategy`]: canary and max-in-flight batch planning
//! - [`controller`]: per-group phase state machine
//! - [`health`]: watching started instances until they run
//! - [`updater`]: bringing one instance up on a (new) VM
//! - [`coordinator`]: the Rolling Update Coordinator
//!
//! ```text
//!   plan ──► coordinator ──► GroupRollout.advance() ──► action
//!                 ▲                                        │
//!                 └──── StepHealth ◄── TaskPool(batch) ◄───┘
//!                                          │
//!                          recompute + publish DNS after each step
//! ```

pub mod controller;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod strategy;
pub mod updater;

pub use controller::{BatchAction, GroupChanges, GroupRollout, RolloutPhase, StepHealth};
pub use coordinator::{DeployOptions, DeployReport, GroupReport, RollingUpdateCoordinator};
pub use error::{RolloutError, RolloutResult};
pub use strategy::{Batch, BatchKind, UpdateConfig, plan_batches};
pub use updater::{InstanceUpdater, UpdateRequest};
