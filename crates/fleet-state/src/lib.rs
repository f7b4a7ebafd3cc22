//! fleet-state: inventory store for the fleet director.
//!
//! Backed by [redb](https://docs.rs/redb), holds deployments, instances,
//! VMs, the shared stemcell/release join tables, deployment properties,
//! IP reservations, local DNS records and cloud-check problems.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment}:{id}`, `{deployment}|{resource}`) enable
//! prefix scans for everything a deployment owns or references.
//!
//! Multi-row invariants are enforced inside a single write transaction:
//! redb serializes writers, so the DNS version counter and the record-id
//! sequence never race, and an aborted transaction commits nothing.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_secs};
pub use types::*;
