//! fleet-dns: local DNS for the fleet.
//!
//! Every live instance with an identity owns exactly one DNS row. Rows are
//! recomputed from the instance set on every topology change, persisted as
//! a delete-before-insert delta under a single global version, and pushed
//! to the deployment's agents.
//!
//! # Architecture
//!
//! ```text
//!   instances ──► record specs ──► diff vs. stored rows ──► apply_dns_delta
//!                 (canonical)                                 (one txn)
//!                                                                │
//!   agents ◄── TaskPool ◄── LocalDnsRecords (version, rows) ◄────┘
//! ```

pub mod canonical;
pub mod error;
pub mod records;
pub mod synchronizer;

pub use canonical::Canonicalizer;
pub use error::{DnsError, DnsResult};
pub use records::{DnsSettings, RecordBuilder, hostname, index_hostname};
pub use synchronizer::{DeploymentRecords, DnsSynchronizer, PublishReport};
