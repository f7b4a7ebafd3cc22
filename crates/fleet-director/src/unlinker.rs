//! Resource Unlinker.
//!
//! Detaches a deployment from the stemcells and release versions it uses.
//! The shared resources themselves are never deleted here; a resource no
//! deployment references any more stays until it is cleaned up explicitly.

use fleet_state::StateStore;
use tracing::debug;

use crate::error::DirectorResult;

/// Keys that were unlinked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlinkReport {
    pub stemcells: Vec<String>,
    pub release_versions: Vec<String>,
}

#[derive(Clone)]
pub struct ResourceUnlinker {
    store: StateStore,
}

impl ResourceUnlinker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn unlink(&self, deployment: &str) -> DirectorResult<UnlinkReport> {
        let stemcells = self.store.unlink_stemcells(deployment)?;
        for key in &stemcells {
            debug!(%deployment, stemcell = %key, "stemcell unlinked");
        }
        let release_versions = self.store.unlink_release_versions(deployment)?;
        for key in &release_versions {
            debug!(%deployment, release = %key, "release version unlinked");
        }
        Ok(UnlinkReport {
            stemcells,
            release_versions,
        })
    }
}
