use crate::errors::DarwinResult;
use crate::patch::Patch;
use crate::resource::{ClassifiedResource, ResourceRole};
use crate::store::MigrationStore;
use std::sync::Arc;

/// Turns classified resources into patches of a component.
#[derive(Clone)]
pub struct PatchCatalog {
    store: Arc<dyn MigrationStore>,
}

impl PatchCatalog {
    pub fn new(store: Arc<dyn MigrationStore>) -> PatchCatalog {
        PatchCatalog { store }
    }

    /// Patches for the resources playing `role`, in input order.
    ///
    /// Evolve patches of a component that already has recorded patches are
    /// hydrated from the store (inserted when missing); every other patch is
    /// virtual. `bookkeeping` tells whether the bookkeeping tables exist.
    pub fn patches(
        &self,
        resources: &[ClassifiedResource],
        component: &str,
        platform: &str,
        role: ResourceRole,
        bookkeeping: bool,
    ) -> DarwinResult<Vec<Patch>> {
        let persist =
            bookkeeping && role == ResourceRole::Evolve && self.store.has_any_patch(component)?;

        resources
            .iter()
            .filter(|resource| resource.role() == role && resource.platform() == platform)
            .map(|resource| {
                let patch = Patch::from_resource(resource, component)?;
                if persist {
                    self.store.insert_or_fetch_patch(&patch)
                } else {
                    Ok(patch)
                }
            })
            .collect()
    }
}
