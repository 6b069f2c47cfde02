use std::sync::Arc;

use super::ServiceError;
use crate::models::users::DirectChild;
use crate::repositories::tree::TreeStore;

/// The resolved placement edge for a new user: where the user goes in the
/// tree and who gets referral credit. The two differ exactly on spillover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementSlot {
    pub parent_id: String,
    pub sponsor_id: String,
}

/// Decides the actual placement parent for a requested sponsor, enforcing
/// the per-edge capacity cap. Never auto-selects a designee: when the
/// sponsor is full and none was supplied, the error carries the sponsor's
/// direct children so the caller can choose one and retry.
#[derive(Clone)]
pub struct PlacementResolver {
    store: Arc<TreeStore>,
}

impl PlacementResolver {
    pub fn new(store: Arc<TreeStore>) -> Self {
        PlacementResolver { store }
    }

    pub fn resolve(
        &self,
        sponsor_id: Option<&str>,
        designee_id: Option<&str>,
    ) -> Result<PlacementSlot, ServiceError> {
        let root = self.store.root_id();
        let sponsor_id = match sponsor_id {
            Some(id) => id,
            None => {
                return Ok(PlacementSlot {
                    parent_id: root.to_string(),
                    sponsor_id: root.to_string(),
                })
            }
        };

        if !self.store.contains(sponsor_id) {
            return Err(ServiceError::NotFound(sponsor_id.to_string()));
        }

        let count = self.store.child_count(sponsor_id)?;
        if sponsor_id == root || count < self.store.capacity() {
            return Ok(PlacementSlot {
                parent_id: sponsor_id.to_string(),
                sponsor_id: sponsor_id.to_string(),
            });
        }

        match designee_id {
            None => Err(sponsor_full(&self.store, sponsor_id)),
            Some(designee_id) => {
                let children = self.store.get_children(sponsor_id)?;
                if !children.iter().any(|c| c == designee_id) {
                    return Err(ServiceError::InvalidDesignee(designee_id.to_string()));
                }
                let designee = self.store.get_user(designee_id)?;
                if !designee.is_active() {
                    return Err(ServiceError::InvalidDesignee(designee_id.to_string()));
                }
                // A designee that is itself at capacity is accepted here;
                // the cap is per-edge and the atomic insert enforces it.
                Ok(PlacementSlot {
                    parent_id: designee_id.to_string(),
                    sponsor_id: sponsor_id.to_string(),
                })
            }
        }
    }
}

/// Builds the recoverable capacity error, listing the parent's direct
/// children for the designee-selection retry flow.
pub fn sponsor_full(store: &TreeStore, sponsor_id: &str) -> ServiceError {
    let direct_children = store
        .get_children(sponsor_id)
        .unwrap_or_default()
        .iter()
        .filter_map(|id| store.get_user(id).ok())
        .map(|user| DirectChild {
            user_id: user.user_id,
            full_name: user.full_name,
        })
        .collect();

    ServiceError::SponsorFull {
        sponsor_id: sponsor_id.to_string(),
        capacity: store.capacity(),
        direct_children,
    }
}
