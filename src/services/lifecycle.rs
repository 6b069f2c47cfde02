use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::placement::{sponsor_full, PlacementResolver};
use super::{RequestHandler, Service, ServiceError};
use crate::models::archive::DeletionReceipt;
use crate::models::users::{Genealogy, OnboardUser, User, UserStatus, UserUpdate, UserView};
use crate::repositories::tree::{StoreError, TreeStore};

pub enum LifecycleRequest {
    Onboard {
        params: OnboardUser,
        response: oneshot::Sender<Result<UserView, ServiceError>>,
    },
    Update {
        user_id: String,
        params: UserUpdate,
        response: oneshot::Sender<Result<UserView, ServiceError>>,
    },
    AssignToRoot {
        user_id: String,
        response: oneshot::Sender<Result<UserView, ServiceError>>,
    },
    Delete {
        user_id: String,
        deleted_by: String,
        response: oneshot::Sender<Result<DeletionReceipt, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct LifecycleRequestHandler {
    store: Arc<TreeStore>,
    resolver: PlacementResolver,
}

impl LifecycleRequestHandler {
    pub fn new(store: Arc<TreeStore>) -> Self {
        let resolver = PlacementResolver::new(store.clone());

        LifecycleRequestHandler { store, resolver }
    }

    async fn onboard(&self, params: OnboardUser) -> Result<UserView, ServiceError> {
        let full_name = validate_full_name(&params.full_name)?;
        let email = validate_email(&params.email)?;
        let package_usd = params.package_usd.unwrap_or(0.0);
        if !package_usd.is_finite() || package_usd < 0.0 {
            return Err(ServiceError::Validation(
                "packageUSD must be non-negative".to_string(),
            ));
        }

        let slot = self.resolver.resolve(
            params.sponsor_id.as_deref(),
            params.placement_designee_id.as_deref(),
        )?;

        let now = Utc::now();
        let user = User {
            user_id: Uuid::new_v4().hyphenated().to_string(),
            full_name,
            email,
            phone: normalize_optional(params.phone),
            genealogy: Some(Genealogy {
                placement: slot.parent_id,
                sponsorship: slot.sponsor_id,
            }),
            package_usd,
            status: UserStatus::Active,
            referral_code: self.generate_referral_code(),
            date_joined: params.date_joined.unwrap_or_else(|| now.date_naive()),
            created_at: now,
            updated_at: now,
        };

        // The capacity re-check inside the insert is the authoritative one;
        // a racing onboard may have filled the parent since resolution. No
        // partial record is left behind in that case.
        match self.store.insert_user(user.clone()) {
            Ok(()) => {
                log::info!(
                    "Onboarded user {} under {} (sponsor {}).",
                    user.user_id,
                    user.parent_id().unwrap_or_default(),
                    user.sponsor_id().unwrap_or_default(),
                );
                Ok(UserView::from(&user))
            }
            Err(StoreError::ParentFull(parent_id)) => Err(sponsor_full(&self.store, &parent_id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, user_id: &str, params: UserUpdate) -> Result<UserView, ServiceError> {
        let user = self.store.get_user(user_id)?;
        if user.is_root() {
            return Err(ServiceError::RootImmutable);
        }
        if params.is_empty() {
            return Err(ServiceError::Validation(
                "at least one field must be supplied".to_string(),
            ));
        }

        let full_name = match &params.full_name {
            Some(name) => Some(validate_full_name(name)?),
            None => None,
        };
        if let Some(sponsor_id) = &params.original_sponsor_id {
            if sponsor_id.trim().is_empty() {
                return Err(ServiceError::Validation(
                    "originalSponsorId cannot be empty".to_string(),
                ));
            }
            if sponsor_id == user_id {
                return Err(ServiceError::Validation(
                    "a user cannot sponsor themselves".to_string(),
                ));
            }
            if !self.store.contains(sponsor_id) {
                return Err(ServiceError::NotFound(sponsor_id.clone()));
            }
        }

        if let Some(parent_id) = &params.parent_id {
            if parent_id.trim().is_empty() {
                return Err(ServiceError::Validation(
                    "parentId cannot be empty".to_string(),
                ));
            }
            if user.parent_id() != Some(parent_id.as_str()) {
                // Re-parenting is for leaves only; detach the subtree first.
                if self.store.child_count(user_id)? > 0 {
                    return Err(ServiceError::HasChildren(user_id.to_string()));
                }
                match self.store.set_parent(user_id, parent_id) {
                    Ok(()) => {}
                    Err(StoreError::ParentFull(p)) => return Err(sponsor_full(&self.store, &p)),
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let updated = self.store.update_user(user_id, |u| {
            if let Some(name) = full_name {
                u.full_name = name;
            }
            if let Some(phone) = params.phone {
                // Explicit empty string clears the phone; absent leaves it.
                u.phone = normalize_optional(Some(phone));
            }
            if let Some(sponsor_id) = params.original_sponsor_id {
                if let Some(genealogy) = u.genealogy.as_mut() {
                    genealogy.sponsorship = sponsor_id;
                }
            }
        })?;

        log::info!("Updated user {}.", user_id);
        Ok(UserView::from(&updated))
    }

    async fn assign_to_root(&self, user_id: &str) -> Result<UserView, ServiceError> {
        let user = self.store.get_user(user_id)?;
        if user.is_root() {
            return Err(ServiceError::RootImmutable);
        }
        if self.store.child_count(user_id)? > 0 {
            return Err(ServiceError::HasChildren(user_id.to_string()));
        }

        let root_id = self.store.root_id().to_string();
        self.store.set_parent(user_id, &root_id)?;
        log::warn!("User {} re-parented directly to the company root.", user_id);

        let user = self.store.get_user(user_id)?;
        Ok(UserView::from(&user))
    }

    async fn delete(
        &self,
        user_id: &str,
        deleted_by: &str,
    ) -> Result<DeletionReceipt, ServiceError> {
        let receipt = self.store.remove_node(user_id, deleted_by)?;
        log::info!(
            "Deleted user {}; transferred {} USD to {}.",
            user_id,
            receipt.transferred_amount_usd,
            receipt.transferred_to,
        );
        Ok(receipt)
    }

    fn generate_referral_code(&self) -> String {
        loop {
            let token = Uuid::new_v4().simple().to_string();
            let code = format!("SGX-{}", token[..8].to_uppercase());
            if !self.store.referral_code_taken(&code) {
                return code;
            }
        }
    }
}

fn validate_full_name(full_name: &str) -> Result<String, ServiceError> {
    let trimmed = full_name.trim();
    if trimmed.chars().count() < 2 {
        return Err(ServiceError::Validation(
            "full name must be at least 2 characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn validate_email(email: &str) -> Result<String, ServiceError> {
    let trimmed = email.trim();
    let valid = match trimmed.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains("..")
        }
        None => false,
    };
    if !valid {
        return Err(ServiceError::Validation(format!(
            "invalid email address: {}",
            trimmed
        )));
    }
    Ok(trimmed.to_string())
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl RequestHandler<LifecycleRequest> for LifecycleRequestHandler {
    async fn handle_request(&self, request: LifecycleRequest) {
        match request {
            LifecycleRequest::Onboard { params, response } => {
                let result = self.onboard(params).await;
                let _ = response.send(result);
            }
            LifecycleRequest::Update {
                user_id,
                params,
                response,
            } => {
                let result = self.update(&user_id, params).await;
                let _ = response.send(result);
            }
            LifecycleRequest::AssignToRoot { user_id, response } => {
                let result = self.assign_to_root(&user_id).await;
                let _ = response.send(result);
            }
            LifecycleRequest::Delete {
                user_id,
                deleted_by,
                response,
            } => {
                let result = self.delete(&user_id, &deleted_by).await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct LifecycleService;

impl LifecycleService {
    pub fn new() -> Self {
        LifecycleService {}
    }
}

#[async_trait]
impl Service<LifecycleRequest, LifecycleRequestHandler> for LifecycleService {}
