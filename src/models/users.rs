use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
}

/// Placement vs sponsorship for a non-root user. The two ids differ exactly
/// when the user was spilled over under a designee, so "split sponsor" is a
/// derivation, never a stored flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Genealogy {
    /// Parent in the structural tree (`parentId`).
    pub placement: String,
    /// User credited with the referral (`originalSponsorId`).
    pub sponsorship: String,
}

impl Genealogy {
    pub fn is_split_sponsor(&self) -> bool {
        self.placement != self.sponsorship
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub user_id: String,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    /// `None` only for the company root sentinel.
    pub genealogy: Option<Genealogy>,
    pub package_usd: f64,
    pub status: UserStatus,
    pub referral_code: String,
    pub date_joined: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn parent_id(&self) -> Option<&str> {
        self.genealogy.as_ref().map(|g| g.placement.as_str())
    }

    pub fn sponsor_id(&self) -> Option<&str> {
        self.genealogy.as_ref().map(|g| g.sponsorship.as_str())
    }

    pub fn is_split_sponsor(&self) -> bool {
        self.genealogy
            .as_ref()
            .map(Genealogy::is_split_sponsor)
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, UserStatus::Active)
    }

    pub fn is_root(&self) -> bool {
        self.genealogy.is_none()
    }
}

/// Wire shape of a user, matching the admin API contract.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub user_id: String,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub parent_id: Option<String>,
    pub original_sponsor_id: Option<String>,
    pub is_split_sponsor: bool,
    #[serde(rename = "packageUSD")]
    pub package_usd: f64,
    pub status: UserStatus,
    pub referral_code: String,
    pub date_joined: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        UserView {
            user_id: user.user_id.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            parent_id: user.parent_id().map(str::to_string),
            original_sponsor_id: user.sponsor_id().map(str::to_string),
            is_split_sponsor: user.is_split_sponsor(),
            package_usd: user.package_usd,
            status: user.status,
            referral_code: user.referral_code.clone(),
            date_joined: user.date_joined,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUser {
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub sponsor_id: Option<String>,
    #[serde(default, rename = "packageUSD")]
    pub package_usd: Option<f64>,
    #[serde(default)]
    pub date_joined: Option<NaiveDate>,
    #[serde(default)]
    pub placement_designee_id: Option<String>,
}

/// Partial update. Absent fields are left unchanged; an explicit empty
/// string clears the field where clearing makes sense (phone).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub parent_id: Option<String>,
    pub original_sponsor_id: Option<String>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.phone.is_none()
            && self.parent_id.is_none()
            && self.original_sponsor_id.is_none()
    }
}

/// One node of a materialized subtree view.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNode {
    pub user_id: String,
    pub full_name: String,
    #[serde(rename = "packageUSD")]
    pub package_usd: f64,
    #[serde(skip_serializing_if = "is_false")]
    pub is_split_sponsor: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_sponsor_id: Option<String>,
    pub children: Vec<UserNode>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentNode {
    pub user_id: String,
    pub full_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectChild {
    pub user_id: String,
    pub full_name: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralTree {
    pub tree: UserNode,
    pub parent: Option<ParentNode>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub total_users: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPage {
    pub users: Vec<UserView>,
    pub pagination: Pagination,
}
