use chrono::{DateTime, Utc};
use serde::Serialize;

use super::users::{User, UserView};

/// Audit record kept after a user is excised from the tree. Same shape as
/// the live user plus the deletion metadata; no longer addressable as an
/// active node.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedUser {
    #[serde(flatten)]
    pub user: UserView,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    #[serde(rename = "transferredAmountUSD")]
    pub transferred_amount_usd: f64,
}

impl DeletedUser {
    pub fn new(user: &User, deleted_by: String, transferred_amount_usd: f64) -> Self {
        DeletedUser {
            user: UserView::from(user),
            deleted_at: Utc::now(),
            deleted_by,
            transferred_amount_usd,
        }
    }
}

/// Returned by a successful delete.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReceipt {
    pub user_id: String,
    #[serde(rename = "transferredAmountUSD")]
    pub transferred_amount_usd: f64,
    pub transferred_to: String,
}
