use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::models::archive::DeletedUser;
use crate::models::users::{
    DirectChild, Pagination, ParentNode, ReferralTree, UserPage, UserView,
};
use crate::repositories::tree::TreeStore;

const DEFAULT_PAGE_LIMIT: usize = 10;
const MAX_PAGE_LIMIT: usize = 100;

pub enum ProjectorRequest {
    GetUser {
        user_id: String,
        response: oneshot::Sender<Result<UserView, ServiceError>>,
    },
    Subtree {
        user_id: String,
        depth: Option<usize>,
        response: oneshot::Sender<Result<ReferralTree, ServiceError>>,
    },
    DirectChildren {
        user_id: String,
        response: oneshot::Sender<Result<Vec<DirectChild>, ServiceError>>,
    },
    ListUsers {
        page: usize,
        limit: usize,
        search: Option<String>,
        response: oneshot::Sender<Result<UserPage, ServiceError>>,
    },
    ListDeleted {
        response: oneshot::Sender<Result<Vec<DeletedUser>, ServiceError>>,
    },
}

/// Read-only views over the tree for the admin UI. Never mutates.
#[derive(Clone)]
pub struct ProjectorRequestHandler {
    store: Arc<TreeStore>,
    max_depth: usize,
}

impl ProjectorRequestHandler {
    pub fn new(store: Arc<TreeStore>, max_depth: usize) -> Self {
        ProjectorRequestHandler { store, max_depth }
    }

    async fn get_user(&self, user_id: &str) -> Result<UserView, ServiceError> {
        let user = self.store.get_user(user_id)?;
        Ok(UserView::from(&user))
    }

    async fn subtree(
        &self,
        user_id: &str,
        depth: Option<usize>,
    ) -> Result<ReferralTree, ServiceError> {
        let depth = depth.unwrap_or(self.max_depth).min(self.max_depth);
        let tree = self.store.get_subtree(user_id, depth)?;
        let parent = self.parent_of(user_id).await?;
        Ok(ReferralTree { tree, parent })
    }

    async fn direct_children(&self, user_id: &str) -> Result<Vec<DirectChild>, ServiceError> {
        let children = self
            .store
            .get_children(user_id)?
            .iter()
            .filter_map(|id| self.store.get_user(id).ok())
            .map(|user| DirectChild {
                user_id: user.user_id,
                full_name: user.full_name,
            })
            .collect();
        Ok(children)
    }

    /// Single-hop placement lookup, rendered as parent context next to a
    /// subtree view.
    async fn parent_of(&self, user_id: &str) -> Result<Option<ParentNode>, ServiceError> {
        let parent = self.store.get_ancestor(user_id)?.map(|p| ParentNode {
            user_id: p.user_id,
            full_name: p.full_name,
        });
        Ok(parent)
    }

    async fn list_users(
        &self,
        page: usize,
        limit: usize,
        search: Option<&str>,
    ) -> Result<UserPage, ServiceError> {
        let limit = if limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        };
        let page = page.max(1);

        let needle = search.map(str::to_lowercase).filter(|s| !s.is_empty());
        let mut users = self.store.list_users();
        if let Some(needle) = &needle {
            users.retain(|u| {
                u.user_id.to_lowercase().contains(needle)
                    || u.full_name.to_lowercase().contains(needle)
                    || u.email.to_lowercase().contains(needle)
            });
        }
        users.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        let total_users = users.len();
        let total_pages = total_users.div_ceil(limit);
        let views = users
            .iter()
            .skip((page - 1) * limit)
            .take(limit)
            .map(UserView::from)
            .collect();

        Ok(UserPage {
            users: views,
            pagination: Pagination {
                current_page: page,
                total_pages,
                total_users,
            },
        })
    }

    async fn list_deleted(&self) -> Result<Vec<DeletedUser>, ServiceError> {
        Ok(self.store.list_deleted())
    }
}

#[async_trait]
impl RequestHandler<ProjectorRequest> for ProjectorRequestHandler {
    async fn handle_request(&self, request: ProjectorRequest) {
        match request {
            ProjectorRequest::GetUser { user_id, response } => {
                let result = self.get_user(&user_id).await;
                let _ = response.send(result);
            }
            ProjectorRequest::Subtree {
                user_id,
                depth,
                response,
            } => {
                let result = self.subtree(&user_id, depth).await;
                let _ = response.send(result);
            }
            ProjectorRequest::DirectChildren { user_id, response } => {
                let result = self.direct_children(&user_id).await;
                let _ = response.send(result);
            }
            ProjectorRequest::ListUsers {
                page,
                limit,
                search,
                response,
            } => {
                let result = self.list_users(page, limit, search.as_deref()).await;
                let _ = response.send(result);
            }
            ProjectorRequest::ListDeleted { response } => {
                let result = self.list_deleted().await;
                let _ = response.send(result);
            }
        }
    }
}

pub struct ProjectorService;

impl ProjectorService {
    pub fn new() -> Self {
        ProjectorService {}
    }
}

#[async_trait]
impl Service<ProjectorRequest, ProjectorRequestHandler> for ProjectorService {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::users::{Genealogy, User, UserStatus};
    use crate::settings;
    use chrono::Utc;

    fn seeded() -> ProjectorRequestHandler {
        let store = Arc::new(TreeStore::new(&settings::Tree {
            capacity: 6,
            max_depth: 5,
            root_id: "SAGENEX-GOLD".to_string(),
            root_name: "Sagenex Gold".to_string(),
        }));
        for (id, parent) in [("a", "SAGENEX-GOLD"), ("b", "SAGENEX-GOLD"), ("c", "a")] {
            let now = Utc::now();
            store
                .insert_user(User {
                    user_id: id.to_string(),
                    full_name: format!("User {}", id.to_uppercase()),
                    email: format!("{}@example.com", id),
                    phone: None,
                    genealogy: Some(Genealogy {
                        placement: parent.to_string(),
                        sponsorship: parent.to_string(),
                    }),
                    package_usd: 100.0,
                    status: UserStatus::Active,
                    referral_code: format!("SGX-{}", id),
                    date_joined: now.date_naive(),
                    created_at: now,
                    updated_at: now,
                })
                .unwrap();
        }
        ProjectorRequestHandler::new(store, 5)
    }

    #[tokio::test]
    async fn subtree_includes_parent_context() {
        let handler = seeded();
        let view = handler.subtree("a", Some(1)).await.unwrap();
        assert_eq!(view.tree.user_id, "a");
        assert_eq!(view.tree.children.len(), 1);
        assert_eq!(view.parent.unwrap().user_id, "SAGENEX-GOLD");

        let root_view = handler.subtree("SAGENEX-GOLD", Some(1)).await.unwrap();
        assert!(root_view.parent.is_none());
        let mut frontline: Vec<_> = root_view
            .tree
            .children
            .iter()
            .map(|c| c.user_id.as_str())
            .collect();
        frontline.sort();
        assert_eq!(frontline, vec!["a", "b"]);
        assert!(root_view.tree.children.iter().all(|c| c.children.is_empty()));
    }

    #[tokio::test]
    async fn subtree_depth_is_clamped_to_settings() {
        let handler = seeded();
        let view = handler.subtree("SAGENEX-GOLD", Some(50)).await.unwrap();
        // depth 5 still reaches everything in this small tree
        let a = view
            .tree
            .children
            .iter()
            .find(|c| c.user_id == "a")
            .unwrap();
        assert_eq!(a.children[0].user_id, "c");
    }

    #[tokio::test]
    async fn direct_children_lists_names_for_designee_selection() {
        let handler = seeded();
        let children = handler.direct_children("a").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].user_id, "c");
        assert_eq!(children[0].full_name, "User C");

        let err = handler.direct_children("ghost").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_users_searches_and_paginates() {
        let handler = seeded();

        let page = handler.list_users(1, 2, None).await.unwrap();
        assert_eq!(page.users.len(), 2);
        assert_eq!(page.pagination.total_users, 3);
        assert_eq!(page.pagination.total_pages, 2);
        // the root sentinel is not a listable user
        assert!(page.users.iter().all(|u| u.user_id != "SAGENEX-GOLD"));

        let second = handler.list_users(2, 2, None).await.unwrap();
        assert_eq!(second.users.len(), 1);

        let found = handler.list_users(1, 10, Some("user c")).await.unwrap();
        assert_eq!(found.users.len(), 1);
        assert_eq!(found.users[0].user_id, "c");
    }

    #[tokio::test]
    async fn parent_of_is_single_hop() {
        let handler = seeded();
        assert_eq!(handler.parent_of("c").await.unwrap().unwrap().user_id, "a");
        assert!(handler.parent_of("SAGENEX-GOLD").await.unwrap().is_none());
    }
}
