use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::users::DirectChild;
use crate::repositories::tree::{StoreError, TreeStore};
use crate::settings::Settings;

pub mod http;
pub mod lifecycle;
pub mod placement;
pub mod projector;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("sponsor {sponsor_id} already has {capacity} direct children; supply a placement designee")]
    SponsorFull {
        sponsor_id: String,
        capacity: usize,
        direct_children: Vec<DirectChild>,
    },
    #[error("designee {0} is not an active direct child of the sponsor")]
    InvalidDesignee(String),
    #[error("user {0} still has direct children")]
    HasChildren(String),
    #[error("moving {user_id} under {parent_id} would create a cycle")]
    CycleDetected { user_id: String, parent_id: String },
    #[error("the company root cannot be modified or deleted")]
    RootImmutable,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::HasChildren(id) => ServiceError::HasChildren(id),
            StoreError::CycleDetected { user_id, parent_id } => {
                ServiceError::CycleDetected { user_id, parent_id }
            }
            StoreError::RootImmutable => ServiceError::RootImmutable,
            // Full parents are re-reported through placement::sponsor_full
            // where the designee context is known; reaching this arm means
            // the caller did not expect capacity to matter.
            StoreError::ParentFull(id) => ServiceError::SponsorFull {
                sponsor_id: id,
                capacity: 0,
                direct_children: Vec::new(),
            },
            StoreError::AlreadyExists(id) => {
                ServiceError::Internal(format!("duplicate user id: {}", id))
            }
            StoreError::AncestryTooDeep(id) => {
                ServiceError::Internal(format!("corrupted parent chain at: {}", id))
            }
        }
    }
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

pub async fn start_services(settings: Settings) -> Result<(), anyhow::Error> {
    let store = Arc::new(TreeStore::new(&settings.tree));
    log::info!(
        "Seeded referral tree with root sentinel {} (capacity {}).",
        store.root_id(),
        store.capacity()
    );

    let (lifecycle_tx, mut lifecycle_rx) = mpsc::channel(512);
    let (projector_tx, mut projector_rx) = mpsc::channel(512);

    let mut lifecycle_service = lifecycle::LifecycleService::new();
    let mut projector_service = projector::ProjectorService::new();

    log::info!("Starting lifecycle service.");
    let lifecycle_store = store.clone();
    tokio::spawn(async move {
        lifecycle_service
            .run(
                lifecycle::LifecycleRequestHandler::new(lifecycle_store),
                &mut lifecycle_rx,
            )
            .await;
    });

    log::info!("Starting projector service.");
    let projector_store = store.clone();
    let max_depth = settings.tree.max_depth;
    tokio::spawn(async move {
        projector_service
            .run(
                projector::ProjectorRequestHandler::new(projector_store, max_depth),
                &mut projector_rx,
            )
            .await;
    });

    log::info!("Starting HTTP server.");
    http::start_http_server(&settings.server.listen, lifecycle_tx, projector_tx).await
}
