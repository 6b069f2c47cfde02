use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::lifecycle::LifecycleRequest;
use super::projector::ProjectorRequest;
use super::ServiceError;

mod users;

#[derive(Clone)]
pub struct AppState {
    lifecycle_channel: mpsc::Sender<LifecycleRequest>,
    projector_channel: mpsc::Sender<ProjectorRequest>,
}

/// Maps the domain error taxonomy onto HTTP. `SponsorFull` keeps its
/// recoverable shape: the body carries the sponsor's direct children so the
/// client can run the designee-selection flow and retry.
fn error_response(err: ServiceError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::SponsorFull { .. }
        | ServiceError::HasChildren(_)
        | ServiceError::CycleDetected { .. } => StatusCode::CONFLICT,
        ServiceError::InvalidDesignee(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServiceError::RootImmutable => StatusCode::FORBIDDEN,
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = match &err {
        ServiceError::SponsorFull {
            sponsor_id,
            capacity,
            direct_children,
        } => json!({
            "message": err.to_string(),
            "sponsorId": sponsor_id,
            "capacity": capacity,
            "directChildren": direct_children,
        }),
        _ => json!({ "message": err.to_string() }),
    };

    (status, Json(body))
}

fn channel_closed<E: std::fmt::Display>(err: E) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": format!("Failed to process request: {}", err) })),
    )
}

pub async fn start_http_server(
    listen: &str,
    lifecycle_channel: mpsc::Sender<LifecycleRequest>,
    projector_channel: mpsc::Sender<ProjectorRequest>,
) -> Result<(), anyhow::Error> {
    let app_state = AppState {
        lifecycle_channel,
        projector_channel,
    };

    let app = Router::new()
        .route("/api/v1/admin/onboard", post(users::onboard_user))
        .route("/api/v1/admin/users", get(users::list_users))
        .route("/api/v1/admin/users/deleted", get(users::list_deleted_users))
        .route(
            "/api/v1/admin/users/{user_id}",
            get(users::get_user)
                .put(users::update_user)
                .delete(users::delete_user),
        )
        .route(
            "/api/v1/admin/users/{user_id}/assign-to-root",
            post(users::assign_to_root),
        )
        .route("/api/v1/admin/users/{user_id}/tree", get(users::referral_tree))
        .route(
            "/api/v1/admin/users/{user_id}/direct-children",
            get(users::direct_children),
        )
        .route("/health", get(|| async { "OK" }))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
