use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;

use super::{channel_closed, error_response, AppState};
use crate::models::users::{OnboardUser, UserUpdate};
use crate::services::lifecycle::LifecycleRequest;
use crate::services::projector::ProjectorRequest;

pub async fn onboard_user(
    State(state): State<AppState>,
    Json(params): Json<OnboardUser>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .lifecycle_channel
        .send(LifecycleRequest::Onboard {
            params,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(user)) => (
            StatusCode::CREATED,
            Json(json!({ "message": "User onboarded successfully.", "user": user })),
        ),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

#[derive(Deserialize)]
pub struct ListUsersQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    search: Option<String>,
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .projector_channel
        .send(ProjectorRequest::ListUsers {
            page: query.page.unwrap_or(1),
            limit: query.limit.unwrap_or(10),
            search: query.search,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(page)) => (StatusCode::OK, Json(json!(page))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .projector_channel
        .send(ProjectorRequest::GetUser {
            user_id,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(user)) => (StatusCode::OK, Json(json!({ "user": user }))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(params): Json<UserUpdate>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .lifecycle_channel
        .send(LifecycleRequest::Update {
            user_id,
            params,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(user)) => (
            StatusCode::OK,
            Json(json!({ "message": "User updated successfully.", "user": user })),
        ),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserQuery {
    #[serde(default)]
    deleted_by: Option<String>,
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<DeleteUserQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .lifecycle_channel
        .send(LifecycleRequest::Delete {
            user_id,
            deleted_by: query.deleted_by.unwrap_or_else(|| "admin".to_string()),
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(receipt)) => (
            StatusCode::OK,
            Json(json!({
                "message": "User deleted and balance transferred.",
                "transferredAmountUSD": receipt.transferred_amount_usd,
                "transferredTo": receipt.transferred_to,
            })),
        ),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

pub async fn assign_to_root(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .lifecycle_channel
        .send(LifecycleRequest::AssignToRoot {
            user_id,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(user)) => (
            StatusCode::OK,
            Json(json!({ "message": "User assigned to company root.", "user": user })),
        ),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

#[derive(Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    depth: Option<usize>,
}

pub async fn referral_tree(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<TreeQuery>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .projector_channel
        .send(ProjectorRequest::Subtree {
            user_id,
            depth: query.depth,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(tree)) => (StatusCode::OK, Json(json!(tree))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

pub async fn direct_children(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .projector_channel
        .send(ProjectorRequest::DirectChildren {
            user_id,
            response: tx,
        })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(children)) => (StatusCode::OK, Json(json!({ "children": children }))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}

pub async fn list_deleted_users(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();

    let send_result = state
        .projector_channel
        .send(ProjectorRequest::ListDeleted { response: tx })
        .await;
    if let Err(e) = send_result {
        return channel_closed(e);
    }

    match rx.await {
        Ok(Ok(deleted)) => (StatusCode::OK, Json(json!(deleted))),
        Ok(Err(service_error)) => error_response(service_error),
        Err(e) => channel_closed(e),
    }
}
