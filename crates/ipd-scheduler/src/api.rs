//! Admin JSON API.
//!
//! Unauthenticated JSON over HTTP on the scheduler's listen address:
//! project CRUD plus build listing and submission. Domain errors map to
//! the documented error codes; everything else is a 500 with a generic
//! body.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::builder::Builder;
use crate::error::SchedulerError;
use crate::projects::ProjectRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProjectRegistry>,
    pub builder: Arc<Builder>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/projects", get(list_projects))
        .route("/projects/", get(list_projects))
        .route(
            "/projects/{key}",
            get(get_project).put(put_project).delete(delete_project),
        )
        .route("/builds", get(list_builds).post(post_build))
        .route("/builds/", get(list_builds).post(post_build))
        .with_state(state)
}

async fn list_projects(State(state): State<AppState>) -> Response {
    match state.registry.list().await {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_project(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.registry.get(&key).await {
        Ok(project) => Json(project).into_response(),
        Err(SchedulerError::ProjectNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "project-does-not-exist", "key": key })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct PutProject {
    repo: String,
}

async fn put_project(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Form(body): Form<PutProject>,
) -> Response {
    match state.registry.register(&key, &body.repo).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(SchedulerError::ProjectAlreadyExists(_)) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "project-already-exists", "key": key })),
        )
            .into_response(),
        Err(SchedulerError::Invalid(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid-project-key", "key": key, "reason": reason })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn delete_project(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.registry.unregister(&key).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_builds(State(state): State<AppState>) -> Response {
    match state.builder.list_builds().await {
        Ok(builds) => Json(builds).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct PostBuild {
    project_key: String,
    commit_id: String,
}

async fn post_build(State(state): State<AppState>, Form(body): Form<PostBuild>) -> Response {
    match state
        .builder
        .schedule_build(&body.project_key, &body.commit_id)
        .await
    {
        Ok(build_ref) => Json(build_ref).into_response(),
        Err(SchedulerError::BuildspecNotFound {
            project_key,
            commit_id,
        }) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "buildspec-not-found",
                "project_key": project_key,
                "commit_id": commit_id,
            })),
        )
            .into_response(),
        Err(SchedulerError::ProjectNotFound(key)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "project-does-not-exist", "key": key })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: SchedulerError) -> Response {
    error!(error = %e, "Admin API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal-error" })),
    )
        .into_response()
}
