use super::handlers;
use crate::server::state::AppState;
use axum::{
    routing::{delete, get, post},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(handlers::create_task))
        .route("/tasks", delete(handlers::delete_all_tasks))
        .route("/tasks/{task_id}", get(handlers::get_task))
        .route("/tasks/{task_id}", delete(handlers::delete_task))
        .route("/tasks/{task_id}/logs", get(handlers::stream_task_logs))
        .route(
            "/tasks/{task_id}/logs/content",
            get(handlers::get_task_log_content),
        )
        .route(
            "/projects/{project_id}/tasks",
            get(handlers::list_project_tasks),
        )
}
