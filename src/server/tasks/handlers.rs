use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{
    CreateTaskRequest, CreateTaskResponse, DeleteTasksResponse, TaskResponse,
};
use crate::db::tasks as db_tasks;
use crate::logs::{self, TailEvent};
use crate::server::error::{ServerError, ServerErrorExt};
use crate::server::state::AppState;
use crate::task::snapshot::{
    registry_base_url, validate_local_image_name, validate_repo_image_name, CredentialSnapshot,
    ProjectSnapshot, ProxySnapshot,
};
use crate::task::DispatchRequest;

/// Task ids are UUIDs; parsing also keeps them safe to use in file names
fn parse_task_id(task_id: &str) -> Result<String, ServerError> {
    Uuid::parse_str(task_id)
        .map(|id| id.to_string())
        .map_err(|_| ServerError::bad_request(format!("Invalid task id '{}'", task_id)))
}

/// Start a build/tag/push task
///
/// POST /tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ServerError> {
    if payload.project_id.trim().is_empty() {
        return Err(ServerError::bad_request("project_id must not be empty"));
    }

    let project = payload.project;
    let local_image_name = project
        .local_image_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    if let Some(name) = &local_image_name {
        validate_local_image_name(name).map_err(ServerError::bad_request)?;
    }
    validate_repo_image_name(project.repo_image_name.trim()).map_err(ServerError::bad_request)?;

    let registry_url = registry_base_url(
        payload.registry.as_ref().map(|r| r.url.as_str()),
        payload.registry.as_ref().map_or(true, |r| r.is_https),
    );

    let snapshot = ProjectSnapshot {
        build_context: project.build_context,
        dockerfile: project.dockerfile,
        local_image_name,
        repo_image_name: project.repo_image_name.trim().to_string(),
        no_cache: project.no_cache,
        auto_cleanup: project.auto_cleanup,
        platforms: project.platforms,
        registry_url: registry_url.clone(),
    };

    // Credentials always target the project's registry
    let credential = payload.credential.map(|c| CredentialSnapshot {
        username: c.username,
        secret: c.secret,
        registry_url: registry_url.clone(),
    });
    let proxy = payload
        .proxy
        .map(|p| p.url.trim().to_string())
        .filter(|url| !url.is_empty())
        .map(|url| -> Result<ProxySnapshot, ServerError> {
            url::Url::parse(&url).map_err(|e| {
                ServerError::bad_request(format!("Invalid proxy URL '{}': {}", url, e))
            })?;
            Ok(ProxySnapshot { url })
        })
        .transpose()?;

    let project_id = payload.project_id;
    let task_id = state
        .dispatcher
        .dispatch(DispatchRequest {
            project_id: project_id.clone(),
            project: snapshot,
            tag_input: payload.tag,
            credential,
            proxy,
        })
        .await
        .map_err(|e| {
            ServerError::internal_anyhow(e, "Failed to dispatch task")
                .with_context("project_id", project_id.clone())
        })?;

    Ok((StatusCode::CREATED, Json(CreateTaskResponse { task_id })))
}

/// Get a task record
///
/// GET /tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let task_id = parse_task_id(&task_id)?;

    let task = db_tasks::find_by_id(&state.db_pool, &task_id)
        .await
        .internal_err("Failed to fetch task")?
        .ok_or_else(|| ServerError::not_found(format!("Task '{}' not found", task_id)))?;

    Ok(Json(task.into()))
}

/// List a project's tasks, newest first
///
/// GET /projects/{project_id}/tasks
pub async fn list_project_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<TaskResponse>>, ServerError> {
    let tasks = db_tasks::list_for_project(&state.db_pool, &project_id)
        .await
        .internal_err("Failed to list tasks")?;

    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

/// Stream a task's log via Server-Sent Events
///
/// Each log line becomes one `data` event. The stream ends when the task's log
/// is complete. If the log never appears, a single `error` event is sent.
///
/// GET /tasks/{task_id}/logs
pub async fn stream_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let task_id = parse_task_id(&task_id)?;

    let events = state.tailer.tail(&task_id).map(|event| {
        Ok(match event {
            // Bare carriage returns from progress output are not valid in SSE data
            TailEvent::Line(line) => Event::default().data(line.replace('\r', "")),
            TailEvent::CreationTimeout(message) | TailEvent::ReadError(message) => {
                warn!("Log stream error: {}", message);
                Event::default().event("error").data(message)
            }
        })
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Get a task's full log text
///
/// GET /tasks/{task_id}/logs/content
pub async fn get_task_log_content(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<String, ServerError> {
    let task_id = parse_task_id(&task_id)?;

    logs::read_all(&state.log_dir, &task_id)
        .await
        .internal_err("Failed to read task log")?
        .ok_or_else(|| ServerError::not_found(format!("No log for task '{}'", task_id)))
}

/// Delete a task record and its log
///
/// DELETE /tasks/{task_id}
pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    let task_id = parse_task_id(&task_id)?;

    let deleted = db_tasks::delete(&state.db_pool, &task_id)
        .await
        .internal_err("Failed to delete task")?;
    if !deleted {
        return Err(ServerError::not_found(format!("Task '{}' not found", task_id)));
    }

    logs::remove(&state.log_dir, &task_id)
        .await
        .internal_err("Failed to remove task log")?;

    info!("Deleted task {}", task_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Delete every task record and log
///
/// DELETE /tasks
pub async fn delete_all_tasks(
    State(state): State<AppState>,
) -> Result<Json<DeleteTasksResponse>, ServerError> {
    let ids = db_tasks::list_ids(&state.db_pool)
        .await
        .internal_err("Failed to list tasks")?;

    let deleted = db_tasks::delete_all(&state.db_pool)
        .await
        .internal_err("Failed to delete tasks")?;

    for id in &ids {
        if let Err(e) = logs::remove(&state.log_dir, id).await {
            warn!("Failed to remove log of task {}: {:#}", id, e);
        }
    }

    info!("Deleted {} task(s)", deleted);
    Ok(Json(DeleteTasksResponse { deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuilderPolicy;
    use crate::db::{self, TaskStatus};
    use crate::logs::{LogTailer, TaskLog};
    use crate::server::tasks::routes;
    use crate::task::snapshot::WorkerConfig;
    use crate::task::Dispatcher;
    use axum::{body::Body, http::Request, Router};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt; // for `oneshot`

    async fn app(dir: &TempDir) -> (Router, sqlx::SqlitePool) {
        let pool = db::test_pool().await;
        let log_dir = dir.path().join("logs");
        let dispatcher = Dispatcher::with_program(
            pool.clone(),
            dir.path().join("tasks"),
            WorkerConfig {
                database_url: "sqlite::memory:".into(),
                log_dir: log_dir.clone(),
                container_cli: "docker".into(),
                shared_builder: None,
                default_registries: vec![],
                builder_policy: BuilderPolicy::default(),
            },
            PathBuf::from("true"),
        );
        let tailer = LogTailer::new(
            log_dir.clone(),
            Duration::from_millis(10),
            3,
            Duration::from_millis(10),
        );
        let state = AppState::new(pool.clone(), dispatcher, tailer, log_dir);
        (routes().with_state(state), pool)
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_image_name() {
        let dir = TempDir::new().unwrap();
        let (app, pool) = app(&dir).await;

        let response = app
            .oneshot(post_json(
                "/tasks",
                serde_json::json!({
                    "project_id": "p1",
                    "project": {
                        "build_context": "/src/app",
                        "repo_image_name": "Team/App"
                    },
                    "tag": "v1"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Invalid repository image name"));
        assert!(db_tasks::list_ids(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_proxy_url() {
        let dir = TempDir::new().unwrap();
        let (app, pool) = app(&dir).await;

        let response = app
            .oneshot(post_json(
                "/tasks",
                serde_json::json!({
                    "project_id": "p1",
                    "project": {
                        "build_context": "/src/app",
                        "repo_image_name": "team/app"
                    },
                    "tag": "v1",
                    "proxy": { "url": "not a url" }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Invalid proxy URL"));
        assert!(db_tasks::list_ids(&pool).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_task_dispatches() {
        let dir = TempDir::new().unwrap();
        let (app, pool) = app(&dir).await;

        let response = app
            .oneshot(post_json(
                "/tasks",
                serde_json::json!({
                    "project_id": "p1",
                    "project": {
                        "build_context": "/src/app",
                        "repo_image_name": "team/app",
                        "platforms": "linux/amd64,linux/arm64"
                    },
                    "registry": { "url": "https://10.0.0.5:5000", "is_https": false },
                    "tag": "v1, v2|v3",
                    "credential": { "username": "ci", "secret": "s3cret" }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let created: CreateTaskResponse =
            serde_json::from_str(&body_string(response).await).unwrap();

        let task = db_tasks::find_by_id(&pool, &created.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.tag, "v1, v2|v3");

        let snapshot = crate::task::snapshot::TaskInput::take_from(
            &dir.path().join("tasks").join(format!("{}.json", created.task_id)),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.project.registry_url, "http://10.0.0.5:5000");
        assert_eq!(
            snapshot.credential.unwrap().registry_url,
            "http://10.0.0.5:5000"
        );
    }

    #[tokio::test]
    async fn test_get_task_not_found_and_invalid_id() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/tasks/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/tasks/..%2Fetc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_log_content() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;
        let task_id = Uuid::new_v4().to_string();

        let log = TaskLog::create(&dir.path().join("logs"), &task_id).unwrap();
        log.line("building");
        log.finish();

        let response = app
            .clone()
            .oneshot(get(&format!("/tasks/{}/logs/content", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.starts_with("building\n"));

        let response = app
            .oneshot(get(&format!("/tasks/{}/logs/content", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_logs_until_sentinel() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;
        let task_id = Uuid::new_v4().to_string();

        let log = TaskLog::create(&dir.path().join("logs"), &task_id).unwrap();
        log.line("--- [1/1] Building ---");
        log.line("done");
        log.finish();

        let response = app
            .oneshot(get(&format!("/tasks/{}/logs", task_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert!(body.contains("data: --- [1/1] Building ---"));
        assert!(body.contains("data: done"));
        assert!(!body.contains(logs::TASK_LOG_SENTINEL));
    }

    #[tokio::test]
    async fn test_stream_logs_creation_timeout() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;

        let response = app
            .oneshot(get(&format!("/tasks/{}/logs", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_string(response).await;
        assert!(body.contains("event: error"));
        assert!(body.contains("was not created"));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let (app, pool) = app(&dir).await;
        let log_dir = dir.path().join("logs");

        let first = Uuid::new_v4().to_string();
        let second = Uuid::new_v4().to_string();
        db_tasks::create(&pool, &first, "p1", "v1").await.unwrap();
        db_tasks::create(&pool, &second, "p1", "v2").await.unwrap();
        TaskLog::create(&log_dir, &first).unwrap().finish();
        TaskLog::create(&log_dir, &second).unwrap().finish();

        let response = app.clone().oneshot(get("/projects/p1/tasks")).await.unwrap();
        let tasks: Vec<TaskResponse> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![second.as_str(), first.as_str()]
        );
        assert!(tasks.iter().all(|t| !t.finished));

        let delete_one = Request::builder()
            .method("DELETE")
            .uri(format!("/tasks/{}", first))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete_one).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!logs::log_path(&log_dir, &first).exists());

        let delete_all = Request::builder()
            .method("DELETE")
            .uri("/tasks")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(delete_all).await.unwrap();
        let deleted: DeleteTasksResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(deleted.deleted, 1);
        assert!(!logs::log_path(&log_dir, &second).exists());
    }
}
