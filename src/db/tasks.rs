use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{Task, TaskStatus};

/// Create a task in PENDING state
pub async fn create(pool: &SqlitePool, id: &str, project_id: &str, tag: &str) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        r#"
        INSERT INTO tasks (id, project_id, tag, status, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, project_id, tag, status, created_at
        "#,
    )
    .bind(id)
    .bind(project_id)
    .bind(tag)
    .bind(TaskStatus::Pending)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("Failed to create task")?;

    Ok(task)
}

/// Move a task out of PENDING.
///
/// Returns `false` if the task is unknown or already terminal; a status
/// transition happens at most once.
pub async fn set_status(pool: &SqlitePool, id: &str, status: TaskStatus) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $2
        WHERE id = $1 AND status = $3
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(TaskStatus::Pending)
    .execute(pool)
    .await
    .context("Failed to update task status")?;

    Ok(result.rows_affected() > 0)
}

/// Find task by ID
pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        r#"
        SELECT id, project_id, tag, status, created_at
        FROM tasks
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to find task by ID")?;

    Ok(task)
}

/// List tasks for a project, newest first
pub async fn list_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        r#"
        SELECT id, project_id, tag, status, created_at
        FROM tasks
        WHERE project_id = $1
        ORDER BY created_at DESC, rowid DESC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("Failed to list tasks for project")?;

    Ok(tasks)
}

/// List all task IDs
pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>("SELECT id FROM tasks")
        .fetch_all(pool)
        .await
        .context("Failed to list task IDs")?;

    Ok(ids)
}

/// Delete a task record. Returns `false` if it did not exist.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete task")?;

    Ok(result.rows_affected() > 0)
}

/// Delete every task record, returning how many were removed
pub async fn delete_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks")
        .execute(pool)
        .await
        .context("Failed to delete tasks")?;

    Ok(result.rows_affected())
}
