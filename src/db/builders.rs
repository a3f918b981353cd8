use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::BuilderRecord;

/// Mark a dedicated builder as in use by one more task, inserting it on first sight
pub async fn acquire(pool: &SqlitePool, name: &str, host: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO builders (name, host, created_at, last_used_at, active_tasks)
        VALUES ($1, $2, $3, $3, 1)
        ON CONFLICT (name) DO UPDATE SET
            last_used_at = excluded.last_used_at,
            active_tasks = builders.active_tasks + 1
        "#,
    )
    .bind(name)
    .bind(host)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to record builder use")?;

    Ok(())
}

/// Mark a task as done with a builder. The idle window starts at `now`.
pub async fn release(pool: &SqlitePool, name: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE builders
        SET active_tasks = MAX(active_tasks - 1, 0), last_used_at = $2
        WHERE name = $1
        "#,
    )
    .bind(name)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to release builder")?;

    Ok(())
}

/// List known builders, least recently used first
pub async fn list_lru(pool: &SqlitePool) -> Result<Vec<BuilderRecord>> {
    let builders = sqlx::query_as::<_, BuilderRecord>(
        r#"
        SELECT name, host, created_at, last_used_at, active_tasks
        FROM builders
        ORDER BY last_used_at ASC, name ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to list builders")?;

    Ok(builders)
}

/// Forget a builder
pub async fn delete(pool: &SqlitePool, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM builders WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("Failed to delete builder record")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn test_acquire_inserts_then_updates() {
        let pool = test_pool().await;
        let t0 = Utc::now() - Duration::hours(2);
        let t1 = Utc::now();

        acquire(&pool, "b1", "reg.local", t0).await.unwrap();
        acquire(&pool, "b1", "reg.local", t1).await.unwrap();

        let all = list_lru(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].created_at, t0);
        assert_eq!(all[0].last_used_at, t1);
        assert_eq!(all[0].active_tasks, 2);
    }

    #[tokio::test]
    async fn test_release_counts_down_and_clamps() {
        let pool = test_pool().await;
        let t0 = Utc::now() - Duration::hours(2);
        let t1 = Utc::now();

        acquire(&pool, "b1", "reg.local", t0).await.unwrap();
        release(&pool, "b1", t1).await.unwrap();

        let record = &list_lru(&pool).await.unwrap()[0];
        assert_eq!(record.active_tasks, 0);
        assert_eq!(record.last_used_at, t1);

        // Extra releases never go negative
        release(&pool, "b1", t1).await.unwrap();
        assert_eq!(list_lru(&pool).await.unwrap()[0].active_tasks, 0);

        // Unknown builders are ignored
        release(&pool, "missing", t1).await.unwrap();
        assert_eq!(list_lru(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lru_order_and_delete() {
        let pool = test_pool().await;
        let now = Utc::now();
        acquire(&pool, "recent", "a", now).await.unwrap();
        acquire(&pool, "oldest", "b", now - Duration::hours(3)).await.unwrap();
        acquire(&pool, "older", "c", now - Duration::hours(1)).await.unwrap();

        let names: Vec<String> = list_lru(&pool).await.unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["oldest", "older", "recent"]);

        delete(&pool, "oldest").await.unwrap();
        assert_eq!(list_lru(&pool).await.unwrap().len(), 2);
    }
}
