use super::model::{check_status, from_millis, handle_status, to_millis, NewHandle};
use crate::model::{CachedCheck, CachedToken, Handle, HandleStatus, HistoryEntry};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every in-memory connection is its own database, so keep exactly one alive.
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        // Enable WAL and stricter durability.
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous=FULL;")
            .execute(&pool)
            .await?;
        pool
    };
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const HANDLE_COLUMNS: &str = "id, name, platform, status, last_checked_at, notifications_enabled, monitoring_enabled";

fn handle_from_row(row: &SqliteRow) -> Result<Handle> {
    let status: String = row.try_get("status")?;
    let last_checked_at = row
        .try_get::<Option<i64>, _>("last_checked_at")?
        .map(from_millis)
        .transpose()?;
    Ok(Handle {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        platform: row.try_get("platform")?,
        status: handle_status(&status)?,
        last_checked_at,
        notifications_enabled: row.try_get("notifications_enabled")?,
        monitoring_enabled: row.try_get("monitoring_enabled")?,
    })
}

/// Register a handle. New handles start out in `monitoring`.
#[instrument(skip_all)]
pub async fn insert_handle(pool: &Pool, new: &NewHandle) -> Result<Handle> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO handles (id, name, platform, status, notifications_enabled, monitoring_enabled, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.platform)
    .bind(HandleStatus::Monitoring.as_str())
    .bind(new.notifications_enabled)
    .bind(new.monitoring_enabled)
    .bind(to_millis(Utc::now()))
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert handle {}/{}", new.platform, new.name))?;
    get_handle(pool, &id)
        .await?
        .ok_or_else(|| anyhow!("handle {} vanished after insert", id))
}

#[instrument(skip_all)]
pub async fn get_handle(pool: &Pool, id: &str) -> Result<Option<Handle>> {
    let row = sqlx::query(&format!("SELECT {} FROM handles WHERE id = ?", HANDLE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(handle_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_handles(pool: &Pool) -> Result<Vec<Handle>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM handles ORDER BY created_at ASC, id ASC",
        HANDLE_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(handle_from_row).collect()
}

#[instrument(skip_all)]
pub async fn update_handle_status(
    pool: &Pool,
    id: &str,
    status: HandleStatus,
    checked_at: DateTime<Utc>,
) -> Result<()> {
    let res = sqlx::query("UPDATE handles SET status = ?, last_checked_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_millis(checked_at))
        .bind(id)
        .execute(pool)
        .await
        .context("failed to persist handle status")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("handle {} not found", id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_history(
    pool: &Pool,
    handle_id: &str,
    status: HandleStatus,
    recorded_at: DateTime<Utc>,
) -> Result<i64> {
    let res = sqlx::query(
        "INSERT INTO handle_history (handle_id, status, recorded_at) VALUES (?, ?, ?)",
    )
    .bind(handle_id)
    .bind(status.as_str())
    .bind(to_millis(recorded_at))
    .execute(pool)
    .await
    .context("failed to append handle history")?;
    Ok(res.last_insert_rowid())
}

#[instrument(skip_all)]
pub async fn history_for(pool: &Pool, handle_id: &str) -> Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        "SELECT id, handle_id, status, recorded_at FROM handle_history WHERE handle_id = ? ORDER BY id ASC",
    )
    .bind(handle_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<HistoryEntry> {
            let status: String = row.try_get("status")?;
            Ok(HistoryEntry {
                id: row.try_get("id")?,
                handle_id: row.try_get("handle_id")?,
                status: handle_status(&status)?,
                recorded_at: from_millis(row.try_get("recorded_at")?)?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn get_cached_check(pool: &Pool, handle_id: &str) -> Result<Option<CachedCheck>> {
    let row = sqlx::query(
        "SELECT handle_id, handle_name, platform, status, checked_at, expires_at FROM cached_checks WHERE handle_id = ?",
    )
    .bind(handle_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.try_get("status")?;
    Ok(Some(CachedCheck {
        handle_id: row.try_get("handle_id")?,
        handle_name: row.try_get("handle_name")?,
        platform: row.try_get("platform")?,
        status: check_status(&status)?,
        checked_at: from_millis(row.try_get("checked_at")?)?,
        expires_at: from_millis(row.try_get("expires_at")?)?,
    }))
}

#[instrument(skip_all)]
pub async fn upsert_cached_check(pool: &Pool, check: &CachedCheck) -> Result<()> {
    sqlx::query(
        "INSERT INTO cached_checks (handle_id, handle_name, platform, status, checked_at, expires_at) VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(handle_id) DO UPDATE SET handle_name = excluded.handle_name, platform = excluded.platform, \
         status = excluded.status, checked_at = excluded.checked_at, expires_at = excluded.expires_at",
    )
    .bind(&check.handle_id)
    .bind(&check.handle_name)
    .bind(&check.platform)
    .bind(check.status.as_str())
    .bind(to_millis(check.checked_at))
    .bind(to_millis(check.expires_at))
    .execute(pool)
    .await
    .context("failed to upsert cached check")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_cached_token(pool: &Pool, token_id: &str) -> Result<Option<CachedToken>> {
    let row = sqlx::query(
        "SELECT token_id, access_token, expires_at FROM cached_tokens WHERE token_id = ?",
    )
    .bind(token_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(CachedToken {
        token_id: row.try_get("token_id")?,
        access_token: row.try_get("access_token")?,
        expires_at: from_millis(row.try_get("expires_at")?)?,
    }))
}

#[instrument(skip_all)]
pub async fn upsert_cached_token(pool: &Pool, token: &CachedToken) -> Result<()> {
    sqlx::query(
        "INSERT INTO cached_tokens (token_id, access_token, expires_at) VALUES (?, ?, ?) \
         ON CONFLICT(token_id) DO UPDATE SET access_token = excluded.access_token, expires_at = excluded.expires_at",
    )
    .bind(&token.token_id)
    .bind(&token.access_token)
    .bind(to_millis(token.expires_at))
    .execute(pool)
    .await
    .context("failed to upsert cached token")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_cached_token(pool: &Pool, token_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM cached_tokens WHERE token_id = ?")
        .bind(token_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete cache rows whose expiry is strictly before `now`.
#[instrument(skip_all)]
pub async fn delete_expired_cache(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let checks = sqlx::query("DELETE FROM cached_checks WHERE expires_at < ?")
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let tokens = sqlx::query("DELETE FROM cached_tokens WHERE expires_at < ?")
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(checks + tokens)
}
