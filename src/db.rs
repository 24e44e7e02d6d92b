//! SQLite-backed record store. The `stories` table holds the mutable
//! "current" projection plus set-once JSON document columns; `status_history`
//! is append-only. All status mutation funnels through [`append_status`].
use crate::model::{
    CreationMetadata, NarrativeAnalysis, Page, StatusEntry, StoryRecord, StoryStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

/// Sentinel progress value: log the event without changing the numeric
/// progress field. The history entry still carries the last known value.
pub const KEEP_PROGRESS: i64 = -1;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
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

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
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

#[instrument(skip_all)]
pub async fn insert_story(pool: &Pool, record: &StoryRecord) -> Result<()> {
    let metadata = serde_json::to_string(&record.creation_metadata)?;
    sqlx::query(
        "INSERT INTO stories (id, status, progress, current_stage_message, creation_metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(record.status.as_str())
    .bind(record.progress)
    .bind(&record.current_stage_message)
    .bind(metadata)
    .bind(record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> Result<StoryRecord> {
    let metadata: CreationMetadata = serde_json::from_str(row.get("creation_metadata"))
        .context("invalid creation_metadata JSON")?;
    let pages: Vec<Page> =
        serde_json::from_str(row.get("pages")).context("invalid pages JSON")?;
    Ok(StoryRecord {
        id: row.get("id"),
        status: StoryStatus::parse(row.get("status")),
        progress: row.get("progress"),
        current_stage_message: row.get("current_stage_message"),
        title: row.get("title"),
        creation_metadata: metadata,
        status_history: Vec::new(),
        pages,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

async fn fetch_history(pool: &Pool, story_id: &str) -> Result<Vec<StatusEntry>> {
    let rows = sqlx::query(
        "SELECT stage, message, progress, created_at FROM status_history
         WHERE story_id = ? ORDER BY id",
    )
    .bind(story_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| StatusEntry {
            stage: row.get("stage"),
            message: row.get("message"),
            progress: row.get("progress"),
            timestamp: row.get::<DateTime<Utc>, _>("created_at"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn get_story(pool: &Pool, story_id: &str) -> Result<Option<StoryRecord>> {
    let row = sqlx::query(
        "SELECT id, status, progress, current_stage_message, title, creation_metadata, pages, created_at
         FROM stories WHERE id = ?",
    )
    .bind(story_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut record = row_to_record(&row)?;
    record.status_history = fetch_history(pool, story_id).await?;
    Ok(Some(record))
}

/// All stories, newest first by creation timestamp.
#[instrument(skip_all)]
pub async fn list_stories(pool: &Pool) -> Result<Vec<StoryRecord>> {
    let rows = sqlx::query(
        "SELECT id, status, progress, current_stage_message, title, creation_metadata, pages, created_at
         FROM stories ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut record = row_to_record(row)?;
        record.status_history = fetch_history(pool, &record.id).await?;
        records.push(record);
    }
    Ok(records)
}

/// Set the title and narrative-analysis context once stage 1 completes.
#[instrument(skip_all)]
pub async fn store_analysis(
    pool: &Pool,
    story_id: &str,
    analysis: &NarrativeAnalysis,
) -> Result<()> {
    let context = serde_json::json!({ "narrative_analysis": analysis });
    sqlx::query("UPDATE stories SET title = ?, creation_process_context = ? WHERE id = ?")
        .bind(&analysis.title)
        .bind(serde_json::to_string(&context)?)
        .bind(story_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Write the final sorted pages and the raw storyboard context atomically.
#[instrument(skip_all)]
pub async fn store_pages(
    pool: &Pool,
    story_id: &str,
    pages: &[Page],
    storyboard: &serde_json::Value,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let context: Option<String> =
        sqlx::query_scalar("SELECT creation_process_context FROM stories WHERE id = ?")
            .bind(story_id)
            .fetch_optional(&mut *tx)
            .await?;
    let mut context: serde_json::Value = context
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .unwrap_or_else(|| serde_json::json!({}));
    context["storyboard_pages"] = storyboard.clone();

    sqlx::query("UPDATE stories SET pages = ?, creation_process_context = ? WHERE id = ?")
        .bind(serde_json::to_string(pages)?)
        .bind(serde_json::to_string(&context)?)
        .bind(story_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Append a history entry and overwrite the current projection, atomically.
///
/// `progress = KEEP_PROGRESS` logs the message without moving the numeric
/// progress; the history entry re-carries the last known value so every
/// entry is self-contained.
#[instrument(skip_all, fields(story_id = %story_id, stage = %stage.as_str()))]
pub async fn append_status(
    pool: &Pool,
    story_id: &str,
    stage: StoryStatus,
    progress: i64,
    message: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    // The INSERT is the transaction's first statement so the write lock is
    // taken up front; a transaction that reads before its first write cannot
    // upgrade under a concurrent writer (SQLITE_BUSY, bypassing the busy
    // timeout). The sentinel therefore resolves inside the INSERT itself.
    sqlx::query(
        "INSERT INTO status_history (story_id, stage, message, progress, created_at)
         VALUES (?, ?, ?,
                 CASE WHEN ? >= 0 THEN ?
                      ELSE COALESCE((SELECT progress FROM stories WHERE id = ?), 0) END,
                 ?)",
    )
    .bind(story_id)
    .bind(stage.as_str())
    .bind(message)
    .bind(progress)
    .bind(progress)
    .bind(story_id)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    if progress >= 0 {
        sqlx::query(
            "UPDATE stories SET status = ?, current_stage_message = ?, progress = ? WHERE id = ?",
        )
        .bind(stage.as_str())
        .bind(message)
        .bind(progress)
        .bind(story_id)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query("UPDATE stories SET status = ?, current_stage_message = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(message)
            .bind(story_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
