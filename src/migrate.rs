use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Tag lists are JSON arrays of names, in source order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signals (
            id INTEGER PRIMARY KEY,
            summary TEXT NOT NULL,
            context TEXT NOT NULL,
            sentiment INTEGER NOT NULL,
            severity INTEGER NOT NULL,
            bias INTEGER NOT NULL,
            date TEXT NOT NULL,
            boundary TEXT NOT NULL,
            method TEXT NOT NULL,
            topics TEXT NOT NULL DEFAULT '[]',
            keywords TEXT NOT NULL DEFAULT '[]',
            impacts TEXT NOT NULL DEFAULT '[]',
            emotions TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT,
            state_name TEXT,
            state_type TEXT,
            team_name TEXT,
            team_key TEXT,
            assignee_name TEXT,
            assignee_email TEXT,
            creator_name TEXT,
            creator_email TEXT,
            priority INTEGER,
            estimate REAL,
            labels TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS signal_embeddings (
            signal_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (signal_id, model),
            FOREIGN KEY (signal_id) REFERENCES signals(id)
                ON DELETE CASCADE ON UPDATE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Issues are referenced by their tracker key, not the tracker UUID.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issue_embeddings (
            issue_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (issue_id, model),
            FOREIGN KEY (issue_id) REFERENCES issues(identifier)
                ON DELETE CASCADE ON UPDATE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS associations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            signal_id INTEGER NOT NULL,
            issue_id TEXT NOT NULL,
            score REAL NOT NULL,
            reason TEXT NOT NULL,
            method TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(signal_id, issue_id),
            FOREIGN KEY (signal_id) REFERENCES signals(id)
                ON DELETE CASCADE ON UPDATE CASCADE,
            FOREIGN KEY (issue_id) REFERENCES issues(identifier)
                ON DELETE CASCADE ON UPDATE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_date ON signals(date DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_team ON issues(team_key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_associations_issue ON associations(issue_id, score DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_associations_signal ON associations(signal_id, score DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
