//! Embedding coverage and database overview.
//!
//! `siglink status` prints the embedding status counts; `siglink stats` adds
//! stale-embedding counts for the configured model, the association score
//! distribution, and the database file size.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::{issue_text, signal_text, EntityKind};
use crate::queries::{self, EmbeddingsStatus};
use crate::store::hash_text;

/// Association counts per score bucket.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct ScoreBuckets {
    /// score >= 0.8
    pub high: i64,
    /// 0.5 <= score < 0.8
    pub medium: i64,
    pub low: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodCount {
    pub method: String,
    pub count: i64,
    pub mean_score: f64,
}

/// Embeddings under `model` whose stored hash no longer matches the entity's text.
pub async fn stale_embeddings(pool: &SqlitePool, kind: EntityKind, model: &str) -> Result<u64> {
    let sql = match kind {
        EntityKind::Signal => {
            r#"
            SELECT s.summary AS a, s.context AS b, e.hash AS hash
            FROM signal_embeddings e
            JOIN signals s ON s.id = e.signal_id
            WHERE e.model = ?
            "#
        }
        EntityKind::Issue => {
            r#"
            SELECT i.title AS a, i.description AS b, e.hash AS hash
            FROM issue_embeddings e
            JOIN issues i ON i.identifier = e.issue_id
            WHERE e.model = ?
            "#
        }
    };

    let rows = sqlx::query(sql).bind(model).fetch_all(pool).await?;

    let mut stale = 0;
    for row in &rows {
        let a: String = row.get("a");
        let text = match kind {
            EntityKind::Signal => signal_text(&a, row.get("b")),
            EntityKind::Issue => issue_text(&a, row.get::<Option<&str>, _>("b")),
        };
        let hash: String = row.get("hash");
        if hash_text(&text) != hash {
            stale += 1;
        }
    }
    Ok(stale)
}

pub async fn score_buckets(pool: &SqlitePool) -> Result<ScoreBuckets> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN score >= 0.8 THEN 1 ELSE 0 END), 0) AS high,
            COALESCE(SUM(CASE WHEN score >= 0.5 AND score < 0.8 THEN 1 ELSE 0 END), 0) AS medium,
            COALESCE(SUM(CASE WHEN score < 0.5 THEN 1 ELSE 0 END), 0) AS low
        FROM associations
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(ScoreBuckets {
        high: row.get("high"),
        medium: row.get("medium"),
        low: row.get("low"),
    })
}

pub async fn method_counts(pool: &SqlitePool) -> Result<Vec<MethodCount>> {
    let rows = sqlx::query(
        r#"
        SELECT method, COUNT(*) AS count, AVG(score) AS mean_score
        FROM associations
        GROUP BY method
        ORDER BY count DESC, method ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| MethodCount {
            method: row.get("method"),
            count: row.get("count"),
            mean_score: row.get("mean_score"),
        })
        .collect())
}

pub fn print_status(status: &EmbeddingsStatus) {
    println!("status");
    println!(
        "  signals: {} / {} embedded ({}%)",
        status.signal_embedded,
        status.signal_total,
        percent(status.signal_embedded, status.signal_total)
    );
    println!(
        "  issues: {} / {} embedded ({}%)",
        status.issue_embedded,
        status.issue_total,
        percent(status.issue_embedded, status.issue_total)
    );
    println!("  associations: {}", status.associations_count);
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let status = queries::get_embeddings_status(&pool).await?;
    pool.close().await;
    print_status(&status);
    Ok(())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let model = embedding::configured_model_name(&config.embedding);

    let status = queries::get_embeddings_status(&pool).await?;
    let stale_signals = stale_embeddings(&pool, EntityKind::Signal, &model).await?;
    let stale_issues = stale_embeddings(&pool, EntityKind::Issue, &model).await?;
    let buckets = score_buckets(&pool).await?;
    let methods = method_counts(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("siglink database stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Model:       {}", model);
    println!();
    println!("  Signals:     {}", status.signal_total);
    println!(
        "  Embedded:    {} / {} ({}%), {} stale",
        status.signal_embedded,
        status.signal_total,
        percent(status.signal_embedded, status.signal_total),
        stale_signals
    );
    println!("  Issues:      {}", status.issue_total);
    println!(
        "  Embedded:    {} / {} ({}%), {} stale",
        status.issue_embedded,
        status.issue_total,
        percent(status.issue_embedded, status.issue_total),
        stale_issues
    );
    println!();
    println!("  Associations: {}", status.associations_count);
    println!("    high (>=0.8):     {}", buckets.high);
    println!("    medium (0.5-0.8): {}", buckets.medium);
    println!("    low (<0.5):       {}", buckets.low);

    if !methods.is_empty() {
        println!();
        println!("  By method:");
        println!("  {:<40} {:>8} {:>10}", "METHOD", "COUNT", "MEAN");
        println!("  {}", "-".repeat(60));
        for m in &methods {
            println!("  {:<40} {:>8} {:>10.3}", m.method, m.count, m.mean_score);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
