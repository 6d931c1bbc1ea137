//! Read-side queries over issues, signals, and their associations.
//!
//! Everything here is a pure read except [`purge_all`]. The functions take a
//! pool so the CLI (`siglink issues`, `siglink issue ENG-1`, ...) and the HTTP
//! server share one implementation; the `run_*` wrappers print to stdout.
//!
//! All list orderings end in a unique key so results are deterministic.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{Association, Issue, Signal};

/// An issue with the number of signals linked to it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IssueWithCount {
    pub identifier: String,
    pub title: String,
    pub state_name: Option<String>,
    pub team_key: Option<String>,
    pub priority: Option<i64>,
    pub created_at: String,
    pub association_count: i64,
}

/// A signal with the number of issues linked to it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SignalWithCount {
    pub id: i64,
    pub summary: String,
    pub severity: i64,
    pub date: String,
    pub association_count: i64,
}

/// A signal linked to some issue, with the link's score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkedSignal {
    pub signal_id: i64,
    pub summary: String,
    pub severity: i64,
    pub date: String,
    pub score: f64,
    pub reason: String,
    pub method: String,
}

/// An issue linked to some signal, with the link's score.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LinkedIssue {
    pub issue_id: String,
    pub title: String,
    pub state_name: Option<String>,
    pub score: f64,
    pub reason: String,
    pub method: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct EmbeddingsStatus {
    pub signal_total: i64,
    pub signal_embedded: i64,
    pub issue_total: i64,
    pub issue_embedded: i64,
    pub associations_count: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SampleAssociation {
    pub signal_id: i64,
    pub signal_summary: String,
    pub issue_id: String,
    pub issue_title: String,
    pub score: f64,
    pub method: String,
}

/// Rows deleted from each table by [`purge_all`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct PurgeCounts {
    pub associations: u64,
    pub signal_embeddings: u64,
    pub issue_embeddings: u64,
    pub signals: u64,
    pub issues: u64,
}

impl PurgeCounts {
    pub fn total(&self) -> u64 {
        self.associations
            + self.signal_embeddings
            + self.issue_embeddings
            + self.signals
            + self.issues
    }
}

fn limit_value(limit: Option<i64>) -> i64 {
    limit.filter(|l| *l >= 0).unwrap_or(-1)
}

fn parse_tags(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn signal_from_row(row: &SqliteRow) -> Signal {
    Signal {
        id: row.get("id"),
        summary: row.get("summary"),
        context: row.get("context"),
        sentiment: row.get("sentiment"),
        severity: row.get("severity"),
        bias: row.get("bias"),
        date: row.get("date"),
        boundary: row.get("boundary"),
        method: row.get("method"),
        topics: parse_tags(row.get("topics")),
        keywords: parse_tags(row.get("keywords")),
        impacts: parse_tags(row.get("impacts")),
        emotions: parse_tags(row.get("emotions")),
    }
}

fn issue_from_row(row: &SqliteRow) -> Issue {
    Issue {
        id: row.get("id"),
        identifier: row.get("identifier"),
        title: row.get("title"),
        description: row.get("description"),
        state_name: row.get("state_name"),
        state_type: row.get("state_type"),
        team_name: row.get("team_name"),
        team_key: row.get("team_key"),
        assignee_name: row.get("assignee_name"),
        assignee_email: row.get("assignee_email"),
        creator_name: row.get("creator_name"),
        creator_email: row.get("creator_email"),
        priority: row.get("priority"),
        estimate: row.get("estimate"),
        labels: parse_tags(row.get("labels")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
    }
}

/// Issues ranked by how many signals link to them, newest first on ties.
pub async fn list_issues_with_counts(
    pool: &SqlitePool,
    limit: Option<i64>,
) -> Result<Vec<IssueWithCount>> {
    let rows = sqlx::query(
        r#"
        SELECT i.identifier, i.title, i.state_name, i.team_key, i.priority, i.created_at,
               COUNT(a.id) AS association_count
        FROM issues i
        LEFT JOIN associations a ON a.issue_id = i.identifier
        GROUP BY i.identifier
        ORDER BY association_count DESC, i.created_at DESC, i.identifier ASC
        LIMIT ?
        "#,
    )
    .bind(limit_value(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| IssueWithCount {
            identifier: row.get("identifier"),
            title: row.get("title"),
            state_name: row.get("state_name"),
            team_key: row.get("team_key"),
            priority: row.get("priority"),
            created_at: row.get("created_at"),
            association_count: row.get("association_count"),
        })
        .collect())
}

/// Signals ranked by how many issues link to them, most recent first on ties.
pub async fn list_signals_with_counts(
    pool: &SqlitePool,
    limit: Option<i64>,
) -> Result<Vec<SignalWithCount>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.summary, s.severity, s.date, COUNT(a.id) AS association_count
        FROM signals s
        LEFT JOIN associations a ON a.signal_id = s.id
        GROUP BY s.id
        ORDER BY association_count DESC, s.date DESC, s.id ASC
        LIMIT ?
        "#,
    )
    .bind(limit_value(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SignalWithCount {
            id: row.get("id"),
            summary: row.get("summary"),
            severity: row.get("severity"),
            date: row.get("date"),
            association_count: row.get("association_count"),
        })
        .collect())
}

pub async fn get_issue(pool: &SqlitePool, identifier: &str) -> Result<Option<Issue>> {
    let row = sqlx::query("SELECT * FROM issues WHERE identifier = ?")
        .bind(identifier)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(issue_from_row))
}

pub async fn get_signal(pool: &SqlitePool, id: i64) -> Result<Option<Signal>> {
    let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(signal_from_row))
}

/// Signals linked to `issue_id` with `score >= min_score`, best first.
pub async fn get_signals_for_issue(
    pool: &SqlitePool,
    issue_id: &str,
    min_score: f64,
) -> Result<Vec<LinkedSignal>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.summary, s.severity, s.date, a.score, a.reason, a.method
        FROM associations a
        JOIN signals s ON s.id = a.signal_id
        WHERE a.issue_id = ? AND a.score >= ?
        ORDER BY a.score DESC, s.id ASC
        "#,
    )
    .bind(issue_id)
    .bind(min_score)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LinkedSignal {
            signal_id: row.get("id"),
            summary: row.get("summary"),
            severity: row.get("severity"),
            date: row.get("date"),
            score: row.get("score"),
            reason: row.get("reason"),
            method: row.get("method"),
        })
        .collect())
}

/// Issues linked to `signal_id` with `score >= min_score`, best first.
pub async fn get_issues_for_signal(
    pool: &SqlitePool,
    signal_id: i64,
    min_score: f64,
) -> Result<Vec<LinkedIssue>> {
    let rows = sqlx::query(
        r#"
        SELECT i.identifier, i.title, i.state_name, a.score, a.reason, a.method
        FROM associations a
        JOIN issues i ON i.identifier = a.issue_id
        WHERE a.signal_id = ? AND a.score >= ?
        ORDER BY a.score DESC, i.identifier ASC
        "#,
    )
    .bind(signal_id)
    .bind(min_score)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LinkedIssue {
            issue_id: row.get("identifier"),
            title: row.get("title"),
            state_name: row.get("state_name"),
            score: row.get("score"),
            reason: row.get("reason"),
            method: row.get("method"),
        })
        .collect())
}

pub async fn get_association(
    pool: &SqlitePool,
    signal_id: i64,
    issue_id: &str,
) -> Result<Option<Association>> {
    let row = sqlx::query(
        r#"
        SELECT id, signal_id, issue_id, score, reason, method, created_at
        FROM associations
        WHERE signal_id = ? AND issue_id = ?
        "#,
    )
    .bind(signal_id)
    .bind(issue_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Association {
        id: row.get("id"),
        signal_id: row.get("signal_id"),
        issue_id: row.get("issue_id"),
        score: row.get("score"),
        reason: row.get("reason"),
        method: row.get("method"),
        created_at: row.get("created_at"),
    }))
}

pub async fn get_associations_count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM associations")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Entity totals and how many distinct entities have at least one embedding.
pub async fn get_embeddings_status(pool: &SqlitePool) -> Result<EmbeddingsStatus> {
    let signal_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signals")
        .fetch_one(pool)
        .await?;
    let signal_embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT e.signal_id) FROM signal_embeddings e JOIN signals s ON s.id = e.signal_id",
    )
    .fetch_one(pool)
    .await?;
    let issue_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM issues")
        .fetch_one(pool)
        .await?;
    let issue_embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT e.issue_id) FROM issue_embeddings e JOIN issues i ON i.identifier = e.issue_id",
    )
    .fetch_one(pool)
    .await?;

    Ok(EmbeddingsStatus {
        signal_total,
        signal_embedded,
        issue_total,
        issue_embedded,
        associations_count: get_associations_count(pool).await?,
    })
}

/// The highest-scoring associations with their signal and issue text.
pub async fn sample_associations(pool: &SqlitePool, limit: i64) -> Result<Vec<SampleAssociation>> {
    let rows = sqlx::query(
        r#"
        SELECT a.signal_id, s.summary, a.issue_id, i.title, a.score, a.method
        FROM associations a
        JOIN signals s ON s.id = a.signal_id
        JOIN issues i ON i.identifier = a.issue_id
        ORDER BY a.score DESC, a.signal_id ASC, a.issue_id ASC
        LIMIT ?
        "#,
    )
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SampleAssociation {
            signal_id: row.get("signal_id"),
            signal_summary: row.get("summary"),
            issue_id: row.get("issue_id"),
            issue_title: row.get("title"),
            score: row.get("score"),
            method: row.get("method"),
        })
        .collect())
}

/// Delete every row from all five tables, keeping the schema, then `VACUUM`.
///
/// Deletes run child tables first in one transaction; `VACUUM` cannot run
/// inside a transaction and follows the commit.
pub async fn purge_all(pool: &SqlitePool) -> Result<PurgeCounts> {
    let mut tx = pool.begin().await?;

    let associations = sqlx::query("DELETE FROM associations")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let signal_embeddings = sqlx::query("DELETE FROM signal_embeddings")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let issue_embeddings = sqlx::query("DELETE FROM issue_embeddings")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let signals = sqlx::query("DELETE FROM signals")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let issues = sqlx::query("DELETE FROM issues")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;

    sqlx::query("VACUUM").execute(pool).await?;

    Ok(PurgeCounts {
        associations,
        signal_embeddings,
        issue_embeddings,
        signals,
        issues,
    })
}

// ============ CLI ============

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

pub async fn run_issues(config: &Config, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let issues = list_issues_with_counts(&pool, limit).await?;
    pool.close().await;

    if issues.is_empty() {
        println!("No issues.");
        return Ok(());
    }

    println!(
        "{:<12} {:>7}  {:<14} {:<10}  {}",
        "ISSUE", "SIGNALS", "STATE", "CREATED", "TITLE"
    );
    for issue in &issues {
        println!(
            "{:<12} {:>7}  {:<14} {:<10}  {}",
            issue.identifier,
            issue.association_count,
            truncate(or_dash(issue.state_name.as_deref()), 14),
            truncate(&issue.created_at, 10),
            truncate(&issue.title, 60)
        );
    }
    Ok(())
}

pub async fn run_signals(config: &Config, limit: Option<i64>) -> Result<()> {
    let pool = db::connect(config).await?;
    let signals = list_signals_with_counts(&pool, limit).await?;
    pool.close().await;

    if signals.is_empty() {
        println!("No signals.");
        return Ok(());
    }

    println!(
        "{:>8} {:>6}  {:>3}  {:<10}  {}",
        "SIGNAL", "ISSUES", "SEV", "DATE", "SUMMARY"
    );
    for signal in &signals {
        println!(
            "{:>8} {:>6}  {:>3}  {:<10}  {}",
            signal.id,
            signal.association_count,
            signal.severity,
            truncate(&signal.date, 10),
            truncate(&signal.summary, 60)
        );
    }
    Ok(())
}

pub async fn run_issue(config: &Config, identifier: &str, min_score: Option<f64>) -> Result<()> {
    let min_score = min_score.unwrap_or(config.association.min_score);
    let pool = db::connect(config).await?;

    let Some(issue) = get_issue(&pool, identifier).await? else {
        pool.close().await;
        bail!("issue not found: {}", identifier);
    };
    let signals = get_signals_for_issue(&pool, identifier, min_score).await?;
    pool.close().await;

    println!("--- Issue ---");
    println!("identifier:   {}", issue.identifier);
    println!("title:        {}", issue.title);
    println!("state:        {}", or_dash(issue.state_name.as_deref()));
    println!("team:         {}", or_dash(issue.team_name.as_deref()));
    println!("assignee:     {}", or_dash(issue.assignee_name.as_deref()));
    if let Some(priority) = issue.priority {
        println!("priority:     {}", priority);
    }
    if !issue.labels.is_empty() {
        println!("labels:       {}", issue.labels.join(", "));
    }
    println!("created_at:   {}", issue.created_at);
    println!("updated_at:   {}", issue.updated_at);
    if let Some(desc) = issue.description.as_deref().filter(|d| !d.is_empty()) {
        println!();
        println!("{}", desc);
    }
    println!();

    println!("--- Signals ({}, score >= {}) ---", signals.len(), min_score);
    for s in &signals {
        println!(
            "{:.3}  [{}] {}  ({})",
            s.score,
            s.signal_id,
            truncate(&s.summary, 70),
            s.method
        );
    }
    Ok(())
}

pub async fn run_signal(config: &Config, id: i64, min_score: Option<f64>) -> Result<()> {
    let min_score = min_score.unwrap_or(config.association.min_score);
    let pool = db::connect(config).await?;

    let Some(signal) = get_signal(&pool, id).await? else {
        pool.close().await;
        bail!("signal not found: {}", id);
    };
    let issues = get_issues_for_signal(&pool, id, min_score).await?;
    pool.close().await;

    println!("--- Signal ---");
    println!("id:           {}", signal.id);
    println!("date:         {}", signal.date);
    println!("severity:     {}", signal.severity);
    println!("sentiment:    {}", signal.sentiment);
    println!("boundary:     {}", signal.boundary);
    if !signal.topics.is_empty() {
        println!("topics:       {}", signal.topics.join(", "));
    }
    println!();
    println!("{}", signal.summary);
    println!("{}", signal.context);
    println!();

    println!("--- Issues ({}, score >= {}) ---", issues.len(), min_score);
    for i in &issues {
        println!(
            "{:.3}  {:<12} {}  ({})",
            i.score,
            i.issue_id,
            truncate(&i.title, 70),
            i.method
        );
    }
    Ok(())
}

pub async fn run_link(config: &Config, signal_id: i64, issue_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let association = get_association(&pool, signal_id, issue_id).await?;
    pool.close().await;

    let Some(a) = association else {
        bail!("no association between signal {} and issue {}", signal_id, issue_id);
    };

    println!("signal:     {}", a.signal_id);
    println!("issue:      {}", a.issue_id);
    println!("score:      {:.4}", a.score);
    println!("reason:     {}", a.reason);
    println!("method:     {}", a.method);
    println!("created_at: {}", format_ts_iso(a.created_at));
    Ok(())
}

pub async fn run_sample(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let sample = sample_associations(&pool, limit).await?;
    pool.close().await;
    print_sample(&sample);
    Ok(())
}

pub fn print_sample(sample: &[SampleAssociation]) {
    if sample.is_empty() {
        println!("No associations.");
        return;
    }
    println!("Top {} associations:", sample.len());
    for (n, s) in sample.iter().enumerate() {
        println!();
        println!("{}. score {:.3} ({})", n + 1, s.score, s.method);
        println!("   signal {}: {}", s.signal_id, truncate(&s.signal_summary, 80));
        println!("   issue {}: {}", s.issue_id, truncate(&s.issue_title, 80));
    }
}

pub async fn run_purge(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        bail!("purge deletes every signal, issue, embedding, and association; pass --yes to confirm");
    }

    let pool = db::connect(config).await?;
    let counts = purge_all(&pool).await?;
    pool.close().await;

    tracing::warn!(rows = counts.total(), "database purged");
    println!("purge");
    println!("  associations: {}", counts.associations);
    println!("  signal_embeddings: {}", counts.signal_embeddings);
    println!("  issue_embeddings: {}", counts.issue_embeddings);
    println!("  signals: {}", counts.signals);
    println!("  issues: {}", counts.issues);
    println!("  total: {}", counts.total());
    Ok(())
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("login fails", 20), "login fails");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
    }

    #[test]
    fn tags_parse_or_empty() {
        assert_eq!(parse_tags(r#"["ux","auth"]"#), vec!["ux", "auth"]);
        assert!(parse_tags("not json").is_empty());
    }

    #[test]
    fn negative_limit_means_unbounded() {
        assert_eq!(limit_value(None), -1);
        assert_eq!(limit_value(Some(-5)), -1);
        assert_eq!(limit_value(Some(10)), 10);
    }

    #[test]
    fn iso_timestamps() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}
