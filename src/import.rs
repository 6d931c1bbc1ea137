//! JSON import of signals and tracker issues.
//!
//! Both files are JSON arrays. Each record is validated on its own: a record
//! with a missing or mistyped required field is skipped, logged, and counted
//! as an error, while the rest of the file is still imported. A file that is
//! not a JSON array at all is rejected before anything is written.
//!
//! Records are upserted by primary key, so re-importing a refreshed export
//! updates rows in place. Embeddings whose text changed become stale and can
//! be refreshed with `siglink embed pending --refresh-stale`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::EntityKind;

/// Why a single record could not be imported.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("{0}")]
    Malformed(#[from] serde_json::Error),
    #[error("identifier `{identifier}` already belongs to issue {other}")]
    IdentifierTaken { identifier: String, other: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub total: u64,
    pub inserted: u64,
    pub updated: u64,
    pub errors: u64,
}

/// `{ "name": "ux" }`, the shape of every tag and label.
#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

fn tags_json(tags: Option<&[Named]>) -> String {
    let names: Vec<&str> = tags
        .unwrap_or_default()
        .iter()
        .map(|tag| tag.name.as_str())
        .collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Debug, Deserialize)]
struct SignalRecord {
    id: i64,
    summary: String,
    context: String,
    sentiment: i64,
    severity: i64,
    bias: i64,
    date: String,
    boundary: String,
    method: String,
    topics: Option<Vec<Named>>,
    keywords: Option<Vec<Named>>,
    impacts: Option<Vec<Named>>,
    emotions: Option<Vec<Named>>,
}

#[derive(Debug, Deserialize)]
struct State {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Team {
    name: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Person {
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Labels {
    nodes: Option<Vec<Named>>,
}

/// One issue node as exported by the tracker's GraphQL API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueRecord {
    id: String,
    identifier: String,
    title: String,
    description: Option<String>,
    state: Option<State>,
    team: Option<Team>,
    assignee: Option<Person>,
    creator: Option<Person>,
    priority: Option<i64>,
    estimate: Option<f64>,
    labels: Option<Labels>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn parse_signal(value: &Value) -> Result<SignalRecord, RecordError> {
    Ok(SignalRecord::deserialize(value)?)
}

fn parse_issue(value: &Value) -> Result<IssueRecord, RecordError> {
    Ok(IssueRecord::deserialize(value)?)
}

async fn upsert_signal(tx: &mut Transaction<'_, Sqlite>, s: &SignalRecord) -> Result<bool> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM signals WHERE id = ?")
        .bind(s.id)
        .fetch_optional(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO signals (id, summary, context, sentiment, severity, bias, date, boundary,
                             method, topics, keywords, impacts, emotions)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            summary = excluded.summary,
            context = excluded.context,
            sentiment = excluded.sentiment,
            severity = excluded.severity,
            bias = excluded.bias,
            date = excluded.date,
            boundary = excluded.boundary,
            method = excluded.method,
            topics = excluded.topics,
            keywords = excluded.keywords,
            impacts = excluded.impacts,
            emotions = excluded.emotions
        "#,
    )
    .bind(s.id)
    .bind(&s.summary)
    .bind(&s.context)
    .bind(s.sentiment)
    .bind(s.severity)
    .bind(s.bias)
    .bind(&s.date)
    .bind(&s.boundary)
    .bind(&s.method)
    .bind(tags_json(s.topics.as_deref()))
    .bind(tags_json(s.keywords.as_deref()))
    .bind(tags_json(s.impacts.as_deref()))
    .bind(tags_json(s.emotions.as_deref()))
    .execute(&mut **tx)
    .await?;

    Ok(exists.is_none())
}

async fn upsert_issue(tx: &mut Transaction<'_, Sqlite>, i: &IssueRecord) -> Result<bool> {
    let state = i.state.as_ref();
    let team = i.team.as_ref();
    let assignee = i.assignee.as_ref();
    let creator = i.creator.as_ref();
    let labels = i.labels.as_ref().and_then(|l| l.nodes.as_deref());

    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM issues WHERE id = ?")
        .bind(&i.id)
        .fetch_optional(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO issues (id, identifier, title, description, state_name, state_type,
                            team_name, team_key, assignee_name, assignee_email,
                            creator_name, creator_email, priority, estimate, labels,
                            created_at, updated_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            identifier = excluded.identifier,
            title = excluded.title,
            description = excluded.description,
            state_name = excluded.state_name,
            state_type = excluded.state_type,
            team_name = excluded.team_name,
            team_key = excluded.team_key,
            assignee_name = excluded.assignee_name,
            assignee_email = excluded.assignee_email,
            creator_name = excluded.creator_name,
            creator_email = excluded.creator_email,
            priority = excluded.priority,
            estimate = excluded.estimate,
            labels = excluded.labels,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at
        "#,
    )
    .bind(&i.id)
    .bind(&i.identifier)
    .bind(&i.title)
    .bind(&i.description)
    .bind(state.and_then(|s| s.name.as_deref()))
    .bind(state.and_then(|s| s.kind.as_deref()))
    .bind(team.and_then(|t| t.name.as_deref()))
    .bind(team.and_then(|t| t.key.as_deref()))
    .bind(assignee.and_then(|p| p.name.as_deref()))
    .bind(assignee.and_then(|p| p.email.as_deref()))
    .bind(creator.and_then(|p| p.name.as_deref()))
    .bind(creator.and_then(|p| p.email.as_deref()))
    .bind(i.priority)
    .bind(i.estimate)
    .bind(tags_json(labels))
    .bind(&i.created_at)
    .bind(&i.updated_at)
    .bind(&i.completed_at)
    .execute(&mut **tx)
    .await?;

    Ok(exists.is_none())
}

/// Parse `content` as a JSON array of records.
pub fn parse_records(content: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(content).context("import file is not valid JSON")?;
    match value {
        Value::Array(records) => Ok(records),
        _ => bail!("import file must contain a JSON array of records"),
    }
}

/// Upsert every valid signal record; invalid ones are counted and skipped.
pub async fn import_signals(pool: &SqlitePool, records: &[Value]) -> Result<ImportReport> {
    let mut report = ImportReport {
        total: records.len() as u64,
        ..Default::default()
    };
    let mut tx = pool.begin().await?;

    for (n, value) in records.iter().enumerate() {
        let signal = match parse_signal(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(record = n, error = %e, "skipping invalid signal record");
                report.errors += 1;
                continue;
            }
        };
        if upsert_signal(&mut tx, &signal).await? {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }
    }

    tx.commit().await?;
    Ok(report)
}

/// Upsert every valid issue record; invalid ones are counted and skipped.
///
/// A record whose `identifier` is already used by a different issue id
/// violates the uniqueness constraint and is counted as an error.
pub async fn import_issues(pool: &SqlitePool, records: &[Value]) -> Result<ImportReport> {
    let mut report = ImportReport {
        total: records.len() as u64,
        ..Default::default()
    };
    let mut tx = pool.begin().await?;

    for (n, value) in records.iter().enumerate() {
        let issue = match parse_issue(value) {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(record = n, error = %e, "skipping invalid issue record");
                report.errors += 1;
                continue;
            }
        };

        let taken: Option<String> =
            sqlx::query_scalar("SELECT id FROM issues WHERE identifier = ? AND id != ?")
                .bind(&issue.identifier)
                .bind(&issue.id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(other) = taken {
            let e = RecordError::IdentifierTaken {
                identifier: issue.identifier.clone(),
                other,
            };
            tracing::warn!(record = n, error = %e, "skipping invalid issue record");
            report.errors += 1;
            continue;
        }

        if upsert_issue(&mut tx, &issue).await? {
            report.inserted += 1;
        } else {
            report.updated += 1;
        }
    }

    tx.commit().await?;
    Ok(report)
}

/// CLI entry point for `siglink import <kind> <file>`.
pub async fn run_import(config: &Config, kind: EntityKind, path: &Path) -> Result<ImportReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let records = parse_records(&content).with_context(|| format!("in {}", path.display()))?;

    let pool = db::connect(config).await?;
    let report = match kind {
        EntityKind::Signal => import_signals(&pool, &records).await?,
        EntityKind::Issue => import_issues(&pool, &records).await?,
    };
    pool.close().await;

    println!("import {}s from {}", kind, path.display());
    println!("  records: {}", report.total);
    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    println!("  errors: {}", report.errors);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal_json() -> Value {
        json!({
            "id": 7,
            "summary": "login fails",
            "context": "on mobile after update",
            "sentiment": -2,
            "severity": 3,
            "bias": 0,
            "date": "2024-05-01",
            "boundary": "external",
            "method": "survey",
            "topics": [{ "name": "auth" }, { "name": "mobile" }]
        })
    }

    #[test]
    fn parses_signal_with_tags() {
        let s = parse_signal(&signal_json()).unwrap();
        assert_eq!(s.id, 7);
        assert_eq!(tags_json(s.topics.as_deref()), r#"["auth","mobile"]"#);
        assert_eq!(tags_json(s.keywords.as_deref()), "[]");
    }

    #[test]
    fn signal_missing_field_is_named() {
        let mut v = signal_json();
        v.as_object_mut().unwrap().remove("context");
        let err = parse_signal(&v).unwrap_err();
        assert!(err.to_string().contains("missing field `context`"), "{}", err);
    }

    #[test]
    fn signal_wrong_type_is_rejected() {
        let mut v = signal_json();
        v["severity"] = json!("high");
        assert!(matches!(parse_signal(&v), Err(RecordError::Malformed(_))));
        v["severity"] = json!(null);
        assert!(parse_signal(&v).is_err());
        assert!(parse_signal(&json!([1, 2])).is_err());

        let mut v = signal_json();
        v["topics"] = json!([{ "label": "auth" }]);
        assert!(parse_signal(&v).is_err());
    }

    #[test]
    fn parses_tracker_issue_node() {
        let v = json!({
            "id": "uuid-1",
            "identifier": "ENG-1",
            "title": "Login button unresponsive",
            "description": null,
            "state": { "name": "In Progress", "type": "started" },
            "team": { "name": "Engineering", "key": "ENG" },
            "assignee": null,
            "priority": 2,
            "estimate": 1.5,
            "labels": { "nodes": [{ "name": "bug" }] },
            "createdAt": "2024-04-01T00:00:00Z",
            "updatedAt": "2024-04-02T00:00:00Z"
        });
        let i = parse_issue(&v).unwrap();
        assert_eq!(i.identifier, "ENG-1");
        assert_eq!(i.description, None);
        assert_eq!(i.state.and_then(|s| s.kind).as_deref(), Some("started"));
        assert_eq!(i.team.and_then(|t| t.key).as_deref(), Some("ENG"));
        assert!(i.assignee.is_none());
        assert_eq!(i.estimate, Some(1.5));
        let labels = i.labels.and_then(|l| l.nodes);
        assert_eq!(tags_json(labels.as_deref()), r#"["bug"]"#);
        assert_eq!(i.created_at, "2024-04-01T00:00:00Z");
        assert_eq!(i.completed_at, None);
    }

    #[test]
    fn issue_requires_camel_case_timestamps() {
        let v = json!({
            "id": "uuid-1",
            "identifier": "ENG-1",
            "title": "Login button unresponsive",
            "created_at": "2024-04-01",
            "updated_at": "2024-04-01"
        });
        let err = parse_issue(&v).unwrap_err();
        assert!(err.to_string().contains("createdAt"), "{}", err);
    }

    #[test]
    fn rejects_non_array_files() {
        assert!(parse_records("{\"id\": 1}").is_err());
        assert!(parse_records("not json").is_err());
        assert_eq!(parse_records("[]").unwrap().len(), 0);
    }
}
