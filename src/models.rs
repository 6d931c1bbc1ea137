//! Core data models for signals, issues, embeddings, and associations.
//!
//! Signals and issues are owned by external collaborators (importers,
//! tracker sync); the association pipeline only reads them. Embeddings and
//! associations are derived data written by the pipeline.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Which entity table an embedding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Signal,
    Issue,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Signal, EntityKind::Issue];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Signal => "signal",
            EntityKind::Issue => "issue",
        }
    }

    /// Name of the embedding table for this kind.
    pub(crate) fn embedding_table(&self) -> &'static str {
        match self {
            EntityKind::Signal => "signal_embeddings",
            EntityKind::Issue => "issue_embeddings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" | "signals" => Ok(EntityKind::Signal),
            "issue" | "issues" => Ok(EntityKind::Issue),
            other => anyhow::bail!("Unknown entity kind: {}. Use signals or issues.", other),
        }
    }
}

/// Identifier of an embeddable entity.
///
/// Signals carry an externally assigned integer id; issues are keyed by
/// their tracker identifier (e.g. `ENG-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    Signal(i64),
    Issue(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Signal(id) => write!(f, "signal {}", id),
            EntityId::Issue(id) => write!(f, "issue {}", id),
        }
    }
}

/// An observation record as stored in the `signals` table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Signal {
    pub id: i64,
    pub summary: String,
    pub context: String,
    pub sentiment: i64,
    pub severity: i64,
    pub bias: i64,
    pub date: String,
    pub boundary: String,
    pub method: String,
    pub topics: Vec<String>,
    pub keywords: Vec<String>,
    pub impacts: Vec<String>,
    pub emotions: Vec<String>,
}

/// A tracked work item as stored in the `issues` table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Issue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub state_name: Option<String>,
    pub state_type: Option<String>,
    pub team_name: Option<String>,
    pub team_key: Option<String>,
    pub assignee_name: Option<String>,
    pub assignee_email: Option<String>,
    pub creator_name: Option<String>,
    pub creator_email: Option<String>,
    pub priority: Option<i64>,
    pub estimate: Option<f64>,
    pub labels: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Canonical embedding text for a signal: summary and context on separate lines.
pub fn signal_text(summary: &str, context: &str) -> String {
    format!("{}\n{}", summary, context)
}

/// Canonical embedding text for an issue; a missing description embeds as empty.
pub fn issue_text(title: &str, description: Option<&str>) -> String {
    format!("{}\n{}", title, description.unwrap_or(""))
}

/// A persisted link between one signal and one issue.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Association {
    pub id: i64,
    pub signal_id: i64,
    pub issue_id: String,
    pub score: f64,
    pub reason: String,
    pub method: String,
    pub created_at: i64,
}

/// An association produced by the engine, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAssociation {
    pub signal_id: i64,
    pub issue_id: String,
    pub score: f64,
    pub reason: String,
    pub method: String,
}

impl NewAssociation {
    pub fn new(signal_id: i64, issue_id: &str, score: f64, method: &str) -> Self {
        Self {
            signal_id,
            issue_id: issue_id.to_string(),
            score,
            reason: format!("Semantic similarity: {:.2}", score),
            method: method.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_texts_join_with_newline() {
        assert_eq!(signal_text("login fails", "on mobile"), "login fails\non mobile");
        assert_eq!(issue_text("Login button", None), "Login button\n");
        assert_eq!(issue_text("Login button", Some("tap does nothing")), "Login button\ntap does nothing");
    }

    #[test]
    fn reason_rounds_to_two_places() {
        let a = NewAssociation::new(1, "ENG-1", 0.8249, "exhaustive-m");
        assert_eq!(a.reason, "Semantic similarity: 0.82");
        assert_eq!(a.issue_id, "ENG-1");
    }

    #[test]
    fn entity_kind_parses_plural_and_singular() {
        assert_eq!("signals".parse::<EntityKind>().unwrap(), EntityKind::Signal);
        assert_eq!("issue".parse::<EntityKind>().unwrap(), EntityKind::Issue);
        assert!("docs".parse::<EntityKind>().is_err());
    }
}
