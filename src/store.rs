//! SQLite access for the derived tables: embeddings and associations.
//!
//! Every write here is independently idempotent. Embeddings are upserted by
//! (entity, model); associations are inserted only if the (signal, issue)
//! pair is absent, with the uniqueness constraint doing the check so that
//! check-and-insert is one atomic statement.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{issue_text, signal_text, EntityId, EntityKind, NewAssociation};

/// An entity that needs an embedding under the requested model.
#[derive(Debug, Clone)]
pub struct PendingEntity {
    pub id: EntityId,
    pub text: String,
    pub text_hash: String,
}

/// Issue ids already linked to each signal.
///
/// Materialized once per association run and used as an in-memory set
/// difference in place of a `LEFT JOIN ... IS NULL` over the cross product.
#[derive(Debug, Default)]
pub struct AssociatedPairs {
    by_signal: HashMap<i64, HashSet<String>>,
}

impl AssociatedPairs {
    pub fn for_signal(&self, signal_id: i64) -> Option<&HashSet<String>> {
        self.by_signal.get(&signal_id)
    }

    pub fn insert(&mut self, signal_id: i64, issue_id: &str) {
        self.by_signal
            .entry(signal_id)
            .or_default()
            .insert(issue_id.to_string());
    }
}

/// Outcome of one insert-if-absent batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub already_present: u64,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Entities of `kind` with no embedding under `model`.
    ///
    /// With `refresh_stale`, entities whose stored hash no longer matches
    /// their current text are returned as well.
    pub async fn pending_entities(
        &self,
        kind: EntityKind,
        model: &str,
        limit: Option<usize>,
        refresh_stale: bool,
    ) -> Result<Vec<PendingEntity>> {
        // Stale filtering happens after the query, so the limit must too.
        let limit_val = match (limit, refresh_stale) {
            (Some(l), false) => l as i64,
            _ => -1,
        };

        let sql = match kind {
            EntityKind::Signal => {
                r#"
                SELECT s.id AS id, s.summary AS a, s.context AS b, e.hash AS hash
                FROM signals s
                LEFT JOIN signal_embeddings e ON e.signal_id = s.id AND e.model = ?
                WHERE e.signal_id IS NULL OR ?
                ORDER BY s.id
                LIMIT ?
                "#
            }
            EntityKind::Issue => {
                r#"
                SELECT i.identifier AS id, i.title AS a, i.description AS b, e.hash AS hash
                FROM issues i
                LEFT JOIN issue_embeddings e ON e.issue_id = i.identifier AND e.model = ?
                WHERE e.issue_id IS NULL OR ?
                ORDER BY i.identifier
                LIMIT ?
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(model)
            .bind(refresh_stale)
            .bind(limit_val)
            .fetch_all(&self.pool)
            .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, text) = match kind {
                EntityKind::Signal => {
                    let a: String = row.get("a");
                    let b: String = row.get("b");
                    (EntityId::Signal(row.get("id")), signal_text(&a, &b))
                }
                EntityKind::Issue => {
                    let a: String = row.get("a");
                    let b: Option<String> = row.get("b");
                    (EntityId::Issue(row.get("id")), issue_text(&a, b.as_deref()))
                }
            };
            let text_hash = hash_text(&text);
            let stored: Option<String> = row.get("hash");
            if stored.as_deref() == Some(text_hash.as_str()) {
                // Only reachable with refresh_stale: the stored vector is current.
                continue;
            }
            pending.push(PendingEntity {
                id,
                text,
                text_hash,
            });
            if limit.is_some_and(|l| pending.len() >= l) {
                break;
            }
        }

        Ok(pending)
    }

    /// Store or replace the embedding of one entity under `model`.
    pub async fn upsert_embedding(
        &self,
        id: &EntityId,
        model: &str,
        text_hash: &str,
        vector: &[f32],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let blob = vec_to_blob(vector);

        let query = match id {
            EntityId::Signal(signal_id) => sqlx::query(
                r#"
                INSERT INTO signal_embeddings (signal_id, model, dims, hash, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(signal_id, model) DO UPDATE SET
                    dims = excluded.dims,
                    hash = excluded.hash,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(*signal_id),
            EntityId::Issue(issue_id) => sqlx::query(
                r#"
                INSERT INTO issue_embeddings (issue_id, model, dims, hash, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(issue_id, model) DO UPDATE SET
                    dims = excluded.dims,
                    hash = excluded.hash,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(issue_id.as_str()),
        };

        query
            .bind(model)
            .bind(vector.len() as i64)
            .bind(text_hash)
            .bind(blob)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete every embedding of `kind`, across all models.
    pub async fn clear_embeddings(&self, kind: EntityKind) -> Result<u64> {
        let sql = format!("DELETE FROM {}", kind.embedding_table());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// All signal vectors stored under `model`, for signals that still exist.
    pub async fn signal_vectors(&self, model: &str) -> Result<Vec<(i64, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.signal_id, e.embedding
            FROM signal_embeddings e
            JOIN signals s ON s.id = e.signal_id
            WHERE e.model = ?
            ORDER BY e.signal_id
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("signal_id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// All issue vectors stored under `model`, keyed by issue identifier.
    pub async fn issue_vectors(&self, model: &str) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT e.issue_id, e.embedding
            FROM issue_embeddings e
            JOIN issues i ON i.identifier = e.issue_id
            WHERE e.model = ?
            ORDER BY e.issue_id
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("issue_id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// Every (signal, issue) pair that already has an association, regardless of method.
    pub async fn associated_pairs(&self) -> Result<AssociatedPairs> {
        let rows = sqlx::query("SELECT signal_id, issue_id FROM associations")
            .fetch_all(&self.pool)
            .await?;

        let mut pairs = AssociatedPairs::default();
        for row in rows {
            let signal_id: i64 = row.get("signal_id");
            let issue_id: String = row.get("issue_id");
            pairs.insert(signal_id, &issue_id);
        }
        Ok(pairs)
    }

    /// Insert associations whose pair is absent; existing rows win.
    ///
    /// Runs in one transaction, so a batch is either fully applied or not
    /// at all.
    pub async fn insert_associations(&self, records: &[NewAssociation]) -> Result<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO associations (signal_id, issue_id, score, reason, method, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(signal_id, issue_id) DO NOTHING
                "#,
            )
            .bind(record.signal_id)
            .bind(&record.issue_id)
            .bind(record.score)
            .bind(&record.reason)
            .bind(&record.method)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.already_present += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associated_pairs_lookup() {
        let mut pairs = AssociatedPairs::default();
        assert!(pairs.for_signal(1).is_none());
        pairs.insert(1, "ENG-1");
        pairs.insert(1, "ENG-2");
        pairs.insert(1, "ENG-1");
        pairs.insert(2, "ENG-1");
        assert_eq!(pairs.for_signal(1).map(|s| s.len()), Some(2));
        assert!(pairs.for_signal(1).is_some_and(|s| s.contains("ENG-2")));
        assert!(!pairs.for_signal(2).is_some_and(|s| s.contains("ENG-2")));
        assert!(pairs.for_signal(3).is_none());
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = hash_text("login fails\n");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_text("login fails\n"));
        assert_ne!(h, hash_text("login fails"));
    }
}
