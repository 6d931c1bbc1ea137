//! The association engine.
//!
//! Turns candidate-search output into persisted associations:
//!
//! 1. Load signal and issue vectors for the configured model and the set of
//!    (signal, issue) pairs that are already associated.
//! 2. Build the configured [`CandidateSearch`] backend over the issue vectors.
//! 3. For each signal, score candidates that are not yet associated.
//! 4. Keep candidates with `score >= threshold` and insert them if absent.
//!
//! Existing associations are never rescored or overwritten, whichever method
//! produced them. Each signal's inserts commit on their own, so a run that is
//! killed part way leaves only complete, valid rows behind and the next run
//! continues with the pairs that are still missing.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;

use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::embedding;
use crate::index::IndexKind;
use crate::models::{EntityKind, NewAssociation};
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter, SCORING_REPORT_EVERY};
use crate::queries;
use crate::search::{build_backend, BackendKind};
use crate::store::SqliteStore;

/// Everything the engine needs to know, fixed for one run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding model whose vectors are compared.
    pub model: String,
    pub backend: BackendKind,
    pub index: IndexKind,
    pub top_k: usize,
    pub threshold: f64,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: embedding::configured_model_name(&config.embedding),
            backend: config.association.backend,
            index: config.association.index,
            top_k: config.association.top_k,
            threshold: config.association.threshold,
        }
    }
}

/// Summary statistics over the scores inserted in one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreStats {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    /// Scores at or above 0.8.
    pub high: u64,
    /// Scores in [0.5, 0.8).
    pub medium: u64,
    /// Scores below 0.5 (only possible with a threshold under 0.5).
    pub low: u64,
}

impl ScoreStats {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let mut sorted = scores.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        Some(Self {
            count: n as u64,
            mean: sorted.iter().sum::<f64>() / n as f64,
            min: sorted[0],
            max: sorted[n - 1],
            median,
            high: sorted.iter().filter(|s| **s >= 0.8).count() as u64,
            medium: sorted.iter().filter(|s| (0.5..0.8).contains(*s)).count() as u64,
            low: sorted.iter().filter(|s| **s < 0.5).count() as u64,
        })
    }
}

/// Counts for one `compute_associations` run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationReport {
    pub method: String,
    pub threshold: f64,
    pub signals: u64,
    pub issues: u64,
    /// Signals not scored this run (dimension mismatch).
    pub signals_skipped: u64,
    /// Signals with every issue already associated.
    pub signals_complete: u64,
    pub pairs_scored: u64,
    pub inserted: u64,
    pub below_threshold: u64,
    /// Eligible pairs that another writer persisted first.
    pub already_present: u64,
    pub stats: Option<ScoreStats>,
}

pub struct AssociationEngine<'a> {
    store: &'a SqliteStore,
    config: EngineConfig,
}

impl<'a> AssociationEngine<'a> {
    pub fn new(store: &'a SqliteStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Score every not-yet-associated (signal, issue) pair the backend
    /// surfaces and persist those at or above the threshold.
    pub async fn compute_associations(
        &self,
        progress: &dyn ProgressReporter,
    ) -> Result<AssociationReport> {
        let cfg = &self.config;

        let signals = self.store.signal_vectors(&cfg.model).await?;
        let issues = self.store.issue_vectors(&cfg.model).await?;
        let mut associated = self.store.associated_pairs().await?;
        let issue_count = issues.len() as u64;
        let loaded: HashSet<String> = issues.iter().map(|(id, _)| id.clone()).collect();

        if cfg.backend == BackendKind::Indexed {
            progress.report(ProgressEvent::Indexing {
                backend: format!("{}-{}", cfg.backend, cfg.index),
                issues: issue_count,
            });
        }
        let backend = build_backend(cfg.backend, cfg.index, cfg.top_k, issues)?;
        let method = format!("{}-{}", backend.name(), cfg.model);

        let mut report = AssociationReport {
            method: method.clone(),
            threshold: cfg.threshold,
            signals: signals.len() as u64,
            issues: issue_count,
            signals_skipped: 0,
            signals_complete: 0,
            pairs_scored: 0,
            inserted: 0,
            below_threshold: 0,
            already_present: 0,
            stats: None,
        };

        let Some(dims) = backend.dims() else {
            tracing::info!(model = %cfg.model, "no issue embeddings; nothing to associate");
            return Ok(report);
        };

        let total = signals.len() as u64;
        let mut inserted_scores = Vec::new();

        for (n, (signal_id, vector)) in signals.iter().enumerate() {
            let signal_id = *signal_id;

            if vector.len() != dims {
                tracing::warn!(
                    signal_id,
                    dims = vector.len(),
                    expected = dims,
                    "signal embedding dimension does not match issues, skipping"
                );
                report.signals_skipped += 1;
                continue;
            }

            // Links to issues without a vector under this model do not count.
            let linked = associated.for_signal(signal_id);
            if cfg.backend == BackendKind::Exhaustive
                && linked.is_some_and(|l| {
                    l.iter().filter(|id| loaded.contains(*id)).count() as u64 >= issue_count
                })
            {
                report.signals_complete += 1;
                continue;
            }

            let candidates = backend.candidates(vector, linked)?;
            let mut eligible = Vec::new();
            for candidate in candidates {
                report.pairs_scored += 1;
                if candidate.score >= cfg.threshold {
                    eligible.push(NewAssociation::new(
                        signal_id,
                        &candidate.issue_id,
                        candidate.score,
                        &method,
                    ));
                } else {
                    report.below_threshold += 1;
                }
            }

            let outcome = self.store.insert_associations(&eligible).await?;
            report.inserted += outcome.inserted;
            report.already_present += outcome.already_present;
            for record in &eligible {
                associated.insert(signal_id, &record.issue_id);
            }
            if outcome.already_present == 0 {
                inserted_scores.extend(eligible.iter().map(|r| r.score));
            } else {
                // A concurrent writer got there first; count only what we wrote.
                tracing::debug!(
                    signal_id,
                    collisions = outcome.already_present,
                    "some associations already existed"
                );
            }

            let done = n as u64 + 1;
            if done % SCORING_REPORT_EVERY == 0 || done == total {
                progress.report(ProgressEvent::Scoring {
                    backend: backend.name(),
                    n: done,
                    total,
                });
            }
        }

        report.stats = ScoreStats::from_scores(&inserted_scores);

        tracing::info!(
            method = %method,
            inserted = report.inserted,
            scored = report.pairs_scored,
            "association pass finished"
        );

        Ok(report)
    }
}

/// CLI entry point: compute associations with optional overrides.
pub async fn run_associate(
    config: &Config,
    backend: Option<BackendKind>,
    index: Option<IndexKind>,
    threshold: Option<f64>,
    top_k: Option<usize>,
    progress: ProgressMode,
) -> Result<AssociationReport> {
    let mut engine_config = EngineConfig::from_config(config);
    if let Some(b) = backend {
        engine_config.backend = b;
    }
    if let Some(i) = index {
        engine_config.index = i;
    }
    if let Some(t) = threshold {
        if !t.is_finite() || !(-1.0..=1.0).contains(&t) {
            anyhow::bail!("--threshold must be in [-1.0, 1.0]");
        }
        engine_config.threshold = t;
    }
    if let Some(k) = top_k {
        if k == 0 {
            anyhow::bail!("--top-k must be >= 1");
        }
        engine_config.top_k = k;
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let reporter = progress.reporter();

    let engine = AssociationEngine::new(&store, engine_config);
    let report = engine.compute_associations(reporter.as_ref()).await?;
    print_report(&report);

    let total = queries::get_associations_count(store.pool()).await?;
    println!("  total associations: {}", total);

    store.close().await;
    Ok(report)
}

/// `siglink run`: embed whatever is missing, associate, then show the best links.
pub async fn run_pipeline(config: &Config, sample: i64, progress: ProgressMode) -> Result<()> {
    embed_cmd::run_embed_pending(config, &EntityKind::ALL, None, None, false, false, progress)
        .await?;
    println!();
    run_associate(config, None, None, None, None, progress).await?;
    println!();
    queries::run_sample(config, sample).await
}

pub fn print_report(report: &AssociationReport) {
    println!(
        "associate (method: {}, threshold: {})",
        report.method, report.threshold
    );
    println!("  signals: {}", report.signals);
    println!("  issues: {}", report.issues);
    if report.signals_skipped > 0 {
        println!("  signals skipped: {}", report.signals_skipped);
    }
    println!("  pairs scored: {}", report.pairs_scored);
    println!("  below threshold: {}", report.below_threshold);
    println!("  inserted: {}", report.inserted);
    if report.already_present > 0 {
        println!("  already present: {}", report.already_present);
    }

    if let Some(stats) = &report.stats {
        println!("  score mean: {:.3}", stats.mean);
        println!("  score min: {:.3}", stats.min);
        println!("  score max: {:.3}", stats.max);
        println!("  score median: {:.3}", stats.median);
        let pct = |n: u64| n as f64 * 100.0 / stats.count as f64;
        println!("  high (>=0.8): {} ({:.1}%)", stats.high, pct(stats.high));
        println!("  medium (0.5-0.8): {} ({:.1}%)", stats.medium, pct(stats.medium));
        if stats.low > 0 {
            println!("  low (<0.5): {} ({:.1}%)", stats.low, pct(stats.low));
        }
    }
}
