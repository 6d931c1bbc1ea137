//! Embedding generation: fill the embedding store for entities that lack a vector.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::models::EntityKind;
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use crate::store::{PendingEntity, SqliteStore};

#[derive(Debug, Clone, Copy)]
pub struct EmbedOptions {
    /// Embed at most this many entities in one run.
    pub limit: Option<usize>,
    pub batch_size: usize,
    /// Also re-embed entities whose text changed since their vector was stored.
    pub refresh_stale: bool,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            limit: None,
            batch_size: 64,
            refresh_stale: false,
        }
    }
}

/// Counts for one `ensure_embeddings` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbedReport {
    pub kind: EntityKind,
    pub pending: u64,
    pub embedded: u64,
    pub skipped: u64,
}

impl EmbedReport {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            pending: 0,
            embedded: 0,
            skipped: 0,
        }
    }
}

/// Embed every entity of `kind` that has no vector under the provider's model.
///
/// Entities are embedded in batches of `opts.batch_size`; each batch is
/// written before the next is requested, so an interrupted run keeps every
/// completed batch and the next run picks up only what is still missing.
/// A provider failure aborts the run. Entities with blank text are skipped
/// and counted.
pub async fn ensure_embeddings(
    store: &SqliteStore,
    provider: &dyn EmbeddingProvider,
    kind: EntityKind,
    opts: &EmbedOptions,
    progress: &dyn ProgressReporter,
) -> Result<EmbedReport> {
    let model = provider.model_name().to_string();
    let pending = store
        .pending_entities(kind, &model, opts.limit, opts.refresh_stale)
        .await?;

    let mut report = EmbedReport::new(kind);
    report.pending = pending.len() as u64;
    if pending.is_empty() {
        return Ok(report);
    }

    let (embeddable, blank): (Vec<PendingEntity>, Vec<PendingEntity>) =
        pending.into_iter().partition(|p| !p.text.trim().is_empty());

    for item in &blank {
        tracing::warn!(entity = %item.id, "skipping entity with no text to embed");
        report.skipped += 1;
    }

    if opts.batch_size == 0 {
        bail!("embedding batch size must be >= 1");
    }
    let total = report.pending;

    for batch in embeddable.chunks(opts.batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        let vectors = provider
            .embed(&texts)
            .await
            .with_context(|| format!("embedding batch of {} {}s failed", batch.len(), kind))?;

        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }

        for (item, vector) in batch.iter().zip(vectors.iter()) {
            if vector.is_empty() {
                tracing::warn!(entity = %item.id, "provider returned an empty vector, skipping");
                report.skipped += 1;
                continue;
            }
            let expected = provider.dims();
            if expected != 0 && vector.len() != expected {
                bail!(
                    "model {} returned {} dims for {}, expected {} (check embedding.dims)",
                    model,
                    vector.len(),
                    item.id,
                    expected
                );
            }
            store
                .upsert_embedding(&item.id, &model, &item.text_hash, vector)
                .await?;
            report.embedded += 1;
        }

        progress.report(ProgressEvent::Embedding {
            kind,
            n: report.embedded + report.skipped,
            total,
        });
    }

    tracing::info!(
        kind = %kind,
        model = %model,
        embedded = report.embedded,
        skipped = report.skipped,
        "embedding pass finished"
    );

    Ok(report)
}

fn batch_size(config: &Config, batch_size_override: Option<usize>) -> Result<usize> {
    match batch_size_override {
        Some(0) => bail!("--batch-size must be >= 1"),
        Some(n) => Ok(n),
        None => Ok(config.embedding.batch_size),
    }
}

/// Find and embed entities that are missing embeddings.
pub async fn run_embed_pending(
    config: &Config,
    kinds: &[EntityKind],
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
    refresh_stale: bool,
    progress: ProgressMode,
) -> Result<()> {
    let batch_size = batch_size(config, batch_size_override)?;
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    if dry_run {
        let model = embedding::configured_model_name(&config.embedding);
        println!("embed pending (dry-run)");
        for &kind in kinds {
            let pending = store
                .pending_entities(kind, &model, limit, refresh_stale)
                .await?;
            println!("  {}s needing embeddings: {}", kind, pending.len());
        }
        store.close().await;
        return Ok(());
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let opts = EmbedOptions {
        limit,
        batch_size,
        refresh_stale,
    };
    let reporter = progress.reporter();

    println!("embed pending (model: {})", provider.model_name());
    for &kind in kinds {
        let report =
            ensure_embeddings(&store, provider.as_ref(), kind, &opts, reporter.as_ref()).await?;
        print_report(&report);
    }

    store.close().await;
    Ok(())
}

/// Delete embeddings of the given kinds and regenerate them.
pub async fn run_embed_rebuild(
    config: &Config,
    kinds: &[EntityKind],
    batch_size_override: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    let batch_size = batch_size(config, batch_size_override)?;
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    for &kind in kinds {
        let cleared = store.clear_embeddings(kind).await?;
        println!("embed rebuild: cleared {} {} embeddings", cleared, kind);
    }

    let opts = EmbedOptions {
        limit: None,
        batch_size,
        refresh_stale: false,
    };
    let reporter = progress.reporter();

    println!("embed rebuild (model: {})", provider.model_name());
    for &kind in kinds {
        let report =
            ensure_embeddings(&store, provider.as_ref(), kind, &opts, reporter.as_ref()).await?;
        print_report(&report);
    }

    store.close().await;
    Ok(())
}

pub fn print_report(report: &EmbedReport) {
    if report.pending == 0 {
        println!("  {}s: all up to date", report.kind);
        return;
    }
    println!("  {}s pending: {}", report.kind, report.pending);
    println!("  {}s embedded: {}", report.kind, report.embedded);
    println!("  {}s skipped: {}", report.kind, report.skipped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_override_must_be_positive() {
        let config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
        assert_eq!(batch_size(&config, None).unwrap(), config.embedding.batch_size);
        assert_eq!(batch_size(&config, Some(8)).unwrap(), 8);
        let err = batch_size(&config, Some(0)).unwrap_err();
        assert!(err.to_string().contains("--batch-size"));
    }
}
