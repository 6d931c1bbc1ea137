//! # siglink
//!
//! The `siglink` binary drives the signal/issue association pipeline: import
//! records, embed them, associate signals with issues, and inspect the result.
//!
//! ## Usage
//!
//! ```bash
//! siglink --config ./config/siglink.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `siglink init` | Create the SQLite database and run schema migrations |
//! | `siglink import signals <file>` | Upsert signals from a JSON export |
//! | `siglink import issues <file>` | Upsert tracker issues from a JSON export |
//! | `siglink embed pending` | Embed entities that have no vector yet |
//! | `siglink embed rebuild` | Delete and regenerate embeddings |
//! | `siglink associate` | Link signals to similar issues |
//! | `siglink run` | Embed pending, associate, and show the top links |
//! | `siglink status` / `stats` | Embedding coverage and database overview |
//! | `siglink issues` / `signals` | Ranked lists by association count |
//! | `siglink issue <id>` / `signal <id>` | One record and its links |
//! | `siglink serve` | Start the read-only JSON API |
//!
//! ## Examples
//!
//! ```bash
//! siglink init
//! siglink import signals ./data/signals.json
//! siglink import issues ./data/issues.json
//! siglink run
//! siglink issue ENG-42 --min-score 0.7
//! ```

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use signal_link::index::IndexKind;
use signal_link::models::EntityKind;
use signal_link::progress::ProgressMode;
use signal_link::search::BackendKind;
use signal_link::{associate, config, embed_cmd, import, migrate, queries, server, stats};

/// siglink links free-text signals to tracked issues by embedding similarity.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/siglink.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "siglink",
    about = "Link free-text signals to tracked issues by embedding similarity",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/siglink.toml")]
    config: PathBuf,

    /// Log progress details (same as RUST_LOG=info).
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr: off, human, or json. Defaults to human on a TTY.
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Upsert signals or issues from a JSON array file.
    Import {
        #[arg(value_enum)]
        kind: KindArg,
        file: PathBuf,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Link every signal to the issues it is similar to.
    ///
    /// Only pairs that are not yet associated are scored; existing
    /// associations are never modified.
    Associate {
        /// Candidate search: exhaustive (cosine) or indexed (nearest neighbors).
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Index for the indexed backend: flat or hnsw.
        #[arg(long)]
        index: Option<IndexKind>,

        /// Minimum score on the backend's own scale.
        #[arg(long)]
        threshold: Option<f64>,

        /// Neighbors fetched per signal by the indexed backend.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Embed pending entities, associate, and show the top associations.
    Run {
        /// Number of top associations to show.
        #[arg(long, default_value_t = 10)]
        sample: i64,
    },

    /// Embedding coverage and association count.
    Status,

    /// Database overview: coverage, stale embeddings, score distribution.
    Stats,

    /// Issues ranked by linked-signal count.
    Issues {
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Signals ranked by linked-issue count.
    Signals {
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show one issue and the signals linked to it.
    Issue {
        /// Tracker identifier, e.g. ENG-42.
        identifier: String,
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Show one signal and the issues linked to it.
    Signal {
        id: i64,
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Show the association between one signal and one issue.
    Link { signal_id: i64, issue_id: String },

    /// Show the highest-scoring associations.
    Sample {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Delete every row from every table. Requires --yes.
    Purge {
        #[arg(long)]
        yes: bool,
    },

    /// Start the read-only JSON HTTP API on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed entities that have no vector under the configured model.
    Pending {
        /// Which entities to embed; both when omitted.
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Maximum number of entities per kind to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per provider call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show pending counts without embedding.
        #[arg(long)]
        dry_run: bool,

        /// Also re-embed entities whose text changed since they were embedded.
        #[arg(long)]
        refresh_stale: bool,
    },

    /// Delete and regenerate embeddings.
    Rebuild {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Signals,
    Issues,
}

impl From<KindArg> for EntityKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Signals => EntityKind::Signal,
            KindArg::Issues => EntityKind::Issue,
        }
    }
}

fn kinds(kind: Option<KindArg>) -> Vec<EntityKind> {
    match kind {
        Some(k) => vec![k.into()],
        None => EntityKind::ALL.to_vec(),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "siglink", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { kind, file } => {
            import::run_import(&cfg, kind.into(), &file).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                kind,
                limit,
                batch_size,
                dry_run,
                refresh_stale,
            } => {
                embed_cmd::run_embed_pending(
                    &cfg,
                    &kinds(kind),
                    limit,
                    batch_size,
                    dry_run,
                    refresh_stale,
                    progress,
                )
                .await?;
            }
            EmbedAction::Rebuild { kind, batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, &kinds(kind), batch_size, progress).await?;
            }
        },
        Commands::Associate {
            backend,
            index,
            threshold,
            top_k,
        } => {
            associate::run_associate(&cfg, backend, index, threshold, top_k, progress).await?;
        }
        Commands::Run { sample } => {
            associate::run_pipeline(&cfg, sample, progress).await?;
        }
        Commands::Status => stats::run_status(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
        Commands::Issues { limit } => queries::run_issues(&cfg, limit).await?,
        Commands::Signals { limit } => queries::run_signals(&cfg, limit).await?,
        Commands::Issue {
            identifier,
            min_score,
        } => queries::run_issue(&cfg, &identifier, min_score).await?,
        Commands::Signal { id, min_score } => queries::run_signal(&cfg, id, min_score).await?,
        Commands::Link {
            signal_id,
            issue_id,
        } => queries::run_link(&cfg, signal_id, &issue_id).await?,
        Commands::Sample { limit } => queries::run_sample(&cfg, limit).await?,
        Commands::Purge { yes } => queries::run_purge(&cfg, yes).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        // Handled above, before loading config.
        Commands::Completions { .. } => {}
    }

    Ok(())
}
