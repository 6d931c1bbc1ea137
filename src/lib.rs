//! # signal-link
//!
//! Links free-text observation records ("signals") to tracked work items
//! ("issues") by embedding both into one vector space and persisting the
//! pairs whose similarity clears a threshold.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │  import  │──▶│ embed_cmd │──▶│ associate  │──▶│   queries    │
//! │  (JSON)  │   │ provider  │   │ search +   │   │ CLI + HTTP   │
//! └──────────┘   └───────────┘   │ index      │   └──────────────┘
//!                                └────────────┘
//!                      all state lives in SQLite (store)
//! ```
//!
//! Every write is idempotent. Embedding generation only fills gaps;
//! association computation only scores pairs that are not yet linked and
//! never rewrites an existing association.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`import`] | JSON import of signals and issues |
//! | [`embedding`] | Embedding provider abstraction and vector math |
//! | [`store`] | Embedding and association persistence |
//! | [`embed_cmd`] | Embedding generation |
//! | [`index`] | Nearest-neighbor indexes |
//! | [`search`] | Candidate search backends |
//! | [`associate`] | Association engine |
//! | [`queries`] | Aggregate read queries and purge |
//! | [`stats`] | Coverage and database overview |
//! | [`progress`] | Progress reporting |
//! | [`server`] | Read-only JSON HTTP API |

pub mod associate;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod import;
pub mod index;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod queries;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
