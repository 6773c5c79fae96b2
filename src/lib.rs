//! # Polarion Copilot
//!
//! Retrieval-augmented chat over Polarion work items.
//!
//! Requirements, safety decisions, hazards, and failure modes are fetched
//! from a Polarion project or project group, continuation fragments are
//! merged into their heads, the HTML descriptions are normalized to plain
//! sentences, and the result is chunked and embedded into a flat vector
//! index per target. A catalog tracks every index so it can be updated
//! incrementally with only the items changed since its last update.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌────────────┐
//! │ Polarion │──▶│  Merge  │──▶│  Format  │──▶│  Cache  │──▶│ Chunk+Embed│
//! │  (REST)  │   │ (links) │   │(normalize│   │ (SQLite)│   │ FlatIndex  │
//! └──────────┘   └─────────┘   └──────────┘   └─────────┘   └─────┬──────┘
//!                                                                  │
//!                                   ┌──────────┐    ┌─────────┐    │
//!                                   │   Chat   │◀───│ Catalog │◀───┘
//!                                   │ (stream) │    │ (SQLite)│
//!                                   └──────────┘    └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! copilot init
//! copilot save --location PT_L2_TSS_Subsystem --location-type project \
//!     --types requirement,safetydecision --release "R12.1"
//! copilot catalog list
//! copilot update <db_id>
//! copilot ask --index <db_id> "When must the beam be stopped?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline errors |
//! | [`normalize`] | HTML description cleanup |
//! | [`source`] | Work-item source trait, query building, release resolution |
//! | [`polarion`] | Polarion REST client |
//! | [`merge`] | Continuation and risk-analysis hierarchy merge |
//! | [`format`] | Records to `(text, reference)` pairs |
//! | [`chunk`] | Fixed-window chunking and batching |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Flat vector index and its on-disk form |
//! | [`cache`] | Pending records awaiting embedding |
//! | [`catalog`] | Persisted index metadata and cleanup |
//! | [`sync`] | Index synchronizer state machine |
//! | [`search`] | Retrieval over an index |
//! | [`chat`] | Prompt assembly and streaming completions |
//! | [`progress`] | Pipeline progress reporting |
//! | [`show`] | Status overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod format;
pub mod index;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod polarion;
pub mod progress;
pub mod search;
pub mod show;
pub mod source;
pub mod sync;
