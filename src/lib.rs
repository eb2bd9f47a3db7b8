//! # Agrafes
//!
//! **A local-first multilingual corpus search and alignment engine for
//! concordance work.**
//!
//! Agrafes imports text documents (numbered lines, DOCX paragraphs,
//! lightly-structured XML), splits them into addressable units, indexes
//! the normalized text for full-text search, aligns corresponding units
//! across parallel documents, and answers queries as segments or KWIC
//! concordance rows — optionally enriched with the aligned units of
//! sibling documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌───────────┐
//! │  Parsers   │──▶│   Ingestion    │──▶│  SQLite    │
//! │ TXT/DOCX/  │   │ normalize +    │   │ FTS5 +     │
//! │ TEI        │   │ atomic write   │   │ links      │
//! └────────────┘   └───────────────┘   └────┬──────┘
//!                                           │
//!                      ┌────────────────────┼──────────────┐
//!                      ▼                    ▼              ▼
//!                 ┌─────────┐         ┌──────────┐   ┌──────────┐
//!                 │  Query  │         │  Align    │   │ Curate/  │
//!                 │ seg/KWIC│         │ 4 strat.  │   │ Segment  │
//!                 └────┬────┘         └────┬─────┘   └────┬─────┘
//!                      └───────────────────┴──────────────┘
//!                                          │
//!                                 ┌────────┴────────┐
//!                                 │  HTTP sidecar    │
//!                                 │ (127.0.0.1 only) │
//!                                 └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`normalize`] | Deterministic raw → normalized text policy |
//! | [`encoding`] | BOM/detector/cp1252/latin-1 decoding chain |
//! | [`parse_numbered`] | `[N] text` numbered-line parsing |
//! | [`parse_docx`] | DOCX paragraph extraction (zip + XML events) |
//! | [`parse_tei`] | TEI-like XML parsing, namespace-agnostic |
//! | [`ingest`] | Import pipeline: decode → parse → normalize → store |
//! | [`index`] | FTS5 rebuild bound to unit rowids |
//! | [`query`] | Search with segment/KWIC projection and enrichment |
//! | [`kwic`] | Match-marker parsing and context windows |
//! | [`align`] | Anchor / hybrid / position / similarity strategies |
//! | [`audit`] | Link listing, review, retarget, quality metrics |
//! | [`curate`] | Ordered regex rewriting of normalized text |
//! | [`segment`] | Document resegmentation |
//! | [`documents`] | Metadata updates, relations, validation |
//! | [`runs`] | Append-only run log with per-run log files |
//! | [`jobs`] | FIFO job runtime: progress, cancellation, retention |
//! | [`portfile`] | Sidecar discovery file and liveness gates |
//! | [`sidecar`] | Loopback HTTP server with token guard and envelope |
//! | [`export`] | XML, CSV/TSV, and run-report writers |
//! | [`config`] | Engine tuning (TOML, optional) |
//! | [`db`] / [`migrate`] | SQLite pool and versioned migrations |
//! | [`models`] / [`error`] | Core types and the typed error taxonomy |

pub mod align;
pub mod audit;
pub mod config;
pub mod curate;
pub mod db;
pub mod documents;
pub mod encoding;
pub mod error;
pub mod export;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod kwic;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parse_docx;
pub mod parse_numbered;
pub mod parse_tei;
pub mod portfile;
pub mod progress;
pub mod query;
pub mod runs;
pub mod segment;
pub mod sidecar;
