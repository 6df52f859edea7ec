//! Durable document-processing pipeline for the deck review platform.
//!
//! A persistent Postgres-backed task queue coordinates multi-phase AI
//! analysis of uploaded decks between CPU orchestrators and GPU workers:
//! atomic leases with expiry, staged progress reporting, retry with jittered
//! backoff, abandoned-task recovery, and callback-driven result ingestion.

pub mod config;
pub mod gpu;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod store_memory;
pub mod store_postgres;
pub mod types;
