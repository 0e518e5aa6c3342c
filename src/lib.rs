//! # NornicDB
//!
//! A graph database speaking the Neo4j wire dialect (Cypher over HTTP
//! transactions) with intrinsic vector search, automatic embedding
//! generation and hybrid lexical + vector retrieval.
//!
//! ## Architecture
//!
//! - **Storage**: an ordered copy-on-write KV substrate with a graph key
//!   schema layered on top (records, label tags, property indexes,
//!   constraint sentinels, twin adjacency keys)
//! - **Durability**: a crc-framed write-ahead log with atomic snapshots and
//!   idempotent replay
//! - **Schema**: UNIQUE / NODE KEY / EXISTS / PROPERTY TYPE constraints
//!   validated per mutation and on creation
//! - **Retrieval**: BM25 full-text, exact-scan cosine similarity, and
//!   reciprocal-rank fusion of the two
//! - **Embeddings**: pluggable producer (remote OpenAI/Ollama-compatible or
//!   local), LRU-cached, driven by a write-triggered background queue
//! - **Surface**: implicit and explicit HTTP transactions with the Neo4j
//!   error catalog, plus search/embedding/admin extension endpoints

pub mod audit;
pub mod config;
pub mod cypher;
pub mod embed;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod schema;
pub mod search;
pub mod server;
pub mod storage;
pub mod wal;

pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::error::{NornicError, Result};
pub use crate::model::{Edge, Node, PropertyValue};
