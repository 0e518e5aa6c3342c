//! BM25 full-text index.
//!
//! An in-memory inverted index kept synchronous with writes: every commit
//! applies the [`FtDelta`]s its workspace accumulated. Rebuild scans the
//! store from scratch (the `/search/rebuild` admin operation).

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::model::{NodeId, Properties, PropertyValue};

use super::tokenizer::tokenize;

const BM25_K: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Text transition for one document, staged by a workspace and applied at
/// commit.
#[derive(Debug, Clone)]
pub struct FtDelta {
    pub id: NodeId,
    pub old_text: Option<String>,
    pub new_text: Option<String>,
}

/// Concatenates the configured text-bearing properties of a record.
/// Returns `None` when nothing indexable is present.
pub fn extract_text(properties: &Properties, fields: &[String]) -> Option<String> {
    let mut parts = Vec::new();
    for field in fields {
        if let Some(PropertyValue::String(s)) = properties.get(field) {
            if !s.trim().is_empty() {
                parts.push(s.as_str());
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[derive(Default)]
struct FtInner {
    /// token → document → term frequency
    postings: FxHashMap<String, FxHashMap<NodeId, u32>>,
    doc_len: FxHashMap<NodeId, u32>,
    total_tokens: u64,
}

impl FtInner {
    fn add_document(&mut self, id: &str, text: &str) {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        self.doc_len.insert(id.to_string(), tokens.len() as u32);
        self.total_tokens += tokens.len() as u64;
        for token in tokens {
            *self
                .postings
                .entry(token)
                .or_default()
                .entry(id.to_string())
                .or_insert(0) += 1;
        }
    }

    fn remove_document(&mut self, id: &str, text: &str) {
        if let Some(len) = self.doc_len.remove(id) {
            self.total_tokens = self.total_tokens.saturating_sub(len as u64);
        }
        for token in tokenize(text) {
            if let Some(docs) = self.postings.get_mut(&token) {
                docs.remove(id);
                if docs.is_empty() {
                    self.postings.remove(&token);
                }
            }
        }
    }
}

pub struct FulltextIndex {
    inner: RwLock<FtInner>,
}

impl Default for FulltextIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FulltextIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FtInner::default()),
        }
    }

    pub fn apply(&self, deltas: &[FtDelta]) {
        if deltas.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for delta in deltas {
            if let Some(old) = &delta.old_text {
                inner.remove_document(&delta.id, old);
            }
            if let Some(new) = &delta.new_text {
                inner.add_document(&delta.id, new);
            }
        }
    }

    pub fn index_document(&self, id: &str, text: &str) {
        let mut inner = self.inner.write();
        inner.add_document(id, text);
    }

    pub fn clear(&self) {
        *self.inner.write() = FtInner::default();
    }

    pub fn doc_count(&self) -> usize {
        self.inner.read().doc_len.len()
    }

    /// BM25 top-`limit` for a query, highest score first; ties break on the
    /// smaller document id so rankings are stable.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(NodeId, f32)> {
        let inner = self.inner.read();
        let n_docs = inner.doc_len.len();
        if n_docs == 0 {
            return Vec::new();
        }
        let avgdl = inner.total_tokens as f32 / n_docs as f32;
        let mut scores: FxHashMap<&str, f32> = FxHashMap::default();
        let mut query_tokens = tokenize(query);
        query_tokens.sort();
        query_tokens.dedup();
        for token in &query_tokens {
            let Some(docs) = inner.postings.get(token) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = (1.0 + (n_docs as f32 - df + 0.5) / (df + 0.5)).ln();
            for (doc, tf) in docs {
                let dl = *inner.doc_len.get(doc).unwrap_or(&1) as f32;
                let tf = *tf as f32;
                let norm = tf + BM25_K * (1.0 - BM25_B + BM25_B * dl / avgdl);
                *scores.entry(doc.as_str()).or_insert(0.0) += idf * (tf * (BM25_K + 1.0)) / norm;
            }
        }
        let mut ranked: Vec<(NodeId, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }
}
