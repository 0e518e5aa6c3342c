//! Reciprocal-rank fusion of the lexical and vector rankings.

use rustc_hash::FxHashMap;

use crate::model::NodeId;

const RRF_C: f64 = 60.0;

/// A fused (or lexical-only) search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: NodeId,
    pub score: f64,
    pub rrf_score: Option<f64>,
    pub bm25_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// Fuses two rankings with `1/(c + rank)` contributions, `c = 60`, ranks
/// starting at 1. Ties break by the lower rank sum, then the smaller id; a
/// candidate missing from one list contributes nothing from it.
pub fn fuse(
    lexical: &[(NodeId, f32)],
    vector: &[(NodeId, f32)],
    limit: usize,
) -> Vec<SearchHit> {
    struct Entry {
        rrf: f64,
        bm25_rank: Option<usize>,
        vector_rank: Option<usize>,
    }
    let mut entries: FxHashMap<&str, Entry> = FxHashMap::default();
    for (rank0, (id, _)) in lexical.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = entries.entry(id).or_insert(Entry {
            rrf: 0.0,
            bm25_rank: None,
            vector_rank: None,
        });
        entry.rrf += 1.0 / (RRF_C + rank as f64);
        entry.bm25_rank = Some(rank);
    }
    for (rank0, (id, _)) in vector.iter().enumerate() {
        let rank = rank0 + 1;
        let entry = entries.entry(id).or_insert(Entry {
            rrf: 0.0,
            bm25_rank: None,
            vector_rank: None,
        });
        entry.rrf += 1.0 / (RRF_C + rank as f64);
        entry.vector_rank = Some(rank);
    }

    let absent = usize::MAX / 4;
    let mut hits: Vec<SearchHit> = entries
        .into_iter()
        .map(|(id, e)| SearchHit {
            id: id.to_string(),
            score: e.rrf,
            rrf_score: Some(e.rrf),
            bm25_rank: e.bm25_rank,
            vector_rank: e.vector_rank,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_sum = a.bm25_rank.unwrap_or(absent) + a.vector_rank.unwrap_or(absent);
                let b_sum = b.bm25_rank.unwrap_or(absent) + b.vector_rank.unwrap_or(absent);
                a_sum.cmp(&b_sum)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}

/// Wraps a lexical-only ranking in the hit shape (vector side unavailable).
pub fn lexical_only(lexical: &[(NodeId, f32)], limit: usize) -> Vec<SearchHit> {
    lexical
        .iter()
        .take(limit)
        .enumerate()
        .map(|(rank0, (id, score))| SearchHit {
            id: id.clone(),
            score: *score as f64,
            rrf_score: None,
            bm25_rank: Some(rank0 + 1),
            vector_rank: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(ids: &[&str]) -> Vec<(NodeId, f32)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), 1.0 - i as f32 * 0.1))
            .collect()
    }

    #[test]
    fn agreement_on_both_lists_wins() {
        let hits = fuse(&ranking(&["a", "b", "c"]), &ranking(&["b", "d"]), 10);
        assert_eq!(hits[0].id, "b");
        assert_eq!(hits[0].bm25_rank, Some(2));
        assert_eq!(hits[0].vector_rank, Some(1));
    }

    #[test]
    fn removing_a_candidate_never_raises_its_rank() {
        let lexical = ranking(&["a", "b", "c"]);
        let both = fuse(&lexical, &ranking(&["c", "a"]), 10);
        let lex_only = fuse(&lexical, &ranking(&["c"]), 10);
        let pos_both = both.iter().position(|h| h.id == "a").unwrap();
        let pos_removed = lex_only.iter().position(|h| h.id == "a").unwrap();
        assert!(pos_removed >= pos_both);
    }

    #[test]
    fn ties_break_by_rank_sum_then_id() {
        // "x" only lexical rank 1, "y" only vector rank 1: same rrf score.
        let hits = fuse(&ranking(&["x"]), &ranking(&["y"]), 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "x");
    }
}
