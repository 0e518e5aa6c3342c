#![allow(missing_docs)]

//! Property-based checks over the engine's universal invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;

use nornicdb::config::Config;
use nornicdb::engine::Engine;
use nornicdb::model::PropertyValue;
use nornicdb::search::hybrid;
use nornicdb::search::vector::cosine;

fn engine_in(dir: &tempfile::TempDir) -> Engine {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    Engine::open(&config).expect("engine opens")
}

/// A small random mutation program over one label with a UNIQUE(email)
/// constraint.
#[derive(Debug, Clone)]
enum Op {
    Create { email: u8 },
    Rename { pick: u8, email: u8 },
    Delete { pick: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16).prop_map(|email| Op::Create { email }),
        (any::<u8>(), 0u8..16).prop_map(|(pick, email)| Op::Rename { pick, email }),
        any::<u8>().prop_map(|pick| Op::Delete { pick }),
    ]
}

fn apply_ops(engine: &Engine, ops: &[Op]) {
    for op in ops {
        let mut ws = engine.begin_workspace();
        let statement = match op {
            Op::Create { email } => {
                format!("CREATE (:User {{email: 'u{email}@x'}})")
            }
            Op::Rename { pick, email } => {
                format!(
                    "MATCH (n:User {{email: 'u{}@x'}}) SET n.email = 'u{email}@x'",
                    pick % 16
                )
            }
            Op::Delete { pick } => {
                format!("MATCH (n:User {{email: 'u{}@x'}}) DETACH DELETE n", pick % 16)
            }
        };
        let applied = engine
            .execute_statement(&mut ws, &statement, BTreeMap::new())
            .is_ok();
        if applied {
            // Rejected statements (constraint violations) stay uncommitted.
            let _ = engine.commit_workspace(ws);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Constraint completeness: whatever mutation sequence the engine
    /// accepted, no two Users share an email afterwards.
    #[test]
    fn unique_constraint_holds_over_any_accepted_sequence(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let engine = engine_in(&dir);
        {
            let mut ws = engine.begin_workspace();
            engine.execute_statement(
                &mut ws,
                "CREATE CONSTRAINT user_email FOR (n:User) REQUIRE n.email IS UNIQUE",
                BTreeMap::new(),
            ).expect("constraint");
        }
        apply_ops(&engine, &ops);

        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            if let Some(PropertyValue::String(email)) = node.properties.get("email") {
                prop_assert!(seen.insert(email.clone()), "duplicate email {email}");
            }
        }
    }

    /// Identifier uniqueness across any accepted sequence.
    #[test]
    fn identifiers_are_never_reused(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let engine = engine_in(&dir);
        apply_ops(&engine, &ops);
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        let mut ids = std::collections::HashSet::new();
        let mut ordinals = std::collections::HashSet::new();
        for node in &nodes {
            prop_assert!(ids.insert(node.id.clone()));
            prop_assert!(ordinals.insert(node.ordinal));
        }
    }

    /// WAL-replay equivalence: a recovered engine observes the same graph.
    #[test]
    fn replay_reproduces_the_live_state(ops in prop::collection::vec(op_strategy(), 1..30)) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let observed_live;
        {
            let engine = engine_in(&dir);
            apply_ops(&engine, &ops);
            let view = engine.view();
            let (mut nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
            nodes.sort_by(|a, b| a.id.cmp(&b.id));
            observed_live = nodes;
            // Dropped without checkpoint: recovery must come from the log.
        }
        let engine = engine_in(&dir);
        let view = engine.view();
        let (mut nodes, _) = view.all_nodes(None, usize::MAX).expect("scan");
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        prop_assert_eq!(observed_live, nodes);
    }

    /// Cosine similarity is symmetric and bounded.
    #[test]
    fn cosine_symmetry_and_range(
        a in prop::collection::vec(-100.0f32..100.0, 8),
        b in prop::collection::vec(-100.0f32..100.0, 8),
    ) {
        let ab = cosine(&a, &b);
        let ba = cosine(&b, &a);
        prop_assert_eq!(ab, ba);
        prop_assert!((-1.0..=1.0).contains(&ab));
    }

    /// RRF monotonicity: dropping a candidate from one input list never
    /// improves its fused rank.
    #[test]
    fn rrf_removal_never_raises_rank(
        lex_ids in prop::collection::vec(0u8..12, 1..10),
        vec_ids in prop::collection::vec(0u8..12, 1..10),
        victim in 0u8..12,
    ) {
        let dedup = |ids: &[u8]| -> Vec<(String, f32)> {
            let mut seen = std::collections::HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(**id))
                .map(|id| (format!("n{id}"), 1.0))
                .collect()
        };
        let lexical = dedup(&lex_ids);
        let vector = dedup(&vec_ids);
        let victim_id = format!("n{victim}");
        let without: Vec<(String, f32)> = vector
            .iter()
            .filter(|(id, _)| *id != victim_id)
            .cloned()
            .collect();

        let full = hybrid::fuse(&lexical, &vector, 100);
        let reduced = hybrid::fuse(&lexical, &without, 100);
        let pos_full = full.iter().position(|h| h.id == victim_id);
        let pos_reduced = reduced.iter().position(|h| h.id == victim_id);
        match (pos_full, pos_reduced) {
            (Some(before), Some(after)) => prop_assert!(after >= before),
            (None, Some(_)) => prop_assert!(false, "victim appeared from nowhere"),
            _ => {}
        }
    }

    /// Label casing: a random mix of cases always resolves to one label.
    #[test]
    fn label_casing_is_insensitive(flips in prop::collection::vec(any::<bool>(), 1..6)) {
        let dir = tempfile::tempdir().expect("tmpdir");
        let engine = engine_in(&dir);
        for flip in &flips {
            let label = if *flip { "Person" } else { "pERSON" };
            let mut ws = engine.begin_workspace();
            engine
                .execute_statement(&mut ws, &format!("CREATE (:{label})"), BTreeMap::new())
                .expect("create");
            engine.commit_workspace(ws).expect("commit");
        }
        let view = engine.view();
        prop_assert_eq!(view.node_ids_by_label("person").len(), flips.len());
        prop_assert_eq!(engine.catalog().labels().len(), 1);
    }
}

/// Cache correctness: the decorator returns exactly what the producer
/// returns, for any text.
#[test]
fn cache_agrees_with_producer() {
    use nornicdb::embed::{CachedEmbedder, Embedder, LocalEmbedder};
    use std::sync::Arc;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let producer = Arc::new(LocalEmbedder::new(64));
        let cached = CachedEmbedder::new(producer.clone(), 128);
        for text in ["alpha beta", "gamma", "alpha beta", "delta epsilon zeta"] {
            let direct = producer.embed(text).await.expect("direct");
            let via_cache = cached.embed(text).await.expect("cached");
            assert_eq!(direct, via_cache);
        }
        assert!(cached.hit_count() >= 1);
    });
}
