#![allow(missing_docs)]

use std::collections::BTreeMap;

use tempfile::TempDir;

use nornicdb::config::Config;
use nornicdb::engine::Engine;
use nornicdb::model::PropertyValue;
use nornicdb::Result;

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config
}

fn create_batch(engine: &Engine, label: &str, start: usize, count: usize) -> Result<()> {
    let mut ws = engine.begin_workspace();
    for i in start..start + count {
        let statement = format!("CREATE (:{label} {{idx: {i}, bucket: 'b{}'}})", i % 3);
        engine.execute_statement(&mut ws, &statement, BTreeMap::new())?;
    }
    engine.commit_workspace(ws)?;
    Ok(())
}

fn count_nodes(engine: &Engine) -> usize {
    engine.view().count_nodes()
}

#[test]
fn hundred_creates_survive_unclean_restart() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let config = test_config(&dir);
    {
        let engine = Engine::open(&config)?;
        for batch in 0..10 {
            create_batch(&engine, "Doc", batch * 10, 10)?;
        }
        assert_eq!(count_nodes(&engine), 100);
        // Dropped without checkpoint or flush: the crash case.
    }

    let engine = Engine::open(&config)?;
    assert_eq!(count_nodes(&engine), 100);

    // Property indexes answer the same lookups after replay.
    let mut ws = engine.begin_workspace();
    let result = engine.execute_statement(
        &mut ws,
        "MATCH (n:Doc {bucket: 'b1'}) RETURN count(n) AS c",
        BTreeMap::new(),
    )?;
    let row = &result.outcome.rows[0][0];
    match row {
        nornicdb::cypher::CypherValue::Value(PropertyValue::Int(n)) => assert_eq!(*n, 33),
        other => panic!("unexpected value {other:?}"),
    }
    Ok(())
}

#[test]
fn recovery_is_equivalent_with_and_without_checkpoint() -> Result<()> {
    let dir_plain = tempfile::tempdir().expect("tmpdir");
    let dir_ckpt = tempfile::tempdir().expect("tmpdir");

    let observe = |engine: &Engine| -> Result<Vec<(String, i64)>> {
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX)?;
        let mut out: Vec<(String, i64)> = nodes
            .into_iter()
            .map(|n| {
                let idx = match n.properties.get("idx") {
                    Some(PropertyValue::Int(i)) => *i,
                    _ => -1,
                };
                (n.labels.join(":"), idx)
            })
            .collect();
        out.sort();
        Ok(out)
    };

    let run = |config: &Config, checkpoint_mid: bool| -> Result<Vec<(String, i64)>> {
        {
            let engine = Engine::open(config)?;
            create_batch(&engine, "Doc", 0, 20)?;
            if checkpoint_mid {
                engine.checkpoint()?;
            }
            create_batch(&engine, "Doc", 20, 20)?;
            // Delete a few after the checkpoint boundary.
            let mut ws = engine.begin_workspace();
            engine.execute_statement(
                &mut ws,
                "MATCH (n:Doc {idx: 5}) DETACH DELETE n",
                BTreeMap::new(),
            )?;
            engine.commit_workspace(ws)?;
        }
        let engine = Engine::open(config)?;
        observe(&engine)
    };

    let plain = run(&test_config(&dir_plain), false)?;
    let checkpointed = run(&test_config(&dir_ckpt), true)?;
    assert_eq!(plain, checkpointed);
    assert_eq!(plain.len(), 39);
    Ok(())
}

#[test]
fn torn_wal_tail_loses_only_the_torn_entry() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let config = test_config(&dir);
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 0, 5)?;
    }
    // Chop bytes off the log tail.
    let wal_path = config.wal_dir().join("wal.log");
    let bytes = std::fs::read(&wal_path)?;
    std::fs::write(&wal_path, &bytes[..bytes.len() - 7])?;

    let engine = Engine::open(&config)?;
    assert_eq!(count_nodes(&engine), 4);
    // The sequence continues from the last valid entry.
    create_batch(&engine, "Doc", 5, 1)?;
    assert_eq!(count_nodes(&engine), 5);
    Ok(())
}

#[test]
fn sequence_numbers_are_monotonic_across_restarts() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let config = test_config(&dir);
    let first_seq;
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 0, 3)?;
        first_seq = engine.last_seq();
        assert_eq!(first_seq, 3);
    }
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 3, 1)?;
        assert_eq!(engine.last_seq(), first_seq + 1);
    }
    Ok(())
}

#[test]
fn checkpoint_truncates_log_and_bounds_replay() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let config = test_config(&dir);
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 0, 50)?;
        let info = engine.checkpoint()?;
        assert_eq!(info.nodes, 50);
        assert_eq!(info.base_seq, 50);
        create_batch(&engine, "Doc", 50, 5)?;
    }
    // The log holds only the post-checkpoint entries plus the sentinel.
    let wal_bytes = std::fs::metadata(config.wal_dir().join("wal.log"))?.len();
    assert!(wal_bytes < 8 * 1024, "log should be truncated, is {wal_bytes}B");

    let engine = Engine::open(&config)?;
    assert_eq!(count_nodes(&engine), 55);
    assert_eq!(engine.last_seq(), 55);
    Ok(())
}

#[test]
fn disabled_wal_still_serves_writes_and_flushes_an_image() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let mut config = test_config(&dir);
    config.wal.enabled = false;
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 0, 7)?;
        // The sequence counter does not advance without a journal.
        assert_eq!(engine.last_seq(), 0);
        engine.shutdown_flush()?;
    }
    assert!(config.graph_dir().join("store.kv").exists());

    let engine = Engine::open(&config)?;
    assert_eq!(count_nodes(&engine), 7);
    Ok(())
}

#[test]
fn ordinals_are_not_reused_after_delete_and_restart() -> Result<()> {
    let dir = tempfile::tempdir().expect("tmpdir");
    let config = test_config(&dir);
    let highest;
    {
        let engine = Engine::open(&config)?;
        create_batch(&engine, "Doc", 0, 3)?;
        let view = engine.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX)?;
        highest = nodes.iter().map(|n| n.ordinal).max().expect("ordinals");
        // Remove the node holding the highest ordinal.
        let victim = nodes
            .iter()
            .find(|n| n.ordinal == highest)
            .expect("victim")
            .id
            .clone();
        let mut ws = engine.begin_workspace();
        ws.delete_node(engine.catalog(), engine.fulltext_config(), &victim, true)?;
        engine.commit_workspace(ws)?;
    }
    let engine = Engine::open(&config)?;
    create_batch(&engine, "Doc", 10, 1)?;
    let view = engine.view();
    let (nodes, _) = view.all_nodes(None, usize::MAX)?;
    assert!(nodes.iter().all(|n| n.ordinal != highest));
    let new_max = nodes.iter().map(|n| n.ordinal).max().expect("ordinals");
    assert!(new_max > highest);
    Ok(())
}
