//! Archive a chain to SQLite, rebuild the index and query it again.

mod common;

use std::sync::Arc;

use common::*;
use epochlog_filter::{FilterEngine, FilterError, FilterSpec};
use epochlog_index::store::Store;
use epochlog_index::{BlockLookup, IndexConfig};
use serde_json::json;

/// Archives every executed pivot of `chain` plus one mined-only block.
fn archive(chain: &mut TestChain, store: &Store) -> eyre::Result<()> {
    let snapshot = chain.index().snapshot();
    for block in snapshot.receipts_for_epoch_range(0, snapshot.latest_state()) {
        store.insert_executed_block(&block)?;
    }
    let (hash, position) = chain.mine_block();
    store.insert_mined_block(hash, &position)?;
    Ok(())
}

#[test]
fn restored_index_answers_like_the_live_one() -> eyre::Result<()> {
    let mut chain = TestChain::new();
    let mut contract = chain.deploy(0xc1);
    for _ in 0..5 {
        chain.call(&mut contract);
    }

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("epochlog.sqlite");
    let store = Store::new(path.to_str().expect("temp path is utf-8"))?;
    archive(&mut chain, &store)?;
    drop(store);

    let reopened = Store::new(path.to_str().expect("temp path is utf-8"))?;
    let restored = FilterEngine::new(Arc::new(reopened.restore_index(IndexConfig::default())?));

    let filter = json!({ "topics": [called_topic().to_string()], "limit": 3 });
    let live = chain.engine.evaluate_raw(raw_filter(filter.clone()))?;
    let rebuilt = restored.evaluate_raw(raw_filter(filter))?;
    assert_eq!(live, rebuilt);
    assert_eq!(rebuilt.len(), 3);

    assert_eq!(
        chain.index().marks().latest_mined,
        restored.index().marks().latest_mined
    );
    assert_eq!(
        chain.index().marks().latest_state,
        restored.index().marks().latest_state
    );
    Ok(())
}

#[test]
fn mined_only_blocks_stay_unexecuted_after_restore() -> eyre::Result<()> {
    let mut chain = TestChain::new();
    chain.deploy(0xc1);

    let store = test_store();
    archive(&mut chain, &store)?;
    let restored = FilterEngine::new(Arc::new(store.restore_index(IndexConfig::default())?));

    let pending = TestChain::block_hash(2);
    assert!(matches!(
        restored.index().snapshot().receipts_for_block(&pending),
        BlockLookup::NotExecuted(_)
    ));

    let spec = FilterSpec::block_set([pending, TestChain::block_hash(1)])?;
    assert_eq!(
        restored.evaluate(&spec),
        Err(FilterError::BlocksNotExecuted(vec![pending]))
    );
    Ok(())
}

#[test]
fn archive_rejects_second_execution() -> eyre::Result<()> {
    let mut chain = TestChain::new();
    chain.deploy(0xc1);

    let store = test_store();
    let snapshot = chain.index().snapshot();
    let block = snapshot
        .receipts_for_epoch_range(1, 1)
        .next()
        .expect("epoch 1 is executed");

    assert_eq!(store.insert_executed_block(&block)?, 1);
    assert!(store.insert_executed_block(&block).is_err());
    Ok(())
}
