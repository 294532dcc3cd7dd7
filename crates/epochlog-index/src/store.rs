//! SQLite archive of mined and executed blocks.
//!
//! The receipt index itself is in-memory; the archive lets a process rebuild
//! it on startup. Uses WAL mode and prepared statements for batch inserts.

use std::cell::RefCell;

use alloy::primitives::{Address, Bytes, B256};
use eyre::{ensure, Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::config::IndexConfig;
use crate::index::ReceiptIndex;
use crate::types::{
    BlockPosition, EmittedLog, EpochNumber, ExecutedBlock, OutcomeStatus, TransactionOutcome,
};

/// Block read back from the archive. `outcomes` is `None` for blocks that
/// were mined but never executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedBlock {
    pub hash: B256,
    pub position: BlockPosition,
    pub outcomes: Option<Vec<TransactionOutcome>>,
}

pub struct Store {
    conn: RefCell<Connection>,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blocks (
                block_hash TEXT PRIMARY KEY,
                epoch_number INTEGER NOT NULL,
                pivot_ordinal INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                is_pivot INTEGER NOT NULL,
                executed INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS blocks_canonical
                ON blocks (epoch_number, pivot_ordinal);

            CREATE TABLE IF NOT EXISTS receipts (
                block_hash TEXT NOT NULL REFERENCES blocks(block_hash),
                tx_index INTEGER NOT NULL,
                tx_hash TEXT NOT NULL,
                outcome_status INTEGER NOT NULL,
                PRIMARY KEY (block_hash, tx_index)
            );

            CREATE TABLE IF NOT EXISTS logs (
                block_hash TEXT NOT NULL,
                tx_index INTEGER NOT NULL,
                tx_log_index INTEGER NOT NULL,
                address TEXT NOT NULL,
                topic0 TEXT,
                topic1 TEXT,
                topic2 TEXT,
                topic3 TEXT,
                data TEXT NOT NULL,
                PRIMARY KEY (block_hash, tx_index, tx_log_index),
                FOREIGN KEY (block_hash, tx_index) REFERENCES receipts(block_hash, tx_index)
            );
            ",
        )?;
        Ok(())
    }

    /// Archives a block that is known but not executed.
    ///
    /// # Errors
    /// Returns error if the block is already archived or the insert fails.
    pub fn insert_mined_block(&self, hash: B256, position: &BlockPosition) -> Result<()> {
        self.conn.borrow_mut().execute(
            "
            INSERT INTO blocks (
                block_hash, epoch_number, pivot_ordinal, block_number, is_pivot, executed
            ) VALUES (?, ?, ?, ?, ?, 0)
            ",
            rusqlite::params![
                hash.to_string(),
                position.epoch_number,
                position.pivot_ordinal,
                position.block_number,
                position.is_pivot,
            ],
        )?;
        Ok(())
    }

    /// Archives an executed block with its receipts and logs in one transaction.
    ///
    /// A previously archived mined block is promoted to executed; its archived
    /// position must match the executed one.
    ///
    /// # Errors
    /// Returns error if the block is already archived as executed, was archived
    /// at a different position, or an insert fails.
    pub fn insert_executed_block(&self, block: &ExecutedBlock) -> Result<usize> {
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        let hash = block.hash.to_string();
        let position = &block.position;

        let archived: Option<(bool, BlockPosition)> = tx
            .query_row(
                "
                SELECT executed, epoch_number, pivot_ordinal, block_number, is_pivot
                FROM blocks WHERE block_hash = ?
                ",
                rusqlite::params![hash],
                |row| {
                    Ok((
                        row.get(0)?,
                        BlockPosition {
                            epoch_number: row.get(1)?,
                            pivot_ordinal: row.get(2)?,
                            block_number: row.get(3)?,
                            is_pivot: row.get(4)?,
                        },
                    ))
                },
            )
            .optional()?;
        if let Some((executed, archived_position)) = archived {
            ensure!(!executed, "block {} is already archived as executed", block.hash);
            ensure!(
                archived_position == *position,
                "block {} was archived at {:?} but executed at {:?}",
                block.hash,
                archived_position,
                position
            );
        }

        tx.execute(
            "
            INSERT INTO blocks (
                block_hash, epoch_number, pivot_ordinal, block_number, is_pivot, executed
            ) VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(block_hash) DO UPDATE SET executed = 1
            ",
            rusqlite::params![
                hash,
                position.epoch_number,
                position.pivot_ordinal,
                position.block_number,
                position.is_pivot,
            ],
        )?;

        let mut log_count = 0;
        {
            let mut receipt_stmt = tx.prepare(
                "
                INSERT INTO receipts (block_hash, tx_index, tx_hash, outcome_status)
                VALUES (?, ?, ?, ?)
                ",
            )?;
            let mut log_stmt = tx.prepare(
                "
                INSERT INTO logs (
                    block_hash, tx_index, tx_log_index, address,
                    topic0, topic1, topic2, topic3, data
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;

            for receipt in &block.receipts {
                receipt_stmt.execute(rusqlite::params![
                    hash,
                    receipt.transaction_index,
                    receipt.transaction_hash.to_string(),
                    receipt.is_success(),
                ])?;

                for log in &receipt.logs {
                    ensure!(
                        log.topics.len() <= 4,
                        "log {} of block {} has {} topics",
                        log.log_index,
                        block.hash,
                        log.topics.len()
                    );
                    let topic = |i: usize| log.topics.get(i).map(|t| t.to_string());
                    log_stmt.execute(rusqlite::params![
                        hash,
                        receipt.transaction_index,
                        log.transaction_log_index,
                        log.address.to_string(),
                        topic(0),
                        topic(1),
                        topic(2),
                        topic(3),
                        log.data.to_string(),
                    ])?;
                    log_count += 1;
                }
            }
        }

        tx.commit()?;
        Ok(log_count)
    }

    /// Returns (min epoch, max epoch, block count). Zeros when empty.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn epoch_range(&self) -> Result<(EpochNumber, EpochNumber, u64)> {
        let conn = self.conn.borrow();
        let row = conn.query_row(
            "SELECT MIN(epoch_number), MAX(epoch_number), COUNT(*) FROM blocks",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<u64>>(0)?,
                    row.get::<_, Option<u64>>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            },
        )?;
        Ok((row.0.unwrap_or(0), row.1.unwrap_or(0), row.2))
    }

    /// Loads every archived block in canonical order.
    ///
    /// # Errors
    /// Returns error if a query fails or archived hex text is malformed.
    pub fn load_blocks(&self) -> Result<Vec<ArchivedBlock>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT block_hash, epoch_number, pivot_ordinal, block_number, is_pivot, executed
            FROM blocks ORDER BY epoch_number, pivot_ordinal
            ",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    BlockPosition {
                        epoch_number: row.get(1)?,
                        pivot_ordinal: row.get(2)?,
                        block_number: row.get(3)?,
                        is_pivot: row.get(4)?,
                    },
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut blocks = Vec::with_capacity(rows.len());
        for (hash_text, position, executed) in rows {
            let hash: B256 = hash_text
                .parse()
                .wrap_err_with(|| format!("malformed archived block hash {hash_text}"))?;
            let outcomes = if executed {
                Some(Self::load_outcomes(&conn, &hash_text)?)
            } else {
                None
            };
            blocks.push(ArchivedBlock {
                hash,
                position,
                outcomes,
            });
        }
        Ok(blocks)
    }

    fn load_outcomes(conn: &Connection, block_hash: &str) -> Result<Vec<TransactionOutcome>> {
        let mut receipt_stmt = conn.prepare(
            "
            SELECT tx_index, tx_hash, outcome_status FROM receipts
            WHERE block_hash = ? ORDER BY tx_index
            ",
        )?;
        let receipts = receipt_stmt
            .query_map(rusqlite::params![block_hash], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut log_stmt = conn.prepare(
            "
            SELECT address, topic0, topic1, topic2, topic3, data FROM logs
            WHERE block_hash = ? AND tx_index = ? ORDER BY tx_log_index
            ",
        )?;

        let mut outcomes = Vec::with_capacity(receipts.len());
        for (tx_index, tx_hash, success) in receipts {
            let rows = log_stmt
                .query_map(rusqlite::params![block_hash, tx_index], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        [
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ],
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut logs = Vec::with_capacity(rows.len());
            for (address, topics, data) in rows {
                let address: Address = address
                    .parse()
                    .wrap_err_with(|| format!("malformed archived address {address}"))?;
                let topics = topics
                    .into_iter()
                    .flatten()
                    .map(|t| {
                        t.parse::<B256>()
                            .wrap_err_with(|| format!("malformed archived topic {t}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let data: Bytes = data
                    .parse()
                    .wrap_err_with(|| format!("malformed archived log data in block {block_hash}"))?;
                logs.push(EmittedLog {
                    address,
                    topics,
                    data,
                });
            }

            outcomes.push(TransactionOutcome {
                transaction_hash: tx_hash
                    .parse()
                    .wrap_err_with(|| format!("malformed archived tx hash {tx_hash}"))?,
                outcome_status: if success {
                    OutcomeStatus::Success
                } else {
                    OutcomeStatus::Failure
                },
                logs,
            });
        }
        Ok(outcomes)
    }

    /// Rebuilds an in-memory index from the archive.
    ///
    /// # Errors
    /// Returns error if loading fails or the archive violates index invariants.
    #[tracing::instrument(skip_all)]
    pub fn restore_index(&self, config: IndexConfig) -> Result<ReceiptIndex> {
        let index = ReceiptIndex::new(config);
        let blocks = self.load_blocks().wrap_err("failed to load archived blocks")?;
        let total = blocks.len();

        for block in blocks {
            match block.outcomes {
                Some(outcomes) => {
                    index
                        .record_receipts(block.hash, block.position, outcomes)
                        .wrap_err_with(|| format!("failed to restore block {}", block.hash))?;
                }
                None => {
                    index
                        .announce_block(block.hash, block.position)
                        .wrap_err_with(|| format!("failed to restore block {}", block.hash))?;
                }
            }
        }

        let stats = index.stats();
        tracing::info!(
            blocks = total,
            executed = stats.executed_blocks,
            logs = stats.logs,
            latest_state = stats.marks.latest_state,
            "receipt index restored from archive"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BlockLookup;
    use std::sync::Arc;

    fn hash(n: u64) -> B256 {
        B256::left_padding_from(&n.to_be_bytes())
    }

    fn position(epoch: u64, is_pivot: bool) -> BlockPosition {
        BlockPosition {
            epoch_number: epoch,
            pivot_ordinal: u32::from(is_pivot),
            block_number: epoch,
            is_pivot,
        }
    }

    fn outcomes() -> Vec<TransactionOutcome> {
        vec![
            TransactionOutcome {
                transaction_hash: hash(100),
                outcome_status: OutcomeStatus::Success,
                logs: vec![EmittedLog {
                    address: Address::repeat_byte(0xab),
                    topics: vec![hash(1), hash(2), hash(3)],
                    data: Bytes::from(vec![0xde, 0xad]),
                }],
            },
            TransactionOutcome {
                transaction_hash: hash(101),
                outcome_status: OutcomeStatus::Failure,
                logs: vec![],
            },
        ]
    }

    #[test]
    fn migrations_create_tables() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let conn = store.conn.borrow();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("query should prepare");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query_map should succeed")
            .collect::<Result<Vec<_>, _>>()
            .expect("all rows should parse");

        assert!(tables.contains(&"blocks".to_string()));
        assert!(tables.contains(&"receipts".to_string()));
        assert!(tables.contains(&"logs".to_string()));
    }

    #[test]
    fn executed_block_round_trips_through_archive() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        let block = ExecutedBlock::assemble(hash(7), position(3, true), outcomes());

        let logs = store
            .insert_executed_block(&block)
            .expect("insert should succeed");
        assert_eq!(logs, 1);

        let loaded = store.load_blocks().expect("load should succeed");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash, hash(7));
        assert_eq!(loaded[0].outcomes.as_ref(), Some(&outcomes()));
    }

    #[test]
    fn mined_block_is_promoted_on_execution() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store
            .insert_mined_block(hash(7), &position(3, true))
            .expect("mined insert should succeed");
        assert!(store.load_blocks().expect("load")[0].outcomes.is_none());

        let block = ExecutedBlock::assemble(hash(7), position(3, true), outcomes());
        store
            .insert_executed_block(&block)
            .expect("promotion should succeed");
        assert!(store.load_blocks().expect("load")[0].outcomes.is_some());

        assert!(
            store.insert_executed_block(&block).is_err(),
            "second execution must be rejected"
        );
    }

    #[test]
    fn promotion_requires_matching_position() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        store
            .insert_mined_block(hash(7), &position(3, true))
            .expect("mined insert should succeed");

        let moved = ExecutedBlock::assemble(hash(7), position(4, true), outcomes());
        assert!(
            store.insert_executed_block(&moved).is_err(),
            "executed position differs from the archived one"
        );

        let loaded = store.load_blocks().expect("load");
        assert_eq!(loaded[0].position, position(3, true));
        assert!(loaded[0].outcomes.is_none(), "failed promotion must roll back");

        let block = ExecutedBlock::assemble(hash(7), position(3, true), outcomes());
        store
            .insert_executed_block(&block)
            .expect("matching promotion should succeed");
    }

    #[test]
    fn restore_rebuilds_index_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let path = dir.path().join("archive.sqlite");
        let path = path.to_str().expect("temp path should be utf-8");

        {
            let store = Store::new(path).expect("store should open");
            let executed = ExecutedBlock::assemble(hash(1), position(1, true), outcomes());
            store.insert_executed_block(&executed).expect("insert");
            store
                .insert_mined_block(hash(2), &position(2, true))
                .expect("insert");
        }

        let store = Store::new(path).expect("store should reopen");
        let index = Arc::new(
            store
                .restore_index(IndexConfig::default())
                .expect("restore should succeed"),
        );

        let marks = index.marks();
        assert_eq!(marks.latest_state, 1);
        assert_eq!(marks.latest_mined, 2);

        let snapshot = index.snapshot();
        match snapshot.receipts_for_block(&hash(1)) {
            BlockLookup::Executed(block) => {
                let log = block.logs().next().expect("archived log should be restored");
                assert_eq!(log.topics.len(), 3);
                assert_eq!(log.data, Bytes::from(vec![0xde, 0xad]));
            }
            other => panic!("expected executed block, got {other:?}"),
        }
        assert!(matches!(
            snapshot.receipts_for_block(&hash(2)),
            BlockLookup::NotExecuted(_)
        ));
    }

    #[test]
    fn epoch_range_reports_bounds() {
        let store = Store::new(":memory:").expect("in-memory store should always open");
        assert_eq!(store.epoch_range().expect("query"), (0, 0, 0));

        store
            .insert_mined_block(hash(1), &position(4, true))
            .expect("insert");
        store
            .insert_mined_block(hash(2), &position(9, true))
            .expect("insert");
        assert_eq!(store.epoch_range().expect("query"), (4, 9, 2));
    }
}
