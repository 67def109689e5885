use std::collections::{BinaryHeap, HashMap};

use log::{debug, warn};

use crate::config::Environment;
use crate::redo::record::{RedoLogRecord, Xid, FLG_KTUBL, KTUCF_ROLLBACK};
use crate::sink::Sink;
use crate::trx::buffer::TransactionBuffer;
use crate::trx::emitter;
use crate::trx::transaction::Transaction;

/// Per-XID transaction state for one source. Owns the chunk pool, the
/// open-transaction map and the commit priority queue; driven by a single
/// reader thread.
#[derive(Default)]
pub struct TransactionStore {
    txs: HashMap<Xid, Transaction>,
    committed: BinaryHeap<Transaction>,
    buffer: TransactionBuffer,
    /// 5.1 undo half waiting for its 11.x redo half.
    pending: Option<RedoLogRecord>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_transactions(&self) -> usize {
        self.txs.len()
    }

    /// Routes one decoded record. Undo halves (5.1) wait for the matching
    /// redo half; markers and DDL apply immediately. Returns true when a
    /// commit marker arrived and the committed queue should drain.
    pub fn route(&mut self, env: &Environment, rec: RedoLogRecord) -> bool {
        match rec.opcode {
            0x0502 => {
                self.begin(&rec);
                false
            }
            0x0504 => {
                self.commit(&rec);
                true
            }
            0x0506 => {
                self.undo_done(env, &rec);
                false
            }
            0x0501 => {
                if let Some(orphan) = self.pending.take() {
                    warn!("undo half without redo half at scn {}, buffered bare", orphan.scn);
                    self.apply(env, orphan, RedoLogRecord::default());
                }
                if rec.is_multiblock_fragment() {
                    self.apply(env, rec, RedoLogRecord::default());
                } else {
                    self.pending = Some(rec);
                }
                false
            }
            0x0B02..=0x0B0C => {
                match self.pending.take() {
                    Some(undo) => self.apply(env, undo, rec),
                    None => debug!("redo half 0x{:04x} without undo half, skipped", rec.opcode),
                }
                false
            }
            0x1801 => {
                if rec.ddl_valid {
                    self.apply(env, rec, RedoLogRecord::default());
                }
                false
            }
            other => {
                debug!("opcode 0x{:04x} not routed", other);
                false
            }
        }
    }

    fn tx_entry(&mut self, xid: Xid) -> &mut Transaction {
        let buffer = &mut self.buffer;
        self.txs
            .entry(xid)
            .or_insert_with(|| Transaction::new(xid, buffer))
    }

    pub fn begin(&mut self, rec: &RedoLogRecord) {
        let scn = rec.scn;
        let tx = self.tx_entry(rec.xid);
        tx.is_begin = true;
        tx.touch(scn);
    }

    pub fn commit(&mut self, rec: &RedoLogRecord) {
        match self.txs.remove(&rec.xid) {
            Some(mut tx) => {
                tx.is_commit = true;
                tx.is_rollback = rec.ktucm_flg & KTUCF_ROLLBACK != 0;
                tx.touch(rec.scn);
                self.committed.push(tx);
            }
            None => warn!("commit marker for unknown xid {}", rec.xid),
        }
    }

    /// Partial rollback: the record names the operation to undo through
    /// its (uba, dba, slt, rci) key. The owning transaction is found by
    /// probing the open set; a miss only warns.
    pub fn undo_done(&mut self, env: &Environment, rec: &RedoLogRecord) {
        let buffer = &mut self.buffer;
        for tx in self.txs.values_mut() {
            if tx.rollback_previous(env, buffer, rec.uba, rec.dba, rec.slt, rec.rci, rec.scn) {
                return;
            }
        }
        warn!(
            "rollback target not found: uba 0x{:014x} dba 0x{:08x} slt {} rci {}",
            rec.uba, rec.dba, rec.slt, rec.rci
        );
    }

    pub fn apply(&mut self, env: &Environment, redo1: RedoLogRecord, redo2: RedoLogRecord) {
        let xid = redo1.xid;
        if xid.is_zero() {
            warn!("record 0x{:04x} without xid at scn {}, dropped", redo1.opcode, redo1.scn);
            return;
        }

        let (objn, objd) = (redo1.objn, redo1.objd);
        // rollback key rides the redo side when present
        let (uba, dba, slt, rci) = if redo2.opcode != 0 {
            (redo2.uba, redo2.dba, redo2.slt, redo2.rci)
        } else {
            (redo1.uba, redo1.dba, redo1.slt, redo1.rci)
        };

        let is_begin = redo1.flg & FLG_KTUBL != 0;
        let buffer = &mut self.buffer;
        let tx = self
            .txs
            .entry(xid)
            .or_insert_with(|| Transaction::new(xid, &mut *buffer));
        if is_begin {
            tx.is_begin = true;
        }
        tx.add(env, buffer, objn, objd, uba, dba, slt, rci, redo1, redo2);
    }

    /// Drains every committed transaction in (commit, SCN, XID) priority
    /// order.
    pub fn drain(&mut self, env: &Environment, sink: &mut dyn Sink) {
        while let Some(tx) = self.committed.peek() {
            if !tx.is_commit {
                break;
            }
            let mut tx = self.committed.pop().unwrap();
            emitter::flush(&mut tx, &mut self.buffer, sink, env);
        }
    }

    /// Cooperative shutdown: in-flight transactions without a commit
    /// marker are abandoned, their chunks returned to the pool.
    pub fn shutdown(&mut self) {
        if let Some(orphan) = self.pending.take() {
            debug!("dropping pending undo half at scn {}", orphan.scn);
        }
        for (xid, mut tx) in self.txs.drain() {
            debug!("abandoning open transaction {}", xid);
            self.buffer.free_chunks(std::mem::take(&mut tx.chunks));
        }
    }
}

#[cfg(test)]
mod store_tests {
    use std::env::set_var;

    use super::*;
    use crate::redo::craft::{ktub_field, ktucm_field, ktudb_field, RecordBuilder};
    use crate::redo::decode::decode;
    use crate::redo::record::Scn;
    use crate::sink::{DmlKind, RowPair};

    fn setup() -> Environment {
        set_var("RUST_LOG", "debug");
        crate::util::init();
        Environment::default()
    }

    #[derive(Debug, Default)]
    struct TraceSink {
        begins: Vec<(Scn, Xid)>,
        commits: usize,
    }

    impl Sink for TraceSink {
        fn begin_tran(&mut self, scn: Scn, xid: Xid) {
            self.begins.push((scn, xid));
        }
        fn next(&mut self) {}
        fn parse_dml(&mut self, _rows: &[RowPair], _kind: DmlKind) {}
        fn parse_insert_multiple(&mut self, _r1: &RedoLogRecord, _r2: &RedoLogRecord) {}
        fn parse_delete_multiple(&mut self, _r1: &RedoLogRecord, _r2: &RedoLogRecord) {}
        fn parse_ddl(&mut self, _r1: &RedoLogRecord) {}
        fn commit_tran(&mut self) {
            self.commits += 1;
        }
        fn tran_size(&self) -> usize {
            0
        }
    }

    fn undo_rec(env: &Environment, xid: Xid, scn: Scn) -> RedoLogRecord {
        decode(
            RecordBuilder::new(0x0501, scn)
                .field(&ktudb_field(xid))
                .field(&ktub_field(1, 2, 0x0B01, 1, 0, 0))
                .build(),
            env,
        )
    }

    fn commit_rec(env: &Environment, xid: Xid, scn: Scn, flg: u8) -> RedoLogRecord {
        decode(
            RecordBuilder::new(0x0504, scn)
                .xid(xid)
                .field(&ktucm_field(xid, flg))
                .build(),
            env,
        )
    }

    #[test]
    fn cross_xid_commits_drain_in_scn_order() {
        let env = setup();
        let mut store = TransactionStore::new();
        let a = Xid::new(0xA, 0, 1);
        let b = Xid::new(0xB, 0, 1);

        store.apply(&env, undo_rec(&env, a, 10), RedoLogRecord::default());
        store.apply(&env, undo_rec(&env, b, 11), RedoLogRecord::default());

        // B commits at 50, A at 60
        assert!(store.route(&env, commit_rec(&env, b, 50, 0)));
        assert!(store.route(&env, commit_rec(&env, a, 60, 0)));

        let mut sink = TraceSink::default();
        store.drain(&env, &mut sink);

        let xids: Vec<Xid> = sink.begins.iter().map(|(_, x)| *x).collect();
        assert_eq!(xids, vec![b, a]);
        assert_eq!(sink.commits, 2);
        assert_eq!(store.open_transactions(), 0);
    }

    #[test]
    fn rollback_marker_suppresses_emission() {
        let env = setup();
        let mut store = TransactionStore::new();
        let xid = Xid::new(0xC, 0, 1);

        store.apply(&env, undo_rec(&env, xid, 20), RedoLogRecord::default());
        store.route(&env, commit_rec(&env, xid, 21, KTUCF_ROLLBACK));

        let mut sink = TraceSink::default();
        store.drain(&env, &mut sink);
        assert!(sink.begins.is_empty());
        assert_eq!(sink.commits, 0);
    }

    #[test]
    fn commit_for_unknown_xid_is_tolerated() {
        let env = setup();
        let mut store = TransactionStore::new();
        assert!(store.route(&env, commit_rec(&env, Xid::new(9, 9, 9), 30, 0)));
        let mut sink = TraceSink::default();
        store.drain(&env, &mut sink);
        assert_eq!(sink.commits, 0);
    }

    #[test]
    fn shutdown_abandons_open_transactions() {
        let env = setup();
        let mut store = TransactionStore::new();
        store.apply(&env, undo_rec(&env, Xid::new(1, 1, 1), 5), RedoLogRecord::default());
        assert_eq!(store.open_transactions(), 1);
        store.shutdown();
        assert_eq!(store.open_transactions(), 0);
    }
}
