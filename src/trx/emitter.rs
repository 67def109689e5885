use log::{debug, warn};

use crate::config::{Environment, TRACE_DETAIL, TRACE_WARN};
use crate::redo::record::{FB_F, FB_L};
use crate::ring::MAX_TRANSACTION_SIZE;
use crate::sink::{DmlKind, RowPair, Sink};
use crate::trx::buffer::TransactionBuffer;
use crate::trx::transaction::Transaction;

/// Commit-time flush: walks the chunk chain in insertion order, stitches
/// row pieces into logical DML runs, and drives the sink. Oversized
/// transactions split into several downstream messages carrying the same
/// XID and SCN.
pub fn flush(
    tx: &mut Transaction,
    buffer: &mut TransactionBuffer,
    sink: &mut dyn Sink,
    env: &Environment,
) {
    if tx.op_codes > 0 && !tx.is_rollback {
        if env.trace >= TRACE_DETAIL {
            debug!(
                "Transaction xid: {} SCN: {} - {} opCodes: {}",
                tx.xid, tx.first_scn, tx.last_scn, tx.op_codes
            );
        }

        sink.begin_tran(tx.last_scn, tx.xid);

        let mut run: Vec<RowPair> = Vec::new();
        let mut kind: Option<DmlKind> = None;
        let mut has_prev = false;
        let mut prev_scn = 0u64;

        for chunk in &tx.chunks {
            for entry in &chunk.entries {
                if env.trace >= TRACE_WARN && prev_scn != 0 && prev_scn > entry.scn {
                    warn!("SCN swap: {} after {}", entry.scn, prev_scn);
                }

                let mut op_flush = false;
                match entry.op {
                    // insert / delete / update / overwrite row piece
                    0x05010B02 | 0x05010B03 | 0x05010B05 | 0x05010B06 => {
                        let r1 = entry.redo1.clone();
                        let mut r2 = entry.redo2.clone();
                        // supplemental log rides the undo side but must be
                        // visible on the redo side at emit time
                        r2.supp_log_after = r1.supp_log_after;

                        if kind.is_none() {
                            kind = Some(classify(entry.op, &r1, &r2));
                        }

                        let fb_last = r1.supp_log_fb & FB_L != 0;
                        chain(&mut run, kind.unwrap(), entry.op, RowPair { r1, r2 }, env);

                        if fb_last {
                            if has_prev {
                                sink.next();
                            }
                            sink.parse_dml(&run, kind.unwrap());
                            op_flush = true;
                        }
                    }

                    // change row forwarding address closes the run
                    0x05010B08 => {
                        if entry.redo1.supp_log_fb & FB_L != 0 {
                            if let Some(kind) = kind {
                                if has_prev {
                                    sink.next();
                                }
                                sink.parse_dml(&run, kind);
                                op_flush = true;
                            }
                        }
                    }

                    // insert multiple rows
                    0x05010B0B => {
                        if has_prev {
                            sink.next();
                        }
                        sink.parse_insert_multiple(&entry.redo1, &entry.redo2);
                        op_flush = true;
                    }

                    // delete multiple rows
                    0x05010B0C => {
                        if has_prev {
                            sink.next();
                        }
                        sink.parse_delete_multiple(&entry.redo1, &entry.redo2);
                        op_flush = true;
                    }

                    // truncate
                    0x18010000 => {
                        if has_prev {
                            sink.next();
                        }
                        sink.parse_ddl(&entry.redo1);
                        op_flush = true;
                    }

                    other => {
                        warn!("Unknown OpCode 0x{:08x}", other);
                    }
                }

                if sink.tran_size() >= MAX_TRANSACTION_SIZE {
                    warn!("Big transaction divided ({})", sink.tran_size());
                    sink.commit_tran();
                    sink.begin_tran(tx.last_scn, tx.xid);
                    has_prev = false;
                }

                if op_flush {
                    run.clear();
                    kind = None;
                    has_prev = true;
                }
                prev_scn = entry.scn;
            }
        }

        sink.commit_tran();
    }

    buffer.free_chunks(std::mem::take(&mut tx.chunks));
}

/// Transaction type from the first pair: insert when the supplemental-log
/// address matches the redo side (or is absent), delete for a first
/// delete piece, update otherwise.
fn classify(op: u32, r1: &crate::redo::record::RedoLogRecord, r2: &crate::redo::record::RedoLogRecord) -> DmlKind {
    if r1.supp_log_fb & FB_F != 0
        && op == 0x05010B02
        && ((r1.supp_log_bdba == r2.bdba && r1.supp_log_slot == r2.slot) || r1.supp_log_bdba == 0)
    {
        DmlKind::Insert
    } else if r1.supp_log_fb & FB_F != 0 && op == 0x05010B03 {
        DmlKind::Delete
    } else {
        DmlKind::Update
    }
}

/// Splices a pair into the run. Inserts grow at the head (undo order),
/// an overwrite following an insert tail slots in before it, everything
/// else appends. A supplemental-log address mismatch drops the pair.
fn chain(run: &mut Vec<RowPair>, kind: DmlKind, op: u32, pair: RowPair, env: &Environment) {
    if run.is_empty() {
        run.push(pair);
        return;
    }

    let last = run.last().unwrap();
    if last.r1.supp_log_bdba != pair.r1.supp_log_bdba
        || last.r1.supp_log_slot != pair.r1.supp_log_slot
    {
        if env.trace >= TRACE_WARN {
            warn!("next BDBA/SLOT does not match");
        }
        return;
    }

    if kind == DmlKind::Insert {
        run.insert(0, pair);
    } else if op == 0x05010B06 && last.r2.opcode == 0x0B02 {
        run.insert(run.len() - 1, pair);
    } else {
        run.push(pair);
    }
}
