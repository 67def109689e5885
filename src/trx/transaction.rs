use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use log::{trace, warn};

use crate::config::{Environment, TRACE_FULL};
use crate::redo::decode::parse_undo;
use crate::redo::record::{
    RedoLogRecord, Scn, Uba, Xid, FLG_LASTBUFFERSPLIT, FLG_MULTIBLOCKUNDOHEAD,
    FLG_MULTIBLOCKUNDOMID, FLG_MULTIBLOCKUNDOTAIL, ZERO_SCN,
};
use crate::trx::buffer::{ChunkEntry, TransactionBuffer, TransactionChunk};
use crate::util;

/// One open transaction: an XID, the chunk chain holding its buffered
/// operations, and the rollback trailer coordinates.
#[derive(Debug, Default)]
pub struct Transaction {
    pub xid: Xid,
    pub first_scn: Scn,
    pub last_scn: Scn,
    pub op_codes: u32,
    pub chunks: Vec<TransactionChunk>,
    pub last_uba: Uba,
    pub last_dba: u32,
    pub last_slt: u8,
    pub last_rci: u8,
    pub is_begin: bool,
    pub is_commit: bool,
    pub is_rollback: bool,
}

impl Transaction {
    pub fn new(xid: Xid, buffer: &mut TransactionBuffer) -> Self {
        Self {
            xid,
            first_scn: ZERO_SCN,
            last_scn: ZERO_SCN,
            chunks: vec![buffer.alloc_chunk()],
            ..Default::default()
        }
    }

    pub fn touch(&mut self, scn: Scn) {
        if self.first_scn == ZERO_SCN || self.first_scn > scn {
            self.first_scn = scn;
        }
        if self.last_scn == ZERO_SCN || self.last_scn < scn {
            self.last_scn = scn;
        }
    }

    /// Buffers one operation. A 5.1 record flagged as a later multi-block
    /// piece is first stitched onto the buffered tail fragment; once the
    /// head arrives the merged record is re-decoded and replaces the
    /// partial predecessor.
    pub fn add(
        &mut self,
        env: &Environment,
        buffer: &mut TransactionBuffer,
        objn: u32,
        objd: u32,
        uba: Uba,
        dba: u32,
        slt: u8,
        rci: u8,
        mut redo1: RedoLogRecord,
        redo2: RedoLogRecord,
    ) {
        let op = ((redo1.opcode as u32) << 16) | redo2.opcode as u32;
        if env.trace >= TRACE_FULL {
            trace!("Transaction add: {:04x}:{:04x}", redo1.opcode, redo2.opcode);
        }

        if redo1.opcode == 0x0501
            && redo1.flg & (FLG_MULTIBLOCKUNDOHEAD | FLG_MULTIBLOCKUNDOMID) != 0
        {
            match TransactionBuffer::last_entry(&self.chunks) {
                Some(last)
                    if last.op == 0x05010000
                        && last.redo1.flg & FLG_MULTIBLOCKUNDOTAIL != 0
                        && last.redo1.field_cnt >= 2 =>
                {
                    splice_multiblock(env, &mut redo1, &last.redo1);
                }
                _ => {
                    warn!("next multi buffer without previous, fragment dropped");
                    return;
                }
            }
            self.rollback_last(env, buffer, redo1.scn);
        }

        if env.trace >= TRACE_FULL {
            trace!(
                "add uba: 0x{:014x}, dba: 0x{:x}, slt: {}, rci: {}",
                uba,
                dba,
                slt,
                rci
            );
        }

        let scn = redo1.scn;
        buffer.append(
            &mut self.chunks,
            ChunkEntry {
                objn,
                objd,
                op,
                redo1,
                redo2,
                uba,
                dba,
                slt,
                rci,
                scn,
            },
        );
        self.last_uba = uba;
        self.last_dba = dba;
        self.last_slt = slt;
        self.last_rci = rci;
        self.op_codes += 1;
        self.touch(scn);
    }

    /// Pops the most recent operation, keyed by the stored trailer
    /// coordinates.
    pub fn rollback_last(&mut self, env: &Environment, buffer: &mut TransactionBuffer, scn: Scn) {
        if env.trace >= TRACE_FULL {
            trace!(
                "rollback last uba: 0x{:014x}, dba: 0x{:x}, slt: {}, rci: {}",
                self.last_uba,
                self.last_dba,
                self.last_slt,
                self.last_rci
            );
        }
        if buffer.rollback_last(
            &mut self.chunks,
            self.last_uba,
            self.last_dba,
            self.last_slt,
            self.last_rci,
        ) {
            self.op_codes -= 1;
            if self.last_scn == ZERO_SCN || self.last_scn < scn {
                self.last_scn = scn;
            }
        }
    }

    /// Splices out the operation matching the rollback key. Does not touch
    /// the `last_*` trailer, so a following `rollback_last` still uses the
    /// coordinates of the newest append.
    pub fn rollback_previous(
        &mut self,
        env: &Environment,
        buffer: &mut TransactionBuffer,
        uba: Uba,
        dba: u32,
        slt: u8,
        rci: u8,
        scn: Scn,
    ) -> bool {
        if env.trace >= TRACE_FULL {
            trace!(
                "rollback previous uba: 0x{:014x}, dba: 0x{:x}, slt: {}, rci: {}",
                uba,
                dba,
                slt,
                rci
            );
        }
        if buffer.rollback_by_key(&mut self.chunks, uba, dba, slt, rci) {
            self.op_codes -= 1;
            if self.last_scn == ZERO_SCN || self.last_scn < scn {
                self.last_scn = scn;
            }
            true
        } else {
            false
        }
    }
}

/// Merges a later multi-block piece onto the buffered tail fragment:
/// length tables concatenate (minus the tail's KTUDB/KTUB entries), the
/// payloads concatenate, a split field folds its two lengths into one
/// entry, and the multi-block flags clear once head and tail have met.
fn splice_multiblock(env: &Environment, redo1: &mut RedoLogRecord, tail: &RedoLogRecord) {
    let delta = redo1.field_lengths_delta;
    let mut buf: Vec<u8> = Vec::with_capacity(redo1.length + tail.length);
    buf.extend_from_slice(&redo1.data[..delta]);

    let mut head_cnt = redo1.field_cnt as usize;

    // tail length-table entries from field 3 on
    let mut tail_lengths: Vec<u8> = tail.data
        [tail.field_lengths_delta + 6..tail.field_lengths_delta + 2 + 2 * tail.field_cnt as usize]
        .to_vec();

    if redo1.flg & FLG_LASTBUFFERSPLIT != 0 {
        let len1 = redo1.field_length(head_cnt) as u16;
        let len2 = util::read16(&tail_lengths, 0);
        util::write16(&mut tail_lengths, 0, len1 + len2);
        head_cnt -= 1;
    }

    let new_cnt = head_cnt + tail.field_cnt as usize - 2;
    buf.extend_from_slice(&(new_cnt as u16).to_le_bytes());
    buf.extend_from_slice(&redo1.data[delta + 2..delta + 2 + 2 * head_cnt]);
    buf.extend_from_slice(&tail_lengths);

    let field_pos = delta + util::align4(2 + 2 * new_cnt);
    buf.resize(field_pos, 0);

    buf.extend_from_slice(&redo1.data[redo1.field_pos..redo1.length]);
    buf.resize(util::align4(buf.len()), 0);

    // tail payload minus its own KTUDB and KTUB fields
    let skip = util::align4(tail.field_length(1)) + util::align4(tail.field_length(2));
    let tail_pos = tail.field_pos + skip;
    buf.extend_from_slice(&tail.data[tail_pos..tail.length]);
    buf.resize(util::align4(buf.len()), 0);

    // flag word sits inside the KTUB field, the second of the merged walk
    let ktub_pos = field_pos + util::align4(util::read16(&buf, delta + 2) as usize);
    let mut flg = util::read16(&buf, ktub_pos + 20);
    flg &= !(FLG_MULTIBLOCKUNDOHEAD
        | FLG_MULTIBLOCKUNDOMID
        | FLG_MULTIBLOCKUNDOTAIL
        | FLG_LASTBUFFERSPLIT);

    let complete =
        redo1.flg & FLG_MULTIBLOCKUNDOHEAD != 0 && tail.flg & FLG_MULTIBLOCKUNDOTAIL != 0;
    if !complete {
        // still partial, keep collecting
        flg |= FLG_MULTIBLOCKUNDOTAIL;
    }
    util::write16(&mut buf, ktub_pos + 20, flg);

    redo1.length = buf.len();
    redo1.field_cnt = new_cnt as u16;
    redo1.field_pos = field_pos;
    redo1.data = Bytes::from(buf);
    redo1.flg = flg;

    if complete {
        parse_undo(env, redo1);
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.xid == other.xid && self.last_scn == other.last_scn && self.is_commit == other.is_commit
    }
}

impl Eq for Transaction {}

impl PartialOrd for Transaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Transaction {
    /// Flush priority: committed first, then ascending commit SCN, then
    /// ascending XID. The greatest transaction is the next to drain.
    fn cmp(&self, other: &Self) -> Ordering {
        self.is_commit
            .cmp(&other.is_commit)
            .then_with(|| other.last_scn.cmp(&self.last_scn))
            .then_with(|| other.xid.cmp(&self.xid))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "xid: {} scn: {} - {} begin: {} commit: {} rollback: {}",
            self.xid,
            self.first_scn,
            self.last_scn,
            self.is_begin,
            self.is_commit,
            self.is_rollback
        )
    }
}
