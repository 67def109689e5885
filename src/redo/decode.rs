use std::collections::HashMap;

use lazy_static::lazy_static;
use log::{debug, trace, warn};

use crate::config::Environment;
use crate::redo::record::{
    KdoOp, RawRecord, RedoLogRecord, Xid, DDL_TYPE_TRUNCATE, FB_C, FB_D, FB_F, FB_H, FB_K, FB_L,
    FB_N, FB_P, FLAGS_KDO_KDOM2,
};
use crate::util;

pub type ParseFn = fn(&Environment, &mut RedoLogRecord);

lazy_static! {
    /// Parser per 16-bit opcode; anything absent is carried through
    /// undecoded (the emitter skips it with a diagnostic).
    static ref DISPATCH: HashMap<u16, ParseFn> = {
        let mut map: HashMap<u16, ParseFn> = HashMap::new();
        map.insert(0x0501, parse_undo as ParseFn);
        map.insert(0x0502, parse_begin as ParseFn);
        map.insert(0x0504, parse_commit as ParseFn);
        map.insert(0x0506, parse_undo_done as ParseFn);
        for minor in 0x02..=0x0C {
            map.insert(0x0B00 | minor, parse_row_change as ParseFn);
        }
        map.insert(0x1801, parse_ddl as ParseFn);
        map
    };
}

/// Decodes one physical record. Never fails: malformed input leaves the
/// record partially populated behind a diagnostic, per the short-field
/// policy.
pub fn decode(raw: RawRecord, env: &Environment) -> RedoLogRecord {
    let mut rec = RedoLogRecord::from_raw(raw);
    match DISPATCH.get(&rec.opcode) {
        Some(parse) => parse(env, &mut rec),
        None => debug!(
            "unhandled opcode 0x{:04x} at scn {}, carried undecoded",
            rec.opcode, rec.scn
        ),
    }
    rec
}

/// OpCode 5.1: KTUDB + KTUB, then (unless a multi-block fragment) the
/// embedded KTB-redo, KDO and the op-dependent column payload fields,
/// closed by the supplemental-log trailer.
pub fn parse_undo(env: &Environment, rec: &mut RedoLogRecord) {
    let fields: Vec<(usize, usize, usize)> = rec.fields().collect();
    let mut nulls_pos = 0usize;
    let mut nulls_bit = 1u8;
    let mut col_nums_pos = 0usize;

    for &(i, pos, len) in &fields {
        match i {
            1 => ktudb(env, rec, pos, len),
            2 => {
                ktub(env, rec, pos, len);
                if rec.is_multiblock_fragment() {
                    // the remaining fields are an incomplete payload slice
                    return;
                }
            }
            3 => {
                if rec.opc == 0x0A16 || rec.opc == 0x0B01 {
                    ktb_redo(env, rec, pos, len);
                }
            }
            4 => {
                if rec.opc == 0x0B01 {
                    kdo_op_code(env, rec, pos, len);
                    nulls_pos = rec.nulls_delta;
                    nulls_bit = 1;
                    if rec.kdo_op() == KdoOp::QMD && env.dump_records() {
                        for n in 0..rec.nrow as usize {
                            let at = rec.slots_delta + n * 2;
                            if at + 2 > rec.data.len() {
                                break;
                            }
                            debug!("slot[{}]: {}", n, util::read16(&rec.data, at));
                        }
                    }
                }
            }
            _ => match rec.kdo_op() {
                KdoOp::URP => {
                    if i == 5 {
                        rec.col_nums_delta = pos;
                        col_nums_pos = pos;
                    } else if rec.op_flags & FLAGS_KDO_KDOM2 != 0 {
                        if i == 6 {
                            if env.dump_records() {
                                dump_col_vector(rec, pos, col_nums_pos);
                            }
                        } else if i == 7 {
                            supp_log(env, rec, pos, len);
                        }
                    } else if i > 5 && i <= 5 + rec.cc as usize {
                        if env.dump_records() {
                            let num = util::read16(&rec.data, col_nums_pos);
                            dump_col(rec, pos, len, num, null_bit(rec, nulls_pos, nulls_bit));
                            col_nums_pos += 2;
                            advance_null_bit(&mut nulls_pos, &mut nulls_bit);
                        }
                    } else if i == 6 + rec.cc as usize {
                        supp_log(env, rec, pos, len);
                    }
                }
                KdoOp::DRP => {
                    if i == 5 {
                        supp_log(env, rec, pos, len);
                    }
                }
                KdoOp::IRP | KdoOp::ORP => {
                    if i > 4 && i <= 4 + rec.cc as usize {
                        if env.dump_records() {
                            dump_col(
                                rec,
                                pos,
                                len,
                                (i - 5) as u16,
                                null_bit(rec, nulls_pos, nulls_bit),
                            );
                            advance_null_bit(&mut nulls_pos, &mut nulls_bit);
                        }
                    } else if i == 5 + rec.cc as usize {
                        supp_log(env, rec, pos, len);
                    }
                }
                KdoOp::QMI => {
                    if i == 5 {
                        rec.row_lengths_delta = pos;
                    } else if i == 6 && env.dump_records() {
                        debug!("row vectors at 0x{:x}, {} rows", pos, rec.nrow);
                    }
                }
                KdoOp::CFA => {
                    if i == 5 {
                        supp_log(env, rec, pos, len);
                    }
                }
                _ => {}
            },
        }
    }
}

/// OpCode 5.2: begin-transaction marker, KTUB only.
fn parse_begin(env: &Environment, rec: &mut RedoLogRecord) {
    if let Some((pos, len)) = rec.field_at(1) {
        ktub(env, rec, pos, len);
    }
}

/// OpCode 5.4: commit / rollback marker.
fn parse_commit(env: &Environment, rec: &mut RedoLogRecord) {
    let Some((pos, len)) = rec.field_at(1) else {
        return;
    };
    if len < 20 {
        warn!("too short field ktucm: {}", len);
        return;
    }
    rec.slt = util::read16(&rec.data, pos) as u8;
    rec.ktucm_flg = rec.data[pos + 13];
    if env.dump_records() {
        let srt = util::read16(&rec.data, pos + 8);
        let sta = rec.data[pos + 12];
        debug!(
            "ktucm redo: slt: {} sqn: {} srt: {} sta: {} flg: 0x{:02x}",
            util::read16(&rec.data, pos),
            util::read32(&rec.data, pos + 4),
            srt,
            sta,
            rec.ktucm_flg
        );
    }
}

/// OpCode 5.6: user undo done, KTUB + KTUXVOFF.
fn parse_undo_done(env: &Environment, rec: &mut RedoLogRecord) {
    let fields: Vec<(usize, usize, usize)> = rec.fields().collect();
    for &(i, pos, len) in &fields {
        match i {
            1 => ktub(env, rec, pos, len),
            2 => ktuxvoff(env, rec, pos, len),
            _ => {}
        }
    }
}

/// OpCodes 11.2 - 11.12: redo side of a row change, KTB-redo + KDO + the
/// sub-op specific payload fields.
pub fn parse_row_change(env: &Environment, rec: &mut RedoLogRecord) {
    let fields: Vec<(usize, usize, usize)> = rec.fields().collect();
    let mut nulls_pos = 0usize;
    let mut nulls_bit = 1u8;

    for &(i, pos, len) in &fields {
        match i {
            1 => ktb_redo(env, rec, pos, len),
            2 => {
                kdo_op_code(env, rec, pos, len);
                nulls_pos = rec.nulls_delta;
                nulls_bit = 1;
            }
            _ => match rec.kdo_op() {
                KdoOp::IRP | KdoOp::ORP => {
                    if i <= 2 + rec.cc as usize && env.dump_records() {
                        dump_col(
                            rec,
                            pos,
                            len,
                            (i - 3) as u16,
                            null_bit(rec, nulls_pos, nulls_bit),
                        );
                        advance_null_bit(&mut nulls_pos, &mut nulls_bit);
                    }
                }
                KdoOp::URP => {
                    if i == 3 {
                        rec.col_nums_delta = pos;
                    } else if i > 3 && i <= 3 + rec.cc as usize && env.dump_records() {
                        let num = util::read16(&rec.data, rec.col_nums_delta + (i - 4) * 2);
                        dump_col(rec, pos, len, num, false);
                    }
                }
                KdoOp::QMI => {
                    if i == 3 {
                        rec.row_lengths_delta = pos;
                    } else if i == 4 && env.dump_records() {
                        debug!("row vectors at 0x{:x}, {} rows", pos, rec.nrow);
                    }
                }
                _ => {}
            },
        }
    }
}

/// OpCode 24.1: DDL. Only valid truncates are replicated.
fn parse_ddl(env: &Environment, rec: &mut RedoLogRecord) {
    let Some((pos, len)) = rec.field_at(1) else {
        return;
    };
    if len < 18 {
        warn!("too short field DDL: {}", len);
        return;
    }
    rec.xid = Xid::new(
        util::read16(&rec.data, pos + 4),
        util::read16(&rec.data, pos + 6),
        util::read32(&rec.data, pos + 8),
    );
    rec.ddl_type = util::read16(&rec.data, pos + 16);
    rec.ddl_valid = rec.ddl_type == DDL_TYPE_TRUNCATE;
    if env.dump_records() {
        debug!("DDL type: {} valid: {}", rec.ddl_type, rec.ddl_valid);
    }
}

/// KTB-redo: transaction-slot redo. First byte selects op C/Z/L/F; C and L
/// carry the UBA, F carries XID plus UBA, op 0x11 appends a block-cleanout
/// dump.
pub fn ktb_redo(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 8 {
        warn!("too short field KTB Redo: {}", len);
        return;
    }

    let op = rec.data[pos];
    if env.dump_records() {
        let ver = rec.data[pos + 1] & 0x03;
        debug!("KTB Redo op: 0x{:02x} ver: 0x{:02x}", op, ver);
    }

    if op == 0x02 {
        // op C
        if len < 16 {
            warn!("too short field KTB Redo C: {}", len);
            return;
        }
        rec.uba = util::read56(&rec.data, pos + 8);
        if env.dump_records() {
            debug!("op: C  uba: 0x{:014x}", rec.uba);
        }
    } else if op == 0x03 {
        // op Z
        if env.dump_records() {
            debug!("op: Z");
        }
    } else if op == 0x04 {
        // op L
        if len < 32 {
            warn!("too short field KTB Redo L: {}", len);
            return;
        }
        rec.uba = util::read56(&rec.data, pos + 16);
        if env.dump_records() {
            let itl_xid = Xid::new(
                util::read16(&rec.data, pos + 8),
                util::read16(&rec.data, pos + 10),
                util::read32(&rec.data, pos + 12),
            );
            let lkc = rec.data[pos + 24];
            debug!(
                "op: L  itl xid: {} uba: 0x{:014x} lkc: {}",
                itl_xid, rec.uba, lkc
            );
        }
    } else if op == 0x01 || op == 0x11 {
        // op F
        if len < 24 {
            warn!("too short field KTB Redo F: {}", len);
            return;
        }
        rec.xid = Xid::new(
            util::read16(&rec.data, pos + 8),
            util::read16(&rec.data, pos + 10),
            util::read32(&rec.data, pos + 12),
        );
        rec.uba = util::read56(&rec.data, pos + 16);
        if env.dump_records() {
            debug!("op: F  xid: {} uba: 0x{:014x}", rec.xid, rec.uba);
        }

        if op == 0x11 && env.dump_records() {
            if len < 56 {
                warn!("too short field KTB Redo F 0x11: {}", len);
                return;
            }
            // cleanout SCN offset unverified
            let opt = rec.data[pos + 44];
            let entries = rec.data[pos + 45];
            let ver = rec.data[pos + 46];
            let scn = util::read48(&rec.data, pos + 48);
            debug!(
                "Block cleanout record, scn: 0x{:012x} ver: 0x{:02x} opt: 0x{:02x}, entries follow...",
                scn, ver, opt
            );
            if len < 56 + entries as usize * 8 {
                warn!("too short field KTB Redo F 0x11: {}", len);
                return;
            }
            for j in 0..entries as usize {
                let itli = rec.data[pos + 56 + j * 8];
                let flg = rec.data[pos + 57 + j * 8];
                let scn = ((util::read16(&rec.data, pos + 58 + j * 8) as u64) << 32)
                    | util::read32(&rec.data, pos + 60 + j * 8) as u64;
                debug!("  itli: {}  flg: {}  scn: 0x{:012x}", itli, flg, scn);
            }
        }
    }
}

/// KDO: the row-level opcode. The low 5 bits of the op byte select the
/// sub-op, each with its own minimum field length; below it the record is
/// dropped with a diagnostic and `op` stays at its default.
pub fn kdo_op_code(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 16 {
        warn!("too short field KDO OpCode: {}", len);
        return;
    }

    let op = rec.data[pos + 10];
    rec.itli = rec.data[pos + 12];
    rec.bdba = util::read32(&rec.data, pos);

    if env.dump_records() {
        let hdba = util::read32(&rec.data, pos + 4);
        let max_fr = util::read16(&rec.data, pos + 8);
        let xtype = rec.data[pos + 11];
        let ispac = rec.data[pos + 13];

        let xtype_str = match xtype {
            1 => "XA", // redo
            2 => "XR", // rollback
            // TODO xtype == 3: second source branch mapped 2 to "CR" and
            // was unreachable; correct mapping unknown
            _ => "??",
        };

        debug!(
            "KDO Op code: {} row dependencies Disabled",
            KdoOp::from(op & 0x1F)
        );
        debug!(
            "  xtype: {} flags: 0x00000000  bdba: 0x{:08x}  hdba: 0x{:08x}",
            xtype_str, rec.bdba, hdba
        );
        debug!("itli: {}  ispac: {}  maxfr: {}", rec.itli, ispac, max_fr);
    }

    match KdoOp::from(op & 0x1F) {
        KdoOp::IRP | KdoOp::ORP => {
            if len < 48 {
                warn!("too short field KDO OpCode IRP: {}", len);
                return;
            }
            rec.fb = rec.data[pos + 16];
            rec.cc = rec.data[pos + 18];
            rec.slot = util::read16(&rec.data, pos + 42);
            rec.nulls_delta = pos + 45;
            if rec.fb & FB_L == 0 {
                rec.nrid_bdba = util::read32(&rec.data, pos + 28);
                rec.nrid_slot = util::read16(&rec.data, pos + 32);
            }

            if env.dump_records() {
                let tabn = rec.data[pos + 44];
                let size_delt = util::read16(&rec.data, pos + 40);
                let lb = rec.data[pos + 17];
                let fl = fb_string(rec.fb);
                debug!(
                    "tabn: {} slot: {}(0x{:x}) size/delt: {}",
                    tabn, rec.slot, rec.slot, size_delt
                );
                debug!("fb: {} lb: 0x{:x}  cc: {}", fl, lb, rec.cc);
                if rec.fb & FB_K != 0 {
                    let curc = 0; // FIXME derive from the cluster-key field
                    let comc = 0; // FIXME derive from the cluster-key field
                    let pk = util::read32(&rec.data, pos + 20);
                    let pk1 = rec.data[pos + 24];
                    let nk = util::read32(&rec.data, pos + 28);
                    let nk1 = rec.data[pos + 32];
                    debug!(
                        "curc: {} comc: {} pk: 0x{:08x}.{:x} nk: 0x{:08x}.{:x}",
                        curc, comc, pk, pk1, nk, nk1
                    );
                }
                dump_null_bitmap(rec);
            }
        }

        KdoOp::DRP => {
            if len < 20 {
                warn!("too short field KDO OpCode DRP: {}", len);
                return;
            }
            rec.slot = util::read16(&rec.data, pos + 16);
            if env.dump_records() {
                let tabn = rec.data[pos + 18];
                debug!("tabn: {} slot: {}(0x{:x})", tabn, rec.slot, rec.slot);
            }
        }

        KdoOp::LKR => {
            if len < 20 {
                warn!("too short field KDO OpCode LKR: {}", len);
                return;
            }
            rec.slot = util::read16(&rec.data, pos + 16);
            if env.dump_records() {
                let tabn = rec.data[pos + 18];
                let to = rec.data[pos + 19];
                debug!("tabn: {} slot: {} to: {}", tabn, rec.slot, to);
            }
        }

        KdoOp::URP => {
            if len < 28 {
                warn!("too short field KDO OpCode URP: {}", len);
                return;
            }
            rec.op_flags = rec.data[pos + 16];
            rec.slot = util::read16(&rec.data, pos + 20);
            rec.cc = rec.data[pos + 23]; // nnew
            rec.nulls_delta = pos + 26;
            if env.dump_records() {
                let lock = rec.data[pos + 17];
                let ckix = rec.data[pos + 18];
                let tabn = rec.data[pos + 19];
                let ncol = rec.data[pos + 22];
                let size = util::read16(&rec.data, pos + 24) as i16;
                debug!(
                    "tabn: {} slot: {}(0x{:x}) flag: 0x{:02x} lock: {} ckix: {}",
                    tabn, rec.slot, rec.slot, rec.op_flags, lock, ckix
                );
                debug!("ncol: {} nnew: {} size: {}", ncol, rec.cc, size);
            }
        }

        KdoOp::CFA => {
            if len < 28 {
                warn!("too short field KDO OpCode CFA: {}", len);
                return;
            }
            rec.nrid_bdba = util::read32(&rec.data, pos + 16);
            rec.nrid_slot = util::read16(&rec.data, pos + 20);
            rec.slot = util::read16(&rec.data, pos + 24);
        }

        KdoOp::QMI | KdoOp::QMD => {
            if len < 20 {
                warn!("too short field KDO OpCode QMI: {}", len);
                return;
            }
            rec.nrow = util::read16(&rec.data, pos + 18);
            rec.slots_delta = pos + 20;
            if env.dump_records() {
                let tabn = rec.data[pos + 16];
                let lock = rec.data[pos + 17];
                debug!("tabn: {} lock: {} nrow: {}", tabn, lock, rec.nrow);
            }
        }

        _ => {}
    }

    rec.op = op;
}

/// KTUB: UNDO metadata, present on every 5.x record.
pub fn ktub(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 24 {
        warn!("too short field ktub: {}", len);
        return;
    }

    rec.objn = util::read32(&rec.data, pos);
    rec.objd = util::read32(&rec.data, pos + 4);
    rec.tsn = util::read32(&rec.data, pos + 8);
    rec.undo = util::read32(&rec.data, pos + 12);
    rec.opc = ((rec.data[pos + 16] as u16) << 8) | rec.data[pos + 17] as u16;
    rec.slt = rec.data[pos + 18];
    rec.rci = rec.data[pos + 19];
    rec.flg = util::read16(&rec.data, pos + 20);

    if env.dump_records() {
        debug!(
            "ktubu redo: slt: {} rci: {} opc: {}.{} objn: {} objd: {} tsn: {}",
            rec.slt,
            rec.rci,
            rec.opc >> 8,
            rec.opc & 0xFF,
            rec.objn,
            rec.objd,
            rec.tsn
        );
        debug!("             0x{:08x}", rec.undo);
    }
}

/// KTUDB: the undo-block header carrying the XID.
pub fn ktudb(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 20 {
        warn!("too short field ktudb: {}", len);
        return;
    }

    rec.xid = Xid::new(
        util::read16(&rec.data, pos + 8),
        util::read16(&rec.data, pos + 10),
        util::read32(&rec.data, pos + 12),
    );

    if env.dump_records() {
        let siz = util::read16(&rec.data, pos);
        let spc = util::read16(&rec.data, pos + 2);
        let flg = util::read16(&rec.data, pos + 4);
        let seq = util::read16(&rec.data, pos + 16);
        let rci = rec.data[pos + 18];
        debug!(
            "ktudb redo: siz: {} spc: {} flg: 0x{:04x} seq: 0x{:04x} rec: 0x{:02x}",
            siz, spc, flg, seq, rci
        );
        debug!("            xid: {}", rec.xid);
    }
}

/// KTUXVOFF: user-undo-done offset, diagnostic only.
fn ktuxvoff(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 8 {
        warn!("too short field ktuxvoff: {}", len);
        return;
    }

    if env.dump_records() {
        let off = util::read16(&rec.data, pos);
        let flg = util::read16(&rec.data, pos + 4);
        debug!("ktuxvoff: 0x{:04x}  ktuxvflg: 0x{:04x}", off, flg);
    }
}

/// Supplemental-log trailer; the long form adds the row address.
pub fn supp_log(env: &Environment, rec: &mut RedoLogRecord, pos: usize, len: usize) {
    if len < 20 {
        warn!("too short supplemental log: {}", len);
        return;
    }

    rec.supp_log_type = rec.data[pos];
    rec.supp_log_fb = rec.data[pos + 1];
    rec.supp_log_cc = util::read16(&rec.data, pos + 2);
    rec.supp_log_before = util::read16(&rec.data, pos + 6);
    rec.supp_log_after = util::read16(&rec.data, pos + 8);

    if env.dump_columns() {
        debug!(
            "supp log type: {} fb: 0x{:02x} cc: {} before: {} after: {}",
            rec.supp_log_type, rec.supp_log_fb, rec.supp_log_cc, rec.supp_log_before, rec.supp_log_after
        );
    }

    if len >= 26 {
        rec.supp_log_bdba = util::read32(&rec.data, pos + 20);
        rec.supp_log_slot = util::read16(&rec.data, pos + 24);
        if env.dump_columns() {
            debug!(
                "supp log bdba: 0x{:08x}.{:x}",
                rec.supp_log_bdba, rec.supp_log_slot
            );
        }
    }
}

fn advance_null_bit(nulls_pos: &mut usize, nulls_bit: &mut u8) {
    *nulls_bit <<= 1;
    if *nulls_bit == 0 {
        *nulls_bit = 1;
        *nulls_pos += 1;
    }
}

fn null_bit(rec: &RedoLogRecord, pos: usize, bit: u8) -> bool {
    rec.data.get(pos).map_or(false, |b| b & bit != 0)
}

fn fb_string(fb: u8) -> String {
    let mut s = [b'-'; 8];
    if fb & FB_N != 0 {
        s[7] = b'N';
    }
    if fb & FB_P != 0 {
        s[6] = b'P';
    }
    if fb & FB_L != 0 {
        s[5] = b'L';
    }
    if fb & FB_F != 0 {
        s[4] = b'F';
    }
    if fb & FB_D != 0 {
        s[3] = b'D';
    }
    if fb & FB_H != 0 {
        s[2] = b'H';
    }
    if fb & FB_C != 0 {
        s[1] = b'C';
    }
    if fb & FB_K != 0 {
        s[0] = b'K';
    }
    String::from_utf8_lossy(&s).into_owned()
}

fn dump_null_bitmap(rec: &RedoLogRecord) {
    let mut out = String::with_capacity(rec.cc as usize);
    let mut pos = rec.nulls_delta;
    let mut bit = 1u8;
    for _ in 0..rec.cc {
        out.push(if null_bit(rec, pos, bit) { 'N' } else { '-' });
        advance_null_bit(&mut pos, &mut bit);
    }
    debug!("null: {}", out);
}

fn dump_col(rec: &RedoLogRecord, pos: usize, len: usize, num: u16, is_null: bool) {
    if is_null {
        trace!("col {:3}: *NULL*", num);
    } else {
        trace!(
            "col {:3}: [{:2}] {}",
            num,
            len,
            hex::encode(&rec.data[pos..pos + len])
        );
    }
}

fn dump_col_vector(rec: &RedoLogRecord, pos: usize, col_nums_pos: usize) {
    let base = util::read16(&rec.data, col_nums_pos);
    debug!("col vector at 0x{:x}, first col {}", pos, base);
}
