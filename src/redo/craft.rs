//! Record-crafting helpers. Tests and the dump-file tooling build
//! synthetic redo records with the same framing the reader contract
//! expects; nothing here is used on the hot decode path.

use bytes::Bytes;

use crate::redo::record::{RawRecord, Scn, Xid, FIELD_LENGTHS_DELTA};
use crate::util;

/// Assembles one physical record: 24-byte header, field-length table,
/// 4-aligned field payloads.
pub struct RecordBuilder {
    opcode: u16,
    scn: Scn,
    dba: u32,
    xid: Xid,
    fields: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub fn new(opcode: u16, scn: Scn) -> Self {
        Self {
            opcode,
            scn,
            dba: 0,
            xid: Xid::default(),
            fields: Vec::new(),
        }
    }

    pub fn dba(mut self, dba: u32) -> Self {
        self.dba = dba;
        self
    }

    /// Reader-resolved transaction id, for records that do not carry one.
    pub fn xid(mut self, xid: Xid) -> Self {
        self.xid = xid;
        self
    }

    pub fn field(mut self, data: &[u8]) -> Self {
        self.fields.push(data.to_vec());
        self
    }

    pub fn build(self) -> RawRecord {
        let cnt = self.fields.len();
        let field_pos = FIELD_LENGTHS_DELTA + util::align4(2 + 2 * cnt);
        let total: usize = field_pos + self.fields.iter().map(|f| util::align4(f.len())).sum::<usize>();

        let mut buf = vec![0u8; total];
        buf[0] = (self.opcode >> 8) as u8;
        buf[1] = (self.opcode & 0xFF) as u8;
        util::write64(&mut buf, 4, self.scn);
        util::write16(&mut buf, 12, self.xid.usn);
        util::write16(&mut buf, 14, self.xid.slt);
        util::write32(&mut buf, 16, self.dba);
        util::write32(&mut buf, 20, self.xid.sqn);
        util::write16(&mut buf, FIELD_LENGTHS_DELTA, cnt as u16);

        let mut pos = field_pos;
        for (i, f) in self.fields.iter().enumerate() {
            util::write16(&mut buf, FIELD_LENGTHS_DELTA + 2 * (i + 1), f.len() as u16);
            buf[pos..pos + f.len()].copy_from_slice(f);
            pos += util::align4(f.len());
        }

        RawRecord::from_bytes(Bytes::from(buf))
    }
}

/// KTUDB payload: xid at offsets 8/10/12, 20 bytes minimum.
pub fn ktudb_field(xid: Xid) -> Vec<u8> {
    let mut f = vec![0u8; 20];
    util::write16(&mut f, 8, xid.usn);
    util::write16(&mut f, 10, xid.slt);
    util::write32(&mut f, 12, xid.sqn);
    f
}

/// KTUB payload: objn/objd/tsn/undo, opc big-endian pair at 16, slt/rci,
/// flag word at 20. 24 bytes minimum.
pub fn ktub_field(objn: u32, objd: u32, opc: u16, slt: u8, rci: u8, flg: u16) -> Vec<u8> {
    let mut f = vec![0u8; 24];
    util::write32(&mut f, 0, objn);
    util::write32(&mut f, 4, objd);
    f[16] = (opc >> 8) as u8;
    f[17] = (opc & 0xFF) as u8;
    f[18] = slt;
    f[19] = rci;
    util::write16(&mut f, 20, flg);
    f
}

/// KTB-redo payload, op C: uba at offset 8.
pub fn ktb_redo_c_field(uba: u64) -> Vec<u8> {
    let mut f = vec![0u8; 16];
    f[0] = 0x02;
    f[8..15].copy_from_slice(&uba.to_le_bytes()[..7]);
    f
}

/// KDO payload skeleton: bdba at 0, op byte at 10, itli at 12. The caller
/// sizes the vector per sub-op and fills sub-op specific offsets.
pub fn kdo_field(len: usize, bdba: u32, op: u8, itli: u8) -> Vec<u8> {
    let mut f = vec![0u8; len];
    util::write32(&mut f, 0, bdba);
    f[10] = op;
    f[12] = itli;
    f
}

/// Supplemental-log trailer: type/fb at 0/1, cc at 2, before/after at 6/8,
/// bdba/slot at 20/24 when the long form is used.
pub fn supp_log_field(fb: u8, cc: u16, bdba: u32, slot: u16) -> Vec<u8> {
    let mut f = vec![0u8; 26];
    f[1] = fb;
    util::write16(&mut f, 2, cc);
    util::write32(&mut f, 20, bdba);
    util::write16(&mut f, 24, slot);
    f
}

/// KTUCM commit-marker payload: slt at 0, sqn at 4, flag byte at 13.
pub fn ktucm_field(xid: Xid, flg: u8) -> Vec<u8> {
    let mut f = vec![0u8; 20];
    util::write16(&mut f, 0, xid.slt);
    util::write32(&mut f, 4, xid.sqn);
    f[13] = flg;
    f
}

/// DDL payload: xid at 4/6/8, DDL type at 16.
pub fn ddl_field(xid: Xid, ddl_type: u16) -> Vec<u8> {
    let mut f = vec![0u8; 18];
    util::write16(&mut f, 4, xid.usn);
    util::write16(&mut f, 6, xid.slt);
    util::write32(&mut f, 8, xid.sqn);
    util::write16(&mut f, 16, ddl_type);
    f
}

/// Oracle 7-byte date: century/year biased by 100, one-based time fields.
pub fn date_bytes(year: u32, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Vec<u8> {
    vec![
        (year / 100 + 100) as u8,
        (year % 100 + 100) as u8,
        month,
        day,
        hour + 1,
        minute + 1,
        second + 1,
    ]
}
