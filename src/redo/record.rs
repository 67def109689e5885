use std::fmt;

use bytes::Bytes;
use derivative::Derivative;
use num_enum::FromPrimitive;
use strum::{Display, EnumString};

use crate::util;

/// System change number; `ZERO_SCN` marks "not seen yet".
pub type Scn = u64;

pub const ZERO_SCN: Scn = 0;

/// Offset of the field-length table inside a redo record; the u16 at the
/// delta is the field count, entry `i` (1-based) follows at `delta + 2*i`.
pub const FIELD_LENGTHS_DELTA: usize = 24;

/// Upper bound for one physical record, merged multi-block records included.
pub const REDO_RECORD_MAX_SIZE: usize = 65536;

// KTUB flag word.
pub const FLG_MULTIBLOCKUNDOHEAD: u16 = 0x0001;
pub const FLG_MULTIBLOCKUNDOTAIL: u16 = 0x0002;
pub const FLG_LASTBUFFERSPLIT: u16 = 0x0004;
pub const FLG_KTUBL: u16 = 0x0008;
pub const FLG_USERUNDODDONE: u16 = 0x0010;
pub const FLG_ISTEMPOBJECT: u16 = 0x0020;
pub const FLG_USERONLY: u16 = 0x0040;
pub const FLG_TABLESPACEUNDO: u16 = 0x0080;
pub const FLG_MULTIBLOCKUNDOMID: u16 = 0x0100;

pub const FLG_MULTIBLOCKUNDO_ANY: u16 =
    FLG_MULTIBLOCKUNDOHEAD | FLG_MULTIBLOCKUNDOTAIL | FLG_MULTIBLOCKUNDOMID;

// Row-piece flag byte (fb).
pub const FB_N: u8 = 0x01; // last column continues in next piece
pub const FB_P: u8 = 0x02; // first column continues from previous piece
pub const FB_L: u8 = 0x04; // last data piece
pub const FB_F: u8 = 0x08; // first data piece
pub const FB_D: u8 = 0x10; // deleted row
pub const FB_H: u8 = 0x20; // head piece of row
pub const FB_C: u8 = 0x40; // clustered table member
pub const FB_K: u8 = 0x80; // cluster key

// KDO op flag byte.
pub const FLAGS_KDO_KDOM2: u8 = 0x80;

// KTUCM commit-marker flag byte.
pub const KTUCF_ROLLBACK: u8 = 0x04;

// DDL record types worth replicating.
pub const DDL_TYPE_TRUNCATE: u16 = 85;

/// Transaction id triple, total order is (usn, slt, sqn).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xid {
    pub usn: u16,
    pub slt: u16,
    pub sqn: u32,
}

impl Xid {
    pub fn new(usn: u16, slt: u16, sqn: u32) -> Self {
        Self { usn, slt, sqn }
    }

    pub fn is_zero(&self) -> bool {
        self.usn == 0 && self.slt == 0 && self.sqn == 0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}.{:03x}.{:08x}", self.usn, self.slt, self.sqn)
    }
}

/// Undo block address, 56 bits, opaque except for equality.
pub type Uba = u64;

/// Row-level sub-opcode carried in the low 5 bits of the KDO op byte.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Display, EnumString, FromPrimitive, Clone, Copy, Eq, PartialEq)]
pub enum KdoOp {
    IUR = 0x01, // interpret undo redo
    IRP = 0x02, // insert row piece
    DRP = 0x03, // delete row piece
    LKR = 0x04, // lock row
    URP = 0x05, // update row piece
    ORP = 0x06, // overwrite row piece
    MFC = 0x07, // manipulate first column
    CFA = 0x08, // change forwarding address
    CKI = 0x09, // change cluster key index
    SKL = 0x0a, // set key links
    QMI = 0x0b, // quick multi-row insert
    QMD = 0x0c, // quick multi-row delete
    TBF = 0x0d,
    DSC = 0x0e,
    LMN = 0x10,
    LLB = 0x11,
    #[default]
    UNDEF = 0x00,
}

/// One physical redo record as handed over by a reader; byte-order
/// conversion and per-record framing are the reader's duty.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct RawRecord {
    pub scn: Scn,
    pub opcode: u16,
    pub dba: u32,
    /// Transaction id the reader resolved for this record; zero when the
    /// record names its own (5.1 carries it in KTUDB).
    pub xid: Xid,
    #[derivative(Debug = "ignore")]
    pub data: Bytes,
    pub field_lengths_delta: usize,
    pub field_cnt: u16,
    pub field_pos: usize,
    pub length: usize,
}

impl RawRecord {
    /// Frames a record out of its raw bytes: opcode at 0, SCN at 4, XID at
    /// 12/14/20, DBA at 16, field count at `FIELD_LENGTHS_DELTA`.
    pub fn from_bytes(data: Bytes) -> Self {
        let opcode = ((data[0] as u16) << 8) | data[1] as u16;
        let scn = util::read64(&data, 4);
        let xid = Xid::new(
            util::read16(&data, 12),
            util::read16(&data, 14),
            util::read32(&data, 20),
        );
        let dba = util::read32(&data, 16);
        let field_cnt = util::read16(&data, FIELD_LENGTHS_DELTA);
        let field_pos = FIELD_LENGTHS_DELTA + util::align4(2 + 2 * field_cnt as usize);
        let length = data.len();
        Self {
            scn,
            opcode,
            dba,
            xid,
            data,
            field_lengths_delta: FIELD_LENGTHS_DELTA,
            field_cnt,
            field_pos,
            length,
        }
    }
}

/// A decoded physical change. Parsers fill in whatever their opcode
/// defines and leave the rest at defaults; offsets point into `data`.
#[derive(Clone, Default, Derivative)]
#[derivative(Debug)]
pub struct RedoLogRecord {
    pub scn: Scn,
    pub xid: Xid,
    pub opcode: u16,
    pub length: usize,
    #[derivative(Debug = "ignore")]
    pub data: Bytes,

    pub field_lengths_delta: usize,
    pub field_cnt: u16,
    pub field_pos: usize,

    // row address
    #[derivative(Debug(format_with = "util::fmt_hex32"))]
    pub dba: u32,
    #[derivative(Debug(format_with = "util::fmt_hex32"))]
    pub bdba: u32,
    pub slot: u16,
    pub itli: u8,
    pub op: u8,
    pub op_flags: u8,
    pub fb: u8,
    pub cc: u8,
    pub nrow: u16,
    #[derivative(Debug(format_with = "util::fmt_hex32"))]
    pub nrid_bdba: u32,
    pub nrid_slot: u16,

    // undo linkage
    pub objn: u32,
    pub objd: u32,
    pub tsn: u32,
    pub undo: u32,
    pub slt: u8,
    pub rci: u8,
    pub flg: u16,
    pub opc: u16,
    #[derivative(Debug(format_with = "util::fmt_hex64"))]
    pub uba: Uba,

    // column layout offsets into data
    pub nulls_delta: usize,
    pub col_nums_delta: usize,
    pub slots_delta: usize,
    pub row_lengths_delta: usize,

    // supplemental log side-band
    pub supp_log_type: u8,
    pub supp_log_fb: u8,
    pub supp_log_cc: u16,
    pub supp_log_before: u16,
    pub supp_log_after: u16,
    #[derivative(Debug(format_with = "util::fmt_hex32"))]
    pub supp_log_bdba: u32,
    pub supp_log_slot: u16,

    // commit marker
    pub ktucm_flg: u8,

    // DDL
    pub ddl_type: u16,
    pub ddl_valid: bool,
}

impl RedoLogRecord {
    pub fn from_raw(raw: RawRecord) -> Self {
        Self {
            scn: raw.scn,
            opcode: raw.opcode,
            dba: raw.dba,
            xid: raw.xid,
            length: raw.length,
            data: raw.data,
            field_lengths_delta: raw.field_lengths_delta,
            field_cnt: raw.field_cnt,
            field_pos: raw.field_pos,
            ..Default::default()
        }
    }

    pub fn kdo_op(&self) -> KdoOp {
        KdoOp::from(self.op & 0x1F)
    }

    /// Length of field `i`, 1-based. Reads past the end of a truncated
    /// record report zero instead of panicking.
    pub fn field_length(&self, i: usize) -> usize {
        let addr = self.field_lengths_delta + i * 2;
        if addr + 2 > self.data.len() {
            return 0;
        }
        util::read16(&self.data, addr) as usize
    }

    /// Iterates `(index, pos, length)` over all fields.
    pub fn fields(&self) -> FieldIter<'_> {
        FieldIter {
            rec: self,
            idx: 0,
            pos: self.field_pos,
        }
    }

    /// Position of field `i`, 1-based; `None` past the last field.
    pub fn field_at(&self, i: usize) -> Option<(usize, usize)> {
        self.fields()
            .find(|&(idx, _, _)| idx == i)
            .map(|(_, pos, len)| (pos, len))
    }

    pub fn is_multiblock_fragment(&self) -> bool {
        self.flg & FLG_MULTIBLOCKUNDO_ANY != 0
    }
}

pub struct FieldIter<'a> {
    rec: &'a RedoLogRecord,
    idx: usize,
    pos: usize,
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.rec.field_cnt as usize {
            return None;
        }
        self.idx += 1;
        let len = self.rec.field_length(self.idx);
        let pos = self.pos;
        if pos + len > self.rec.data.len() {
            // truncated record, stop the walk
            return None;
        }
        self.pos += util::align4(len);
        Some((self.idx, pos, len))
    }
}
