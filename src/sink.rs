use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use log::warn;
use strum::Display;

use crate::meta::def::ObjectDef;
use crate::meta::mgr::Catalog;
use crate::redo::record::{RedoLogRecord, Scn, Xid, FLAGS_KDO_KDOM2};
use crate::redo::value;
use crate::ring::CommandBuffer;
use crate::util;

/// Logical row-operation class inferred from the first pair of a DML run.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DmlKind {
    #[strum(serialize = "insert")]
    Insert,
    #[strum(serialize = "update")]
    Update,
    #[strum(serialize = "delete")]
    Delete,
}

/// One undo/redo pair of a DML run, in chain order.
#[derive(Debug, Clone)]
pub struct RowPair {
    pub r1: RedoLogRecord,
    pub r2: RedoLogRecord,
}

/// Downstream contract the emitter drives at commit time. Implementations
/// serialise values and frame messages; the emitter owns ordering and
/// oversize splitting.
pub trait Sink {
    fn begin_tran(&mut self, scn: Scn, xid: Xid);
    fn next(&mut self);
    fn parse_dml(&mut self, rows: &[RowPair], kind: DmlKind);
    fn parse_insert_multiple(&mut self, r1: &RedoLogRecord, r2: &RedoLogRecord);
    fn parse_delete_multiple(&mut self, r1: &RedoLogRecord, r2: &RedoLogRecord);
    fn parse_ddl(&mut self, r1: &RedoLogRecord);
    fn commit_tran(&mut self);
    /// Bytes accumulated for the in-flight downstream message.
    fn tran_size(&self) -> usize;
}

/// Where completed messages go; the ring for the pipeline, memory for
/// tooling and tests.
pub trait MessageOut: Send + Sync {
    fn push_message(&self, msg: &[u8]);
}

impl MessageOut for CommandBuffer {
    fn push_message(&self, msg: &[u8]) {
        CommandBuffer::push_message(self, msg)
    }
}

/// Collects messages in memory; used by `dump --parse` and unit tests.
#[derive(Debug, Default)]
pub struct MemoryOut {
    messages: Mutex<Vec<Vec<u8>>>,
}

impl MemoryOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }
}

impl MessageOut for MemoryOut {
    fn push_message(&self, msg: &[u8]) {
        self.messages.lock().unwrap().push(msg.to_vec());
    }
}

/// JSON framing of the committed change stream. One downstream message
/// per (possibly split) transaction:
/// `{"scn":..,"xid":"..","changes":[{..},{..}]}`.
pub struct JsonSink {
    catalog: Arc<Catalog>,
    out: Arc<dyn MessageOut>,
    message: String,
}

impl JsonSink {
    pub fn new(catalog: Arc<Catalog>, out: Arc<dyn MessageOut>) -> Self {
        Self {
            catalog,
            out,
            message: String::new(),
        }
    }

    fn object_for(&self, objn: u32) -> Option<Arc<ObjectDef>> {
        self.catalog.lookup_object(objn)
    }

    fn append_table(&mut self, objn: u32, objd: u32) {
        match self.object_for(objn) {
            Some(obj) => {
                let _ = write!(
                    self.message,
                    "\"owner\":\"{}\",\"table\":\"{}\"",
                    obj.owner, obj.tab_name
                );
            }
            None => {
                let _ = write!(self.message, "\"objn\":{},\"objd\":{}", objn, objd);
            }
        }
    }

    fn append_column(
        &mut self,
        obj: Option<&ObjectDef>,
        colnum: usize,
        data: Option<&[u8]>,
        first: &mut bool,
    ) {
        if !*first {
            self.message.push(',');
        }
        *first = false;

        let col = obj.and_then(|o| o.column(colnum));
        match col {
            Some(col) => {
                let _ = write!(self.message, "\"{}\":", col.col_name);
                match data {
                    Some(data) => {
                        self.message.push('"');
                        value::append_value(&mut self.message, col.type_no, data);
                        self.message.push('"');
                    }
                    None => self.message.push_str("null"),
                }
            }
            None => {
                // unresolved column, synthetic name and value
                let _ = write!(self.message, "\"COL{}\":", colnum);
                match data {
                    Some(_) => self.message.push_str("\"?\""),
                    None => self.message.push_str("null"),
                }
            }
        }
    }

    /// Column payloads of an insert run: the redo side carries the values
    /// as fields following KTB-redo and KDO, one per column, nulls in the
    /// KDO bitmap. Column ordinals continue across row pieces.
    fn append_insert_columns(&mut self, rows: &[RowPair]) {
        let obj = rows.first().and_then(|p| self.object_for(p.r1.objn));
        let mut colnum = 0usize;
        let mut first = true;
        for pair in rows {
            let rec = &pair.r2;
            let mut nulls_pos = rec.nulls_delta;
            let mut bit = 1u8;
            for j in 0..rec.cc as usize {
                let is_null = rec.data.get(nulls_pos).map_or(false, |b| b & bit != 0);
                match rec.field_at(3 + j) {
                    Some((pos, len)) if !is_null => {
                        let payload = rec.data.slice(pos..pos + len);
                        self.append_column(obj.as_deref(), colnum, Some(&payload), &mut first);
                    }
                    _ => self.append_column(obj.as_deref(), colnum, None, &mut first),
                }
                colnum += 1;
                bit <<= 1;
                if bit == 0 {
                    bit = 1;
                    nulls_pos += 1;
                }
            }
        }
    }

    /// Column payloads of a delete run: the undo side holds the before
    /// image, fields from 5 on (after KTUDB, KTUB, KTB-redo, KDO).
    fn append_delete_columns(&mut self, rows: &[RowPair]) {
        let obj = rows.first().and_then(|p| self.object_for(p.r1.objn));
        let mut colnum = 0usize;
        let mut first = true;
        for pair in rows {
            let rec = &pair.r1;
            let mut nulls_pos = rec.nulls_delta;
            let mut bit = 1u8;
            for j in 0..rec.cc as usize {
                let is_null = rec.data.get(nulls_pos).map_or(false, |b| b & bit != 0);
                match rec.field_at(5 + j) {
                    Some((pos, len)) if !is_null => {
                        let payload = rec.data.slice(pos..pos + len);
                        self.append_column(obj.as_deref(), colnum, Some(&payload), &mut first);
                    }
                    _ => self.append_column(obj.as_deref(), colnum, None, &mut first),
                }
                colnum += 1;
                bit <<= 1;
                if bit == 0 {
                    bit = 1;
                    nulls_pos += 1;
                }
            }
        }
    }

    /// Changed columns of an update: the undo side (URP) names them in the
    /// col-nums vector with before values from field 6 on; the redo side
    /// mirrors the layout from field 4 on with the after values.
    fn append_update_columns(&mut self, rows: &[RowPair]) {
        let obj = rows.first().and_then(|p| self.object_for(p.r1.objn));

        self.message.push_str("\"before\":{");
        let mut first = true;
        for pair in rows {
            let rec = &pair.r1;
            if rec.op_flags & FLAGS_KDO_KDOM2 != 0 {
                warn!("KDOM2 column vector not decoded, before image incomplete");
                continue;
            }
            let mut nulls_pos = rec.nulls_delta;
            let mut bit = 1u8;
            for j in 0..rec.cc as usize {
                let colnum = col_number(rec, j);
                let is_null = rec.data.get(nulls_pos).map_or(false, |b| b & bit != 0);
                match rec.field_at(6 + j) {
                    Some((pos, len)) if !is_null && len > 0 => {
                        let payload = rec.data.slice(pos..pos + len);
                        self.append_column(obj.as_deref(), colnum, Some(&payload), &mut first);
                    }
                    _ => self.append_column(obj.as_deref(), colnum, None, &mut first),
                }
                bit <<= 1;
                if bit == 0 {
                    bit = 1;
                    nulls_pos += 1;
                }
            }
        }
        self.message.push_str("},\"after\":{");

        let mut first = true;
        for pair in rows {
            let rec = &pair.r2;
            for j in 0..rec.cc as usize {
                let colnum = col_number(rec, j);
                match rec.field_at(4 + j) {
                    Some((pos, len)) if len > 0 => {
                        let payload = rec.data.slice(pos..pos + len);
                        self.append_column(obj.as_deref(), colnum, Some(&payload), &mut first);
                    }
                    _ => self.append_column(obj.as_deref(), colnum, None, &mut first),
                }
            }
        }
        self.message.push('}');
    }

    /// Walks a quick-multi-row vector: per row a 3-byte header (fb, lb,
    /// cc) then per column a length byte, `0xFF` null, `0xFE` u16 length.
    fn append_multi_rows(&mut self, objn: u32, rec: &RedoLogRecord, rows_field: usize) {
        let obj = self.object_for(objn);
        let Some((base, field_len)) = rec.field_at(rows_field) else {
            warn!("row vector field {} missing", rows_field);
            return;
        };

        self.message.push_str("\"rows\":[");
        let mut pos = base;
        for r in 0..rec.nrow as usize {
            if rec.row_lengths_delta + 2 * r + 2 > rec.data.len() {
                warn!("row-length table truncated, {} rows dropped", rec.nrow as usize - r);
                break;
            }
            let row_len = util::read16(&rec.data, rec.row_lengths_delta + 2 * r) as usize;
            if row_len < 3 || pos + row_len > base + field_len {
                warn!("row vector overruns its field, {} rows dropped", rec.nrow as usize - r);
                break;
            }
            if r > 0 {
                self.message.push(',');
            }
            self.message.push('{');

            let row_end = pos + row_len;
            let cc = rec.data[pos + 2] as usize;
            let mut off = pos + 3;
            let mut first = true;
            for colnum in 0..cc {
                if off >= row_end {
                    warn!("row piece truncated at column {}", colnum);
                    break;
                }
                let lead = rec.data[off];
                if lead == 0xFF {
                    off += 1;
                    self.append_column(obj.as_deref(), colnum, None, &mut first);
                } else {
                    let (len, skip) = if lead == 0xFE {
                        (util::read16(&rec.data, off + 1) as usize, 3)
                    } else {
                        (lead as usize, 1)
                    };
                    if off + skip + len > row_end {
                        warn!("row piece truncated at column {}", colnum);
                        break;
                    }
                    let payload = rec.data.slice(off + skip..off + skip + len);
                    self.append_column(obj.as_deref(), colnum, Some(&payload), &mut first);
                    off += skip + len;
                }
            }
            self.message.push('}');
            pos += row_len;
        }
        self.message.push(']');
    }
}

/// Column number of entry `j` in a record's col-nums vector; falls back
/// to the positional index when the vector is truncated.
fn col_number(rec: &RedoLogRecord, j: usize) -> usize {
    let at = rec.col_nums_delta + 2 * j;
    if at + 2 > rec.data.len() {
        return j;
    }
    util::read16(&rec.data, at) as usize
}

impl Sink for JsonSink {
    fn begin_tran(&mut self, scn: Scn, xid: Xid) {
        self.message.clear();
        let _ = write!(self.message, "{{\"scn\":{},\"xid\":\"{}\",\"changes\":[", scn, xid);
    }

    fn next(&mut self) {
        self.message.push(',');
    }

    fn parse_dml(&mut self, rows: &[RowPair], kind: DmlKind) {
        let Some(head) = rows.first() else {
            return;
        };
        let _ = write!(self.message, "{{\"operation\":\"{}\",", kind);
        self.append_table(head.r1.objn, head.r1.objd);
        self.message.push(',');
        match kind {
            DmlKind::Insert => {
                self.message.push_str("\"after\":{");
                self.append_insert_columns(rows);
                self.message.push('}');
            }
            DmlKind::Delete => {
                self.message.push_str("\"before\":{");
                self.append_delete_columns(rows);
                self.message.push('}');
            }
            DmlKind::Update => self.append_update_columns(rows),
        }
        self.message.push('}');
    }

    fn parse_insert_multiple(&mut self, r1: &RedoLogRecord, r2: &RedoLogRecord) {
        self.message.push_str("{\"operation\":\"insert\",");
        self.append_table(r1.objn, r1.objd);
        self.message.push(',');
        // rows ride the redo side, lengths in field 3, vectors in field 4
        self.append_multi_rows(r1.objn, r2, 4);
        self.message.push('}');
    }

    fn parse_delete_multiple(&mut self, r1: &RedoLogRecord, _r2: &RedoLogRecord) {
        self.message.push_str("{\"operation\":\"delete\",");
        self.append_table(r1.objn, r1.objd);
        self.message.push(',');
        // the undo of a multi-row delete is a multi-row insert: rows ride
        // the undo side, lengths in field 5, vectors in field 6
        self.append_multi_rows(r1.objn, r1, 6);
        self.message.push('}');
    }

    fn parse_ddl(&mut self, r1: &RedoLogRecord) {
        self.message.push_str("{\"operation\":\"truncate\",");
        self.append_table(r1.objn, r1.objd);
        self.message.push('}');
    }

    fn commit_tran(&mut self) {
        self.message.push_str("]}");
        self.out.push_message(self.message.as_bytes());
        self.message.clear();
    }

    fn tran_size(&self) -> usize {
        self.message.len()
    }
}

#[cfg(test)]
mod sink_tests {
    use std::env::set_var;

    use super::*;
    use crate::meta::def::ColumnDef;

    fn setup() {
        set_var("RUST_LOG", "info");
        crate::util::init();
    }

    fn emp_catalog() -> Arc<Catalog> {
        let mut catalog = Catalog::new();
        catalog.insert(ObjectDef {
            objn: 11,
            objd: 12,
            owner: "SCOTT".into(),
            tab_name: "EMP".into(),
            col_defs: vec![
                ColumnDef {
                    pos: 0,
                    col_name: "ENAME".into(),
                    type_no: 1,
                    ..Default::default()
                },
                ColumnDef {
                    pos: 1,
                    col_name: "SAL".into(),
                    type_no: 2,
                    ..Default::default()
                },
            ],
        });
        Arc::new(catalog)
    }

    #[test]
    fn message_framing() {
        setup();
        let out = Arc::new(MemoryOut::new());
        let mut sink = JsonSink::new(emp_catalog(), out.clone());

        sink.begin_tran(100, Xid::new(1, 2, 3));
        sink.commit_tran();

        let messages = out.take();
        assert_eq!(messages.len(), 1);
        let text = String::from_utf8(messages[0].clone()).unwrap();
        assert_eq!(text, "{\"scn\":100,\"xid\":\"0001.002.00000003\",\"changes\":[]}");
        // well-formed JSON
        serde_json::from_str::<serde_json::Value>(&text).unwrap();
    }

    #[test]
    fn insert_multiple_walks_the_row_vector() {
        setup();
        use crate::config::Environment;
        use crate::redo::craft::{kdo_field, ktb_redo_c_field, ktub_field, ktudb_field, RecordBuilder};
        use crate::redo::decode::decode;

        let env = Environment::default();
        let undo = decode(
            RecordBuilder::new(0x0501, 700)
                .field(&ktudb_field(Xid::new(7, 0, 1)))
                .field(&ktub_field(5001, 5002, 0x0B01, 1, 0, 0))
                .build(),
            &env,
        );

        let mut kdo = kdo_field(20, 0x60, 0x0B, 1);
        crate::util::write16(&mut kdo, 18, 2); // two rows
        let mut lengths = Vec::new();
        lengths.extend_from_slice(&8u16.to_le_bytes());
        lengths.extend_from_slice(&4u16.to_le_bytes());
        // row 1: two columns "ab" and number 0; row 2: one null column
        let rows: &[u8] = &[0, 0, 2, 2, b'a', b'b', 1, 0x80, 0, 0, 1, 0xFF];
        let redo = decode(
            RecordBuilder::new(0x0B0B, 700)
                .field(&ktb_redo_c_field(0x55))
                .field(&kdo)
                .field(&lengths)
                .field(rows)
                .build(),
            &env,
        );

        let out = Arc::new(MemoryOut::new());
        let mut sink = JsonSink::new(emp_catalog(), out.clone());
        sink.begin_tran(700, Xid::new(7, 0, 1));
        sink.parse_insert_multiple(&undo, &redo);
        sink.commit_tran();

        let text = String::from_utf8(out.take().remove(0)).unwrap();
        let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
        let rows = msg["changes"][0]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ENAME"], "ab");
        assert_eq!(rows[0]["SAL"], "0");
        assert_eq!(rows[1]["ENAME"], serde_json::Value::Null);
    }

    #[test]
    fn unresolved_object_degrades_to_objn() {
        setup();
        let out = Arc::new(MemoryOut::new());
        let mut sink = JsonSink::new(Arc::new(Catalog::new()), out.clone());

        sink.begin_tran(1, Xid::new(1, 1, 1));
        let mut rec = RedoLogRecord::default();
        rec.objn = 777;
        rec.objd = 778;
        sink.parse_ddl(&rec);
        sink.commit_tran();

        let text = String::from_utf8(out.take().remove(0)).unwrap();
        assert!(text.contains("\"objn\":777"));
        assert!(text.contains("\"operation\":\"truncate\""));
        serde_json::from_str::<serde_json::Value>(&text).unwrap();
    }
}
