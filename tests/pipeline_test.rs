use std::sync::Arc;

use serde_json::Value;

use orr::config::Environment;
use orr::factory::{DumpfileFactory, DumpfileWriter, RecordReader};
use orr::meta::def::{ColumnDef, ObjectDef};
use orr::meta::mgr::Catalog;
use orr::redo::craft::{
    date_bytes, ddl_field, kdo_field, ktb_redo_c_field, ktub_field, ktucm_field, ktudb_field,
    supp_log_field, RecordBuilder,
};
use orr::redo::decode::decode;
use orr::redo::record::{RawRecord, Scn, Xid, DDL_TYPE_TRUNCATE, FB_F, FB_L};
use orr::sink::{JsonSink, MemoryOut};
use orr::trx::store::TransactionStore;
use orr::util;

fn emp_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.insert(ObjectDef {
        objn: 5001,
        objd: 5002,
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
            ColumnDef {
                pos: 2,
                col_name: "HIREDATE".into(),
                type_no: 12,
                ..Default::default()
            },
        ],
    });
    catalog
}

/// Writes the records through a dump file and replays them through the
/// whole pipeline, returning the emitted messages.
fn pipeline(name: &str, records: &[RawRecord], catalog: Catalog) -> Vec<Value> {
    util::init();
    let path = std::env::temp_dir().join(format!("orr_pipeline_{}.dump", name));

    let mut writer = DumpfileWriter::create(&path).unwrap();
    for raw in records {
        writer.write_record(raw).unwrap();
    }

    let env = Environment::default();
    let mut factory = DumpfileFactory::open(path.clone()).unwrap();
    let out = Arc::new(MemoryOut::new());
    let mut sink = JsonSink::new(Arc::new(catalog), out.clone());
    let mut store = TransactionStore::new();

    while let Some(raw) = factory.next_record().unwrap() {
        let rec = decode(raw, &env);
        if store.route(&env, rec) {
            store.drain(&env, &mut sink);
        }
    }

    std::fs::remove_file(path).ok();
    out.take()
        .into_iter()
        .map(|m| serde_json::from_slice(&m).unwrap())
        .collect()
}

fn begin_marker(xid: Xid, scn: Scn) -> RawRecord {
    RecordBuilder::new(0x0502, scn)
        .xid(xid)
        .field(&ktub_field(0, 0, 0x0502, xid.slt as u8, 0, 0x0008))
        .build()
}

fn commit_marker(xid: Xid, scn: Scn) -> RawRecord {
    RecordBuilder::new(0x0504, scn)
        .xid(xid)
        .field(&ktucm_field(xid, 0))
        .build()
}

/// Undo half of a single-row insert: the compensating delete plus the
/// supplemental-log trailer closing the run.
fn insert_undo(xid: Xid, scn: Scn, supp_fb: u8) -> RawRecord {
    RecordBuilder::new(0x0501, scn)
        .field(&ktudb_field(xid))
        .field(&ktub_field(5001, 5002, 0x0B01, 1, 0, 0))
        .field(&ktb_redo_c_field(0xA1))
        .field(&kdo_field(20, 0x0040_0123, 0x03, 1))
        .field(&supp_log_field(supp_fb, 3, 0, 0))
        .build()
}

/// Redo half of a single-row insert with three column payloads.
fn insert_redo(scn: Scn, cols: &[&[u8]]) -> RawRecord {
    let mut kdo = kdo_field(48, 0x0040_0123, 0x02, 1);
    kdo[16] = FB_F | FB_L;
    kdo[18] = cols.len() as u8;
    let mut builder = RecordBuilder::new(0x0B02, scn)
        .field(&ktb_redo_c_field(0xA1))
        .field(&kdo);
    for col in cols {
        builder = builder.field(col);
    }
    builder.build()
}

#[test]
fn single_row_insert_formats_all_column_types() {
    let xid = Xid::new(1, 1, 1);
    let records = vec![
        begin_marker(xid, 99),
        insert_undo(xid, 100, FB_F | FB_L),
        insert_redo(100, &[b"hi", &[0x80], &date_bytes(2020, 1, 2, 3, 4, 5)]),
        commit_marker(xid, 100),
    ];

    let messages = pipeline("insert", &records, emp_catalog());
    assert_eq!(messages.len(), 1);

    let msg = &messages[0];
    assert_eq!(msg["scn"], 100);
    assert_eq!(msg["xid"], "0001.001.00000001");
    let changes = msg["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);

    let dml = &changes[0];
    assert_eq!(dml["operation"], "insert");
    assert_eq!(dml["owner"], "SCOTT");
    assert_eq!(dml["table"], "EMP");
    assert_eq!(dml["after"]["ENAME"], "hi");
    assert_eq!(dml["after"]["SAL"], "0");
    assert_eq!(dml["after"]["HIREDATE"], "2020-01-02T03:04:05");
}

/// One URP piece pair of a split update touching a single column.
fn update_pair(xid: Xid, scn: Scn, supp_fb: u8, colnum: u16, before: &[u8], after: &[u8]) -> [RawRecord; 2] {
    let mut kdo1 = kdo_field(28, 0x90, 0x05, 1);
    kdo1[23] = 1; // one changed column
    let undo = RecordBuilder::new(0x0501, scn)
        .field(&ktudb_field(xid))
        .field(&ktub_field(5001, 5002, 0x0B01, 1, 0, 0))
        .field(&ktb_redo_c_field(0xB1))
        .field(&kdo1)
        .field(&colnum.to_le_bytes())
        .field(before)
        .field(&supp_log_field(supp_fb, 1, 0x90, 7))
        .build();

    let mut kdo2 = kdo_field(28, 0x90, 0x05, 1);
    kdo2[23] = 1;
    let redo = RecordBuilder::new(0x0B05, scn)
        .field(&ktb_redo_c_field(0xB2))
        .field(&kdo2)
        .field(&colnum.to_le_bytes())
        .field(after)
        .build();

    [undo, redo]
}

#[test]
fn split_update_emits_one_dml_with_both_pieces() {
    let xid = Xid::new(2, 0, 7);
    let [u1, r1] = update_pair(xid, 101, FB_F, 1, &[0xC1, 0x02], &[0xC1, 0x0B]);
    let [u2, r2] = update_pair(xid, 101, FB_L, 0, b"a", b"b");
    let records = vec![u1, r1, u2, r2, commit_marker(xid, 101)];

    let messages = pipeline("update", &records, emp_catalog());
    assert_eq!(messages.len(), 1);

    let changes = messages[0]["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1, "both pieces fold into one logical update");

    let dml = &changes[0];
    assert_eq!(dml["operation"], "update");
    assert_eq!(dml["before"]["SAL"], "1");
    assert_eq!(dml["before"]["ENAME"], "a");
    assert_eq!(dml["after"]["SAL"], "10");
    assert_eq!(dml["after"]["ENAME"], "b");
}

#[test]
fn truncate_ddl_reaches_the_sink() {
    let xid = Xid::new(3, 2, 9);
    let ddl = RecordBuilder::new(0x1801, 200)
        .field(&ddl_field(xid, DDL_TYPE_TRUNCATE))
        .build();
    let records = vec![ddl, commit_marker(xid, 201)];

    let messages = pipeline("truncate", &records, Catalog::new());
    assert_eq!(messages.len(), 1);

    let changes = messages[0]["changes"].as_array().unwrap();
    assert_eq!(changes[0]["operation"], "truncate");
    assert_eq!(changes[0]["objn"], 0);
}

#[test]
fn cross_xid_commits_emit_in_commit_scn_order() {
    util::init();
    let a = Xid::new(0xA, 0, 1);
    let b = Xid::new(0xB, 0, 1);

    let env = Environment::default();
    let out = Arc::new(MemoryOut::new());
    let mut sink = JsonSink::new(Arc::new(emp_catalog()), out.clone());
    let mut store = TransactionStore::new();

    // interleaved work for A and B, then both commits before one drain
    for raw in [
        insert_undo(a, 10, FB_F | FB_L),
        insert_redo(10, &[b"a1", &[0x80], &date_bytes(2021, 5, 5, 0, 0, 0)]),
        insert_undo(b, 11, FB_F | FB_L),
        insert_redo(11, &[b"b1", &[0x80], &date_bytes(2021, 5, 6, 0, 0, 0)]),
    ] {
        let rec = decode(raw, &env);
        store.route(&env, rec);
    }
    store.route(&env, decode(commit_marker(b, 50), &env));
    store.route(&env, decode(commit_marker(a, 60), &env));
    store.drain(&env, &mut sink);

    let messages: Vec<Value> = out
        .take()
        .into_iter()
        .map(|m| serde_json::from_slice(&m).unwrap())
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["xid"], "000b.000.00000001");
    assert_eq!(messages[0]["scn"], 50);
    assert_eq!(messages[1]["xid"], "000a.000.00000001");
    assert_eq!(messages[1]["scn"], 60);
}

#[test]
fn rollback_marker_drops_the_transaction() {
    let xid = Xid::new(4, 0, 2);
    let rollback = RecordBuilder::new(0x0504, 301)
        .xid(xid)
        .field(&ktucm_field(xid, 0x04))
        .build();
    let records = vec![
        insert_undo(xid, 300, FB_F | FB_L),
        insert_redo(300, &[b"x", &[0x80], &date_bytes(2022, 1, 1, 0, 0, 0)]),
        rollback,
    ];

    let messages = pipeline("rollback", &records, emp_catalog());
    assert!(messages.is_empty());
}

#[test]
fn catalog_miss_degrades_to_synthetic_columns() {
    let xid = Xid::new(5, 0, 3);
    let records = vec![
        insert_undo(xid, 400, FB_F | FB_L),
        insert_redo(400, &[b"zz", &[0x80], &date_bytes(2023, 3, 3, 3, 3, 3)]),
        commit_marker(xid, 400),
    ];

    // empty catalog: object 5001 resolves to nothing
    let messages = pipeline("catalog_miss", &records, Catalog::new());
    let dml = &messages[0]["changes"][0];
    assert_eq!(dml["objn"], 5001);
    assert_eq!(dml["after"]["COL0"], "?");
    assert_eq!(dml["after"]["COL1"], "?");
}

#[test]
fn null_column_renders_json_null() {
    util::init();
    let xid = Xid::new(6, 0, 4);

    // second column flagged null in the KDO bitmap
    let mut kdo = kdo_field(48, 0x0040_0123, 0x02, 1);
    kdo[16] = FB_F | FB_L;
    kdo[18] = 3;
    kdo[45] = 0b010;
    let redo = RecordBuilder::new(0x0B02, 410)
        .field(&ktb_redo_c_field(0xA1))
        .field(&kdo)
        .field(b"hi")
        .field(&[])
        .field(&date_bytes(2020, 1, 2, 3, 4, 5))
        .build();

    let records = vec![
        insert_undo(xid, 410, FB_F | FB_L),
        redo,
        commit_marker(xid, 410),
    ];
    let messages = pipeline("null_col", &records, emp_catalog());
    let after = &messages[0]["changes"][0]["after"];
    assert_eq!(after["ENAME"], "hi");
    assert_eq!(after["SAL"], Value::Null);
    assert_eq!(after["HIREDATE"], "2020-01-02T03:04:05");
}
