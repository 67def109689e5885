use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;

use crate::meta::def::ObjectDef;

/// Read-only dictionary: object number to table definition. Built once at
/// startup and shared between threads without further synchronisation.
#[derive(Debug, Default)]
pub struct Catalog {
    objects: HashMap<u32, Arc<ObjectDef>>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    objects: Vec<ObjectDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: ObjectDef) {
        self.objects.insert(object.objn, Arc::new(object));
    }

    pub fn lookup_object(&self, objn: u32) -> Option<Arc<ObjectDef>> {
        self.objects.get(&objn).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Loads a dictionary snapshot from a JSON document:
    /// `{"objects": [{"objn": .., "owner": .., "tab_name": .., "col_defs": [..]}]}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read schema {:?}", path))?;
        let schema: SchemaFile =
            serde_json::from_str(&text).with_context(|| format!("parse schema {:?}", path))?;

        let mut catalog = Catalog::new();
        for object in schema.objects {
            catalog.insert(object);
        }
        info!("loaded {} objects from {:?}", catalog.len(), path);
        Ok(catalog)
    }
}

#[cfg(test)]
mod mgr_tests {
    use std::env::set_var;

    use super::*;
    use crate::meta::def::ColumnDef;

    fn setup() {
        set_var("RUST_LOG", "info");
        crate::util::init();
    }

    #[test]
    fn lookup_hits_and_misses() {
        setup();
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
            ],
        });

        let obj = catalog.lookup_object(5001).unwrap();
        assert_eq!(obj.tab_name, "EMP");
        assert_eq!(obj.column(1).unwrap().col_name, "SAL");
        assert!(obj.column(9).is_none());
        assert!(catalog.lookup_object(9999).is_none());
    }

    #[test]
    fn parse_schema_document() {
        setup();
        let text = r#"{"objects": [{"objn": 1, "objd": 2, "owner": "A",
            "tab_name": "T", "col_defs": [
                {"pos": 0, "col_name": "C1", "type_no": 2}
            ]}]}"#;
        let schema: SchemaFile = serde_json::from_str(text).unwrap();
        assert_eq!(schema.objects.len(), 1);
        assert_eq!(schema.objects[0].col_defs[0].type_no, 2);
    }
}
