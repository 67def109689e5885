use serde::Deserialize;

/// Replicated-table definition, keyed by object number.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ObjectDef {
    pub objn: u32,
    pub objd: u32,
    pub owner: String,
    pub tab_name: String,
    pub col_defs: Vec<ColumnDef>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ColumnDef {
    /// ordinal position, zero-based as columns appear in the redo payload
    pub pos: usize,
    pub col_name: String,
    /// dictionary type number (1 varchar2, 2 number, 12 date, 96 char, 180 timestamp)
    pub type_no: u32,
    #[serde(default)]
    pub data_len: u32,
    #[serde(default)]
    pub isnil: bool,
}

impl ObjectDef {
    pub fn column(&self, pos: usize) -> Option<&ColumnDef> {
        self.col_defs.iter().find(|c| c.pos == pos)
    }
}
