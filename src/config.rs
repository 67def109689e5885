use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_repr::Deserialize_repr;

/// Wire-protocol version; the configuration document must carry the same
/// string or startup fails.
pub const PROTOCOL_VERSION: &str = "0.3.0";

// Trace verbosity thresholds for the `trace` config integer.
pub const TRACE_WARN: u8 = 1;
pub const TRACE_DETAIL: u8 = 2;
pub const TRACE_FULL: u8 = 3;

/// Redo-dump verbosity, the `dumplogfile` config integer.
#[repr(u8)]
#[derive(Debug, Default, Deserialize_repr, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DumpLevel {
    #[default]
    None = 0,
    Records = 1,
    Columns = 2,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub version: String,
    pub dumplogfile: DumpLevel,
    pub trace: u8,
    pub dumpdata: bool,
    pub directread: bool,
    pub sortcols: u32,
    pub sources: Vec<SourceConfig>,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub alias: String,
    pub name: String,
    pub user: String,
    pub password: String,
    pub server: String,
    pub eventtable: String,
    pub tables: Vec<TableConfig>,
    /// Optional dictionary snapshot so column names and types resolve
    /// without a live database.
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct TableConfig {
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: String,
    pub alias: String,
    pub brokers: String,
    pub topic: String,
    pub source: String,
    pub trace: u8,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let config: Config =
            serde_json::from_str(&text).with_context(|| format!("parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            bail!(
                "incompatible config version {:?}, expected {:?}",
                self.version,
                PROTOCOL_VERSION
            );
        }
        for source in &self.sources {
            if source.source_type != "ORACLE" {
                bail!("unsupported source type {:?}", source.source_type);
            }
        }
        for target in &self.targets {
            if target.target_type != "KAFKA" {
                bail!("unsupported target type {:?}", target.target_type);
            }
            if !self.sources.iter().any(|s| s.alias == target.source) {
                bail!("target {:?} names unknown source {:?}", target.alias, target.source);
            }
        }
        Ok(())
    }
}

/// Per-source knobs threaded through decoder, store and emitter instead
/// of process globals; each source gets its own copy.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    pub dump_level: DumpLevel,
    pub trace: u8,
    pub dump_data: bool,
    pub sort_cols: u32,
}

impl Environment {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dump_level: config.dumplogfile,
            trace: config.trace,
            dump_data: config.dumpdata,
            sort_cols: config.sortcols,
        }
    }

    pub fn dump_records(&self) -> bool {
        self.dump_level >= DumpLevel::Records
    }

    pub fn dump_columns(&self) -> bool {
        self.dump_level >= DumpLevel::Columns
    }
}
