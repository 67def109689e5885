use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Error, Result};
use bytes::Bytes;
use log::info;

use crate::redo::record::{RawRecord, FIELD_LENGTHS_DELTA, REDO_RECORD_MAX_SIZE};

/// Record-dump file magic; files carry framed physical records with the
/// byte order already converted.
pub const DUMPFILE_MAGIC: &[u8; 8] = b"ORRDUMP1";

/// The inward reader contract: one physical redo record per call, framed
/// and byte-order converted. `None` means the stream is exhausted.
pub trait RecordReader {
    fn next_record(&mut self) -> Result<Option<RawRecord>>;
}

/// Reads record-dump files: a magic header, then `[u32 length][record]`
/// frames.
#[derive(Debug)]
pub struct DumpfileFactory {
    pub target: PathBuf,
    file: File,
    records: usize,
}

impl DumpfileFactory {
    pub fn open(target: PathBuf) -> Result<Self, Error> {
        if !target.exists() {
            return Err(Error::msg(format!("TargetFileNotFound: {:?}", target)));
        }

        let mut file = File::open(&target).with_context(|| format!("open {:?}", target))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .with_context(|| format!("read magic of {:?}", target))?;
        if &magic != DUMPFILE_MAGIC {
            bail!("{:?} is not a record dump file", target);
        }

        info!("load {:?}", target);
        Ok(Self {
            target,
            file,
            records: 0,
        })
    }

    pub fn records_read(&self) -> usize {
        self.records
    }
}

impl RecordReader for DumpfileFactory {
    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let mut frame = [0u8; 4];
        match self.file.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_le_bytes(frame) as usize;
        if length < FIELD_LENGTHS_DELTA + 2 || length > REDO_RECORD_MAX_SIZE {
            bail!("bad record frame of {} bytes in {:?}", length, self.target);
        }

        let mut buf = vec![0u8; length];
        self.file
            .read_exact(&mut buf)
            .with_context(|| format!("short record frame in {:?}", self.target))?;
        self.records += 1;
        Ok(Some(RawRecord::from_bytes(Bytes::from(buf))))
    }
}

/// Writes record-dump files; the crafting side of `DumpfileFactory`, used
/// by tooling and tests.
#[derive(Debug)]
pub struct DumpfileWriter {
    file: File,
}

impl DumpfileWriter {
    pub fn create(target: &PathBuf) -> Result<Self> {
        let mut file = File::create(target).with_context(|| format!("create {:?}", target))?;
        file.write_all(DUMPFILE_MAGIC)?;
        Ok(Self { file })
    }

    pub fn write_record(&mut self, raw: &RawRecord) -> Result<()> {
        self.file
            .write_all(&(raw.data.len() as u32).to_le_bytes())?;
        self.file.write_all(&raw.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod factory_tests {
    use std::env::set_var;

    use super::*;
    use crate::redo::craft::{ktub_field, ktudb_field, RecordBuilder};
    use crate::redo::record::Xid;

    fn setup() {
        set_var("RUST_LOG", "info");
        crate::util::init();
    }

    #[test]
    fn write_then_read_roundtrip() {
        setup();
        let path = std::env::temp_dir().join("orr_factory_roundtrip.dump");

        let mut writer = DumpfileWriter::create(&path).unwrap();
        for scn in [100u64, 101, 102] {
            let raw = RecordBuilder::new(0x0501, scn)
                .field(&ktudb_field(Xid::new(1, 2, 3)))
                .field(&ktub_field(10, 11, 0x0B01, 0, 0, 0))
                .build();
            writer.write_record(&raw).unwrap();
        }

        let mut factory = DumpfileFactory::open(path.clone()).unwrap();
        let mut scns = Vec::new();
        while let Some(raw) = factory.next_record().unwrap() {
            assert_eq!(raw.opcode, 0x0501);
            scns.push(raw.scn);
        }
        assert_eq!(scns, vec![100, 101, 102]);
        assert_eq!(factory.records_read(), 3);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        setup();
        assert!(DumpfileFactory::open(PathBuf::from("no-such.dump")).is_err());
    }

    #[test]
    fn wrong_magic_is_an_error() {
        setup();
        let path = std::env::temp_dir().join("orr_factory_badmagic.dump");
        std::fs::write(&path, b"NOTADUMP").unwrap();
        assert!(DumpfileFactory::open(path.clone()).is_err());
        std::fs::remove_file(path).ok();
    }
}
