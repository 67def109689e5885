use log::warn;

use crate::redo::record::{RedoLogRecord, Scn, Uba};

/// Byte budget per chunk; an oversized single entry still gets a chunk of
/// its own.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bookkeeping cost per stored entry, counted against the chunk budget.
pub const ROW_HEADER_SIZE: usize = 48;

/// One buffered operation: the undo/redo record pair plus the sanity key
/// used by rollbacks.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub objn: u32,
    pub objd: u32,
    /// `redo1.opcode << 16 | redo2.opcode`.
    pub op: u32,
    pub redo1: RedoLogRecord,
    pub redo2: RedoLogRecord,
    pub uba: Uba,
    pub dba: u32,
    pub slt: u8,
    pub rci: u8,
    pub scn: Scn,
}

impl ChunkEntry {
    pub fn size(&self) -> usize {
        self.redo1.length + self.redo2.length + ROW_HEADER_SIZE
    }

    pub fn matches(&self, uba: Uba, dba: u32, slt: u8, rci: u8) -> bool {
        self.uba == uba && self.dba == dba && self.slt == slt && self.rci == rci
    }
}

/// Fixed-budget arena segment; chunks chain in insertion order inside a
/// transaction.
#[derive(Debug, Default)]
pub struct TransactionChunk {
    pub entries: Vec<ChunkEntry>,
    pub size: usize,
}

impl TransactionChunk {
    pub fn fits(&self, need: usize) -> bool {
        self.entries.is_empty() || self.size + need <= CHUNK_SIZE
    }

    fn push(&mut self, entry: ChunkEntry) {
        self.size += entry.size();
        self.entries.push(entry);
    }

    fn pop(&mut self) -> Option<ChunkEntry> {
        let entry = self.entries.pop()?;
        self.size -= entry.size();
        Some(entry)
    }
}

/// Chunk pool with a free list. Flushed transactions return their chunks
/// here so steady-state appends never reallocate.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    free: Vec<TransactionChunk>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_chunk(&mut self) -> TransactionChunk {
        self.free.pop().unwrap_or_default()
    }

    pub fn free_chunk(&mut self, mut chunk: TransactionChunk) {
        chunk.entries.clear();
        chunk.size = 0;
        self.free.push(chunk);
    }

    pub fn free_chunks(&mut self, chunks: Vec<TransactionChunk>) {
        for chunk in chunks {
            self.free_chunk(chunk);
        }
    }

    /// Appends to the tail chunk, rolling over to a fresh chunk when the
    /// byte budget would overflow.
    pub fn append(&mut self, chunks: &mut Vec<TransactionChunk>, entry: ChunkEntry) {
        let need = entry.size();
        match chunks.last_mut() {
            Some(tail) if tail.fits(need) => tail.push(entry),
            _ => {
                let mut chunk = self.alloc_chunk();
                chunk.push(entry);
                chunks.push(chunk);
            }
        }
    }

    pub fn last_entry<'a>(chunks: &'a [TransactionChunk]) -> Option<&'a ChunkEntry> {
        chunks.last().and_then(|c| c.entries.last())
    }

    /// Pops the tail entry; the stored `last_*` coordinates act as a
    /// sanity key only.
    pub fn rollback_last(
        &mut self,
        chunks: &mut Vec<TransactionChunk>,
        uba: Uba,
        dba: u32,
        slt: u8,
        rci: u8,
    ) -> bool {
        let Some(tail) = chunks.last_mut() else {
            return false;
        };
        let Some(entry) = tail.pop() else {
            return false;
        };
        if !entry.matches(uba, dba, slt, rci) {
            warn!(
                "rollback last key mismatch: uba 0x{:014x} dba 0x{:08x} slt {} rci {}",
                uba, dba, slt, rci
            );
        }
        if tail.entries.is_empty() && chunks.len() > 1 {
            let empty = chunks.pop().unwrap();
            self.free_chunk(empty);
        }
        true
    }

    /// Splices out the tail-chunk entry matching the rollback key; partial
    /// rollbacks target operations that are not the most recent.
    pub fn rollback_by_key(
        &mut self,
        chunks: &mut Vec<TransactionChunk>,
        uba: Uba,
        dba: u32,
        slt: u8,
        rci: u8,
    ) -> bool {
        let Some(tail) = chunks.last_mut() else {
            return false;
        };
        let Some(idx) = tail
            .entries
            .iter()
            .rposition(|e| e.matches(uba, dba, slt, rci))
        else {
            return false;
        };
        let entry = tail.entries.remove(idx);
        tail.size -= entry.size();
        if tail.entries.is_empty() && chunks.len() > 1 {
            let empty = chunks.pop().unwrap();
            self.free_chunk(empty);
        }
        true
    }
}
