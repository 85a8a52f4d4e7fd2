use std::io::{Seek, SeekFrom, Write};

use crate::error::{ChunkError, Result};
use crate::io::WriteLeExt;
use crate::{ChunkKind, CHUNK_HEADER_SIZE, FORMAT_VERSION};

/// A fully built chunk held in memory, so it can be accumulated against a
/// resource record or a frame stream before being flushed to the output in
/// one pass. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    kind: ChunkKind,
    version: u16,
    payload: Vec<u8>,
}

impl Chunk {
    /// Build a chunk by writing elements into its payload. `Vec<u8>`
    /// implements `Write`, so all [`WriteLeExt`] element primitives apply.
    pub fn build(
        kind: ChunkKind,
        version: u16,
        f: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    ) -> Result<Chunk> {
        let mut payload = Vec::new();
        f(&mut payload)?;
        Ok(Chunk {
            kind,
            version,
            payload,
        })
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded size including the chunk header.
    pub fn encoded_len(&self) -> u64 {
        CHUNK_HEADER_SIZE + self.payload.len() as u64
    }
}

/// Writer role of the chunk protocol.
///
/// `push_chunk` reserves a length-prefix slot that `pop_chunk` patches once
/// the payload size is known; chunks may nest. Element primitives come from
/// [`WriteLeExt`], which this type forwards `Write` to.
pub struct ChunkWriter<W: Write + Seek> {
    w: W,
    // Positions of the headers of currently-open chunks.
    open: Vec<u64>,
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn new(w: W) -> Self {
        Self { w, open: Vec::new() }
    }

    pub fn stream_position(&mut self) -> Result<u64> {
        Ok(self.w.stream_position()?)
    }

    /// Begin a chunk with the current [`FORMAT_VERSION`]-independent producer
    /// version. The payload length is patched in by [`Self::pop_chunk`].
    pub fn push_chunk(&mut self, kind: ChunkKind, version: u16) -> Result<()> {
        let header_pos = self.w.stream_position()?;
        self.w.write_u32_le(kind.0)?;
        self.w.write_u16_le(version)?;
        self.w.write_u16_le(0)?; // flags
        self.w.write_u64_le(0)?; // placeholder length
        self.open.push(header_pos);
        Ok(())
    }

    pub fn pop_chunk(&mut self) -> Result<()> {
        let header_pos = self
            .open
            .pop()
            .ok_or(ChunkError::Corrupt("pop_chunk without matching push_chunk"))?;
        let payload_end = self.w.stream_position()?;
        let payload_start = header_pos + CHUNK_HEADER_SIZE;
        let len = payload_end
            .checked_sub(payload_start)
            .ok_or(ChunkError::Corrupt("stream position underflow"))?;
        self.w.seek(SeekFrom::Start(header_pos + 8))?;
        self.w.write_u64_le(len)?;
        self.w.seek(SeekFrom::Start(payload_end))?;
        Ok(())
    }

    /// Emit an already-built chunk. The length is known, so no patching pass
    /// is needed.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.w.write_u32_le(chunk.kind.0)?;
        self.w.write_u16_le(chunk.version)?;
        self.w.write_u16_le(0)?;
        self.w.write_u64_le(chunk.payload.len() as u64)?;
        self.w.write_bytes(&chunk.payload)?;
        Ok(())
    }

    /// Write the mandatory stream-version chunk. Must be the first chunk of
    /// a stream.
    pub fn write_stream_version(&mut self) -> Result<()> {
        self.push_chunk(ChunkKind::STREAM_VERSION, 0)?;
        self.write_u32_le(FORMAT_VERSION)?;
        self.pop_chunk()
    }

    /// Consume the writer. All pushed chunks must have been popped.
    pub fn finish(self) -> Result<W> {
        if !self.open.is_empty() {
            return Err(ChunkError::Corrupt("stream finished with open chunks"));
        }
        Ok(self.w)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.w
    }
}

impl<W: Write + Seek> Write for ChunkWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.w.flush()
    }
}
