use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{ChunkError, Result};
use crate::io::ReadLeExt;
use crate::{is_supported_version, ChunkHeader, ChunkKind, CHUNK_HEADER_SIZE};

struct Block {
    base: u64,
    data: Vec<u8>,
}

struct OpenChunk {
    header: ChunkHeader,
    end: u64,
}

/// Reader role of the chunk protocol.
///
/// Reads are bounded by the innermost open chunk, so a malformed element can
/// never escape its chunk; `end_chunk` seeks past whatever the caller did not
/// consume, which is how unknown chunk kinds and forward-compatible trailing
/// fields are skipped in O(1).
pub struct ChunkReader<R: Read + Seek> {
    src: R,
    start: u64,
    end: u64,
    pos: u64,
    block: Option<Block>,
    open: Vec<OpenChunk>,
}

impl<R: Read + Seek> ChunkReader<R> {
    /// Read the whole of `src` as one chunk stream.
    pub fn open(mut src: R) -> Result<Self> {
        let end = src.seek(SeekFrom::End(0))?;
        src.seek(SeekFrom::Start(0))?;
        Ok(Self {
            src,
            start: 0,
            end,
            pos: 0,
            block: None,
            open: Vec::new(),
        })
    }

    /// Read only the byte range `[start, end)` of `src` as a chunk stream,
    /// for containers that follow the stream with out-of-band data.
    pub fn with_bounds(mut src: R, start: u64, end: u64) -> Result<Self> {
        let len = src.seek(SeekFrom::End(0))?;
        if start > end || end > len {
            return Err(ChunkError::Corrupt("stream bounds outside file"));
        }
        src.seek(SeekFrom::Start(start))?;
        Ok(Self {
            src,
            start,
            end,
            pos: start,
            block: None,
            open: Vec::new(),
        })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Rewind/seek to an absolute offset within the stream bounds. Any open
    /// chunks are abandoned; the offset must point at a chunk header.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.start || offset > self.end {
            return Err(ChunkError::Corrupt("seek outside stream bounds"));
        }
        self.open.clear();
        self.pos = offset;
        Ok(())
    }

    /// Load the remainder of the stream into memory so subsequent reads and
    /// seeks are served without file I/O. An optimization for the replay
    /// pass, not part of the format contract.
    pub fn load_remainder(&mut self) -> Result<()> {
        if self.block.is_some() {
            return Ok(());
        }
        let base = self.pos;
        let len = (self.end - base) as usize;
        self.src.seek(SeekFrom::Start(base))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| ChunkError::OutOfMemory { len })?;
        (&mut self.src).take(len as u64).read_to_end(&mut data)?;
        if data.len() != len {
            return Err(ChunkError::Corrupt("stream shorter than its bounds"));
        }
        self.block = Some(Block { base, data });
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.open.last().map(|c| c.end).unwrap_or(self.end)
    }

    /// Read the next chunk header, entering the chunk. Returns `None` at the
    /// end of the stream (or of the enclosing chunk).
    pub fn begin_chunk(&mut self) -> Result<Option<ChunkHeader>> {
        let limit = self.limit();
        if self.pos == limit {
            return Ok(None);
        }
        if limit - self.pos < CHUNK_HEADER_SIZE {
            return Err(ChunkError::Corrupt("truncated chunk header"));
        }
        let kind = ChunkKind(self.read_u32_le()?);
        let version = self.read_u16_le()?;
        let flags = self.read_u16_le()?;
        let len = self.read_u64_le()?;
        let payload_end = self
            .pos
            .checked_add(len)
            .ok_or(ChunkError::Corrupt("chunk length overflow"))?;
        if payload_end > limit {
            return Err(ChunkError::Corrupt("chunk length exceeds stream bounds"));
        }
        let header = ChunkHeader {
            kind,
            version,
            flags,
            len,
        };
        self.open.push(OpenChunk {
            header,
            end: payload_end,
        });
        Ok(Some(header))
    }

    /// Leave the current chunk, skipping any unread payload. This is also
    /// how an unrecognized chunk is skipped.
    pub fn end_chunk(&mut self) -> Result<()> {
        let chunk = self
            .open
            .pop()
            .ok_or(ChunkError::Corrupt("end_chunk without matching begin_chunk"))?;
        self.pos = chunk.end;
        Ok(())
    }

    pub fn current_chunk(&self) -> Option<ChunkHeader> {
        self.open.last().map(|c| c.header)
    }

    pub fn remaining_in_chunk(&self) -> u64 {
        self.limit() - self.pos
    }

    /// Variable-length blob. Ownership of the returned bytes transfers to
    /// the caller.
    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64_le()?;
        if len > self.remaining_in_chunk() {
            return Err(ChunkError::Corrupt("blob length exceeds chunk bounds"));
        }
        let len = usize::try_from(len).map_err(|_| ChunkError::Corrupt("blob length overflow"))?;
        self.read_exact_vec(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32_le()? as u64;
        if len > self.remaining_in_chunk() {
            return Err(ChunkError::Corrupt("string length exceeds chunk bounds"));
        }
        let bytes = self.read_exact_vec(len as usize)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Read and validate the mandatory stream-version chunk. Must be called
    /// before any other chunk is read; an unsupported (newer) version is
    /// rejected before anything version-specific is interpreted.
    pub fn read_stream_version(&mut self) -> Result<u32> {
        let header = self
            .begin_chunk()?
            .ok_or(ChunkError::Corrupt("empty stream"))?;
        if header.kind != ChunkKind::STREAM_VERSION {
            return Err(ChunkError::Corrupt("missing stream version chunk"));
        }
        let version = self.read_u32_le()?;
        self.end_chunk()?;
        if !is_supported_version(version) {
            return Err(ChunkError::UnsupportedVersion(version));
        }
        Ok(version)
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let allowed = self.limit().saturating_sub(self.pos);
        let n = (buf.len() as u64).min(allowed) as usize;
        if n == 0 {
            return Ok(0);
        }
        let n = match &self.block {
            Some(block) if self.pos >= block.base => {
                let idx = (self.pos - block.base) as usize;
                let n = n.min(block.data.len().saturating_sub(idx));
                buf[..n].copy_from_slice(&block.data[idx..idx + n]);
                n
            }
            _ => {
                self.src.seek(SeekFrom::Start(self.pos))?;
                self.src.read(&mut buf[..n])?
            }
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Read for ChunkReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_raw(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::WriteLeExt;
    use crate::writer::{Chunk, ChunkWriter};
    use proptest::prelude::*;
    use std::io::Cursor;

    const KIND_A: ChunkKind = ChunkKind(100);
    const KIND_B: ChunkKind = ChunkKind(101);
    const KIND_UNKNOWN: ChunkKind = ChunkKind(9999);

    fn sample_stream() -> Vec<u8> {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();

        w.push_chunk(KIND_A, 1).unwrap();
        w.write_u32_le(0x1234).unwrap();
        w.write_blob(b"payload bytes").unwrap();
        w.pop_chunk().unwrap();

        // A chunk this reader has no handler for.
        w.push_chunk(KIND_UNKNOWN, 3).unwrap();
        w.write_u64_le(0xfeed_f00d).unwrap();
        w.write_blob(&[0xab; 64]).unwrap();
        w.pop_chunk().unwrap();

        w.push_chunk(KIND_B, 1).unwrap();
        w.write_string("after the unknown chunk").unwrap();
        w.pop_chunk().unwrap();

        w.finish().unwrap().into_inner()
    }

    #[test]
    fn skips_unknown_chunk_and_continues() {
        let bytes = sample_stream();
        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(r.read_stream_version().unwrap(), crate::FORMAT_VERSION);

        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!(h.kind, KIND_A);
        assert_eq!(r.read_u32_le().unwrap(), 0x1234);
        assert_eq!(r.read_blob().unwrap(), b"payload bytes");
        r.end_chunk().unwrap();

        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!(h.kind, KIND_UNKNOWN);
        // Skip without reading any element.
        r.end_chunk().unwrap();

        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!(h.kind, KIND_B);
        assert_eq!(r.read_string().unwrap(), "after the unknown chunk");
        r.end_chunk().unwrap();

        assert!(r.begin_chunk().unwrap().is_none());
    }

    #[test]
    fn partially_read_chunk_still_skips_to_next() {
        let bytes = sample_stream();
        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();

        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!(h.kind, KIND_A);
        // Read only the first element; end_chunk must skip the blob.
        assert_eq!(r.read_u32_le().unwrap(), 0x1234);
        r.end_chunk().unwrap();

        assert_eq!(r.begin_chunk().unwrap().unwrap().kind, KIND_UNKNOWN);
    }

    #[test]
    fn element_cannot_cross_chunk_boundary() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();
        w.push_chunk(KIND_A, 1).unwrap();
        w.write_u16_le(7).unwrap();
        w.pop_chunk().unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();
        r.begin_chunk().unwrap().unwrap();
        // The payload holds 2 bytes; a u64 element must fail, not bleed into
        // the next chunk.
        assert!(r.read_u64_le().is_err());
    }

    #[test]
    fn blob_length_beyond_chunk_is_corrupt() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();
        w.push_chunk(KIND_A, 1).unwrap();
        w.write_u64_le(u64::MAX).unwrap(); // blob length field
        w.pop_chunk().unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();
        r.begin_chunk().unwrap().unwrap();
        assert!(matches!(r.read_blob(), Err(ChunkError::Corrupt(_))));
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.push_chunk(ChunkKind::STREAM_VERSION, 0).unwrap();
        w.write_u32_le(crate::FORMAT_VERSION + 1).unwrap();
        w.pop_chunk().unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            r.read_stream_version(),
            Err(ChunkError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn in_memory_chunk_round_trips() {
        let chunk = Chunk::build(KIND_B, 2, |p| {
            p.write_u32_le(11)?;
            p.write_opt_u64(Some(22))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(chunk.encoded_len(), CHUNK_HEADER_SIZE + 4 + 1 + 8);

        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();
        w.write_chunk(&chunk).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();
        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!((h.kind, h.version), (KIND_B, 2));
        assert_eq!(r.read_u32_le().unwrap(), 11);
        assert_eq!(r.read_opt_u64().unwrap(), Some(22));
        r.end_chunk().unwrap();
    }

    #[test]
    fn load_remainder_serves_identical_chunks() {
        let bytes = sample_stream();

        let mut direct = ChunkReader::open(Cursor::new(bytes.clone())).unwrap();
        direct.read_stream_version().unwrap();

        let mut blocked = ChunkReader::open(Cursor::new(bytes)).unwrap();
        blocked.read_stream_version().unwrap();
        blocked.load_remainder().unwrap();

        loop {
            let a = direct.begin_chunk().unwrap();
            let b = blocked.begin_chunk().unwrap();
            assert_eq!(a, b);
            if a.is_none() {
                break;
            }
            let alen = direct.remaining_in_chunk() as usize;
            let blen = blocked.remaining_in_chunk() as usize;
            assert_eq!(direct.read_exact_vec(alen).unwrap(), blocked.read_exact_vec(blen).unwrap());
            direct.end_chunk().unwrap();
            blocked.end_chunk().unwrap();
        }
    }

    #[test]
    fn seek_to_recorded_offset_reenters_stream() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();
        w.push_chunk(KIND_A, 1).unwrap();
        w.write_u32_le(1).unwrap();
        w.pop_chunk().unwrap();
        let second_offset = w.stream_position().unwrap();
        w.push_chunk(KIND_B, 1).unwrap();
        w.write_u32_le(2).unwrap();
        w.pop_chunk().unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();
        r.seek_to(second_offset).unwrap();
        let h = r.begin_chunk().unwrap().unwrap();
        assert_eq!(h.kind, KIND_B);
        assert_eq!(r.read_u32_le().unwrap(), 2);
    }

    proptest! {
        // Guard against panics on corrupted/truncated input, in the same
        // spirit as fuzzing the decoder.
        #[test]
        fn reader_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            if let Ok(mut r) = ChunkReader::open(Cursor::new(&data)) {
                let _ = r.read_stream_version();
                for _ in 0..64 {
                    match r.begin_chunk() {
                        Ok(Some(_)) => {
                            let _ = r.read_u32_le();
                            let _ = r.read_blob();
                            if r.end_chunk().is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
        }
    }
}
