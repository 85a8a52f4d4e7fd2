use std::io::{Read, Seek, SeekFrom, Write};

use optic_chunk::{
    Chunk, ChunkKind, ChunkReader, ChunkWriter, ReadLeExt, WriteLeExt, CHUNK_HEADER_SIZE,
};
use optic_resource::{IdReadExt, IdWriteExt, ResourceId};
use optic_wrap::RenderState;

use crate::error::{CaptureError, Result};
use crate::options::CaptureMeta;

pub const CAPTURE_MAGIC: &[u8; 8] = b"OPTCCAP\0";
pub const FOOTER_MAGIC: &[u8; 8] = b"OPTCEOF\0";
pub const TOC_MAGIC: &[u8; 8] = b"OPTCTOC\0";

pub const CONTAINER_VERSION_V1: u32 = 1;
/// Current container version. V2 moved initial-contents payloads to
/// optionally LZ4-compressed blobs and added the frame-footer callstack.
pub const CONTAINER_VERSION: u32 = 2;

pub const HEADER_SIZE: u32 = 28;
pub const FOOTER_SIZE: u32 = 32;
pub const TOC_HEADER_SIZE: u64 = 16;
pub const TOC_ENTRY_SIZE: u64 = 16;
pub const TOC_VERSION: u32 = 1;

/// Container-level chunk kinds (distinct from the per-call tags).
pub mod section {
    use optic_chunk::ChunkKind;

    /// Pipeline state of one context at the moment capture began.
    pub const BEGIN_STATE: ChunkKind = ChunkKind(32);
    /// Pre-frame contents of one resource.
    pub const INITIAL_CONTENTS: ChunkKind = ChunkKind(33);
    /// Resources that need a clear, not contents, on frame init.
    pub const INITIAL_NEEDED: ChunkKind = ChunkKind(34);
    /// Frame boundary marker; everything after it is frame events.
    pub const CAPTURE_SCOPE: ChunkKind = ChunkKind(35);
    /// End of frame, optionally carrying a captured callstack.
    pub const FRAME_FOOTER: ChunkKind = ChunkKind(36);
    /// Driver-reported diagnostic recorded without altering propagation.
    pub const DEBUG_MESSAGE: ChunkKind = ChunkKind(37);
}

pub fn chunk_name(kind: ChunkKind) -> Option<&'static str> {
    match kind {
        section::BEGIN_STATE => Some("BeginState"),
        section::INITIAL_CONTENTS => Some("InitialContents"),
        section::INITIAL_NEEDED => Some("InitialNeeded"),
        section::CAPTURE_SCOPE => Some("CaptureScope"),
        section::FRAME_FOOTER => Some("FrameFooter"),
        section::DEBUG_MESSAGE => Some("DebugMessage"),
        _ => None,
    }
}

const TOC_ACTION_FLAG: u32 = 1;

/// Seek table entry: one frame event and the byte offset of its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub event: u32,
    pub flags: u32,
    pub offset: u64,
}

impl TocEntry {
    pub fn is_action(&self) -> bool {
        self.flags & TOC_ACTION_FLAG != 0
    }
}

fn is_supported_container_version(v: u32) -> bool {
    (CONTAINER_VERSION_V1..=CONTAINER_VERSION).contains(&v)
}

/// Writer for one capture file.
pub struct CaptureWriter<W: Write + Seek> {
    w: ChunkWriter<W>,
    toc: Vec<TocEntry>,
    next_event: u32,
}

impl<W: Write + Seek> CaptureWriter<W> {
    pub fn new(mut w: W, meta: &CaptureMeta) -> Result<Self> {
        let meta_json = serde_json::to_vec(meta)?;
        w.write_bytes(CAPTURE_MAGIC)?;
        w.write_u32_le(HEADER_SIZE)?;
        w.write_u32_le(CONTAINER_VERSION)?;
        w.write_u32_le(0)?; // flags
        w.write_u32_le(meta_json.len() as u32)?;
        w.write_u32_le(0)?; // reserved
        w.write_bytes(&meta_json)?;

        let mut w = ChunkWriter::new(w);
        w.write_stream_version()?;
        Ok(Self {
            w,
            toc: Vec::new(),
            next_event: 1,
        })
    }

    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.w.write_chunk(chunk)?;
        Ok(())
    }

    pub fn write_begin_state(&mut self, context_index: u32, state: &RenderState) -> Result<()> {
        let chunk = Chunk::build(section::BEGIN_STATE, 1, |p| {
            p.write_u32_le(context_index)?;
            state.encode(p)
        })?;
        self.write_chunk(&chunk)
    }

    pub fn write_initial_contents(
        &mut self,
        id: ResourceId,
        data: &[u8],
        compress: bool,
    ) -> Result<()> {
        let chunk = Chunk::build(section::INITIAL_CONTENTS, 2, |p| {
            p.write_id(id)?;
            p.write_bool(compress)?;
            if compress {
                p.write_blob(&lz4_flex::block::compress_prepend_size(data))
            } else {
                p.write_blob(data)
            }
        })?;
        self.write_chunk(&chunk)
    }

    pub fn write_initial_needed(&mut self, ids: &[ResourceId]) -> Result<()> {
        let chunk = Chunk::build(section::INITIAL_NEEDED, 1, |p| {
            p.write_u32_le(ids.len() as u32)?;
            for &id in ids {
                p.write_id(id)?;
            }
            Ok(())
        })?;
        self.write_chunk(&chunk)
    }

    pub fn write_capture_scope(&mut self, frame: u64) -> Result<()> {
        let chunk = Chunk::build(section::CAPTURE_SCOPE, 1, |p| p.write_u64_le(frame))?;
        self.write_chunk(&chunk)
    }

    pub fn write_debug_message(&mut self, severity: u32, text: &str) -> Result<()> {
        let chunk = Chunk::build(section::DEBUG_MESSAGE, 1, |p| {
            p.write_u32_le(severity)?;
            p.write_string(text)
        })?;
        self.write_chunk(&chunk)
    }

    /// Write one frame-event chunk, recording its byte offset in the seek
    /// table. Returns the event id.
    pub fn write_event_chunk(&mut self, chunk: &Chunk, is_action: bool) -> Result<u32> {
        let offset = self.w.stream_position()?;
        let event = self.next_event;
        self.next_event += 1;
        self.toc.push(TocEntry {
            event,
            flags: if is_action { TOC_ACTION_FLAG } else { 0 },
            offset,
        });
        self.write_chunk(chunk)?;
        Ok(event)
    }

    pub fn event_count(&self) -> u32 {
        self.next_event - 1
    }

    /// Write the frame footer, seek table and file footer.
    pub fn finish(mut self, callstack: Option<&[u64]>) -> Result<W> {
        let footer_chunk = Chunk::build(section::FRAME_FOOTER, 2, |p| {
            match callstack {
                Some(frames) => {
                    p.write_bool(true)?;
                    p.write_u32_le(frames.len() as u32)?;
                    for &frame in frames {
                        p.write_u64_le(frame)?;
                    }
                }
                None => p.write_bool(false)?,
            }
            Ok(())
        })?;
        self.w.write_chunk(&footer_chunk)?;

        let toc = std::mem::take(&mut self.toc);
        let mut w = self.w.finish()?;
        let toc_offset = w.stream_position()?;
        w.write_bytes(TOC_MAGIC)?;
        w.write_u32_le(TOC_VERSION)?;
        w.write_u32_le(toc.len() as u32)?;
        for entry in &toc {
            w.write_u32_le(entry.event)?;
            w.write_u32_le(entry.flags)?;
            w.write_u64_le(entry.offset)?;
        }
        let toc_len = w.stream_position()? - toc_offset;

        w.write_bytes(FOOTER_MAGIC)?;
        w.write_u32_le(FOOTER_SIZE)?;
        w.write_u32_le(CONTAINER_VERSION)?;
        w.write_u64_le(toc_offset)?;
        w.write_u64_le(toc_len)?;
        Ok(w)
    }
}

/// Reader for one capture file. Lengths and offsets are untrusted and get
/// validated against the actual file size before anything is allocated or
/// interpreted.
pub struct CaptureReader<R: Read + Seek> {
    reader: ChunkReader<R>,
    meta: CaptureMeta,
    container_version: u32,
    stream_version: u32,
    chunks_start: u64,
    toc: Vec<TocEntry>,
}

impl<R: Read + Seek> CaptureReader<R> {
    pub fn open(mut r: R) -> Result<Self> {
        let file_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        if file_len < u64::from(HEADER_SIZE) + u64::from(FOOTER_SIZE) {
            return Err(CaptureError::TocOutOfBounds);
        }

        let mut magic = [0u8; 8];
        r.read_exact(&mut magic).map_err(CaptureError::Io)?;
        if &magic != CAPTURE_MAGIC {
            return Err(CaptureError::InvalidMagic);
        }
        let header_size = r.read_u32_le()?;
        if header_size != HEADER_SIZE {
            return Err(CaptureError::UnsupportedContainerVersion(0));
        }
        let container_version = r.read_u32_le()?;
        if !is_supported_container_version(container_version) {
            return Err(CaptureError::UnsupportedContainerVersion(container_version));
        }
        let _flags = r.read_u32_le()?;
        let meta_len = u64::from(r.read_u32_le()?);
        let _reserved = r.read_u32_le()?;

        let chunks_start = u64::from(HEADER_SIZE)
            .checked_add(meta_len)
            .ok_or(CaptureError::TocOutOfBounds)?;
        if chunks_start > file_len {
            return Err(CaptureError::TocOutOfBounds);
        }
        let meta_bytes = (&mut r).read_exact_vec(meta_len as usize)?;
        let meta: CaptureMeta = serde_json::from_slice(&meta_bytes)?;

        // Footer is at a fixed offset from the end; reject a header/footer
        // version disagreement before trusting either.
        r.seek(SeekFrom::Start(file_len - u64::from(FOOTER_SIZE)))?;
        let mut footer_magic = [0u8; 8];
        r.read_exact(&mut footer_magic).map_err(CaptureError::Io)?;
        if &footer_magic != FOOTER_MAGIC {
            return Err(CaptureError::InvalidMagic);
        }
        let footer_size = r.read_u32_le()?;
        if footer_size != FOOTER_SIZE {
            return Err(CaptureError::UnsupportedContainerVersion(0));
        }
        let footer_version = r.read_u32_le()?;
        if footer_version != container_version {
            return Err(CaptureError::UnsupportedContainerVersion(footer_version));
        }
        let toc_offset = r.read_u64_le()?;
        let toc_len = r.read_u64_le()?;

        let toc_end = toc_offset
            .checked_add(toc_len)
            .ok_or(CaptureError::TocOutOfBounds)?;
        if toc_offset < chunks_start || toc_end > file_len {
            return Err(CaptureError::TocOutOfBounds);
        }

        r.seek(SeekFrom::Start(toc_offset))?;
        let toc = read_toc(&mut r, toc_len, chunks_start, toc_offset)?;

        let mut reader = ChunkReader::with_bounds(r, chunks_start, toc_offset)?;
        let stream_version = reader.read_stream_version()?;

        Ok(Self {
            reader,
            meta,
            container_version,
            stream_version,
            chunks_start,
            toc,
        })
    }

    pub fn meta(&self) -> &CaptureMeta {
        &self.meta
    }

    pub fn container_version(&self) -> u32 {
        self.container_version
    }

    pub fn stream_version(&self) -> u32 {
        self.stream_version
    }

    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    pub fn chunks(&mut self) -> &mut ChunkReader<R> {
        &mut self.reader
    }

    /// Seek the chunk cursor straight to a frame event recorded in the TOC.
    pub fn seek_to_event(&mut self, event: u32) -> Result<()> {
        let entry = self
            .toc
            .iter()
            .find(|e| e.event == event)
            .ok_or(CaptureError::UnknownEvent(event))?;
        self.reader.seek_to(entry.offset)?;
        Ok(())
    }

    /// Rewind to the first chunk after the stream-version tag.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek_to(self.chunks_start + CHUNK_HEADER_SIZE + 4)?;
        Ok(())
    }
}

fn read_toc<R: Read + Seek>(
    r: &mut R,
    toc_len: u64,
    chunks_start: u64,
    toc_offset: u64,
) -> Result<Vec<TocEntry>> {
    if toc_len < TOC_HEADER_SIZE {
        return Err(CaptureError::TocOutOfBounds);
    }
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(CaptureError::Io)?;
    if &magic != TOC_MAGIC {
        return Err(CaptureError::InvalidMagic);
    }
    let version = r.read_u32_le()?;
    if version != TOC_VERSION {
        return Err(CaptureError::TocOutOfBounds);
    }
    let count = r.read_u32_le()? as u64;
    let expected = TOC_HEADER_SIZE
        .checked_add(count.checked_mul(TOC_ENTRY_SIZE).ok_or(CaptureError::TocOutOfBounds)?)
        .ok_or(CaptureError::TocOutOfBounds)?;
    if expected != toc_len {
        return Err(CaptureError::TocOutOfBounds);
    }

    let mut entries = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let event = r.read_u32_le()?;
        let flags = r.read_u32_le()?;
        let offset = r.read_u64_le()?;
        // Entries are untrusted; they must point inside the chunk stream.
        if offset < chunks_start || offset >= toc_offset {
            return Err(CaptureError::TocOutOfBounds);
        }
        entries.push(TocEntry {
            event,
            flags,
            offset,
        });
    }
    Ok(entries)
}

/// Payload decoders for the container chunk kinds. Each assumes the chunk is
/// currently open in the reader; per-chunk header versions supply
/// compensating defaults for older captures.
pub mod decode {
    use super::*;
    use optic_chunk::ChunkHeader;

    pub fn begin_state<R: Read + Seek>(
        r: &mut ChunkReader<R>,
    ) -> Result<(u32, RenderState)> {
        let context_index = r.read_u32_le()?;
        let state = RenderState::decode(r)?;
        Ok((context_index, state))
    }

    pub fn initial_contents<R: Read + Seek>(
        header: ChunkHeader,
        r: &mut ChunkReader<R>,
    ) -> Result<(ResourceId, Vec<u8>)> {
        let id = r.read_id()?;
        // V1 chunks predate compression and carry the raw payload.
        let compressed = if header.version >= 2 { r.read_bool()? } else { false };
        let blob = r.read_blob()?;
        let data = if compressed {
            lz4_flex::block::decompress_size_prepended(&blob)?
        } else {
            blob
        };
        Ok((id, data))
    }

    pub fn initial_needed<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Vec<ResourceId>> {
        let count = r.read_u32_le()?;
        if u64::from(count) * 8 > r.remaining_in_chunk() {
            return Err(optic_chunk::ChunkError::Corrupt("needed list exceeds chunk").into());
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(r.read_id()?);
        }
        Ok(out)
    }

    pub fn capture_scope<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<u64> {
        Ok(r.read_u64_le()?)
    }

    pub fn frame_footer<R: Read + Seek>(
        header: ChunkHeader,
        r: &mut ChunkReader<R>,
    ) -> Result<Option<Vec<u64>>> {
        // V1 frame footers carried no callstack.
        if header.version < 2 || !r.read_bool()? {
            return Ok(None);
        }
        let count = r.read_u32_le()?;
        if u64::from(count) * 8 > r.remaining_in_chunk() {
            return Err(optic_chunk::ChunkError::Corrupt("callstack exceeds chunk").into());
        }
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(r.read_u64_le()?);
        }
        Ok(Some(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CaptureMeta, DeviceConfig};
    use optic_wrap::Call;
    use std::io::Cursor;

    fn meta() -> CaptureMeta {
        CaptureMeta::new(&DeviceConfig::default(), 42)
    }

    fn sample_capture() -> Vec<u8> {
        let mut w = CaptureWriter::new(Cursor::new(Vec::new()), &meta()).unwrap();
        w.write_begin_state(0, &RenderState::default()).unwrap();
        w.write_initial_contents(ResourceId::from_raw(7), &[5u8; 300], true)
            .unwrap();
        w.write_initial_needed(&[ResourceId::from_raw(9)]).unwrap();
        w.write_capture_scope(42).unwrap();
        let draw = Call::Draw {
            vertex_count: 3,
            first_vertex: 0,
        };
        w.write_event_chunk(&draw.to_chunk().unwrap(), true).unwrap();
        w.finish(Some(&[0x1000, 0x2000])).unwrap().into_inner()
    }

    #[test]
    fn header_meta_and_toc_round_trip() {
        let bytes = sample_capture();
        let mut reader = CaptureReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.meta(), &meta());
        assert_eq!(reader.container_version(), CONTAINER_VERSION);
        assert_eq!(reader.toc().len(), 1);
        assert!(reader.toc()[0].is_action());

        // Walk the chunk stream end to end.
        let mut kinds = Vec::new();
        loop {
            let Some(header) = reader.chunks().begin_chunk().unwrap() else {
                break;
            };
            kinds.push(header.kind);
            match header.kind {
                section::INITIAL_CONTENTS => {
                    let (id, data) = decode::initial_contents(header, reader.chunks()).unwrap();
                    assert_eq!(id, ResourceId::from_raw(7));
                    assert_eq!(data, vec![5u8; 300]);
                }
                section::FRAME_FOOTER => {
                    let stack = decode::frame_footer(header, reader.chunks()).unwrap();
                    assert_eq!(stack, Some(vec![0x1000, 0x2000]));
                }
                _ => {}
            }
            reader.chunks().end_chunk().unwrap();
        }
        assert!(kinds.contains(&section::CAPTURE_SCOPE));
    }

    #[test]
    fn seek_to_event_lands_on_its_chunk() {
        let bytes = sample_capture();
        let mut reader = CaptureReader::open(Cursor::new(bytes)).unwrap();
        reader.seek_to_event(1).unwrap();
        let header = reader.chunks().begin_chunk().unwrap().unwrap();
        assert_eq!(header.kind, optic_wrap::call_kind::DRAW);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = sample_capture();
        bytes[0] = b'X';
        assert!(matches!(
            CaptureReader::open(Cursor::new(bytes)),
            Err(CaptureError::InvalidMagic)
        ));
    }

    #[test]
    fn newer_container_version_is_rejected() {
        let mut bytes = sample_capture();
        // Header version field sits right after magic + header_size.
        bytes[12..16].copy_from_slice(&(CONTAINER_VERSION + 10).to_le_bytes());
        assert!(matches!(
            CaptureReader::open(Cursor::new(bytes)),
            Err(CaptureError::UnsupportedContainerVersion(_))
        ));
    }

    #[test]
    fn header_footer_version_mismatch_is_rejected() {
        let mut bytes = sample_capture();
        let footer_version_at = bytes.len() - (FOOTER_SIZE as usize) + 12;
        bytes[footer_version_at..footer_version_at + 4]
            .copy_from_slice(&CONTAINER_VERSION_V1.to_le_bytes());
        assert!(matches!(
            CaptureReader::open(Cursor::new(bytes)),
            Err(CaptureError::UnsupportedContainerVersion(CONTAINER_VERSION_V1))
        ));
    }

    #[test]
    fn truncated_file_is_out_of_bounds() {
        let bytes = sample_capture();
        let truncated = bytes[..bytes.len() - 40].to_vec();
        assert!(CaptureReader::open(Cursor::new(truncated)).is_err());
    }
}
