use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use optic_resource::{FrameRefs, ResourceId};

use crate::call::Call;
use crate::driver::{
    BlendDesc, BufferDesc, DepthDesc, DepthStencilViewDesc, NativeHandle, RasterDesc,
    RenderTargetViewDesc, SamplerDesc, ShaderResourceViewDesc, ShaderStage, TextureDesc,
    UnorderedAccessViewDesc,
};
use crate::refcount::{RefClass, RefCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture2d,
    Sampler,
    Shader,
    RenderTargetView,
    DepthStencilView,
    ShaderResourceView,
    UnorderedAccessView,
    BlendState,
    DepthState,
    RasterState,
    CommandList,
}

impl ObjectKind {
    pub fn is_view(self) -> bool {
        matches!(
            self,
            ObjectKind::RenderTargetView
                | ObjectKind::DepthStencilView
                | ObjectKind::ShaderResourceView
                | ObjectKind::UnorderedAccessView
        )
    }
}

/// A finished deferred recording: the chunks and decoded calls a command
/// list captured, plus the frame references they imply. Immutable once the
/// list is finished.
pub struct CommandListData {
    pub chunks: Vec<optic_chunk::Chunk>,
    pub calls: Vec<Call>,
    pub refs: FrameRefs,
}

/// Creation-time description kept with each arena entry. This is what the
/// coverage and dependency logic reads back without a driver round trip.
pub enum ObjectInfo {
    Buffer(BufferDesc),
    Texture2d(TextureDesc),
    Sampler(SamplerDesc),
    Shader { stage: ShaderStage },
    RenderTargetView {
        parent: ResourceId,
        desc: RenderTargetViewDesc,
    },
    DepthStencilView {
        parent: ResourceId,
        desc: DepthStencilViewDesc,
    },
    ShaderResourceView {
        parent: ResourceId,
        desc: ShaderResourceViewDesc,
    },
    UnorderedAccessView {
        parent: ResourceId,
        desc: UnorderedAccessViewDesc,
    },
    BlendState(BlendDesc),
    DepthState(DepthDesc),
    RasterState(RasterDesc),
    CommandList(Arc<CommandListData>),
}

impl ObjectInfo {
    /// The resource a view was created over, or the context a command list
    /// was recorded on. Null for top-level objects.
    pub fn parent(&self) -> ResourceId {
        match self {
            ObjectInfo::RenderTargetView { parent, .. }
            | ObjectInfo::DepthStencilView { parent, .. }
            | ObjectInfo::ShaderResourceView { parent, .. }
            | ObjectInfo::UnorderedAccessView { parent, .. } => *parent,
            _ => ResourceId::NULL,
        }
    }

    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match self {
            ObjectInfo::Texture2d(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn buffer_desc(&self) -> Option<&BufferDesc> {
        match self {
            ObjectInfo::Buffer(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn raster_desc(&self) -> Option<&RasterDesc> {
        match self {
            ObjectInfo::RasterState(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn depth_view_desc(&self) -> Option<&DepthStencilViewDesc> {
        match self {
            ObjectInfo::DepthStencilView { desc, .. } => Some(desc),
            _ => None,
        }
    }

    pub fn command_list(&self) -> Option<&Arc<CommandListData>> {
        match self {
            ObjectInfo::CommandList(data) => Some(data),
            _ => None,
        }
    }
}

/// One wrapped object: the exclusively owned real handle, its identity, and
/// the counters that decide when the real handle is freed.
pub struct ObjectEntry {
    id: ResourceId,
    kind: ObjectKind,
    info: ObjectInfo,
    native: NativeHandle,
    counts: RefCounts,
}

impl ObjectEntry {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    pub fn native(&self) -> NativeHandle {
        self.native
    }

    pub fn counts(&self) -> &RefCounts {
        &self.counts
    }

    pub fn parent(&self) -> ResourceId {
        self.info.parent()
    }
}

pub enum ReleaseOutcome {
    NotFound,
    Alive { class_count: i64 },
    /// The combined count hit zero: the entry has been removed from the
    /// arena and the destroy sink (if installed) has been told to free the
    /// native handle and unwind the remaining bookkeeping.
    Destroyed(Arc<ObjectEntry>),
}

/// Completes destruction once the arena decides an object is dead: free the
/// native handle, drop registration/record state, release references held on
/// parents. Installed by the device layer; releases may cascade (a view's
/// death releases its resource), so implementations can re-enter the arena.
pub trait DestroySink: Send + Sync {
    fn destroyed(&self, entry: &Arc<ObjectEntry>);
}

const SHARD_COUNT: usize = 16;

/// Owner of all live wrapped objects. Exactly one release observes an
/// object's combined count hit zero; that release removes the entry and runs
/// the destroy sink, making this the single destruction decision point.
pub struct ObjectArena {
    shards: Vec<RwLock<HashMap<ResourceId, Arc<ObjectEntry>>>>,
    sink: RwLock<Option<Arc<dyn DestroySink>>>,
}

impl Default for ObjectArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectArena {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            sink: RwLock::new(None),
        }
    }

    pub fn set_destroy_sink(&self, sink: Arc<dyn DestroySink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    fn shard(&self, id: ResourceId) -> &RwLock<HashMap<ResourceId, Arc<ObjectEntry>>> {
        &self.shards[(id.to_raw() as usize) & (SHARD_COUNT - 1)]
    }

    pub fn insert(
        &self,
        id: ResourceId,
        kind: ObjectKind,
        info: ObjectInfo,
        native: NativeHandle,
    ) -> Arc<ObjectEntry> {
        let entry = Arc::new(ObjectEntry {
            id,
            kind,
            info,
            native,
            counts: RefCounts::new_owned(),
        });
        let prev = self.shard(id).write().unwrap().insert(id, entry.clone());
        assert!(prev.is_none(), "arena entry {id} inserted twice");
        entry
    }

    pub fn get(&self, id: ResourceId) -> Option<Arc<ObjectEntry>> {
        self.shard(id).read().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.shard(id).read().unwrap().contains_key(&id)
    }

    pub fn native_of(&self, id: ResourceId) -> Option<NativeHandle> {
        self.get(id).map(|e| e.native)
    }

    pub fn kind_of(&self, id: ResourceId) -> Option<ObjectKind> {
        self.get(id).map(|e| e.kind)
    }

    /// Returns the new count for `class`, or `None` if the object is gone.
    pub fn add_ref(&self, id: ResourceId, class: RefClass) -> Option<i64> {
        self.get(id).map(|e| e.counts.add(class))
    }

    pub fn release(&self, id: ResourceId, class: RefClass) -> ReleaseOutcome {
        let Some(entry) = self.get(id) else {
            return ReleaseOutcome::NotFound;
        };
        let (class_count, destroy) = entry.counts.release(class);
        if destroy {
            self.shard(id).write().unwrap().remove(&id);
            // No shard lock is held here: the sink may cascade back into
            // `release` for the entry's parents.
            let sink = self.sink.read().unwrap().clone();
            if let Some(sink) = sink {
                sink.destroyed(&entry);
            }
            ReleaseOutcome::Destroyed(entry)
        } else {
            ReleaseOutcome::Alive { class_count }
        }
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().unwrap().keys().copied());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_info() -> ObjectInfo {
        ObjectInfo::Texture2d(TextureDesc {
            width: 4,
            height: 4,
            mips: 1,
            format: crate::driver::Format::Rgba8Unorm,
            bind: crate::driver::BindFlags::RENDER_TARGET,
            sample_count: 1,
        })
    }

    #[test]
    fn entry_survives_external_release_while_view_ref_held() {
        let arena = ObjectArena::new();
        let id = ResourceId::from_raw(1);
        arena.insert(id, ObjectKind::Texture2d, texture_info(), NativeHandle(0x10));

        arena.add_ref(id, RefClass::View).unwrap();
        match arena.release(id, RefClass::External) {
            ReleaseOutcome::Alive { class_count } => assert_eq!(class_count, 0),
            _ => panic!("object destroyed while a view reference was held"),
        }
        assert!(arena.contains(id));

        match arena.release(id, RefClass::View) {
            ReleaseOutcome::Destroyed(entry) => {
                assert_eq!(entry.native(), NativeHandle(0x10));
            }
            _ => panic!("final release must destroy"),
        }
        assert!(!arena.contains(id));
    }

    #[test]
    fn release_of_unknown_id_reports_not_found() {
        let arena = ObjectArena::new();
        assert!(matches!(
            arena.release(ResourceId::from_raw(9), RefClass::External),
            ReleaseOutcome::NotFound
        ));
    }
}
