use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::frame_ref::{FrameRef, FrameRefs};
use crate::id::{IdAllocator, ResourceId};
use crate::record::ResourceRecord;
use crate::sharded::Sharded;

/// Which side of the capture/replay boundary this registry serves. Decides
/// the id numbering space and whether capture-side bookkeeping applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Capture,
    Replay,
}

/// Pre-frame contents snapshot for one resource. `data == None` means the
/// resource was referenced but its contents are not needed byte-for-byte
/// (write-only targets); replay clears it on frame init instead.
#[derive(Clone)]
pub struct InitialContents {
    pub data: Option<Arc<Vec<u8>>>,
}

/// The one structure every thread touches on every intercepted call. All
/// maps are sharded by id; the narrow interface below is the only access
/// path.
pub struct Registry {
    role: Role,
    allocator: IdAllocator,
    /// Native handle -> id, the double-registration guard.
    natives: Mutex<HashMap<u64, ResourceId>>,
    records: Sharded<Arc<ResourceRecord>>,
    dirty: Sharded<()>,
    pending_dirty: Mutex<HashSet<ResourceId>>,
    initial: Sharded<InitialContents>,
    /// Replay-side: captured id -> live id, and the reverse.
    live: Sharded<ResourceId>,
    original: Sharded<ResourceId>,
    replacements: Sharded<ResourceId>,
    frame_refs: Mutex<FrameRefs>,
}

impl Registry {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            allocator: IdAllocator::new(role == Role::Replay),
            natives: Mutex::new(HashMap::new()),
            records: Sharded::default(),
            dirty: Sharded::default(),
            pending_dirty: Mutex::new(HashSet::new()),
            initial: Sharded::default(),
            live: Sharded::default(),
            original: Sharded::default(),
            replacements: Sharded::default(),
            frame_refs: Mutex::new(FrameRefs::new()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    ///////////////////////////////////////////
    // Identity

    /// Assign an id to a newly wrapped native object. Registering the same
    /// native object twice is an invariant violation: continuing would let
    /// two ids alias one object and silently corrupt any capture, so this
    /// panics rather than recover.
    pub fn register(&self, native: u64) -> ResourceId {
        let id = self.allocator.alloc();
        let prev = self.natives.lock().unwrap().insert(native, id);
        if let Some(prev) = prev {
            panic!("native object {native:#x} registered twice (already {prev})");
        }
        id
    }

    /// Assign an id to a wrapped object with no native handle behind it
    /// (e.g. a finished command list, which exists only as recorded calls).
    pub fn register_unbacked(&self) -> ResourceId {
        self.allocator.alloc()
    }

    pub fn unregister(&self, native: u64) {
        self.natives.lock().unwrap().remove(&native);
    }

    pub fn id_for_native(&self, native: u64) -> ResourceId {
        self.natives
            .lock()
            .unwrap()
            .get(&native)
            .copied()
            .unwrap_or(ResourceId::NULL)
    }

    ///////////////////////////////////////////
    // Capture-side records

    /// Create the record for `id`. Duplicate creation is a programming
    /// error.
    pub fn add_resource_record(&self, id: ResourceId) -> Arc<ResourceRecord> {
        let record = Arc::new(ResourceRecord::new(id));
        let prev = self.records.insert(id, record.clone());
        assert!(prev.is_none(), "duplicate resource record for {id}");
        record
    }

    pub fn get_record(&self, id: ResourceId) -> Option<Arc<ResourceRecord>> {
        self.records.get(id)
    }

    pub fn has_record(&self, id: ResourceId) -> bool {
        self.records.contains(id)
    }

    pub fn remove_record(&self, id: ResourceId) {
        self.records.remove(id);
    }

    /// Reset every record's written flag ahead of serializing a new capture.
    pub fn mark_unwritten_resources(&self) {
        for record in self.records.values() {
            record.mark_data_unwritten();
        }
    }

    ///////////////////////////////////////////
    // Dirty tracking

    /// The resource's contents are suspect (e.g. written by the GPU); any
    /// cached initial contents are stale. Safe to call redundantly and
    /// concurrently with lookups.
    pub fn mark_dirty(&self, id: ResourceId) {
        if id.is_null() {
            return;
        }
        self.initial.remove(id);
        self.dirty.insert(id, ());
    }

    /// Safe to call mid-capture; flushed to the dirty set at the next frame
    /// boundary so the in-flight capture's initial contents stay coherent.
    pub fn mark_pending_dirty(&self, id: ResourceId) {
        if id.is_null() {
            return;
        }
        self.pending_dirty.lock().unwrap().insert(id);
    }

    pub fn flush_pending_dirty(&self) {
        let pending: Vec<ResourceId> = self.pending_dirty.lock().unwrap().drain().collect();
        for id in pending {
            self.mark_dirty(id);
        }
    }

    /// The resource is in a known state again (fully cleared/overwritten).
    pub fn mark_clean(&self, id: ResourceId) {
        self.dirty.remove(id);
    }

    pub fn is_dirty(&self, id: ResourceId) -> bool {
        self.dirty.contains(id)
    }

    pub fn dirty_resources(&self) -> Vec<ResourceId> {
        self.dirty.keys()
    }

    ///////////////////////////////////////////
    // Initial contents

    pub fn set_initial_contents(&self, id: ResourceId, contents: InitialContents) {
        self.initial.insert(id, contents);
    }

    pub fn initial_contents(&self, id: ResourceId) -> Option<InitialContents> {
        self.initial.get(id)
    }

    pub fn has_initial_contents(&self, id: ResourceId) -> bool {
        self.initial.contains(id)
    }

    pub fn free_initial_contents(&self) {
        self.initial.clear();
    }

    ///////////////////////////////////////////
    // Frame references

    pub fn mark_frame_referenced(&self, id: ResourceId, frame_ref: FrameRef) {
        self.frame_refs.lock().unwrap().mark(id, frame_ref);
    }

    pub fn merge_frame_refs(&self, refs: &FrameRefs) {
        self.frame_refs.lock().unwrap().merge_from(refs);
    }

    pub fn frame_ref(&self, id: ResourceId) -> Option<FrameRef> {
        self.frame_refs.lock().unwrap().get(id)
    }

    pub fn read_before_write(&self, id: ResourceId) -> bool {
        matches!(
            self.frame_ref(id),
            Some(FrameRef::ReadBeforeWrite) | Some(FrameRef::Unknown)
        )
    }

    pub fn frame_refs_snapshot(&self) -> FrameRefs {
        self.frame_refs.lock().unwrap().clone()
    }

    pub fn clear_frame_refs(&self) {
        self.frame_refs.lock().unwrap().clear();
    }

    ///////////////////////////////////////////
    // Replay-side live resources

    /// Bind a captured id to the object re-created for it this session.
    pub fn add_live_resource(&self, original: ResourceId, live: ResourceId) {
        assert!(
            !original.is_null() && !live.is_null(),
            "live resource binding requires non-null ids"
        );
        let prev = self.live.insert(original, live);
        assert!(prev.is_none(), "duplicate live resource binding for {original}");
        self.original.insert(live, original);
    }

    pub fn has_live_resource(&self, original: ResourceId) -> bool {
        let target = self.replacements.get(original).unwrap_or(original);
        self.live.contains(target)
    }

    /// Resolve a captured id to this session's live id. A miss is a
    /// recoverable degradation: the caller treats the result as unbound and
    /// the replay continues.
    pub fn get_live_resource(&self, original: ResourceId) -> Option<ResourceId> {
        if original.is_null() {
            return None;
        }
        let target = self.replacements.get(original).unwrap_or(original);
        let live = self.live.get(target);
        if live.is_none() {
            error!("no live resource bound for {original}; treating as unbound");
        }
        live
    }

    pub fn erase_live_resource(&self, original: ResourceId) {
        if let Some(live) = self.live.remove(original) {
            self.original.remove(live);
        }
    }

    pub fn get_original_id(&self, live: ResourceId) -> ResourceId {
        self.original.get(live).unwrap_or(ResourceId::NULL)
    }

    pub fn get_live_id(&self, original: ResourceId) -> ResourceId {
        self.live.get(original).unwrap_or(ResourceId::NULL)
    }

    ///////////////////////////////////////////
    // Replacements

    /// Redirect resolution of `from` to `to` (edit-and-continue workflows).
    pub fn replace_resource(&self, from: ResourceId, to: ResourceId) {
        self.replacements.insert(from, to);
    }

    pub fn has_replacement(&self, from: ResourceId) -> bool {
        self.replacements.contains(from)
    }

    pub fn remove_replacement(&self, from: ResourceId) {
        self.replacements.remove(from);
    }
}
