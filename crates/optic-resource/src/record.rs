use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use optic_chunk::Chunk;

use crate::id::ResourceId;
use crate::registry::Registry;

/// Capture-side bookkeeping for one wrapped resource: the ordered chunks
/// that constructed and mutated it, dependency edges to the records of the
/// resources it was created from, and the counters the dirty-tracking
/// amortization policy runs on.
pub struct ResourceRecord {
    id: ResourceId,
    special: AtomicBool,
    update_count: AtomicU32,
    inner: Mutex<Inner>,
    /// CPU shadow of the resource contents, maintained across map/unmap so
    /// written ranges can be diffed and serialized.
    shadow: Mutex<Option<Vec<u8>>>,
}

#[derive(Default)]
struct Inner {
    chunks: Vec<Chunk>,
    parents: Vec<ResourceId>,
    /// Set once this record's chunks have been inserted into the capture
    /// being written, so shared parents are emitted exactly once.
    data_written: bool,
    length: u64,
}

impl ResourceRecord {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            special: AtomicBool::new(false),
            update_count: AtomicU32::new(0),
            inner: Mutex::new(Inner::default()),
            shadow: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Special resources (swapchain-backbuffer-like) always re-serialize,
    /// bypassing the dirty tracking.
    pub fn set_special(&self, special: bool) {
        self.special.store(special, Ordering::Relaxed);
    }

    pub fn is_special(&self) -> bool {
        self.special.load(Ordering::Relaxed)
    }

    pub fn add_chunk(&self, chunk: Chunk) {
        self.inner.lock().unwrap().chunks.push(chunk);
    }

    pub fn has_chunks(&self) -> bool {
        !self.inner.lock().unwrap().chunks.is_empty()
    }

    pub fn num_chunks(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    pub fn chunks_cloned(&self) -> Vec<Chunk> {
        self.inner.lock().unwrap().chunks.clone()
    }

    /// Total byte length of this record's serialized chunks.
    pub fn length(&self) -> u64 {
        self.inner.lock().unwrap().length
    }

    pub fn set_length(&self, length: u64) {
        self.inner.lock().unwrap().length = length;
    }

    pub fn add_parent(&self, parent: ResourceId) {
        if parent.is_null() || parent == self.id {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.parents.contains(&parent) {
            inner.parents.push(parent);
        }
    }

    pub fn parents(&self) -> Vec<ResourceId> {
        self.inner.lock().unwrap().parents.clone()
    }

    /// Count one in-place content update; returns the running total for the
    /// coarse-tracking fallback decision.
    pub fn bump_update_count(&self) -> u32 {
        self.update_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn update_count(&self) -> u32 {
        self.update_count.load(Ordering::Relaxed)
    }

    pub fn mark_data_unwritten(&self) {
        self.inner.lock().unwrap().data_written = false;
    }

    /// Append this record's chunks (parents first) to `out`. Each record
    /// contributes at most once per capture write; `visiting` breaks
    /// dependency cycles defensively even though creation order should make
    /// them impossible.
    pub fn insert_chunks(&self, registry: &Registry, out: &mut Vec<Chunk>) {
        let mut visiting = HashSet::new();
        self.insert_chunks_inner(registry, out, &mut visiting);
    }

    fn insert_chunks_inner(
        &self,
        registry: &Registry,
        out: &mut Vec<Chunk>,
        visiting: &mut HashSet<ResourceId>,
    ) {
        if !visiting.insert(self.id) {
            return;
        }
        let parents = {
            let mut inner = self.inner.lock().unwrap();
            if inner.data_written {
                return;
            }
            inner.data_written = true;
            inner.parents.clone()
        };
        for parent in parents {
            if let Some(record) = registry.get_record(parent) {
                record.insert_chunks_inner(registry, out, visiting);
            }
        }
        out.extend(self.inner.lock().unwrap().chunks.iter().cloned());
    }

    pub fn shadow(&self) -> Option<Vec<u8>> {
        self.shadow.lock().unwrap().clone()
    }

    pub fn set_shadow(&self, data: Option<Vec<u8>>) {
        *self.shadow.lock().unwrap() = data;
    }
}
