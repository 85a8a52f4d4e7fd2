use std::collections::HashMap;

use crate::id::ResourceId;

/// How a resource was referenced within the captured frame. Decides whether
/// its pre-frame contents must be included in the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRef {
    /// Referenced by the frame-initial pipeline state; no action has touched
    /// it yet, so the access direction is undecided.
    Unknown,
    Read,
    Write,
    /// Read at least once before the first write. The strongest reason to
    /// preserve initial contents.
    ReadBeforeWrite,
}

impl FrameRef {
    /// Merge a new reference into an accumulated one.
    pub fn merge(self, new: FrameRef) -> FrameRef {
        use FrameRef::*;
        match (self, new) {
            (ReadBeforeWrite, _) => ReadBeforeWrite,
            (_, Unknown) => self,
            (Unknown, n) => n,
            (Read, Write) | (Read, ReadBeforeWrite) => ReadBeforeWrite,
            (Read, Read) => Read,
            (Write, _) => Write,
        }
    }

    /// Whether this kind of reference means the capture must carry the
    /// resource's pre-frame contents. Write-only resources only need a clear
    /// on frame init.
    pub fn needs_initial_contents(self) -> bool {
        !matches!(self, FrameRef::Write)
    }
}

/// Accumulated per-resource references for one recording scope (the frame,
/// or a command list whose references merge in at submission).
#[derive(Debug, Default, Clone)]
pub struct FrameRefs {
    refs: HashMap<ResourceId, FrameRef>,
}

impl FrameRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this is the first reference to `id` in this scope.
    pub fn mark(&mut self, id: ResourceId, frame_ref: FrameRef) -> bool {
        if id.is_null() {
            return false;
        }
        match self.refs.get_mut(&id) {
            Some(existing) => {
                *existing = existing.merge(frame_ref);
                false
            }
            None => {
                self.refs.insert(id, frame_ref);
                true
            }
        }
    }

    pub fn get(&self, id: ResourceId) -> Option<FrameRef> {
        self.refs.get(&id).copied()
    }

    pub fn merge_from(&mut self, other: &FrameRefs) {
        for (&id, &frame_ref) in &other.refs {
            self.mark(id, frame_ref);
        }
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceId, FrameRef)> + '_ {
        self.refs.iter().map(|(&id, &r)| (id, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_then_write_upgrades_to_read_before_write() {
        let mut refs = FrameRefs::new();
        let id = ResourceId::from_raw(1);
        assert!(refs.mark(id, FrameRef::Read));
        assert!(!refs.mark(id, FrameRef::Write));
        assert_eq!(refs.get(id), Some(FrameRef::ReadBeforeWrite));
        assert!(refs.get(id).unwrap().needs_initial_contents());
    }

    #[test]
    fn write_then_read_stays_write() {
        let mut refs = FrameRefs::new();
        let id = ResourceId::from_raw(2);
        refs.mark(id, FrameRef::Write);
        refs.mark(id, FrameRef::Read);
        assert_eq!(refs.get(id), Some(FrameRef::Write));
        assert!(!refs.get(id).unwrap().needs_initial_contents());
    }

    #[test]
    fn unknown_is_weakest_but_still_needs_initial_contents() {
        let mut refs = FrameRefs::new();
        let id = ResourceId::from_raw(3);
        refs.mark(id, FrameRef::Unknown);
        assert!(refs.get(id).unwrap().needs_initial_contents());
        refs.mark(id, FrameRef::Write);
        assert_eq!(refs.get(id), Some(FrameRef::Write));
        // A later Unknown (re-bound in initial state of a nested scope) must
        // not weaken an established direction.
        refs.mark(id, FrameRef::Unknown);
        assert_eq!(refs.get(id), Some(FrameRef::Write));
    }

    #[test]
    fn null_ids_are_ignored() {
        let mut refs = FrameRefs::new();
        assert!(!refs.mark(ResourceId::NULL, FrameRef::Read));
        assert!(refs.is_empty());
    }
}
