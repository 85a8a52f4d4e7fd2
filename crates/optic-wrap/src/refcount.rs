use std::sync::atomic::{AtomicI64, Ordering};

/// The independent reasons a wrapped object is kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefClass {
    /// Application-visible AddRef/Release count.
    External,
    /// Internal device-lifetime reference, invisible to the application.
    Soft,
    /// Held by a dependent sub-object (a view over a resource, a command
    /// list over its context).
    View,
    /// Held while the object is bound somewhere in a live render state.
    Pipeline,
}

/// Per-entry reference counters. The combined total is the single
/// destruction decision point: exactly one `release` call observes the
/// 1 -> 0 transition and gets told to destroy.
#[derive(Debug, Default)]
pub struct RefCounts {
    external: AtomicI64,
    soft: AtomicI64,
    view: AtomicI64,
    pipeline: AtomicI64,
    total: AtomicI64,
}

impl RefCounts {
    /// Counts for a freshly created object: the creating application holds
    /// one external reference.
    pub fn new_owned() -> Self {
        let counts = RefCounts::default();
        counts.external.store(1, Ordering::Relaxed);
        counts.total.store(1, Ordering::Relaxed);
        counts
    }

    fn class(&self, class: RefClass) -> &AtomicI64 {
        match class {
            RefClass::External => &self.external,
            RefClass::Soft => &self.soft,
            RefClass::View => &self.view,
            RefClass::Pipeline => &self.pipeline,
        }
    }

    /// Returns the new count for `class`.
    pub fn add(&self, class: RefClass) -> i64 {
        let n = self.class(class).fetch_add(1, Ordering::AcqRel) + 1;
        self.total.fetch_add(1, Ordering::AcqRel);
        n
    }

    /// Returns the new count for `class` and whether this release was the
    /// one that dropped the combined total to zero. A negative count is an
    /// invariant violation; continuing past it risks a double free of the
    /// native object, so it panics.
    pub fn release(&self, class: RefClass) -> (i64, bool) {
        let n = self.class(class).fetch_sub(1, Ordering::AcqRel) - 1;
        if n < 0 {
            panic!("negative {class:?} refcount");
        }
        let prev_total = self.total.fetch_sub(1, Ordering::AcqRel);
        if prev_total <= 0 {
            panic!("negative combined refcount");
        }
        (n, prev_total == 1)
    }

    pub fn external(&self) -> i64 {
        self.external.load(Ordering::Acquire)
    }

    pub fn soft(&self) -> i64 {
        self.soft.load(Ordering::Acquire)
    }

    pub fn view(&self) -> i64 {
        self.view.load(Ordering::Acquire)
    }

    pub fn pipeline(&self) -> i64 {
        self.pipeline.load(Ordering::Acquire)
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }
}
