use std::sync::Arc;

use optic_resource::ResourceId;

use crate::arena::{CommandListData, ObjectArena, ObjectEntry, ObjectKind, ReleaseOutcome};
use crate::driver::NativeHandle;
use crate::refcount::RefClass;

/// Shared plumbing of every wrapped object: the arena entry standing in for
/// the real driver object, plus the arena that decides its lifetime.
///
/// Cloning the handle does not touch the reference counts; the application
/// owns those through `add_ref`/`release`, exactly as it would against the
/// real API.
#[derive(Clone)]
pub struct WrappedHandle {
    id: ResourceId,
    entry: Arc<ObjectEntry>,
    arena: Arc<ObjectArena>,
}

impl WrappedHandle {
    pub fn new(entry: Arc<ObjectEntry>, arena: Arc<ObjectArena>) -> Self {
        Self {
            id: entry.id(),
            entry,
            arena,
        }
    }

    /// Stable for the object's whole lifetime.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.entry.kind()
    }

    pub fn native(&self) -> NativeHandle {
        self.entry.native()
    }

    pub fn entry(&self) -> &Arc<ObjectEntry> {
        &self.entry
    }

    pub fn is_alive(&self) -> bool {
        self.arena.contains(self.id)
    }

    /// Bump the application-visible reference count.
    pub fn add_ref(&self) -> i64 {
        self.arena.add_ref(self.id, RefClass::External).unwrap_or(0)
    }

    /// Drop one application-visible reference. Returns the remaining
    /// external count; zero does not imply destruction while soft, view or
    /// pipeline references survive.
    pub fn release(&self) -> i64 {
        match self.arena.release(self.id, RefClass::External) {
            ReleaseOutcome::Alive { class_count } => class_count,
            ReleaseOutcome::Destroyed(_) | ReleaseOutcome::NotFound => 0,
        }
    }
}

impl core::fmt::Debug for WrappedHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.id)
    }
}

macro_rules! wrapped_object {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name(WrappedHandle);

        impl $name {
            pub fn from_handle(handle: WrappedHandle) -> Self {
                Self(handle)
            }

            pub fn handle(&self) -> &WrappedHandle {
                &self.0
            }

            pub fn id(&self) -> ResourceId {
                self.0.id()
            }

            pub fn add_ref(&self) -> i64 {
                self.0.add_ref()
            }

            pub fn release(&self) -> i64 {
                self.0.release()
            }
        }
    };
}

wrapped_object!(Buffer);
wrapped_object!(Texture2d);
wrapped_object!(Sampler);
wrapped_object!(Shader);
wrapped_object!(BlendState);
wrapped_object!(DepthState);
wrapped_object!(RasterState);
wrapped_object!(
    /// View over a resource; holds a view reference on it so the resource
    /// outlives the view regardless of the application's own counts.
    RenderTargetView
);
wrapped_object!(DepthStencilView);
wrapped_object!(ShaderResourceView);
wrapped_object!(UnorderedAccessView);
wrapped_object!(
    /// A finished deferred recording, executable on the immediate context.
    CommandList
);

impl RenderTargetView {
    pub fn resource_id(&self) -> ResourceId {
        self.0.entry().parent()
    }
}

impl DepthStencilView {
    pub fn resource_id(&self) -> ResourceId {
        self.0.entry().parent()
    }
}

impl ShaderResourceView {
    pub fn resource_id(&self) -> ResourceId {
        self.0.entry().parent()
    }
}

impl UnorderedAccessView {
    pub fn resource_id(&self) -> ResourceId {
        self.0.entry().parent()
    }
}

impl CommandList {
    pub fn data(&self) -> Option<Arc<CommandListData>> {
        self.0.entry().info().command_list().cloned()
    }
}
