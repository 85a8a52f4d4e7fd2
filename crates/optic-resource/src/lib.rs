//! Resource identity virtualization.
//!
//! Every interceptable driver object gets a process-unique, serializable
//! [`ResourceId`] at wrap time. The [`Registry`] keeps the id-keyed maps both
//! sides need: capture-side records (chunk streams, dirty state, frame
//! references, initial contents) and replay-side bindings from captured ids
//! to the objects re-created for this session.

mod frame_ref;
mod id;
mod record;
mod registry;
mod sharded;

pub use crate::frame_ref::{FrameRef, FrameRefs};
pub use crate::id::{IdAllocator, IdReadExt, IdWriteExt, ResourceId};
pub use crate::record::ResourceRecord;
pub use crate::registry::{InitialContents, Registry, Role};
