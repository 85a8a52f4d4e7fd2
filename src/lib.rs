//! Live interception layer for a graphics API: wraps a driver, records a
//! bounded window of API activity into a replayable capture, and replays it
//! deterministically, fully or up to an arbitrary event.
//!
//! The member crates split along the engine's seams:
//! - [`optic_chunk`]: the chunked serialization protocol.
//! - [`optic_resource`]: resource identity, records, dirty tracking.
//! - [`optic_wrap`]: the wrapped-object layer, driver trait and render
//!   state.
//! - [`optic_capture`]: device/context proxies, capture state machine,
//!   container format, replay controller.

pub use optic_capture as capture;
pub use optic_chunk as chunk;
pub use optic_resource as resource;
pub use optic_wrap as wrap;
