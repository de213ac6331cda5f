// SPDX-License-Identifier: GPL-3.0-only

//! Capture backend abstraction
//!
//! ```text
//! ┌─────────────────────┐
//! │    CaptureEngine    │  ← Requests, recycling, sequence numbers
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CaptureBackend Trait│  ← Negotiation, buffers, submit, completions
//! └──────────┬──────────┘
//!            │
//!            ▼
//!     ┌──────────────┐
//!     │VirtualCamera │  ← Test-pattern sensor
//!     └──────────────┘
//! ```
//!
//! The engine depends only on this contract. Tuning algorithms (exposure,
//! focus, white balance) live behind it and are never visible here.

pub mod buffer_pool;
pub mod controls;
pub mod types;

pub use buffer_pool::{BufferPool, MappedSpan};
pub use controls::{ControlChannel, ControlId, ControlList, ControlValue};
pub use types::*;

/// Contract between the capture engine and a camera backend
///
/// Every method takes `&self`: the engine shares one backend between the
/// caller's thread, the completion context and whichever thread releases the
/// last reference to a frame.
pub trait CaptureBackend: Send + Sync {
    // ===== Enumeration =====

    /// Cameras this backend can open
    fn cameras(&self) -> Vec<CameraInfo>;

    // ===== Lifecycle =====

    /// Take exclusive ownership of a camera
    fn acquire(&self, camera_id: &str) -> BackendResult<CameraInfo>;

    /// Give the camera back. Buffers must have been freed first.
    fn release(&self);

    /// Negotiate stream configurations
    ///
    /// The backend may adjust size, stride and buffer count, and assigns a
    /// [`StreamId`] to each config.
    fn configure(&self, configs: &mut [StreamConfig]) -> BackendResult<()>;

    // ===== Buffers =====

    /// Allocate the buffers of a configured stream
    fn allocate(&self, stream: StreamId) -> BackendResult<Vec<HardwareBuffer>>;

    /// Release the buffers of a stream
    fn free(&self, stream: StreamId) -> BackendResult<()>;

    // ===== Streaming =====

    /// Start streaming with an initial control list
    fn start(&self, controls: &ControlList) -> BackendResult<()>;

    /// Stop streaming
    ///
    /// Requests still queued are completed with [`RequestStatus::Cancelled`]
    /// before this returns.
    fn stop(&self) -> BackendResult<()>;

    /// Queue a request for capture
    fn submit(&self, request: RequestSubmission) -> BackendResult<()>;

    /// Register (or with `None`, remove) the completion callback
    ///
    /// The callback runs on the backend's completion context and must not
    /// block.
    fn set_completion_handler(&self, handler: Option<CompletionHandler>);
}
