// SPDX-License-Identifier: GPL-3.0-only

//! Capture lifecycle
//!
//! ```text
//!   Idle ──submit──▶ Submitted ──complete──▶ Completed ──last release──▶ Idle/Submitted
//!                        │
//!                        └──cancel──▶ Idle
//! ```
//!
//! - [`engine`]: Owns the requests and drives the backend
//! - [`frame`]: Reference-counted completed frame, recycled on last release
//! - [`request`]: Capture request bookkeeping

pub mod engine;
pub mod frame;
pub mod request;

pub use engine::CaptureEngine;
pub use frame::{CompletedFrame, FrameBuffer, FrameHandle, PostProcessMetadata};
pub use request::{RequestCounts, RequestState};
