// SPDX-License-Identifier: GPL-3.0-only

//! camflow - frame capture lifecycle manager
//!
//! Drives a camera through a fixed pool of capture requests, wraps every
//! finished capture in a reference-counted frame that returns its buffers to
//! the camera when the last holder lets go, and runs configurable
//! post-processing stages concurrently while delivering frames in capture
//! order.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`backends`]: Camera backend contract, buffer pool, controls and the
//!   virtual camera
//! - [`capture`]: Capture engine, requests and the completed-frame envelope
//! - [`pipelines`]: Ordered post-processing pipeline and its stages
//! - [`preview`]: Drop-if-busy preview channel and displays
//! - [`app`]: Application shell and event loop
//! - [`config`]: Application options
//!
//! # Example
//!
//! ```ignore
//! let options = Options::default();
//! let mut app = CameraApp::new(options, StageRegistry::with_builtin_stages(), Box::new(NullDisplay::new()))?;
//! app.open_camera(Arc::new(VirtualCamera::default()))?;
//! run_hello(&mut app, Some(Duration::from_secs(5)))?;
//! ```

pub mod app;
pub mod backends;
pub mod capture;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod preview;

// Re-export commonly used types
pub use app::{AppEvent, CameraApp};
pub use capture::{CaptureEngine, CompletedFrame, FrameHandle};
pub use config::Options;
pub use errors::{CaptureError, CaptureResult, StageError};
