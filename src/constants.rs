// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Viewfinder stream defaults
pub mod viewfinder {
    /// Default viewfinder width in pixels
    pub const DEFAULT_WIDTH: u32 = 640;

    /// Default viewfinder height in pixels
    pub const DEFAULT_HEIGHT: u32 = 480;

    /// Buffers per stream; every capture request holds one of each stream
    pub const DEFAULT_BUFFER_COUNT: usize = 4;
}

/// Camera selection
pub mod camera {
    /// Identifier of the built-in virtual camera
    pub const VIRTUAL_CAMERA_ID: &str = "virtual0";

    /// Frame rate of the virtual camera when none is requested
    pub const VIRTUAL_CAMERA_FPS: f64 = 30.0;
}

/// Image tuning defaults, matching the neutral setting of each control
pub mod tuning {
    pub const BRIGHTNESS: f32 = 0.0;
    pub const CONTRAST: f32 = 1.0;
    pub const SATURATION: f32 = 1.0;
    pub const SHARPNESS: f32 = 1.0;
    pub const EV: f32 = 0.0;
    pub const METERING: &str = "centre";
    pub const EXPOSURE: &str = "normal";
    pub const AWB: &str = "auto";
    /// Leave noise reduction to the camera's own default
    pub const DENOISE: &str = "auto";
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// Default run time of the preview loop in milliseconds (0 runs forever)
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

    /// Log a progress line every N frames
    pub const FRAME_LOG_INTERVAL: u64 = 30;

    /// How long the run loop waits for an event before checking the deadline
    pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// Preview overlay
pub mod preview {
    /// Default info-text template
    pub const DEFAULT_INFO_TEXT: &str = "#%frame (%fps fps) exp %exp ag %ag dg %dg";
}
