// SPDX-License-Identifier: GPL-3.0-only

//! Stages shipped with the crate
//!
//! - [`NegateStage`]: inverts the image in place
//! - [`MotionDetectStage`]: flags frames whose luma changed in a region of
//!   interest and publishes the result as `motion_detect.result`

mod motion_detect;
mod negate;

pub use motion_detect::{MOTION_RESULT_KEY, MotionDetectConfig, MotionDetectStage};
pub use negate::NegateStage;

use crate::backends::camera::types::{StreamConfig, StreamRole};

/// The stream a single-stream stage works on: the viewfinder if there is one,
/// otherwise the first stream
pub(crate) fn primary_stream(streams: &[StreamConfig]) -> Option<&StreamConfig> {
    streams
        .iter()
        .find(|config| config.role == StreamRole::Viewfinder)
        .or_else(|| streams.first())
}
