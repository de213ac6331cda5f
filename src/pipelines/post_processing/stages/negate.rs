// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::camera::types::{StreamConfig, StreamId};
use crate::capture::frame::CompletedFrame;
use crate::errors::{CaptureError, CaptureResult, StageError};
use crate::pipelines::post_processing::Stage;
use std::sync::Mutex;
use tracing::debug;

/// Inverts every byte of the primary stream's buffer
///
/// Only 4:2:0 YUV is accepted: inverting luma and chroma alike gives a photo
/// negative there, which is not true of packed RGB with padding.
#[derive(Default)]
pub struct NegateStage {
    stream: Mutex<Option<StreamId>>,
}

impl NegateStage {
    pub const NAME: &'static str = "negate";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for NegateStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&self, streams: &[StreamConfig]) -> CaptureResult<()> {
        let config = super::primary_stream(streams)
            .ok_or_else(|| CaptureError::Configuration("negate: no stream to work on".to_string()))?;
        let stream = config.stream.ok_or_else(|| {
            CaptureError::Configuration("negate: stream was never negotiated".to_string())
        })?;
        if !config.pixel_format.is_yuv420() {
            return Err(CaptureError::Configuration(format!(
                "negate: unsupported pixel format {}",
                config.pixel_format
            )));
        }

        debug!(stream = %stream, size = %config.size, "Negate stage configured");
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
        Ok(())
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        let Some(stream) = *self.stream.lock().unwrap_or_else(|e| e.into_inner()) else {
            return Err(StageError::new(Self::NAME, "not configured"));
        };
        let buffer = frame
            .buffer(stream)
            .ok_or_else(|| StageError::new(Self::NAME, format!("frame has no {} buffer", stream)))?;

        for span in &buffer.spans {
            span.write(|bytes| bytes.iter_mut().for_each(|b| *b = !*b));
        }
        Ok(false)
    }
}
