// SPDX-License-Identifier: GPL-3.0-only

use super::{Display, DoneCallback};
use crate::backends::camera::buffer_pool::MappedSpan;
use crate::backends::camera::types::{BufferId, StreamInfo};
use crate::errors::CaptureResult;
use std::time::Duration;
use tracing::trace;

/// Display that shows nothing and hands every buffer straight back
///
/// An optional render time makes it behave like a slow display, which is
/// handy for exercising preview backpressure.
#[derive(Default)]
pub struct NullDisplay {
    render_time: Duration,
    done: Option<DoneCallback>,
    info_text: String,
}

impl NullDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend `render_time` on every frame before releasing it
    pub fn with_render_time(render_time: Duration) -> Self {
        Self {
            render_time,
            ..Self::default()
        }
    }
}

impl Display for NullDisplay {
    fn set_info_text(&mut self, text: &str) {
        self.info_text.clear();
        self.info_text.push_str(text);
    }

    fn show(&mut self, buffer: BufferId, span: &MappedSpan, info: &StreamInfo) -> CaptureResult<()> {
        trace!(
            buffer = %buffer,
            bytes = span.len(),
            width = info.width,
            height = info.height,
            info = %self.info_text,
            "Null display frame"
        );
        if !self.render_time.is_zero() {
            std::thread::sleep(self.render_time);
        }
        if let Some(done) = &self.done {
            done(buffer);
        }
        Ok(())
    }

    fn set_done_callback(&mut self, callback: DoneCallback) {
        self.done = Some(callback);
    }

    fn reset(&mut self) {}

    fn max_image_size(&self) -> (u32, u32) {
        (0, 0)
    }

    fn quit(&mut self) -> bool {
        false
    }
}
