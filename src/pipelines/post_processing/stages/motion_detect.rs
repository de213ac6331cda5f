// SPDX-License-Identifier: GPL-3.0-only

//! Luma-difference motion detector
//!
//! Every `frame_period` frames the luma samples inside the region of interest
//! are compared with the samples kept from the previous check. A sample has
//! changed when `|new - old| > old * difference_m + difference_c`; motion is
//! reported when the changed fraction of the region reaches
//! `region_threshold`. The latest verdict is attached to every frame.

use crate::backends::camera::types::{StreamConfig, StreamId};
use crate::capture::frame::CompletedFrame;
use crate::errors::{CaptureError, CaptureResult, StageError};
use crate::pipelines::post_processing::Stage;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{debug, info};

/// Key the verdict is published under in the post-process metadata
pub const MOTION_RESULT_KEY: &str = "motion_detect.result";

/// Parameters read from the post-process document
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotionDetectConfig {
    /// Region of interest as fractions of the image
    pub roi_x: f32,
    pub roi_y: f32,
    pub roi_width: f32,
    pub roi_height: f32,
    /// Sample every `hskip`-th pixel of every `vskip`-th row
    pub hskip: u32,
    pub vskip: u32,
    pub difference_m: f32,
    pub difference_c: i32,
    /// Fraction of changed samples that counts as motion
    pub region_threshold: f32,
    /// Only every `frame_period`-th frame is examined
    pub frame_period: u64,
    /// Log every change of verdict at info level
    pub verbose: bool,
}

impl Default for MotionDetectConfig {
    fn default() -> Self {
        Self {
            roi_x: 0.0,
            roi_y: 0.0,
            roi_width: 1.0,
            roi_height: 1.0,
            hskip: 1,
            vskip: 1,
            difference_m: 0.1,
            difference_c: 10,
            region_threshold: 0.005,
            frame_period: 5,
            verbose: false,
        }
    }
}

impl MotionDetectConfig {
    fn validate(&self) -> CaptureResult<()> {
        let fraction = |v: f32| (0.0..=1.0).contains(&v);
        if !(fraction(self.roi_x)
            && fraction(self.roi_y)
            && fraction(self.roi_width)
            && fraction(self.roi_height)
            && self.roi_x + self.roi_width <= 1.0
            && self.roi_y + self.roi_height <= 1.0)
        {
            return Err(CaptureError::Configuration(
                "motion_detect: region of interest must lie inside the image".to_string(),
            ));
        }
        if self.hskip == 0 || self.vskip == 0 || self.frame_period == 0 {
            return Err(CaptureError::Configuration(
                "motion_detect: hskip, vskip and frame_period must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sample grid inside the luma plane
#[derive(Debug, Clone, Copy)]
struct Region {
    stream: StreamId,
    stride: usize,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    hskip: usize,
    vskip: usize,
}

impl Region {
    fn samples(&self) -> usize {
        self.width.div_ceil(self.hskip) * self.height.div_ceil(self.vskip)
    }
}

#[derive(Default)]
struct MotionState {
    region: Option<Region>,
    previous: Vec<u8>,
    primed: bool,
    motion: bool,
}

pub struct MotionDetectStage {
    config: MotionDetectConfig,
    state: Mutex<MotionState>,
}

impl Default for MotionDetectStage {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionDetectStage {
    pub const NAME: &'static str = "motion_detect";

    pub fn new() -> Self {
        Self::with_config(MotionDetectConfig::default())
    }

    pub fn with_config(config: MotionDetectConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MotionState::default()),
        }
    }

    pub fn config(&self) -> &MotionDetectConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MotionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Stage for MotionDetectStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn read(&mut self, params: &Value) -> CaptureResult<()> {
        let config: MotionDetectConfig = if params.is_null() {
            MotionDetectConfig::default()
        } else {
            serde_json::from_value(params.clone()).map_err(|e| {
                CaptureError::Configuration(format!("motion_detect: invalid parameters: {}", e))
            })?
        };
        config.validate()?;
        self.config = config;
        Ok(())
    }

    fn configure(&self, streams: &[StreamConfig]) -> CaptureResult<()> {
        let stream = super::primary_stream(streams).ok_or_else(|| {
            CaptureError::Configuration("motion_detect: no stream to work on".to_string())
        })?;
        let id = stream.stream.ok_or_else(|| {
            CaptureError::Configuration("motion_detect: stream was never negotiated".to_string())
        })?;
        if !stream.pixel_format.is_yuv420() {
            return Err(CaptureError::Configuration(format!(
                "motion_detect: unsupported pixel format {}",
                stream.pixel_format
            )));
        }

        let width = stream.size.width as f32;
        let height = stream.size.height as f32;
        let region = Region {
            stream: id,
            stride: stream.stride as usize,
            x: (self.config.roi_x * width) as usize,
            y: (self.config.roi_y * height) as usize,
            width: ((self.config.roi_width * width) as usize).max(1),
            height: ((self.config.roi_height * height) as usize).max(1),
            hskip: self.config.hskip as usize,
            vskip: self.config.vskip as usize,
        };
        debug!(
            stream = %id,
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            samples = region.samples(),
            "Motion detection region"
        );

        let mut state = self.lock();
        state.region = Some(region);
        state.previous = vec![0; region.samples()];
        state.primed = false;
        state.motion = false;
        Ok(())
    }

    fn start(&self) {
        let mut state = self.lock();
        state.primed = false;
        state.motion = false;
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        let mut state = self.lock();
        let Some(region) = state.region else {
            return Err(StageError::new(Self::NAME, "not configured"));
        };

        if frame.sequence() % self.config.frame_period == 0 {
            let span = frame.span(region.stream).ok_or_else(|| {
                StageError::new(Self::NAME, format!("frame has no {} buffer", region.stream))
            })?;
            let last_row = (region.y + region.height - 1) * region.stride;
            if last_row + region.x + region.width > span.len() {
                return Err(StageError::new(Self::NAME, "region lies outside the buffer"));
            }

            let MotionState { previous, primed, .. } = &mut *state;
            let changed = span.read(|luma| compare_and_update(&region, luma, previous, &self.config));
            let motion = *primed && changed as f32 >= self.config.region_threshold * region.samples() as f32;
            *primed = true;

            if motion != state.motion && self.config.verbose {
                info!(sequence = frame.sequence(), motion, changed, "Motion detection changed");
            }
            state.motion = motion;
        }

        frame.post_process_metadata().set(MOTION_RESULT_KEY, state.motion);
        Ok(false)
    }
}

/// Count changed samples and store the new ones as the reference
fn compare_and_update(region: &Region, luma: &[u8], previous: &mut [u8], config: &MotionDetectConfig) -> usize {
    let mut changed = 0;
    let mut index = 0;
    for row in (region.y..region.y + region.height).step_by(region.vskip) {
        let start = row * region.stride + region.x;
        let samples = luma[start..start + region.width].iter().step_by(region.hskip);
        for &new in samples {
            let old = previous[index];
            let threshold = old as f32 * config.difference_m + config.difference_c as f32;
            if (new as i32 - old as i32).abs() as f32 > threshold {
                changed += 1;
            }
            previous[index] = new;
            index += 1;
        }
    }
    changed
}
