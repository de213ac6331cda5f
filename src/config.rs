// SPDX-License-Identifier: GPL-3.0-only

//! Application options
//!
//! Options come from an optional JSON file and are then overridden field by
//! field from the command line. Every field has a default, so a file only
//! needs to name what it changes.

use crate::backends::camera::controls::{
    AwbMode, ControlId, ControlList, ControlValue, DenoiseMode, ExposureProfile, MeteringMode,
};
use crate::backends::camera::types::{PixelFormat, Rectangle, Size};
use crate::constants::{camera, preview, timing, tuning, viewfinder};
use crate::errors::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Camera to open
    pub camera: String,
    /// Viewfinder size
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Buffers per stream
    pub buffer_count: usize,
    /// Fixed frame rate; unset lets the camera choose
    pub framerate: Option<f64>,
    /// Run time in milliseconds, 0 runs until quit
    pub timeout_ms: u64,
    /// Fixed exposure time in microseconds
    pub shutter_us: Option<u64>,
    /// Fixed analogue gain
    pub gain: Option<f32>,
    /// Exposure compensation in stops
    pub ev: f32,
    pub metering: String,
    pub exposure: String,
    pub awb: String,
    /// Fixed red and blue gains, which disable auto white balance
    pub awb_gains: Option<[f32; 2]>,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub sharpness: f32,
    pub denoise: String,
    /// Region of interest as fractions of the sensor: x, y, width, height
    pub roi: Option<[f32; 4]>,
    /// Info-text template shown with the preview
    pub info_text: String,
    /// JSON post-process document
    pub post_process_file: Option<PathBuf>,
    /// Run without a preview window
    pub nopreview: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            camera: camera::VIRTUAL_CAMERA_ID.to_string(),
            width: viewfinder::DEFAULT_WIDTH,
            height: viewfinder::DEFAULT_HEIGHT,
            pixel_format: PixelFormat::YUV420,
            buffer_count: viewfinder::DEFAULT_BUFFER_COUNT,
            framerate: None,
            timeout_ms: timing::DEFAULT_TIMEOUT_MS,
            shutter_us: None,
            gain: None,
            ev: tuning::EV,
            metering: tuning::METERING.to_string(),
            exposure: tuning::EXPOSURE.to_string(),
            awb: tuning::AWB.to_string(),
            awb_gains: None,
            brightness: tuning::BRIGHTNESS,
            contrast: tuning::CONTRAST,
            saturation: tuning::SATURATION,
            sharpness: tuning::SHARPNESS,
            denoise: tuning::DENOISE.to_string(),
            roi: None,
            info_text: preview::DEFAULT_INFO_TEXT.to_string(),
            post_process_file: None,
            nopreview: false,
        }
    }
}

impl Options {
    /// Read options from a JSON file and validate them
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CaptureError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let options: Options = serde_json::from_str(&text)?;
        options.validate()?;
        debug!(path = %path.display(), "Loaded options");
        Ok(options)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        let invalid = |msg: String| Err(CaptureError::Configuration(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!("invalid viewfinder size {}x{}", self.width, self.height));
        }
        if self.buffer_count == 0 {
            return invalid("buffer_count must be at least 1".to_string());
        }
        if let Some(fps) = self.framerate
            && !(fps > 0.0 && fps.is_finite())
        {
            return invalid(format!("invalid framerate {}", fps));
        }
        if MeteringMode::from_name(&self.metering).is_none() {
            return invalid(format!("unknown metering mode \"{}\"", self.metering));
        }
        if ExposureProfile::from_name(&self.exposure).is_none() {
            return invalid(format!("unknown exposure mode \"{}\"", self.exposure));
        }
        if AwbMode::from_name(&self.awb).is_none() {
            return invalid(format!("unknown awb mode \"{}\"", self.awb));
        }
        if self.denoise != tuning::DENOISE && DenoiseMode::from_name(&self.denoise).is_none() {
            return invalid(format!("unknown denoise mode \"{}\"", self.denoise));
        }
        if !(-1.0..=1.0).contains(&self.brightness) {
            return invalid(format!("brightness {} outside [-1, 1]", self.brightness));
        }
        if self.contrast < 0.0 || self.saturation < 0.0 || self.sharpness < 0.0 {
            return invalid("contrast, saturation and sharpness must not be negative".to_string());
        }
        if let Some([x, y, w, h]) = self.roi {
            let fraction = |v: f32| (0.0..=1.0).contains(&v);
            if !(fraction(x) && fraction(y) && w > 0.0 && h > 0.0 && x + w <= 1.0 && y + h <= 1.0) {
                return invalid("roi must lie inside the sensor area".to_string());
            }
        }
        Ok(())
    }

    /// Viewfinder size requested by the options
    pub fn viewfinder_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Controls applied at start unless the caller already staged them
    pub fn base_controls(&self, sensor_area: Size) -> CaptureResult<ControlList> {
        self.validate()?;
        let mut controls = ControlList::new();

        if let Some(mode) = MeteringMode::from_name(&self.metering) {
            controls.set(ControlId::AeMeteringMode, ControlValue::Int(mode.value()));
        }
        if let Some(mode) = ExposureProfile::from_name(&self.exposure) {
            controls.set(ControlId::AeExposureMode, ControlValue::Int(mode.value()));
        }
        controls.set(ControlId::ExposureValue, ControlValue::Float(self.ev));
        if let Some(shutter) = self.shutter_us {
            controls.set(ControlId::ExposureTime, ControlValue::Int(shutter as i64));
        }
        if let Some(gain) = self.gain {
            controls.set(ControlId::AnalogueGain, ControlValue::Float(gain));
        }

        if let Some(mode) = AwbMode::from_name(&self.awb) {
            controls.set(ControlId::AwbMode, ControlValue::Int(mode.value()));
        }
        if let Some(gains) = self.awb_gains {
            controls.set(ControlId::ColourGains, ControlValue::FloatPair(gains));
        }

        controls.set(ControlId::Brightness, ControlValue::Float(self.brightness));
        controls.set(ControlId::Contrast, ControlValue::Float(self.contrast));
        controls.set(ControlId::Saturation, ControlValue::Float(self.saturation));
        controls.set(ControlId::Sharpness, ControlValue::Float(self.sharpness));
        if let Some(mode) = DenoiseMode::from_name(&self.denoise) {
            controls.set(ControlId::NoiseReductionMode, ControlValue::Int(mode.value()));
        }

        if let Some([x, y, w, h]) = self.roi {
            let width = sensor_area.width as f32;
            let height = sensor_area.height as f32;
            controls.set(
                ControlId::ScalerCrop,
                ControlValue::Rect(Rectangle {
                    x: (x * width) as i32,
                    y: (y * height) as i32,
                    width: (w * width) as u32,
                    height: (h * height) as u32,
                }),
            );
        }

        if let Some(fps) = self.framerate {
            let frame_time = (1e6 / fps) as i64;
            controls.set(
                ControlId::FrameDurationLimits,
                ControlValue::IntPair([frame_time, frame_time]),
            );
        }

        Ok(controls)
    }
}
