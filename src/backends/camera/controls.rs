// SPDX-License-Identifier: GPL-3.0-only

//! Camera controls and the pending-control channel
//!
//! A [`ControlList`] is both the request side (what the application wants the
//! next exposure to use) and the result side (what the sensor actually did,
//! attached to every completed frame).
//!
//! The [`ControlChannel`] stages one batch of changes for exactly one future
//! request. It is guarded by its own lock so that producers never contend with
//! the engine's stop/recycle path.

use super::types::Rectangle;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Control identifiers understood by the engine and the virtual backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlId {
    AeEnable,
    /// Exposure time in microseconds
    ExposureTime,
    AnalogueGain,
    DigitalGain,
    AeMeteringMode,
    AeExposureMode,
    ExposureValue,
    AeLocked,
    AwbEnable,
    AwbMode,
    /// Red and blue gains
    ColourGains,
    ColourTemperature,
    /// Crop region in sensor coordinates
    ScalerCrop,
    /// Min/max frame duration in microseconds
    FrameDurationLimits,
    FrameDuration,
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    NoiseReductionMode,
    AfMode,
    LensPosition,
    FocusFoM,
    /// Start of exposure in nanoseconds
    SensorTimestamp,
    Lux,
}

/// Value of a single control
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    IntPair([i64; 2]),
    FloatPair([f32; 2]),
    Rect(Rectangle),
}

/// Auto white balance mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwbMode {
    Auto,
    Incandescent,
    Tungsten,
    Fluorescent,
    Indoor,
    Daylight,
    Cloudy,
    Custom,
}

impl AwbMode {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "auto" | "normal" => AwbMode::Auto,
            "incandescent" => AwbMode::Incandescent,
            "tungsten" => AwbMode::Tungsten,
            "fluorescent" => AwbMode::Fluorescent,
            "indoor" => AwbMode::Indoor,
            "daylight" => AwbMode::Daylight,
            "cloudy" => AwbMode::Cloudy,
            "custom" => AwbMode::Custom,
            _ => return None,
        })
    }

    pub fn value(&self) -> i64 {
        *self as i64
    }
}

/// Auto exposure metering mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteringMode {
    Centre,
    Spot,
    Average,
    Custom,
}

impl MeteringMode {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "centre" | "center" => MeteringMode::Centre,
            "spot" => MeteringMode::Spot,
            "average" | "matrix" => MeteringMode::Average,
            "custom" => MeteringMode::Custom,
            _ => return None,
        })
    }

    pub fn value(&self) -> i64 {
        *self as i64
    }
}

/// Auto exposure profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureProfile {
    Normal,
    Short,
    Long,
    Custom,
}

impl ExposureProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "normal" => ExposureProfile::Normal,
            "sport" | "short" => ExposureProfile::Short,
            "long" => ExposureProfile::Long,
            "custom" => ExposureProfile::Custom,
            _ => return None,
        })
    }

    pub fn value(&self) -> i64 {
        *self as i64
    }
}

/// Noise reduction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenoiseMode {
    Off,
    Fast,
    HighQuality,
    Minimal,
}

impl DenoiseMode {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "off" => DenoiseMode::Off,
            "cdn_fast" | "fast" => DenoiseMode::Fast,
            "cdn_hq" | "high_quality" => DenoiseMode::HighQuality,
            "cdn_off" | "minimal" => DenoiseMode::Minimal,
            _ => return None,
        })
    }

    pub fn value(&self) -> i64 {
        *self as i64
    }
}

/// Ordered set of control values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlList {
    values: BTreeMap<ControlId, ControlValue>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a control, replacing any previous value
    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        self.values.insert(id, value);
    }

    /// Set a control only if the list does not already carry it
    ///
    /// Returns true when the value was applied.
    pub fn set_if_absent(&mut self, id: ControlId, value: ControlValue) -> bool {
        if self.values.contains_key(&id) {
            return false;
        }
        self.values.insert(id, value);
        true
    }

    pub fn get(&self, id: ControlId) -> Option<ControlValue> {
        self.values.get(&id).copied()
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.values.contains_key(&id)
    }

    pub fn remove(&mut self, id: ControlId) -> Option<ControlValue> {
        self.values.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, ControlValue)> + '_ {
        self.values.iter().map(|(id, value)| (*id, *value))
    }

    /// Copy every entry of `other` into this list, overwriting on conflict
    pub fn merge(&mut self, other: &ControlList) {
        for (id, value) in other.iter() {
            self.values.insert(id, value);
        }
    }

    pub fn get_i64(&self, id: ControlId) -> Option<i64> {
        match self.get(id)? {
            ControlValue::Int(v) => Some(v),
            ControlValue::Bool(b) => Some(b as i64),
            _ => None,
        }
    }

    pub fn get_f32(&self, id: ControlId) -> Option<f32> {
        match self.get(id)? {
            ControlValue::Float(v) => Some(v),
            ControlValue::Int(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn get_bool(&self, id: ControlId) -> Option<bool> {
        match self.get(id)? {
            ControlValue::Bool(b) => Some(b),
            ControlValue::Int(v) => Some(v != 0),
            _ => None,
        }
    }

    pub fn get_float_pair(&self, id: ControlId) -> Option<[f32; 2]> {
        match self.get(id)? {
            ControlValue::FloatPair(pair) => Some(pair),
            _ => None,
        }
    }

    pub fn get_int_pair(&self, id: ControlId) -> Option<[i64; 2]> {
        match self.get(id)? {
            ControlValue::IntPair(pair) => Some(pair),
            _ => None,
        }
    }

    pub fn get_rect(&self, id: ControlId) -> Option<Rectangle> {
        match self.get(id)? {
            ControlValue::Rect(rect) => Some(rect),
            _ => None,
        }
    }
}

impl FromIterator<(ControlId, ControlValue)> for ControlList {
    fn from_iter<T: IntoIterator<Item = (ControlId, ControlValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Pending control batch for the next submitted request
#[derive(Debug, Default)]
pub struct ControlChannel {
    pending: Mutex<ControlList>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole pending batch (last writer wins)
    pub fn set(&self, controls: ControlList) {
        debug!(count = controls.len(), "Staging control batch");
        *self.lock() = controls;
    }

    /// Take the pending batch, leaving an empty one behind
    pub fn consume(&self) -> ControlList {
        std::mem::take(&mut *self.lock())
    }

    /// Fill in every control from `base` the caller has not set yet
    pub fn merge_defaults(&self, base: &ControlList) {
        let mut pending = self.lock();
        for (id, value) in base.iter() {
            pending.set_if_absent(id, value);
        }
    }

    /// Copy of the pending batch without consuming it
    pub fn snapshot(&self) -> ControlList {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlList> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
