// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the capture backend contract

use super::controls::ControlList;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Identity of a configured stream, assigned by the backend during `configure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

/// Identity of one hardware buffer (the dmabuf handle on real hardware)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// What a stream is used for. Stages see this as the "use case" string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    #[default]
    Viewfinder,
    StillCapture,
    VideoRecording,
    Raw,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Viewfinder => "viewfinder",
            StreamRole::StillCapture => "still",
            StreamRole::VideoRecording => "video",
            StreamRole::Raw => "raw",
        }
    }
}

/// Pixel formats the engine knows how to lay out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    /// Planar 4:2:0, three planes (Y, U, V)
    #[default]
    YUV420,
    /// Semi-planar 4:2:0, two planes (Y, interleaved UV)
    NV12,
    /// Packed 24-bit RGB
    RGB888,
    /// Packed 24-bit BGR
    BGR888,
}

impl PixelFormat {
    /// Minimum stride in bytes of the first plane
    pub fn min_stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::YUV420 | PixelFormat::NV12 => width,
            PixelFormat::RGB888 | PixelFormat::BGR888 => width * 3,
        }
    }

    /// Plane lengths in bytes for the given geometry
    pub fn plane_sizes(&self, stride: u32, height: u32) -> Vec<usize> {
        let luma = stride as usize * height as usize;
        match self {
            PixelFormat::YUV420 => {
                let chroma = (stride as usize / 2) * (height as usize).div_ceil(2);
                vec![luma, chroma, chroma]
            }
            PixelFormat::NV12 => vec![luma, stride as usize * (height as usize).div_ceil(2)],
            PixelFormat::RGB888 | PixelFormat::BGR888 => vec![luma],
        }
    }

    /// Whether this is one of the 4:2:0 YUV formats
    pub fn is_yuv420(&self) -> bool {
        matches!(self, PixelFormat::YUV420 | PixelFormat::NV12)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::YUV420 => "YUV420",
            PixelFormat::NV12 => "NV12",
            PixelFormat::RGB888 => "RGB888",
            PixelFormat::BGR888 => "BGR888",
        };
        write!(f, "{}", name)
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Rectangle in sensor pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Requested (and after negotiation, actual) configuration of one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub role: StreamRole,
    pub pixel_format: PixelFormat,
    pub size: Size,
    /// Bytes per row of the first plane; 0 lets the backend choose
    pub stride: u32,
    /// Number of buffers to allocate for this stream
    pub buffer_count: usize,
    /// Filled in by the backend during `configure`
    pub stream: Option<StreamId>,
}

impl StreamConfig {
    pub fn new(role: StreamRole, pixel_format: PixelFormat, size: Size, buffer_count: usize) -> Self {
        Self {
            role,
            pixel_format,
            size,
            stride: 0,
            buffer_count,
            stream: None,
        }
    }

    /// Frame descriptor handed to the display and to stages
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.size.width,
            height: self.size.height,
            stride: self.stride,
            pixel_format: self.pixel_format,
        }
    }
}

/// Geometry of the frames flowing on one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
}

/// A block of device memory shared with the process (a dmabuf on hardware)
///
/// Several planes, and on some platforms several buffers, may live inside the
/// same memory object at different offsets.
#[derive(Debug)]
pub struct MemoryObject {
    id: u64,
    data: RwLock<Box<[u8]>>,
}

impl MemoryObject {
    pub fn new(id: u64, length: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            data: RwLock::new(vec![0u8; length].into_boxed_slice()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over a byte range of this object
    pub(crate) fn with_range<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        f(&data[offset..offset + len])
    }

    /// Run `f` over a mutable byte range of this object
    pub(crate) fn with_range_mut<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data[offset..offset + len])
    }
}

/// One plane of a hardware buffer
#[derive(Debug, Clone)]
pub struct Plane {
    pub memory: Arc<MemoryObject>,
    pub offset: usize,
    pub length: usize,
}

/// A buffer as handed out by the backend's allocator
#[derive(Debug, Clone)]
pub struct HardwareBuffer {
    pub id: BufferId,
    pub stream: StreamId,
    pub planes: Vec<Plane>,
}

/// A request as the backend sees it when it is queued
#[derive(Debug, Clone)]
pub struct RequestSubmission {
    /// Opaque value echoed back in the completion
    pub cookie: u64,
    pub buffers: BTreeMap<StreamId, BufferId>,
    pub controls: ControlList,
}

/// Final status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Complete,
    Cancelled,
}

/// Delivered by the backend on its completion context
#[derive(Debug, Clone)]
pub struct RequestCompletion {
    pub cookie: u64,
    pub status: RequestStatus,
    pub buffers: BTreeMap<StreamId, BufferId>,
    /// Per-buffer timestamps in nanoseconds, used when the result metadata
    /// carries no sensor timestamp
    pub buffer_timestamps: BTreeMap<BufferId, u64>,
    /// Result metadata (actual exposure, gains, sensor timestamp, ...)
    pub metadata: ControlList,
}

/// Callback invoked for every finished request
pub type CompletionHandler = Arc<dyn Fn(RequestCompletion) + Send + Sync>;

/// Static description of a camera
#[derive(Debug, Clone, PartialEq)]
pub struct CameraInfo {
    pub id: String,
    pub model: String,
    /// Active pixel area of the sensor, used to turn ROI fractions into crops
    pub sensor_area: Size,
    /// Sizes the sensor can stream at
    pub modes: Vec<Size>,
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Error types for backend operations
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend is not available on this system
    NotAvailable(String),
    /// Camera device not found
    DeviceNotFound(String),
    /// No camera acquired, or the operation needs a configured camera
    NotConfigured,
    /// Format not supported
    FormatNotSupported(String),
    /// Allocator ran out of buffers or memory
    OutOfBuffers(String),
    /// Operation requires a started camera
    NotStarted,
    /// The request refers to unknown buffers or is already queued
    InvalidRequest(String),
    /// Other errors
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotAvailable(msg) => write!(f, "Backend not available: {}", msg),
            BackendError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            BackendError::NotConfigured => write!(f, "Camera not configured"),
            BackendError::FormatNotSupported(msg) => write!(f, "Format not supported: {}", msg),
            BackendError::OutOfBuffers(msg) => write!(f, "Out of buffers: {}", msg),
            BackendError::NotStarted => write!(f, "Camera not started"),
            BackendError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            BackendError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv420_plane_sizes() {
        let sizes = PixelFormat::YUV420.plane_sizes(640, 480);
        assert_eq!(sizes, vec![640 * 480, 320 * 240, 320 * 240]);
    }

    #[test]
    fn test_nv12_plane_sizes_odd_height() {
        let sizes = PixelFormat::NV12.plane_sizes(64, 5);
        assert_eq!(sizes, vec![64 * 5, 64 * 3]);
    }

    #[test]
    fn test_memory_object_ranges() {
        let memory = MemoryObject::new(7, 16);
        memory.with_range_mut(4, 4, |bytes| bytes.fill(0xAB));
        let copied = memory.with_range(0, 16, |bytes| bytes.to_vec());
        assert_eq!(&copied[4..8], &[0xAB; 4]);
        assert_eq!(copied[0], 0);
        assert_eq!(copied[8], 0);
    }
}
