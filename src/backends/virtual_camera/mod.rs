// SPDX-License-Identifier: GPL-3.0-only

//! Virtual camera backend
//!
//! A software sensor that implements [`CaptureBackend`] with the same buffer
//! ownership rules as real hardware: a buffer can be queued only once, queued
//! requests complete in FIFO order, and stopping cancels whatever is still
//! queued.
//!
//! Two pacing modes are available:
//!
//! - [`Pacing::FreeRunning`]: a completion thread emits frames at a fixed rate
//!   (or at the rate requested through `FrameDurationLimits`).
//! - [`Pacing::Manual`]: nothing completes until the owner calls
//!   [`VirtualCamera::complete_next`]. Completions then run on the caller's
//!   thread, which makes engine behaviour deterministic under test.

mod test_pattern;

use crate::backends::camera::controls::{ControlId, ControlList, ControlValue};
use crate::backends::camera::types::*;
use crate::backends::camera::CaptureBackend;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Default frame interval when nothing else is known (30 fps)
const DEFAULT_FRAME_INTERVAL_NS: u64 = 33_333_333;

/// Row alignment applied to negotiated strides
const STRIDE_ALIGN: u32 = 32;

/// How completions are produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// A background thread completes requests at this frame rate
    FreeRunning { fps: f64 },
    /// The owner drives completions with `complete_next`
    Manual,
}

/// Construction parameters for a virtual camera
#[derive(Debug, Clone)]
pub struct VirtualCameraConfig {
    pub id: String,
    pub model: String,
    pub sensor_area: Size,
    pub pacing: Pacing,
    /// Largest buffer count the allocator will hand out per stream
    pub max_buffers: usize,
    /// Put all planes of a buffer into one memory object (like a single dmabuf)
    pub shared_plane_memory: bool,
    /// Attach `SensorTimestamp` to result metadata; when false only per-buffer
    /// timestamps are provided
    pub sensor_timestamps: bool,
}

impl Default for VirtualCameraConfig {
    fn default() -> Self {
        Self {
            id: "virtual0".to_string(),
            model: "camflow-virtual".to_string(),
            sensor_area: Size::new(1920, 1080),
            pacing: Pacing::FreeRunning { fps: 30.0 },
            max_buffers: 16,
            shared_plane_memory: true,
            sensor_timestamps: true,
        }
    }
}

impl VirtualCameraConfig {
    /// A manually driven camera, the usual choice for tests
    pub fn manual() -> Self {
        Self {
            pacing: Pacing::Manual,
            ..Self::default()
        }
    }
}

struct ConfiguredStream {
    config: StreamConfig,
    buffers: Vec<HardwareBuffer>,
}

#[derive(Default)]
struct SensorState {
    acquired: bool,
    streams: Vec<ConfiguredStream>,
    buffer_index: HashMap<BufferId, (usize, usize)>,
    started: bool,
    queue: VecDeque<RequestSubmission>,
    queued_buffers: HashSet<BufferId>,
    /// Controls persist across requests, like on a real sensor
    controls: ControlList,
    frame_count: u64,
    timestamp_ns: u64,
    next_buffer_id: u64,
    next_memory_id: u64,
    reject_submissions: bool,
}

struct Shared {
    config: VirtualCameraConfig,
    state: Mutex<SensorState>,
    wake: Condvar,
    handler: Mutex<Option<CompletionHandler>>,
    worker_stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Software camera implementing the capture backend contract
#[derive(Clone)]
pub struct VirtualCamera {
    shared: Arc<Shared>,
}

impl Default for VirtualCamera {
    fn default() -> Self {
        Self::new(VirtualCameraConfig::default())
    }
}

impl VirtualCamera {
    pub fn new(config: VirtualCameraConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SensorState::default()),
                wake: Condvar::new(),
                handler: Mutex::new(None),
                worker_stop: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Shorthand for a manually paced camera
    pub fn manual() -> Self {
        Self::new(VirtualCameraConfig::manual())
    }

    /// Complete the oldest queued request on the calling thread
    ///
    /// Returns false if nothing was queued.
    pub fn complete_next(&self) -> bool {
        self.shared.complete_next()
    }

    /// Complete up to `count` requests, returning how many completed
    pub fn complete_frames(&self, count: usize) -> usize {
        (0..count).take_while(|_| self.complete_next()).count()
    }

    /// Requests queued and not yet completed
    pub fn queued(&self) -> usize {
        self.shared.lock_state().queue.len()
    }

    /// Buffers allocated and not yet freed, over every stream
    pub fn allocated_buffers(&self) -> usize {
        self.shared.lock_state().streams.iter().map(|s| s.buffers.len()).sum()
    }

    /// Make every following `submit` fail, to exercise fatal recycle paths
    pub fn set_reject_submissions(&self, reject: bool) {
        self.shared.lock_state().reject_submissions = reject;
    }

    /// Controls the sensor is currently applying
    pub fn active_controls(&self) -> ControlList {
        self.shared.lock_state().controls.clone()
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock_state().started
    }

    fn info(&self) -> CameraInfo {
        let config = &self.shared.config;
        CameraInfo {
            id: config.id.clone(),
            model: config.model.clone(),
            sensor_area: config.sensor_area,
            modes: vec![
                config.sensor_area,
                Size::new(config.sensor_area.width / 2, config.sensor_area.height / 2),
            ],
        }
    }
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler(&self) -> Option<CompletionHandler> {
        self.handler.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Frame interval requested through FrameDurationLimits, if any
    fn requested_interval_ns(controls: &ControlList) -> Option<u64> {
        controls
            .get_int_pair(ControlId::FrameDurationLimits)
            .map(|[min, _]| min)
            .filter(|min| *min > 0)
            .map(|min_us| min_us as u64 * 1000)
    }

    fn frame_interval_ns(&self, controls: &ControlList) -> u64 {
        if let Some(interval) = Self::requested_interval_ns(controls) {
            return interval;
        }
        match self.config.pacing {
            Pacing::FreeRunning { fps } if fps > 0.0 => (1e9 / fps) as u64,
            _ => DEFAULT_FRAME_INTERVAL_NS,
        }
    }

    fn complete_next(&self) -> bool {
        let completion = {
            let mut state = self.lock_state();
            if !state.started {
                return false;
            }
            let Some(request) = state.queue.pop_front() else {
                return false;
            };
            for buffer in request.buffers.values() {
                state.queued_buffers.remove(buffer);
            }

            state.controls.merge(&request.controls);
            let interval = self.frame_interval_ns(&state.controls);
            state.timestamp_ns += interval;
            let frame_index = state.frame_count;
            state.frame_count += 1;

            for buffer_id in request.buffers.values() {
                if let Some(&(stream_idx, buffer_idx)) = state.buffer_index.get(buffer_id) {
                    let stream = &state.streams[stream_idx];
                    test_pattern::fill(&stream.buffers[buffer_idx], &stream.config, frame_index);
                }
            }

            let metadata = self.result_metadata(&state.controls, state.timestamp_ns, interval);
            let buffer_timestamps = request
                .buffers
                .values()
                .map(|id| (*id, state.timestamp_ns))
                .collect();

            trace!(cookie = request.cookie, frame = frame_index, "Virtual sensor completed request");
            RequestCompletion {
                cookie: request.cookie,
                status: RequestStatus::Complete,
                buffers: request.buffers,
                buffer_timestamps,
                metadata,
            }
        };

        // Run the callback without holding the sensor lock so the receiver
        // can submit again from its own context
        if let Some(handler) = self.handler() {
            handler(completion);
        }
        true
    }

    /// Echo the active controls back the way an ISP would report them
    fn result_metadata(&self, controls: &ControlList, timestamp_ns: u64, interval_ns: u64) -> ControlList {
        let manual_exposure =
            controls.contains(ControlId::ExposureTime) && controls.contains(ControlId::AnalogueGain);

        let mut metadata = ControlList::new();
        if self.config.sensor_timestamps {
            metadata.set(ControlId::SensorTimestamp, ControlValue::Int(timestamp_ns as i64));
        }
        metadata.set(
            ControlId::ExposureTime,
            ControlValue::Int(controls.get_i64(ControlId::ExposureTime).unwrap_or(10_000)),
        );
        metadata.set(
            ControlId::AnalogueGain,
            ControlValue::Float(controls.get_f32(ControlId::AnalogueGain).unwrap_or(1.0)),
        );
        metadata.set(ControlId::DigitalGain, ControlValue::Float(1.0));
        metadata.set(
            ControlId::ColourGains,
            ControlValue::FloatPair(
                controls
                    .get_float_pair(ControlId::ColourGains)
                    .unwrap_or([1.8, 1.5]),
            ),
        );
        metadata.set(ControlId::ColourTemperature, ControlValue::Int(5000));
        metadata.set(ControlId::FocusFoM, ControlValue::Int(1000));
        metadata.set(ControlId::AeLocked, ControlValue::Bool(manual_exposure));
        metadata.set(ControlId::Lux, ControlValue::Float(400.0));
        metadata.set(ControlId::FrameDuration, ControlValue::Int((interval_ns / 1000) as i64));
        if let Some(crop) = controls.get(ControlId::ScalerCrop) {
            metadata.set(ControlId::ScalerCrop, crop);
        }
        metadata
    }

    /// Background completion loop for free-running pacing
    fn run_worker(self: Arc<Self>) {
        debug!("Virtual sensor thread started");
        let mut next_deadline = Instant::now();

        while !self.worker_stop.load(Ordering::Acquire) {
            let interval = {
                let mut state = self.lock_state();
                while state.queue.is_empty() && !self.worker_stop.load(Ordering::Acquire) {
                    state = self
                        .wake
                        .wait_timeout(state, Duration::from_millis(100))
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
                self.frame_interval_ns(&state.controls)
            };
            if self.worker_stop.load(Ordering::Acquire) {
                break;
            }

            next_deadline += Duration::from_nanos(interval);
            let now = Instant::now();
            if next_deadline > now {
                std::thread::sleep(next_deadline - now);
            } else {
                // Fell behind (starved of buffers); don't burst to catch up
                next_deadline = now;
            }

            self.complete_next();
        }
        debug!("Virtual sensor thread exiting");
    }
}

impl CaptureBackend for VirtualCamera {
    fn cameras(&self) -> Vec<CameraInfo> {
        vec![self.info()]
    }

    fn acquire(&self, camera_id: &str) -> BackendResult<CameraInfo> {
        if camera_id != self.shared.config.id {
            return Err(BackendError::DeviceNotFound(camera_id.to_string()));
        }
        let mut state = self.shared.lock_state();
        if state.acquired {
            return Err(BackendError::Other(format!("{} is already acquired", camera_id)));
        }
        state.acquired = true;
        info!(camera = camera_id, "Acquired virtual camera");
        Ok(self.info())
    }

    fn release(&self) {
        let mut state = self.shared.lock_state();
        state.acquired = false;
        state.streams.clear();
        state.buffer_index.clear();
        info!("Released virtual camera");
    }

    fn configure(&self, configs: &mut [StreamConfig]) -> BackendResult<()> {
        let mut state = self.shared.lock_state();
        if !state.acquired {
            return Err(BackendError::NotConfigured);
        }
        if state.started {
            return Err(BackendError::Other("cannot configure while streaming".to_string()));
        }

        let area = self.shared.config.sensor_area;
        state.streams.clear();
        state.buffer_index.clear();

        for (index, config) in configs.iter_mut().enumerate() {
            // Clamp to the sensor and keep dimensions even for 4:2:0 chroma
            let width = config.size.width.clamp(2, area.width) & !1;
            let height = config.size.height.clamp(2, area.height) & !1;
            if width != config.size.width || height != config.size.height {
                debug!(
                    requested = %config.size,
                    adjusted = %Size::new(width, height),
                    "Adjusted stream size"
                );
            }
            config.size = Size::new(width, height);

            let min_stride = config.pixel_format.min_stride(width);
            config.stride = config.stride.max(min_stride).next_multiple_of(STRIDE_ALIGN);
            if config.buffer_count == 0 {
                config.buffer_count = 4;
            }
            config.stream = Some(StreamId(index as u32));

            state.streams.push(ConfiguredStream {
                config: config.clone(),
                buffers: Vec::new(),
            });
        }

        info!(streams = configs.len(), "Virtual camera configured");
        Ok(())
    }

    fn allocate(&self, stream: StreamId) -> BackendResult<Vec<HardwareBuffer>> {
        let max_buffers = self.shared.config.max_buffers;
        let shared_memory = self.shared.config.shared_plane_memory;
        let mut state = self.shared.lock_state();
        let stream_idx = state
            .streams
            .iter()
            .position(|s| s.config.stream == Some(stream))
            .ok_or(BackendError::NotConfigured)?;

        let config = state.streams[stream_idx].config.clone();
        if config.buffer_count > max_buffers {
            return Err(BackendError::OutOfBuffers(format!(
                "{} buffers requested, {} available",
                config.buffer_count, max_buffers
            )));
        }

        let plane_sizes = config
            .pixel_format
            .plane_sizes(config.stride, config.size.height);
        let mut buffers = Vec::with_capacity(config.buffer_count);

        for buffer_idx in 0..config.buffer_count {
            let id = BufferId(state.next_buffer_id);
            state.next_buffer_id += 1;

            let planes = if shared_memory {
                let memory = MemoryObject::new(state.next_memory_id, plane_sizes.iter().sum());
                state.next_memory_id += 1;
                let mut offset = 0;
                plane_sizes
                    .iter()
                    .map(|len| {
                        let plane = Plane {
                            memory: Arc::clone(&memory),
                            offset,
                            length: *len,
                        };
                        offset += len;
                        plane
                    })
                    .collect()
            } else {
                plane_sizes
                    .iter()
                    .map(|len| {
                        let memory = MemoryObject::new(state.next_memory_id, *len);
                        state.next_memory_id += 1;
                        Plane {
                            memory,
                            offset: 0,
                            length: *len,
                        }
                    })
                    .collect()
            };

            let buffer = HardwareBuffer { id, stream, planes };
            state.buffer_index.insert(id, (stream_idx, buffer_idx));
            buffers.push(buffer);
        }

        state.streams[stream_idx].buffers = buffers.clone();
        debug!(stream = %stream, count = buffers.len(), "Allocated virtual buffers");
        Ok(buffers)
    }

    fn free(&self, stream: StreamId) -> BackendResult<()> {
        let mut state = self.shared.lock_state();
        if state.started {
            return Err(BackendError::Other("cannot free buffers while streaming".to_string()));
        }
        let SensorState {
            streams,
            buffer_index,
            ..
        } = &mut *state;
        if let Some(configured) = streams.iter_mut().find(|s| s.config.stream == Some(stream)) {
            for buffer in configured.buffers.drain(..) {
                buffer_index.remove(&buffer.id);
            }
        }
        Ok(())
    }

    fn start(&self, controls: &ControlList) -> BackendResult<()> {
        {
            let mut state = self.shared.lock_state();
            if state.streams.is_empty() {
                return Err(BackendError::NotConfigured);
            }
            if state.started {
                return Err(BackendError::Other("already started".to_string()));
            }
            state.started = true;
            state.controls = controls.clone();
        }

        if let Pacing::FreeRunning { fps } = self.shared.config.pacing {
            self.shared.worker_stop.store(false, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("virtual-sensor".to_string())
                .spawn(move || shared.run_worker())
                .map_err(|e| BackendError::Other(format!("spawn sensor thread: {}", e)))?;
            *self.shared.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            info!(fps, "Virtual camera streaming");
        } else {
            info!("Virtual camera streaming (manual pacing)");
        }
        Ok(())
    }

    fn stop(&self) -> BackendResult<()> {
        self.shared.worker_stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let worker = self.shared.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker
            && handle.join().is_err()
        {
            warn!("Virtual sensor thread panicked");
        }

        let cancelled: Vec<RequestSubmission> = {
            let mut state = self.shared.lock_state();
            if !state.started {
                return Ok(());
            }
            state.started = false;
            state.queued_buffers.clear();
            state.queue.drain(..).collect()
        };

        debug!(cancelled = cancelled.len(), "Virtual camera stopped");
        if let Some(handler) = self.shared.handler() {
            for request in cancelled {
                handler(RequestCompletion {
                    cookie: request.cookie,
                    status: RequestStatus::Cancelled,
                    buffers: request.buffers,
                    buffer_timestamps: Default::default(),
                    metadata: ControlList::new(),
                });
            }
        }
        Ok(())
    }

    fn submit(&self, request: RequestSubmission) -> BackendResult<()> {
        let mut state = self.shared.lock_state();
        if !state.started {
            return Err(BackendError::NotStarted);
        }
        if state.reject_submissions {
            return Err(BackendError::Other("request rejected by sensor".to_string()));
        }
        for buffer in request.buffers.values() {
            if !state.buffer_index.contains_key(buffer) {
                return Err(BackendError::InvalidRequest(format!("unknown {}", buffer)));
            }
            if state.queued_buffers.contains(buffer) {
                return Err(BackendError::InvalidRequest(format!("{} is already queued", buffer)));
            }
        }

        state.queued_buffers.extend(request.buffers.values().copied());
        state.queue.push_back(request);
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn set_completion_handler(&self, handler: Option<CompletionHandler>) {
        *self.shared.handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    fn configured_camera() -> (VirtualCamera, Vec<HardwareBuffer>) {
        let camera = VirtualCamera::manual();
        camera.acquire("virtual0").unwrap();
        let mut configs = vec![StreamConfig::new(
            StreamRole::Viewfinder,
            PixelFormat::YUV420,
            Size::new(64, 48),
            2,
        )];
        camera.configure(&mut configs).unwrap();
        let buffers = camera.allocate(StreamId(0)).unwrap();
        (camera, buffers)
    }

    fn submission(cookie: u64, buffer: BufferId) -> RequestSubmission {
        RequestSubmission {
            cookie,
            buffers: BTreeMap::from([(StreamId(0), buffer)]),
            controls: ControlList::new(),
        }
    }

    #[test]
    fn test_configure_aligns_stride_and_assigns_streams() {
        let camera = VirtualCamera::manual();
        camera.acquire("virtual0").unwrap();
        let mut configs = vec![StreamConfig::new(
            StreamRole::Viewfinder,
            PixelFormat::YUV420,
            Size::new(101, 75),
            0,
        )];
        camera.configure(&mut configs).unwrap();

        assert_eq!(configs[0].size, Size::new(100, 74));
        assert_eq!(configs[0].stride % STRIDE_ALIGN, 0);
        assert_eq!(configs[0].buffer_count, 4);
        assert_eq!(configs[0].stream, Some(StreamId(0)));
    }

    #[test]
    fn test_double_submission_is_rejected() {
        let (camera, buffers) = configured_camera();
        camera.start(&ControlList::new()).unwrap();

        camera.submit(submission(0, buffers[0].id)).unwrap();
        let err = camera.submit(submission(1, buffers[0].id)).unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[test]
    fn test_stop_cancels_queued_requests() {
        let (camera, buffers) = configured_camera();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancelled);
        camera.set_completion_handler(Some(Arc::new(move |completion: RequestCompletion| {
            if completion.status == RequestStatus::Cancelled {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));

        camera.start(&ControlList::new()).unwrap();
        camera.submit(submission(0, buffers[0].id)).unwrap();
        camera.submit(submission(1, buffers[1].id)).unwrap();
        camera.stop().unwrap();

        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
        assert_eq!(camera.queued(), 0);
    }

    #[test]
    fn test_manual_completion_reports_metadata() {
        let (camera, buffers) = configured_camera();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        camera.set_completion_handler(Some(Arc::new(move |completion: RequestCompletion| {
            sink.lock().unwrap().push(completion);
        })));

        let mut controls = ControlList::new();
        controls.set(ControlId::FrameDurationLimits, ControlValue::IntPair([20_000, 20_000]));
        camera.start(&controls).unwrap();
        camera.submit(submission(7, buffers[0].id)).unwrap();
        camera.submit(submission(8, buffers[1].id)).unwrap();
        assert_eq!(camera.complete_frames(5), 2);

        let results = results.lock().unwrap();
        assert_eq!(results[0].cookie, 7);
        assert_eq!(results[1].cookie, 8);
        let t0 = results[0].metadata.get_i64(ControlId::SensorTimestamp).unwrap();
        let t1 = results[1].metadata.get_i64(ControlId::SensorTimestamp).unwrap();
        assert_eq!(t1 - t0, 20_000_000);
    }

    #[test]
    fn test_allocation_beyond_limit_fails() {
        let camera = VirtualCamera::new(VirtualCameraConfig {
            max_buffers: 2,
            ..VirtualCameraConfig::manual()
        });
        camera.acquire("virtual0").unwrap();
        let mut configs = vec![StreamConfig::new(
            StreamRole::Viewfinder,
            PixelFormat::NV12,
            Size::new(64, 48),
            3,
        )];
        camera.configure(&mut configs).unwrap();
        assert!(matches!(
            camera.allocate(StreamId(0)),
            Err(BackendError::OutOfBuffers(_))
        ));
    }
}
