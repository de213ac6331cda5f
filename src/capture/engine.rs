// SPDX-License-Identifier: GPL-3.0-only

//! Capture engine
//!
//! Owns the capture requests, keeps the backend fed and turns completions into
//! [`CompletedFrame`]s.
//!
//! Three contexts touch the engine concurrently:
//!
//! - the caller, through `configure`/`start`/`stop`;
//! - the backend completion context, which builds frames and hands them to
//!   the pipeline without blocking;
//! - whichever thread drops the last reference to a frame, which recycles its
//!   request back to the hardware.
//!
//! Locks are always taken in the order session, requests, timing. The pending
//! control batch and the buffer pool have their own locks and are never held
//! while taking one of the others.

use super::frame::{CompletedFrame, FrameBuffer, FrameParts, Recycle, RecycleTicket};
use super::request::{CaptureRequest, RequestCounts, RequestState};
use crate::backends::camera::buffer_pool::BufferPool;
use crate::backends::camera::controls::{ControlChannel, ControlId, ControlList};
use crate::backends::camera::types::{
    CompletionHandler, RequestCompletion, RequestStatus, StreamConfig, StreamId, StreamRole,
};
use crate::backends::camera::CaptureBackend;
use crate::errors::{CaptureError, CaptureResult};
use crate::pipelines::post_processing::Pipeline;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, error, info, trace, warn};

/// Started flag and the sequences of frames still owed a recycle
#[derive(Default)]
struct Session {
    started: bool,
    tracked: HashSet<u64>,
}

#[derive(Default)]
struct RequestTable {
    requests: Vec<CaptureRequest>,
    /// Bumped whenever the requests are rebuilt, so tickets from an earlier
    /// configuration never touch the new ones
    epoch: u64,
}

#[derive(Default)]
struct Timing {
    next_sequence: u64,
    /// Timestamp of the previous frame this session
    last_timestamp_ns: Option<u64>,
}

struct EngineShared {
    backend: Arc<dyn CaptureBackend>,
    pipeline: Pipeline,
    controls: ControlChannel,
    session: Mutex<Session>,
    requests: Mutex<RequestTable>,
    timing: Mutex<Timing>,
    pool: RwLock<BufferPool>,
    configs: Mutex<Vec<StreamConfig>>,
    fatal: Mutex<Option<CaptureError>>,
    this: Weak<EngineShared>,
}

/// Frame-capture lifecycle manager
pub struct CaptureEngine {
    shared: Arc<EngineShared>,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn CaptureBackend>, pipeline: Pipeline) -> Self {
        let shared = Arc::new_cyclic(|this| EngineShared {
            backend,
            pipeline,
            controls: ControlChannel::new(),
            session: Mutex::new(Session::default()),
            requests: Mutex::new(RequestTable::default()),
            timing: Mutex::new(Timing::default()),
            pool: RwLock::new(BufferPool::default()),
            configs: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            this: this.clone(),
        });
        Self { shared }
    }

    // ===== Configuration =====

    /// Negotiate streams, allocate their buffers and build the requests
    ///
    /// `configs` is updated with whatever the backend settled on.
    pub fn configure(&self, configs: &mut [StreamConfig]) -> CaptureResult<()> {
        if self.is_started() {
            return Err(CaptureError::Configuration(
                "cannot reconfigure while capturing".to_string(),
            ));
        }
        if configs.is_empty() {
            return Err(CaptureError::Configuration("no streams requested".to_string()));
        }

        self.release_buffers();

        self.shared.backend.configure(configs).map_err(|e| {
            CaptureError::Configuration(format!("stream negotiation failed: {}", e))
        })?;
        for config in configs.iter() {
            info!(
                role = config.role.as_str(),
                size = %config.size,
                stride = config.stride,
                format = %config.pixel_format,
                buffers = config.buffer_count,
                "Stream configured"
            );
        }

        let pool = BufferPool::allocate(self.shared.backend.as_ref(), configs)?;
        *self.shared.pool.write().unwrap_or_else(|e| e.into_inner()) = pool;
        *self.shared.lock_configs() = configs.to_vec();

        self.make_requests()?;
        self.shared.pipeline.configure(configs)?;
        Ok(())
    }

    /// Build one request per buffer slot, each holding one buffer of every
    /// active stream
    pub fn make_requests(&self) -> CaptureResult<()> {
        if self.is_started() {
            return Err(CaptureError::Configuration(
                "cannot rebuild requests while capturing".to_string(),
            ));
        }

        let requests = {
            let pool = self.shared.read_pool();
            if pool.is_empty() {
                return Err(CaptureError::Configuration(
                    "no buffers allocated, configure streams first".to_string(),
                ));
            }

            let streams: Vec<StreamId> = pool.streams().collect();
            let count = pool.buffer_count();
            if let Some(stream) = streams.iter().find(|s| pool.buffers(**s).len() != count) {
                return Err(CaptureError::Configuration(format!(
                    "{} has {} buffers, other streams have {}",
                    stream,
                    pool.buffers(*stream).len(),
                    count
                )));
            }

            (0..count)
                .map(|slot| {
                    let buffers = streams
                        .iter()
                        .map(|stream| (*stream, pool.buffers(*stream)[slot]))
                        .collect();
                    CaptureRequest::new(slot as u64, buffers)
                })
                .collect::<Vec<_>>()
        };

        let count = requests.len();
        {
            let mut table = self.shared.lock_requests();
            table.requests = requests;
            table.epoch += 1;
        }
        self.shared.lock_timing().next_sequence = 0;

        debug!(requests = count, "Capture requests created");
        Ok(())
    }

    // ===== Session =====

    /// Start capturing
    ///
    /// `base` fills in every control the caller has not already staged
    /// through [`CaptureEngine::set_controls`].
    pub fn start(&self, base: &ControlList) -> CaptureResult<()> {
        let shared = &self.shared;
        if self.is_started() {
            return Err(CaptureError::Configuration("capture already started".to_string()));
        }
        if shared.lock_requests().requests.is_empty() {
            return Err(CaptureError::Configuration(
                "no capture requests, configure streams first".to_string(),
            ));
        }

        shared.controls.merge_defaults(base);
        let initial = shared.controls.consume();
        debug!(controls = initial.len(), "Starting camera");
        shared
            .backend
            .start(&initial)
            .map_err(|e| CaptureError::hardware("start camera", e))?;

        shared.lock_timing().last_timestamp_ns = None;
        *shared.fatal.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if let Err(e) = shared.pipeline.start() {
            if let Err(stop_err) = shared.backend.stop() {
                warn!(error = %stop_err, "Failed to stop camera after pipeline start failure");
            }
            return Err(e);
        }

        let weak = shared.this.clone();
        let handler: CompletionHandler = Arc::new(move |completion: RequestCompletion| {
            if let Some(engine) = weak.upgrade() {
                engine.on_completion(completion);
            }
        });
        shared.backend.set_completion_handler(Some(handler));

        let submitted = {
            let mut session = shared.lock_session();
            session.started = true;
            session.tracked.clear();

            let mut table = shared.lock_requests();
            let mut submitted = 0;
            let mut failure = None;
            for request in table
                .requests
                .iter_mut()
                .filter(|r| r.state() == RequestState::Idle)
            {
                let submission = request.submit(ControlList::new());
                if let Err(e) = shared.backend.submit(submission) {
                    request.reset();
                    failure = Some(e);
                    break;
                }
                submitted += 1;
            }
            match failure {
                Some(e) => Err(CaptureError::hardware("queue request", e)),
                None => Ok(submitted),
            }
        };

        match submitted {
            Ok(count) => {
                info!(requests = count, "Capture started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to queue initial requests");
                if let Err(stop_err) = self.stop() {
                    warn!(error = %stop_err, "Failed to stop after start failure");
                }
                Err(e)
            }
        }
    }

    /// Stop capturing
    ///
    /// Waits for the pipeline to drain. Frames the application still holds
    /// stay readable, but releasing them no longer resubmits anything.
    pub fn stop(&self) -> CaptureResult<()> {
        let shared = &self.shared;
        {
            let mut session = shared.lock_session();
            if !session.started {
                return Ok(());
            }
            // From here on no recycle resubmits and no completion builds a frame
            session.started = false;
        }

        // Outside the session lock: the backend delivers cancellations
        // through the completion handler, which takes it
        let result = shared
            .backend
            .stop()
            .map_err(|e| CaptureError::hardware("stop camera", e));

        shared.pipeline.stop();
        shared.backend.set_completion_handler(None);

        {
            let mut session = shared.lock_session();
            let orphaned = session.tracked.len();
            session.tracked.clear();

            let mut table = shared.lock_requests();
            for request in table
                .requests
                .iter_mut()
                .filter(|r| r.state() == RequestState::Submitted)
            {
                warn!(cookie = request.cookie(), "Backend did not cancel queued request");
                request.reset();
            }
            debug!(orphaned, "Tracked frames cleared");
        }
        shared.controls.clear();

        match &result {
            Ok(()) => info!("Capture stopped"),
            Err(e) => error!(error = %e, "Camera stop failed"),
        }
        result
    }

    /// Stop, tear the pipeline down and give every buffer back
    pub fn teardown(&self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Stop during teardown failed");
        }
        self.shared.pipeline.teardown();
        self.release_buffers();
        debug!("Capture engine torn down");
    }

    fn release_buffers(&self) {
        {
            let mut table = self.shared.lock_requests();
            table.requests.clear();
            table.epoch += 1;
        }
        let mut pool = self.shared.pool.write().unwrap_or_else(|e| e.into_inner());
        if !pool.is_empty() {
            pool.free(self.shared.backend.as_ref());
        }
        self.shared.lock_configs().clear();
    }

    // ===== Controls =====

    /// Stage controls for the next request (replaces any pending batch)
    pub fn set_controls(&self, controls: ControlList) {
        self.shared.controls.set(controls);
    }

    pub fn controls(&self) -> &ControlChannel {
        &self.shared.controls
    }

    // ===== Diagnostics =====

    pub fn is_started(&self) -> bool {
        self.shared.lock_session().started
    }

    /// Requests by lifecycle state
    pub fn request_counts(&self) -> RequestCounts {
        RequestCounts::tally(self.shared.lock_requests().requests.iter())
    }

    /// Frames handed out and not yet recycled
    pub fn tracked_frames(&self) -> usize {
        self.shared.lock_session().tracked.len()
    }

    /// Sequence number the next completed frame will get
    pub fn sequence(&self) -> u64 {
        self.shared.lock_timing().next_sequence
    }

    /// The error that stopped resubmission, if any
    pub fn fatal_error(&self) -> Option<CaptureError> {
        self.shared.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.shared.backend
    }

    /// Stream configurations as negotiated by the backend
    pub fn streams(&self) -> Vec<StreamConfig> {
        self.shared.lock_configs().clone()
    }

    /// Negotiated configuration of the first stream with `role`
    pub fn stream(&self, role: StreamRole) -> Option<StreamConfig> {
        self.shared
            .lock_configs()
            .iter()
            .find(|c| c.role == role)
            .cloned()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if self.is_started() {
            self.teardown();
        } else if !self.shared.read_pool().is_empty() {
            self.release_buffers();
        }
    }
}

impl EngineShared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_requests(&self) -> MutexGuard<'_, RequestTable> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_configs(&self) -> MutexGuard<'_, Vec<StreamConfig>> {
        self.configs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_pool(&self) -> std::sync::RwLockReadGuard<'_, BufferPool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner())
    }

    fn reset_request(&self, cookie: u64) {
        if let Some(request) = self.lock_requests().requests.get_mut(cookie as usize) {
            request.reset();
        }
    }

    /// Completion callback, runs on the backend's completion context
    fn on_completion(&self, completion: RequestCompletion) {
        if completion.status == RequestStatus::Cancelled {
            trace!(cookie = completion.cookie, "Request cancelled");
            self.reset_request(completion.cookie);
            return;
        }

        let buffers: BTreeMap<StreamId, FrameBuffer> = {
            let pool = self.read_pool();
            completion
                .buffers
                .iter()
                .map(|(stream, id)| {
                    let spans = pool.spans(*id).map(<[_]>::to_vec).unwrap_or_default();
                    (*stream, FrameBuffer { id: *id, spans })
                })
                .collect()
        };

        let timestamp_ns = completion
            .metadata
            .get_i64(ControlId::SensorTimestamp)
            .and_then(|ts| u64::try_from(ts).ok())
            .or_else(|| {
                completion
                    .buffers
                    .values()
                    .find_map(|id| completion.buffer_timestamps.get(id).copied())
            });

        let (sequence, framerate, epoch) = {
            let mut session = self.lock_session();
            let mut table = self.lock_requests();

            if !session.started {
                trace!(cookie = completion.cookie, "Completion after stop, discarding");
                if let Some(request) = table.requests.get_mut(completion.cookie as usize) {
                    request.reset();
                }
                return;
            }

            let epoch = table.epoch;
            let Some(request) = table.requests.get_mut(completion.cookie as usize) else {
                warn!(cookie = completion.cookie, "Completion for unknown request");
                return;
            };

            let mut timing = self.lock_timing();
            let sequence = timing.next_sequence;
            timing.next_sequence += 1;
            let framerate = match (timing.last_timestamp_ns, timestamp_ns) {
                (Some(last), Some(ts)) if ts > last => 1e9 / (ts - last) as f64,
                _ => 0.0,
            };
            if timestamp_ns.is_some() {
                timing.last_timestamp_ns = timestamp_ns;
            }

            request.complete(sequence);
            session.tracked.insert(sequence);
            (sequence, framerate, epoch)
        };

        trace!(sequence, framerate, "Frame completed");

        let recycler: Weak<dyn Recycle> = self.this.clone();
        let frame = CompletedFrame::new(
            FrameParts {
                sequence,
                cookie: completion.cookie,
                epoch,
                buffers,
                metadata: completion.metadata,
                framerate,
                timestamp_ns: timestamp_ns.unwrap_or(0),
            },
            Some(recycler),
        );
        self.pipeline.process(frame);
    }

    fn latch_fatal(&self, err: CaptureError) {
        let first = {
            let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
            let first = fatal.is_none();
            if first {
                *fatal = Some(err.clone());
            }
            first
        };
        if first {
            error!(error = %err, "Capture engine failed");
            self.pipeline.report(err);
        }
    }
}

impl Recycle for EngineShared {
    fn recycle(&self, ticket: RecycleTicket) {
        let mut session = self.lock_session();
        let failed = self.fatal.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        let live = session.started && session.tracked.remove(&ticket.sequence) && !failed;

        let mut table = self.lock_requests();
        let current_epoch = table.epoch == ticket.epoch;
        let Some(request) = table
            .requests
            .get_mut(ticket.cookie as usize)
            .filter(|r| current_epoch && r.backs(ticket.sequence))
        else {
            trace!(sequence = ticket.sequence, "Released frame belongs to a previous configuration");
            return;
        };

        request.reuse(ticket.buffers);
        if !live {
            trace!(
                sequence = ticket.sequence,
                started = session.started,
                "Released frame is no longer tracked, not resubmitting"
            );
            return;
        }

        let submission = request.submit(self.controls.consume());
        if !submission.controls.is_empty() {
            debug!(
                sequence = ticket.sequence,
                controls = submission.controls.len(),
                "Applying pending controls"
            );
        }

        if let Err(e) = self.backend.submit(submission) {
            request.reset();
            drop(table);
            drop(session);
            self.latch_fatal(CaptureError::hardware("resubmit request", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{PixelFormat, Size};
    use crate::backends::virtual_camera::VirtualCamera;
    use crate::pipelines::post_processing::Delivery;
    use std::sync::mpsc;

    fn engine_with(camera: &VirtualCamera) -> (CaptureEngine, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pipeline = Pipeline::new(Arc::new(move |delivery| {
            let _ = tx.lock().unwrap().send(delivery);
        }));
        camera.acquire("virtual0").unwrap();
        let engine = CaptureEngine::new(Arc::new(camera.clone()), pipeline);
        let mut configs = vec![StreamConfig::new(
            StreamRole::Viewfinder,
            PixelFormat::YUV420,
            Size::new(64, 48),
            4,
        )];
        engine.configure(&mut configs).unwrap();
        (engine, rx)
    }

    fn next_frame(rx: &mpsc::Receiver<Delivery>) -> crate::capture::frame::FrameHandle {
        match rx.try_recv().unwrap() {
            Delivery::Frame(frame) => frame,
            Delivery::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    #[test]
    fn test_start_requires_requests() {
        let camera = VirtualCamera::manual();
        let engine = CaptureEngine::new(Arc::new(camera), Pipeline::new(Arc::new(|_| {})));
        assert!(matches!(
            engine.start(&ControlList::new()),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn test_release_resubmits_with_pending_controls() {
        let camera = VirtualCamera::manual();
        let (engine, rx) = engine_with(&camera);
        engine.start(&ControlList::new()).unwrap();
        assert_eq!(camera.queued(), 4);

        assert!(camera.complete_next());
        let frame = next_frame(&rx);
        assert_eq!(frame.sequence(), 0);
        assert_eq!(camera.queued(), 3);
        assert_eq!(engine.tracked_frames(), 1);

        let mut controls = ControlList::new();
        controls.set(ControlId::Brightness, crate::backends::camera::ControlValue::Float(0.25));
        engine.set_controls(controls);
        drop(frame);

        assert_eq!(camera.queued(), 4);
        assert_eq!(engine.tracked_frames(), 0);
        assert!(engine.controls().is_empty());

        camera.complete_frames(4);
        assert_eq!(camera.active_controls().get_f32(ControlId::Brightness), Some(0.25));
        engine.stop().unwrap();
    }

    #[test]
    fn test_framerate_from_sensor_timestamps() {
        let camera = VirtualCamera::manual();
        let (engine, rx) = engine_with(&camera);
        let mut base = ControlList::new();
        base.set(
            ControlId::FrameDurationLimits,
            crate::backends::camera::ControlValue::IntPair([40_000, 40_000]),
        );
        engine.start(&base).unwrap();

        camera.complete_frames(2);
        let first = next_frame(&rx);
        let second = next_frame(&rx);
        assert_eq!(first.framerate(), 0.0);
        assert!((second.framerate() - 25.0).abs() < 1e-6);
        drop((first, second));
        engine.stop().unwrap();
    }

    /// Feed a completion for `cookie` straight into the engine
    fn inject(engine: &CaptureEngine, cookie: u64, sensor_ns: Option<i64>, buffer_ns: u64) {
        let buffers = engine.shared.lock_requests().requests[cookie as usize]
            .buffers()
            .clone();
        let buffer_timestamps = buffers.values().map(|id| (*id, buffer_ns)).collect();
        let mut metadata = ControlList::new();
        if let Some(ts) = sensor_ns {
            metadata.set(
                ControlId::SensorTimestamp,
                crate::backends::camera::ControlValue::Int(ts),
            );
        }
        engine.shared.on_completion(RequestCompletion {
            cookie,
            status: RequestStatus::Complete,
            buffers,
            buffer_timestamps,
            metadata,
        });
    }

    #[test]
    fn test_identical_timestamps_give_zero_rate() {
        let camera = VirtualCamera::manual();
        let (engine, rx) = engine_with(&camera);
        engine.start(&ControlList::new()).unwrap();

        inject(&engine, 0, Some(1_000_000_000), 0);
        inject(&engine, 1, Some(1_000_000_000), 0);
        inject(&engine, 2, Some(1_040_000_000), 0);
        let frames: Vec<_> = (0..3).map(|_| next_frame(&rx)).collect();
        assert_eq!(frames[0].framerate(), 0.0);
        assert_eq!(frames[1].framerate(), 0.0);
        assert!((frames[2].framerate() - 25.0).abs() < 1e-6);

        engine.stop().unwrap();
        drop(frames);
    }

    #[test]
    fn test_first_timestamp_zero_still_rates_second_frame() {
        let camera = VirtualCamera::manual();
        let (engine, rx) = engine_with(&camera);
        engine.start(&ControlList::new()).unwrap();

        inject(&engine, 0, Some(0), 0);
        inject(&engine, 1, Some(40_000_000), 0);
        let first = next_frame(&rx);
        let second = next_frame(&rx);
        assert_eq!(first.framerate(), 0.0);
        assert!((second.framerate() - 25.0).abs() < 1e-6);

        engine.stop().unwrap();
        drop((first, second));
    }

    #[test]
    fn test_negative_sensor_timestamp_falls_back_to_buffer() {
        let camera = VirtualCamera::manual();
        let (engine, rx) = engine_with(&camera);
        engine.start(&ControlList::new()).unwrap();

        inject(&engine, 0, Some(40_000_000), 0);
        inject(&engine, 1, Some(-1), 80_000_000);
        let first = next_frame(&rx);
        let second = next_frame(&rx);
        assert_eq!(second.timestamp_ns(), 80_000_000);
        assert!((second.framerate() - 25.0).abs() < 1e-6);

        engine.stop().unwrap();
        drop((first, second));
    }

    #[test]
    fn test_drop_unstarted_engine_frees_buffers() {
        let camera = VirtualCamera::manual();
        let (engine, _rx) = engine_with(&camera);
        assert_eq!(camera.allocated_buffers(), 4);
        drop(engine);
        assert_eq!(camera.allocated_buffers(), 0);
    }
}
