// SPDX-License-Identifier: GPL-3.0-only

//! Application shell
//!
//! [`CameraApp`] owns one capture engine, its post-processing pipeline and the
//! preview channel, and turns everything they produce into [`AppEvent`]s on a
//! single queue. The caller's loop reads that queue with [`CameraApp::wait`].
//!
//! ```text
//!  backend ──▶ CaptureEngine ──▶ Pipeline ──▶ event queue ──▶ wait()
//!                                                  ▲
//!  display quit / Ctrl+C ──────────────────────────┘
//! ```

use crate::backends::camera::types::{CameraInfo, StreamConfig, StreamId, StreamRole};
use crate::backends::camera::{CaptureBackend, ControlList};
use crate::capture::{CaptureEngine, FrameHandle};
use crate::config::Options;
use crate::constants::timing;
use crate::errors::{CaptureError, CaptureResult};
use crate::pipelines::post_processing::{Delivery, Pipeline, StageRegistry};
use crate::preview::{Display, PreviewChannel};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Use case handed to stages when they adjust the viewfinder config
const VIEWFINDER_USE_CASE: &str = "viewfinder";

/// What the application loop is told about
#[derive(Debug)]
pub enum AppEvent {
    /// A frame made it through the pipeline
    RequestComplete(FrameHandle),
    /// Nothing arrived within the wait period
    Timeout,
    /// The user asked to quit
    Quit,
    /// The session hit a fatal error
    Error(CaptureError),
}

struct OpenCamera {
    backend: Arc<dyn CaptureBackend>,
    info: CameraInfo,
    engine: CaptureEngine,
}

pub struct CameraApp {
    options: Options,
    registry: StageRegistry,
    events: Sender<AppEvent>,
    receiver: Receiver<AppEvent>,
    preview: PreviewChannel,
    camera: Option<OpenCamera>,
    viewfinder: Option<StreamId>,
}

impl CameraApp {
    /// Build the shell and start the preview thread around `display`
    pub fn new(options: Options, registry: StageRegistry, display: Box<dyn Display>) -> CaptureResult<Self> {
        options.validate()?;
        let (events, receiver) = mpsc::channel();

        let quit = events.clone();
        let preview = PreviewChannel::spawn(
            display,
            Box::new(move || {
                let _ = quit.send(AppEvent::Quit);
            }),
        )?;

        Ok(Self {
            options,
            registry,
            events,
            receiver,
            preview,
            camera: None,
            viewfinder: None,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Acquire the configured camera and build its pipeline
    pub fn open_camera(&mut self, backend: Arc<dyn CaptureBackend>) -> CaptureResult<CameraInfo> {
        if self.camera.is_some() {
            self.close_camera();
        }

        let sink_events = self.events.clone();
        let mut pipeline = Pipeline::new(Arc::new(move |delivery| {
            let event = match delivery {
                Delivery::Frame(frame) => AppEvent::RequestComplete(frame),
                Delivery::Failed(err) => AppEvent::Error(err),
            };
            // A closed queue drops the frame, which recycles it
            let _ = sink_events.send(event);
        }));
        if let Some(path) = &self.options.post_process_file {
            pipeline.load_file(&self.registry, path)?;
            info!(stages = ?pipeline.stage_names(), "Post-processing stages loaded");
        }

        let info = backend.acquire(&self.options.camera)?;
        info!(
            camera = %info.id,
            model = %info.model,
            sensor = %info.sensor_area,
            "Camera acquired"
        );

        let engine = CaptureEngine::new(Arc::clone(&backend), pipeline);
        self.camera = Some(OpenCamera {
            backend,
            info: info.clone(),
            engine,
        });
        Ok(info)
    }

    /// Tear the session down and give the camera back
    pub fn close_camera(&mut self) {
        self.teardown();
        if let Some(camera) = self.camera.take() {
            drop(camera.engine);
            camera.backend.release();
            info!(camera = %camera.info.id, "Camera released");
        }
    }

    fn open(&self) -> CaptureResult<&OpenCamera> {
        self.camera
            .as_ref()
            .ok_or_else(|| CaptureError::Configuration("no camera open".to_string()))
    }

    /// Negotiate the viewfinder stream and prepare requests and stages for it
    pub fn configure_viewfinder(&mut self) -> CaptureResult<()> {
        let camera = self.open()?;

        let mut config = StreamConfig::new(
            StreamRole::Viewfinder,
            self.options.pixel_format,
            self.options.viewfinder_size(),
            self.options.buffer_count,
        );
        camera.engine.pipeline().adjust_config(VIEWFINDER_USE_CASE, &mut config);
        bound_to_display(&mut config, self.preview.max_image_size());

        let mut configs = vec![config];
        camera.engine.configure(&mut configs)?;

        let viewfinder = configs
            .first()
            .and_then(|config| config.stream)
            .ok_or_else(|| CaptureError::Configuration("viewfinder was not negotiated".to_string()))?;
        self.preview.set_streams(
            configs
                .iter()
                .filter_map(|config| config.stream.map(|id| (id, config.info())))
                .collect(),
        );
        info!(
            stream = %viewfinder,
            size = %configs[0].size,
            format = %configs[0].pixel_format,
            buffers = configs[0].buffer_count,
            "Viewfinder configured"
        );
        self.viewfinder = Some(viewfinder);
        Ok(())
    }

    /// Start capturing with the option-derived base controls
    pub fn start_camera(&mut self) -> CaptureResult<()> {
        let camera = self.open()?;
        let base = self.options.base_controls(camera.info.sensor_area)?;
        camera.engine.start(&base)?;
        self.preview.set_info_template(&self.options.info_text);
        Ok(())
    }

    /// Stop capturing and drop every frame still queued for the application
    pub fn stop_camera(&mut self) -> CaptureResult<()> {
        let result = match &self.camera {
            Some(camera) => camera.engine.stop(),
            None => Ok(()),
        };
        self.preview.clear();

        let mut discarded = 0;
        while let Ok(event) = self.receiver.try_recv() {
            if matches!(event, AppEvent::RequestComplete(_)) {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded queued frames after stop");
        }
        result
    }

    /// Stop and free every buffer; the camera stays acquired
    pub fn teardown(&mut self) {
        if let Err(e) = self.stop_camera() {
            warn!(error = %e, "Stop during teardown failed");
        }
        if let Some(camera) = &self.camera {
            camera.engine.teardown();
        }
        self.viewfinder = None;
    }

    /// Block until the next event
    pub fn wait(&self) -> AppEvent {
        // The shell holds a sender, so the queue never disconnects
        self.receiver.recv().unwrap_or(AppEvent::Quit)
    }

    /// Wait at most `timeout` for the next event
    pub fn wait_timeout(&self, timeout: Duration) -> AppEvent {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => AppEvent::Timeout,
            Err(RecvTimeoutError::Disconnected) => AppEvent::Quit,
        }
    }

    pub fn post(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    /// A handle other threads (signal handlers) can post through
    pub fn event_sender(&self) -> Sender<AppEvent> {
        self.events.clone()
    }

    /// Offer a frame to the preview; false when the preview was busy
    pub fn show_preview(&self, frame: FrameHandle, stream: StreamId) -> bool {
        self.preview.send(frame, stream)
    }

    /// Stage controls for the next request
    pub fn set_controls(&self, controls: ControlList) -> CaptureResult<()> {
        self.open()?.engine.set_controls(controls);
        Ok(())
    }

    pub fn viewfinder_stream(&self) -> Option<StreamId> {
        self.viewfinder
    }

    pub fn preview(&self) -> &PreviewChannel {
        &self.preview
    }

    pub fn engine(&self) -> Option<&CaptureEngine> {
        self.camera.as_ref().map(|camera| &camera.engine)
    }

    pub fn camera_info(&self) -> Option<&CameraInfo> {
        self.camera.as_ref().map(|camera| &camera.info)
    }
}

impl Drop for CameraApp {
    fn drop(&mut self) {
        self.close_camera();
        self.preview.shutdown();
    }
}

/// Shrink `config` to fit a display of `max` pixels, keeping its aspect ratio
///
/// Both dimensions end up even, as 4:2:0 formats require.
fn bound_to_display(config: &mut StreamConfig, max: (u32, u32)) {
    let (max_width, max_height) = max;
    let size = &mut config.size;
    if max_width > 0 && max_height > 0 && (size.width > max_width || size.height > max_height) {
        let scale = f64::min(
            max_width as f64 / size.width as f64,
            max_height as f64 / size.height as f64,
        );
        let width = (size.width as f64 * scale).round() as u32;
        let height = (size.height as f64 * scale).round() as u32;
        debug!(
            from = %size,
            width,
            height,
            "Viewfinder bounded by display"
        );
        size.width = width;
        size.height = height;
    }
    size.width = (size.width & !1).max(2);
    size.height = (size.height & !1).max(2);
}

/// Run the preview loop until `timeout` elapses or the user quits
///
/// Returns the number of frames received. A `None` timeout runs until quit.
pub fn run_hello(app: &mut CameraApp, timeout: Option<Duration>) -> CaptureResult<u64> {
    app.configure_viewfinder()?;
    app.start_camera()?;
    let stream = app
        .viewfinder_stream()
        .ok_or_else(|| CaptureError::Configuration("no viewfinder stream".to_string()))?;

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut frames = 0u64;

    loop {
        match app.wait_timeout(timing::EVENT_POLL_INTERVAL) {
            AppEvent::RequestComplete(frame) => {
                frames += 1;
                if frame.sequence() % timing::FRAME_LOG_INTERVAL == 0 {
                    info!(
                        sequence = frame.sequence(),
                        fps = frame.framerate(),
                        "Frame"
                    );
                }
                app.show_preview(frame, stream);
            }
            AppEvent::Timeout => {}
            AppEvent::Quit => {
                info!("Quit requested");
                break;
            }
            AppEvent::Error(e) => {
                error!(error = %e, "Capture failed");
                app.stop_camera()?;
                return Err(e);
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!("Run time elapsed");
            break;
        }
    }

    app.stop_camera()?;
    info!(
        frames,
        shown = app.preview().shown(),
        dropped = app.preview().dropped(),
        "Preview loop finished"
    );
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::{PixelFormat, Size};

    fn viewfinder(width: u32, height: u32) -> StreamConfig {
        StreamConfig::new(StreamRole::Viewfinder, PixelFormat::YUV420, Size::new(width, height), 4)
    }

    #[test]
    fn test_bound_keeps_aspect_ratio() {
        let mut config = viewfinder(1920, 1080);
        bound_to_display(&mut config, (160, 90));
        assert_eq!(config.size, Size::new(160, 90));

        let mut config = viewfinder(640, 480);
        bound_to_display(&mut config, (100, 100));
        assert_eq!(config.size, Size::new(100, 74));
    }

    #[test]
    fn test_unbounded_display_only_rounds() {
        let mut config = viewfinder(641, 479);
        bound_to_display(&mut config, (0, 0));
        assert_eq!(config.size, Size::new(640, 478));
    }
}
