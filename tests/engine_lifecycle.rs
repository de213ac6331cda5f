// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture engine against a manually paced camera

use camflow::backends::camera::types::{PixelFormat, Size, StreamConfig, StreamRole};
use camflow::backends::camera::{CaptureBackend, ControlId, ControlList, ControlValue};
use camflow::backends::virtual_camera::{VirtualCamera, VirtualCameraConfig};
use camflow::capture::{CaptureEngine, FrameHandle, RequestCounts};
use camflow::pipelines::post_processing::{Delivery, Pipeline};
use camflow::CaptureError;
use std::sync::mpsc;
use std::sync::Arc;

const BUFFERS: usize = 4;

struct Harness {
    camera: VirtualCamera,
    engine: CaptureEngine,
    deliveries: mpsc::Receiver<Delivery>,
}

impl Harness {
    fn new() -> Self {
        Self::with_streams(
            VirtualCameraConfig::manual(),
            vec![viewfinder(BUFFERS)],
        )
        .unwrap()
    }

    fn with_streams(
        config: VirtualCameraConfig,
        mut configs: Vec<StreamConfig>,
    ) -> Result<Self, CaptureError> {
        let camera = VirtualCamera::new(config);
        camera.acquire("virtual0").unwrap();

        let (tx, deliveries) = mpsc::channel();
        let pipeline = Pipeline::new(Arc::new(move |delivery| {
            let _ = tx.send(delivery);
        }));
        let engine = CaptureEngine::new(Arc::new(camera.clone()), pipeline);
        engine.configure(&mut configs)?;

        Ok(Self {
            camera,
            engine,
            deliveries,
        })
    }

    /// Complete one request and take the frame it produced
    fn capture(&self) -> FrameHandle {
        assert!(self.camera.complete_next(), "no request queued");
        match self.deliveries.try_recv().expect("frame was not delivered") {
            Delivery::Frame(frame) => frame,
            Delivery::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }
}

fn viewfinder(buffers: usize) -> StreamConfig {
    StreamConfig::new(
        StreamRole::Viewfinder,
        PixelFormat::YUV420,
        Size::new(64, 48),
        buffers,
    )
}

fn still(buffers: usize) -> StreamConfig {
    StreamConfig::new(
        StreamRole::StillCapture,
        PixelFormat::YUV420,
        Size::new(128, 96),
        buffers,
    )
}

/// Frame duration of 40 ms, i.e. 25 fps
fn paced_25fps() -> ControlList {
    let mut base = ControlList::new();
    base.set(ControlId::FrameDurationLimits, ControlValue::IntPair([40_000, 40_000]));
    base
}

#[test]
fn test_sequences_are_contiguous() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    let sequences: Vec<u64> = (0..25).map(|_| harness.capture().sequence()).collect();

    assert_eq!(sequences, (0..25).collect::<Vec<u64>>());
    harness.engine.stop().unwrap();
}

#[test]
fn test_hundred_completions_then_stop() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    for expected in 0..100 {
        let frame = harness.capture();
        assert_eq!(frame.sequence(), expected);
    }
    harness.engine.stop().unwrap();

    assert_eq!(harness.engine.tracked_frames(), 0);
    assert_eq!(harness.engine.pipeline().pending(), 0);
    assert_eq!(
        harness.engine.request_counts(),
        RequestCounts {
            idle: BUFFERS,
            submitted: 0,
            completed: 0
        }
    );
    assert!(!harness.camera.is_started());
}

#[test]
fn test_release_after_stop_does_not_resubmit() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    let retained = harness.capture();
    harness.engine.stop().unwrap();
    assert_eq!(harness.engine.request_counts().completed, 1);

    drop(retained);

    assert_eq!(harness.camera.queued(), 0);
    assert!(harness.engine.fatal_error().is_none());
    assert_eq!(harness.engine.request_counts().idle, BUFFERS);

    // The request is picked up again by the next session
    harness.engine.start(&ControlList::new()).unwrap();
    assert_eq!(harness.camera.queued(), BUFFERS);
    harness.engine.stop().unwrap();
}

#[test]
fn test_buffers_are_conserved() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(harness.capture());
        let counts = harness.engine.request_counts();
        assert_eq!(counts.total(), BUFFERS);
        assert_eq!(counts.completed, held.len());
        assert_eq!(harness.camera.queued(), BUFFERS - held.len());
    }

    // Extra references to the same frame do not return its buffers early
    let extra = Arc::clone(&held[0]);
    held.remove(0);
    assert_eq!(harness.camera.queued(), 1);
    drop(extra);
    assert_eq!(harness.camera.queued(), 2);

    held.clear();
    assert_eq!(harness.camera.queued(), BUFFERS);
    assert_eq!(harness.engine.request_counts().submitted, BUFFERS);
    harness.engine.stop().unwrap();
}

#[test]
fn test_failed_resubmit_is_fatal() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    let first = harness.capture();
    let second = harness.capture();
    harness.camera.set_reject_submissions(true);
    drop(first);

    assert!(matches!(
        harness.engine.fatal_error(),
        Some(CaptureError::Hardware(_))
    ));
    assert!(matches!(
        harness.deliveries.try_recv(),
        Ok(Delivery::Failed(CaptureError::Hardware(_)))
    ));

    // Later releases leave their requests idle and report nothing new
    harness.camera.set_reject_submissions(false);
    drop(second);
    assert_eq!(harness.camera.queued(), 2);
    assert!(harness.deliveries.try_recv().is_err());

    harness.engine.stop().unwrap();
    assert_eq!(harness.engine.request_counts().idle, BUFFERS);
}

#[test]
fn test_base_controls_do_not_override_staged_ones() {
    let harness = Harness::new();

    let mut staged = ControlList::new();
    staged.set(ControlId::Brightness, ControlValue::Float(0.1));
    harness.engine.set_controls(staged);

    let mut base = ControlList::new();
    base.set(ControlId::Brightness, ControlValue::Float(0.5));
    base.set(ControlId::Contrast, ControlValue::Float(1.5));
    harness.engine.start(&base).unwrap();

    let active = harness.camera.active_controls();
    assert_eq!(active.get_f32(ControlId::Brightness), Some(0.1));
    assert_eq!(active.get_f32(ControlId::Contrast), Some(1.5));
    assert!(harness.engine.controls().is_empty());
    harness.engine.stop().unwrap();
}

#[test]
fn test_reconfigure_requires_stop() {
    let harness = Harness::new();
    harness.engine.start(&ControlList::new()).unwrap();

    let mut configs = vec![StreamConfig::new(
        StreamRole::Viewfinder,
        PixelFormat::YUV420,
        Size::new(32, 24),
        2,
    )];
    assert!(matches!(
        harness.engine.configure(&mut configs),
        Err(CaptureError::Configuration(_))
    ));

    harness.engine.stop().unwrap();
    harness.engine.configure(&mut configs).unwrap();
    assert_eq!(harness.engine.request_counts().idle, 2);

    // Sequence numbering restarts with the new request set
    harness.engine.start(&ControlList::new()).unwrap();
    assert_eq!(harness.capture().sequence(), 0);
    harness.engine.stop().unwrap();
}

#[test]
fn test_stop_is_idempotent() {
    let harness = Harness::new();
    harness.engine.stop().unwrap();
    harness.engine.start(&ControlList::new()).unwrap();
    harness.engine.stop().unwrap();
    harness.engine.stop().unwrap();
    assert!(!harness.engine.is_started());
}

#[test]
fn test_mismatched_stream_buffer_counts_are_rejected() {
    let result = Harness::with_streams(VirtualCameraConfig::manual(), vec![viewfinder(4), still(3)]);
    assert!(matches!(result, Err(CaptureError::Configuration(_))));
}

#[test]
fn test_every_request_carries_one_buffer_per_stream() {
    let harness =
        Harness::with_streams(VirtualCameraConfig::manual(), vec![viewfinder(3), still(3)]).unwrap();
    assert_eq!(harness.engine.streams().len(), 2);
    assert_eq!(harness.engine.request_counts().idle, 3);
    harness.engine.start(&ControlList::new()).unwrap();

    for _ in 0..6 {
        let frame = harness.capture();
        let buffers: Vec<_> = frame.buffers().map(|(_, buffer)| buffer.id).collect();
        assert_eq!(buffers.len(), 2);
        assert_ne!(buffers[0], buffers[1]);
    }
    harness.engine.stop().unwrap();
}

#[test]
fn test_framerate_from_buffer_timestamps() {
    let config = VirtualCameraConfig {
        sensor_timestamps: false,
        ..VirtualCameraConfig::manual()
    };
    let harness = Harness::with_streams(config, vec![viewfinder(BUFFERS)]).unwrap();
    harness.engine.start(&paced_25fps()).unwrap();

    let first = harness.capture();
    let second = harness.capture();
    assert!(first.metadata().get_i64(ControlId::SensorTimestamp).is_none());
    assert_eq!(first.framerate(), 0.0);
    assert!(second.timestamp_ns() > first.timestamp_ns());
    assert!((second.framerate() - 25.0).abs() < 1e-6);
    drop((first, second));
    harness.engine.stop().unwrap();
}

#[test]
fn test_separate_plane_memory_maps_one_span_per_plane() {
    let config = VirtualCameraConfig {
        shared_plane_memory: false,
        ..VirtualCameraConfig::manual()
    };
    let harness = Harness::with_streams(config, vec![viewfinder(BUFFERS)]).unwrap();
    harness.engine.start(&ControlList::new()).unwrap();

    let frame = harness.capture();
    let (_, buffer) = frame.buffers().next().unwrap();
    assert_eq!(buffer.spans.len(), 3);
    drop(frame);
    harness.engine.stop().unwrap();

    // One memory object per buffer coalesces into a single span
    let shared = Harness::new();
    shared.engine.start(&ControlList::new()).unwrap();
    let frame = shared.capture();
    let (_, buffer) = frame.buffers().next().unwrap();
    assert_eq!(buffer.spans.len(), 1);
    drop(frame);
    shared.engine.stop().unwrap();
}
