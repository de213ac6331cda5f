// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the application shell

use camflow::app::{AppEvent, CameraApp, run_hello};
use camflow::backends::camera::buffer_pool::MappedSpan;
use camflow::backends::camera::types::{BufferId, Size, StreamInfo};
use camflow::backends::camera::{ControlId, ControlList, ControlValue};
use camflow::backends::virtual_camera::{Pacing, VirtualCamera, VirtualCameraConfig};
use camflow::config::Options;
use camflow::pipelines::post_processing::StageRegistry;
use camflow::pipelines::post_processing::stages::MOTION_RESULT_KEY;
use camflow::preview::{Display, DoneCallback, NullDisplay};
use camflow::{CaptureError, CaptureResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn null_app(options: Options) -> CameraApp {
    CameraApp::new(options, StageRegistry::with_builtin_stages(), Box::new(NullDisplay::new())).unwrap()
}

fn expect_frame(app: &CameraApp) -> camflow::FrameHandle {
    match app.wait_timeout(Duration::from_secs(2)) {
        AppEvent::RequestComplete(frame) => frame,
        other => panic!("expected a frame, got {:?}", other),
    }
}

/// A unique scratch file under the system temp directory
fn scratch_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("camflow-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_manual_session_delivers_frames() {
    let camera = VirtualCamera::manual();
    let mut app = null_app(Options::default());
    let info = app.open_camera(Arc::new(camera.clone())).unwrap();
    assert_eq!(info.id, "virtual0");

    app.configure_viewfinder().unwrap();
    assert!(app.viewfinder_stream().is_some());
    app.start_camera().unwrap();

    camera.complete_frames(3);
    for expected in 0..3 {
        assert_eq!(expect_frame(&app).sequence(), expected);
    }

    app.stop_camera().unwrap();
    assert!(matches!(app.wait_timeout(Duration::from_millis(10)), AppEvent::Timeout));
    app.close_camera();
    assert!(app.engine().is_none());
}

#[test]
fn test_posted_events_are_received() {
    let app = null_app(Options::default());
    app.post(AppEvent::Quit);
    assert!(matches!(app.wait(), AppEvent::Quit));

    let sender = app.event_sender();
    std::thread::spawn(move || {
        let _ = sender.send(AppEvent::Error(CaptureError::Hardware("gone".to_string())));
    });
    assert!(matches!(
        app.wait_timeout(Duration::from_secs(2)),
        AppEvent::Error(CaptureError::Hardware(_))
    ));
}

#[test]
fn test_operations_need_an_open_camera() {
    let mut app = null_app(Options::default());
    assert!(matches!(
        app.configure_viewfinder(),
        Err(CaptureError::Configuration(_))
    ));
    assert!(app.start_camera().is_err());
    assert!(app.set_controls(ControlList::new()).is_err());
}

#[test]
fn test_base_controls_reach_the_camera() {
    let camera = VirtualCamera::manual();
    let options = Options {
        framerate: Some(25.0),
        brightness: 0.25,
        ..Options::default()
    };
    let mut app = null_app(options);
    app.open_camera(Arc::new(camera.clone())).unwrap();
    app.configure_viewfinder().unwrap();

    let mut staged = ControlList::new();
    staged.set(ControlId::Brightness, ControlValue::Float(-0.5));
    app.set_controls(staged).unwrap();
    app.start_camera().unwrap();

    let active = camera.active_controls();
    assert_eq!(active.get_f32(ControlId::Brightness), Some(-0.5));
    assert_eq!(active.get_int_pair(ControlId::FrameDurationLimits), Some([40_000, 40_000]));

    camera.complete_frames(2);
    let first = expect_frame(&app);
    let second = expect_frame(&app);
    assert_eq!(first.framerate(), 0.0);
    assert!((second.framerate() - 25.0).abs() < 1e-6);
}

struct SmallDisplay;

impl Display for SmallDisplay {
    fn set_info_text(&mut self, _text: &str) {}

    fn show(&mut self, _buffer: BufferId, _span: &MappedSpan, _info: &StreamInfo) -> CaptureResult<()> {
        Ok(())
    }

    fn set_done_callback(&mut self, _callback: DoneCallback) {}

    fn reset(&mut self) {}

    fn max_image_size(&self) -> (u32, u32) {
        (160, 100)
    }

    fn quit(&mut self) -> bool {
        false
    }
}

#[test]
fn test_viewfinder_bounded_by_display() {
    let camera = VirtualCamera::manual();
    let mut app =
        CameraApp::new(Options::default(), StageRegistry::with_builtin_stages(), Box::new(SmallDisplay))
            .unwrap();
    app.open_camera(Arc::new(camera)).unwrap();
    app.configure_viewfinder().unwrap();

    let engine = app.engine().unwrap();
    let streams = engine.streams();
    // 640x480 scaled into 160x100 keeps 4:3
    assert_eq!(streams[0].size, Size::new(132, 100));
}

#[test]
fn test_post_process_file_runs_stages() {
    let path = scratch_file(
        "post-process.json",
        r#"{ "negate": {}, "motion_detect": { "frame_period": 1 } }"#,
    );
    let camera = VirtualCamera::manual();
    let options = Options {
        post_process_file: Some(path.clone()),
        ..Options::default()
    };
    let mut app = null_app(options);
    app.open_camera(Arc::new(camera.clone())).unwrap();
    app.configure_viewfinder().unwrap();
    app.start_camera().unwrap();

    camera.complete_frames(3);
    for expected in 0..3 {
        let frame = expect_frame(&app);
        assert_eq!(frame.sequence(), expected);
        assert!(frame.post_process_metadata().get::<bool>(MOTION_RESULT_KEY).is_some());
    }
    app.stop_camera().unwrap();
    std::fs::remove_file(path).ok();
}

#[test]
fn test_unknown_stage_fails_at_open() {
    let path = scratch_file("bad-post-process.json", r#"{ "sharpen": {} }"#);
    let options = Options {
        post_process_file: Some(path.clone()),
        ..Options::default()
    };
    let mut app = null_app(options);
    assert!(matches!(
        app.open_camera(Arc::new(VirtualCamera::manual())),
        Err(CaptureError::Configuration(_))
    ));
    std::fs::remove_file(path).ok();
}

#[test]
fn test_hello_loop_runs_until_timeout() {
    let camera = VirtualCamera::new(VirtualCameraConfig {
        pacing: Pacing::FreeRunning { fps: 100.0 },
        ..VirtualCameraConfig::default()
    });
    let options = Options {
        width: 64,
        height: 48,
        ..Options::default()
    };
    let mut app = null_app(options);
    app.open_camera(Arc::new(camera.clone())).unwrap();

    let frames = run_hello(&mut app, Some(Duration::from_millis(300))).unwrap();

    assert!(frames > 0);
    assert!(!camera.is_started());
    assert_eq!(app.engine().unwrap().tracked_frames(), 0);
}

#[test]
fn test_hello_loop_stops_on_quit() {
    let camera = VirtualCamera::new(VirtualCameraConfig {
        pacing: Pacing::FreeRunning { fps: 100.0 },
        ..VirtualCameraConfig::default()
    });
    let mut app = null_app(Options {
        width: 64,
        height: 48,
        ..Options::default()
    });
    app.open_camera(Arc::new(camera)).unwrap();
    let sender = app.event_sender();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        let _ = sender.send(AppEvent::Quit);
    });

    // Would run forever without the quit
    assert!(run_hello(&mut app, None).is_ok());
}
