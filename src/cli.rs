// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Running the preview loop
//! - Listing post-processing stages

use camflow::app::{AppEvent, CameraApp, run_hello};
use camflow::backends::camera::CaptureBackend;
use camflow::backends::camera::types::PixelFormat;
use camflow::backends::virtual_camera::{Pacing, VirtualCamera, VirtualCameraConfig};
use camflow::config::Options;
use camflow::constants::camera;
use camflow::pipelines::post_processing::StageRegistry;
use camflow::preview::{Display, NullDisplay, TerminalDisplay};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Options of the `hello` command; each one overrides the options file
#[derive(Args, Debug, Default)]
pub struct HelloArgs {
    /// JSON options file
    #[arg(short, long)]
    pub options: Option<PathBuf>,

    /// Camera to open (from 'camflow list')
    #[arg(short, long)]
    pub camera: Option<String>,

    /// Run time in milliseconds, 0 runs until quit
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// JSON post-process document
    #[arg(long)]
    pub post_process_file: Option<PathBuf>,

    /// Do not open the terminal preview
    #[arg(short = 'n', long)]
    pub nopreview: bool,

    /// Info-text template (%frame, %fps, %exp, %ag, %dg, %rg, %bg, %focus, %aelock)
    #[arg(long)]
    pub info_text: Option<String>,

    #[arg(long)]
    pub width: Option<u32>,

    #[arg(long)]
    pub height: Option<u32>,

    /// Viewfinder pixel format
    #[arg(long, value_parser = parse_pixel_format)]
    pub pixel_format: Option<PixelFormat>,

    #[arg(long)]
    pub buffer_count: Option<usize>,

    #[arg(long)]
    pub framerate: Option<f64>,

    /// Fixed exposure time in microseconds
    #[arg(long)]
    pub shutter: Option<u64>,

    #[arg(long)]
    pub gain: Option<f32>,

    #[arg(long, allow_hyphen_values = true)]
    pub ev: Option<f32>,

    #[arg(long)]
    pub metering: Option<String>,

    #[arg(long)]
    pub exposure: Option<String>,

    #[arg(long)]
    pub awb: Option<String>,

    /// Fixed red,blue gains
    #[arg(long, value_delimiter = ',')]
    pub awbgains: Option<Vec<f32>>,

    #[arg(long, allow_hyphen_values = true)]
    pub brightness: Option<f32>,

    #[arg(long)]
    pub contrast: Option<f32>,

    #[arg(long)]
    pub saturation: Option<f32>,

    #[arg(long)]
    pub sharpness: Option<f32>,

    #[arg(long)]
    pub denoise: Option<String>,

    /// Region of interest x,y,width,height as sensor fractions
    #[arg(long, value_delimiter = ',')]
    pub roi: Option<Vec<f32>>,
}

impl HelloArgs {
    /// Layer the command line over `options`
    pub fn apply(&self, options: &mut Options) -> Result<(), Box<dyn std::error::Error>> {
        fn set<T: Clone>(field: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *field = value.clone();
            }
        }

        set(&mut options.camera, &self.camera);
        set(&mut options.timeout_ms, &self.timeout);
        set(&mut options.info_text, &self.info_text);
        set(&mut options.width, &self.width);
        set(&mut options.height, &self.height);
        set(&mut options.pixel_format, &self.pixel_format);
        set(&mut options.buffer_count, &self.buffer_count);
        set(&mut options.ev, &self.ev);
        set(&mut options.metering, &self.metering);
        set(&mut options.exposure, &self.exposure);
        set(&mut options.awb, &self.awb);
        set(&mut options.brightness, &self.brightness);
        set(&mut options.contrast, &self.contrast);
        set(&mut options.saturation, &self.saturation);
        set(&mut options.sharpness, &self.sharpness);
        set(&mut options.denoise, &self.denoise);

        if self.post_process_file.is_some() {
            options.post_process_file = self.post_process_file.clone();
        }
        if self.framerate.is_some() {
            options.framerate = self.framerate;
        }
        if self.shutter.is_some() {
            options.shutter_us = self.shutter;
        }
        if self.gain.is_some() {
            options.gain = self.gain;
        }
        if self.nopreview {
            options.nopreview = true;
        }

        if let Some(gains) = &self.awbgains {
            let [red, blue] = gains[..] else {
                return Err("--awbgains takes two values: red,blue".into());
            };
            options.awb_gains = Some([red, blue]);
        }
        if let Some(roi) = &self.roi {
            let [x, y, width, height] = roi[..] else {
                return Err("--roi takes four values: x,y,width,height".into());
            };
            options.roi = Some([x, y, width, height]);
        }
        Ok(())
    }
}

fn parse_pixel_format(name: &str) -> Result<PixelFormat, String> {
    match name.to_ascii_uppercase().as_str() {
        "YUV420" => Ok(PixelFormat::YUV420),
        "NV12" => Ok(PixelFormat::NV12),
        "RGB888" => Ok(PixelFormat::RGB888),
        "BGR888" => Ok(PixelFormat::BGR888),
        _ => Err(format!("unknown pixel format \"{}\"", name)),
    }
}

/// List all available cameras
pub fn list_cameras() -> Result<(), Box<dyn std::error::Error>> {
    let backend = VirtualCamera::default();
    let cameras = backend.cameras();

    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }

    println!("Available cameras:");
    println!();
    for camera in &cameras {
        println!("  [{}] {}", camera.id, camera.model);
        println!("      Sensor: {}", camera.sensor_area);

        if !camera.modes.is_empty() {
            let modes: Vec<String> = camera.modes.iter().map(|mode| mode.to_string()).collect();
            println!("      Modes: {}", modes.join(", "));
        }
        println!();
    }

    Ok(())
}

/// List the stages a post-process file may name
pub fn list_stages() -> Result<(), Box<dyn std::error::Error>> {
    let registry = StageRegistry::with_builtin_stages();
    println!("Post-processing stages:");
    for name in registry.names() {
        println!("  {}", name);
    }
    Ok(())
}

/// Run the preview loop
pub fn hello(args: HelloArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut options = match &args.options {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    args.apply(&mut options)?;
    options.validate()?;

    let fps = options.framerate.unwrap_or(camera::VIRTUAL_CAMERA_FPS);
    let backend: Arc<dyn CaptureBackend> = Arc::new(VirtualCamera::new(VirtualCameraConfig {
        pacing: Pacing::FreeRunning { fps },
        ..VirtualCameraConfig::default()
    }));

    let display: Box<dyn Display> = if options.nopreview {
        Box::new(NullDisplay::new())
    } else {
        Box::new(TerminalDisplay::new()?)
    };

    let timeout = (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms));
    let mut app = CameraApp::new(options, StageRegistry::with_builtin_stages(), display)?;

    let quit = app.event_sender();
    ctrlc::set_handler(move || {
        let _ = quit.send(AppEvent::Quit);
    })?;

    app.open_camera(backend)?;
    let result = run_hello(&mut app, timeout);
    let (shown, dropped) = (app.preview().shown(), app.preview().dropped());
    // Dropping the app restores the terminal before anything is printed
    drop(app);

    let frames = result?;
    info!(frames, shown, dropped, "Session finished");
    println!("Captured {} frames ({} shown, {} dropped)", frames, shown, dropped);
    Ok(())
}
