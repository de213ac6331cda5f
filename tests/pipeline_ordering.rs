// SPDX-License-Identifier: GPL-3.0-only

//! Ordering and drop behaviour of the post-processing pipeline

use camflow::capture::frame::{FrameParts, Recycle, RecycleTicket};
use camflow::capture::{CompletedFrame, FrameHandle};
use camflow::pipelines::post_processing::{Delivery, Pipeline, Stage, StageRegistry};
use camflow::{CaptureError, StageError};
use serde_json::json;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Records the sequence of every released frame
#[derive(Default)]
struct ReleaseLog(Mutex<Vec<u64>>);

impl Recycle for ReleaseLog {
    fn recycle(&self, ticket: RecycleTicket) {
        self.0.lock().unwrap().push(ticket.sequence);
    }
}

impl ReleaseLog {
    fn released(&self) -> Vec<u64> {
        let mut released = self.0.lock().unwrap().clone();
        released.sort_unstable();
        released
    }
}

fn frame(sequence: u64, log: &Arc<ReleaseLog>) -> FrameHandle {
    let recycler: Weak<dyn Recycle> = Arc::downgrade(log) as Weak<dyn Recycle>;
    CompletedFrame::new(
        FrameParts {
            sequence,
            ..FrameParts::default()
        },
        Some(recycler),
    )
}

fn collecting_pipeline() -> (Pipeline, mpsc::Receiver<Delivery>) {
    let (tx, rx) = mpsc::channel();
    let pipeline = Pipeline::new(Arc::new(move |delivery| {
        let _ = tx.send(delivery);
    }));
    (pipeline, rx)
}

/// Sequences delivered so far; the frames themselves are released
fn delivered(rx: &mpsc::Receiver<Delivery>) -> (Vec<u64>, Vec<CaptureError>) {
    let mut frames = Vec::new();
    let mut errors = Vec::new();
    for delivery in rx.try_iter() {
        match delivery {
            Delivery::Frame(frame) => frames.push(frame.sequence()),
            Delivery::Failed(e) => errors.push(e),
        }
    }
    (frames, errors)
}

/// Sleeps a pseudo-random time derived from the sequence number
struct Jitter {
    salt: u64,
}

impl Stage for Jitter {
    fn name(&self) -> &str {
        "jitter"
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        let mixed = (frame.sequence() ^ self.salt)
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        std::thread::sleep(Duration::from_micros((mixed >> 33) % 4000));
        Ok(false)
    }
}

struct Keep;

impl Stage for Keep {
    fn name(&self) -> &str {
        "keep"
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        frame.post_process_metadata().set("keep.seen", frame.sequence());
        Ok(false)
    }
}

/// Drops every third frame and checks the previous stage ran first
struct DropEveryThird;

impl Stage for DropEveryThird {
    fn name(&self) -> &str {
        "drop_every_third"
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        if frame.post_process_metadata().get::<u64>("keep.seen") != Some(frame.sequence()) {
            return Err(StageError::new(self.name(), "keep stage did not run"));
        }
        Ok(frame.sequence() % 3 == 2)
    }
}

struct DropAll;

impl Stage for DropAll {
    fn name(&self) -> &str {
        "drop_all"
    }

    fn process(&self, _frame: &CompletedFrame) -> Result<bool, StageError> {
        Ok(true)
    }
}

struct FailAt(u64);

impl Stage for FailAt {
    fn name(&self) -> &str {
        "fail_at"
    }

    fn process(&self, frame: &CompletedFrame) -> Result<bool, StageError> {
        if frame.sequence() == self.0 {
            return Err(StageError::new(self.name(), "injected failure"));
        }
        Ok(false)
    }
}

#[test]
fn test_order_survives_jittered_stages() {
    let log = Arc::new(ReleaseLog::default());
    let (mut pipeline, rx) = collecting_pipeline();
    pipeline.add_stage(Box::new(Jitter { salt: 0x5eed }));
    pipeline.add_stage(Box::new(Jitter { salt: 0xbeef }));
    pipeline.start().unwrap();

    for sequence in 0..60 {
        pipeline.process(frame(sequence, &log));
    }
    pipeline.stop();

    let (frames, errors) = delivered(&rx);
    assert!(errors.is_empty());
    assert_eq!(frames, (0..60).collect::<Vec<u64>>());
    assert_eq!(pipeline.pending(), 0);
    assert_eq!(log.released(), (0..60).collect::<Vec<u64>>());
}

#[test]
fn test_keep_then_drop_every_third() {
    let log = Arc::new(ReleaseLog::default());
    let (mut pipeline, rx) = collecting_pipeline();
    pipeline.add_stage(Box::new(Keep));
    pipeline.add_stage(Box::new(DropEveryThird));
    pipeline.start().unwrap();

    for sequence in 0..10 {
        pipeline.process(frame(sequence, &log));
    }
    pipeline.stop();

    let (frames, errors) = delivered(&rx);
    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(frames, vec![0, 1, 3, 4, 6, 7, 9]);
}

#[test]
fn test_dropped_frames_are_recycled_without_deadlock() {
    let log = Arc::new(ReleaseLog::default());
    let (mut pipeline, rx) = collecting_pipeline();
    pipeline.add_stage(Box::new(DropAll));
    pipeline.start().unwrap();

    for sequence in 0..20 {
        pipeline.process(frame(sequence, &log));
    }
    pipeline.stop();

    assert!(rx.try_recv().is_err());
    assert_eq!(log.released(), (0..20).collect::<Vec<u64>>());
    assert!(!pipeline.is_running());
}

#[test]
fn test_stage_failure_ends_delivery_for_the_session() {
    let log = Arc::new(ReleaseLog::default());
    let (mut pipeline, rx) = collecting_pipeline();
    pipeline.add_stage(Box::new(FailAt(3)));
    pipeline.start().unwrap();

    for sequence in 0..8 {
        pipeline.process(frame(sequence, &log));
    }
    pipeline.stop();

    let (frames, errors) = delivered(&rx);
    assert_eq!(frames, vec![0, 1, 2]);
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], CaptureError::Stage(e) if e.stage == "fail_at"));
    // Nothing leaks, including the frames behind the failure
    assert_eq!(log.released(), (0..8).collect::<Vec<u64>>());

    // A fresh session delivers again
    pipeline.start().unwrap();
    pipeline.process(frame(10, &log));
    pipeline.stop();
    let (frames, errors) = delivered(&rx);
    assert_eq!(frames, vec![10]);
    assert!(errors.is_empty());
}

#[test]
fn test_loaded_stages_keep_document_order() {
    let (mut pipeline, _rx) = collecting_pipeline();
    let registry = StageRegistry::with_builtin_stages();
    pipeline
        .load(
            &registry,
            &json!({
                "negate": {},
                "motion_detect": { "frame_period": 2 }
            }),
        )
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec!["negate", "motion_detect"]);

    let mut registry = StageRegistry::with_builtin_stages();
    registry.register("keep", || Box::new(Keep) as Box<dyn Stage>);
    let (mut pipeline, _rx) = collecting_pipeline();
    pipeline
        .load(&registry, &json!({ "keep": null, "negate": {} }))
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec!["keep", "negate"]);
}

#[test]
fn test_invalid_stage_parameters_are_rejected() {
    let (mut pipeline, _rx) = collecting_pipeline();
    let registry = StageRegistry::with_builtin_stages();
    let err = pipeline
        .load(&registry, &json!({ "motion_detect": { "hskip": 0 } }))
        .unwrap_err();
    assert!(matches!(err, CaptureError::Configuration(_)));
}
