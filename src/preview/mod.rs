// SPDX-License-Identifier: GPL-3.0-only

//! Preview delivery channel
//!
//! A single-slot mailbox between the capture side and a display consumer
//! thread. The producer never waits: when the slot is still occupied the new
//! frame is dropped (and counted) instead of replacing the pending one.
//!
//! ```text
//!  send(frame) ──▶ [ slot ] ──▶ consumer thread ──▶ Display::show
//!                                     │                   │
//!                                     └── held frames ◀── done(buffer)
//! ```
//!
//! The consumer keeps each shown frame alive until the display reports it is
//! done with that buffer, so a display may scan out of the buffer directly.

mod null;
mod terminal;

pub use null::NullDisplay;
pub use terminal::TerminalDisplay;

use crate::backends::camera::buffer_pool::MappedSpan;
use crate::backends::camera::controls::ControlId;
use crate::backends::camera::types::{BufferId, StreamId, StreamInfo};
use crate::capture::frame::{CompletedFrame, FrameHandle};
use crate::errors::{CaptureError, CaptureResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Called by a display once it no longer needs a buffer
pub type DoneCallback = Arc<dyn Fn(BufferId) + Send + Sync>;

/// Called on the consumer thread when the display asks to quit
pub type QuitHandler = Box<dyn Fn() + Send>;

/// A place to show frames
pub trait Display: Send {
    /// Text to show alongside the next frame
    fn set_info_text(&mut self, text: &str);

    /// Show one buffer
    ///
    /// The display must call the done callback for `buffer` once it has
    /// finished reading from `span`, either before returning or later.
    fn show(&mut self, buffer: BufferId, span: &MappedSpan, info: &StreamInfo) -> CaptureResult<()>;

    fn set_done_callback(&mut self, callback: DoneCallback);

    /// Forget every buffer currently held
    fn reset(&mut self);

    /// Largest image worth sending, `(0, 0)` when unbounded
    fn max_image_size(&self) -> (u32, u32);

    /// Whether the user asked to quit through the display
    fn quit(&mut self) -> bool;
}

#[derive(Default)]
struct Slot {
    pending: Option<(FrameHandle, StreamId)>,
    abort: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    wake: Condvar,
    display: Mutex<Box<dyn Display>>,
    held: Mutex<HashMap<BufferId, FrameHandle>>,
    streams: Mutex<BTreeMap<StreamId, StreamInfo>>,
    info_template: Mutex<String>,
    shown: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_display(&self) -> MutexGuard<'_, Box<dyn Display>> {
        self.display.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_held(&self) -> MutexGuard<'_, HashMap<BufferId, FrameHandle>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Release the frame a display finished with
    fn done(&self, buffer: BufferId) {
        let released = self.lock_held().remove(&buffer);
        // Dropped outside the lock: the last release recycles the request
        drop(released);
    }

    fn release_all(&self) {
        let held: Vec<FrameHandle> = self.lock_held().drain().map(|(_, frame)| frame).collect();
        drop(held);
    }
}

/// Single-slot, drop-if-busy hand-off to a display thread
pub struct PreviewChannel {
    shared: Arc<Shared>,
    max_image_size: (u32, u32),
    thread: Option<JoinHandle<()>>,
}

impl PreviewChannel {
    /// Start the consumer thread around `display`
    pub fn spawn(mut display: Box<dyn Display>, on_quit: QuitHandler) -> CaptureResult<Self> {
        let max_image_size = display.max_image_size();

        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<Shared>| {
            let weak = weak.clone();
            display.set_done_callback(Arc::new(move |buffer| {
                if let Some(shared) = weak.upgrade() {
                    shared.done(buffer);
                }
            }));
            Shared {
                slot: Mutex::new(Slot::default()),
                wake: Condvar::new(),
                display: Mutex::new(display),
                held: Mutex::new(HashMap::new()),
                streams: Mutex::new(BTreeMap::new()),
                info_template: Mutex::new(String::new()),
                shown: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }
        });

        let consumer = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("preview".to_string())
            .spawn(move || run_consumer(consumer, on_quit))
            .map_err(|e| CaptureError::Resource(format!("spawn preview thread: {}", e)))?;

        Ok(Self {
            shared,
            max_image_size,
            thread: Some(thread),
        })
    }

    /// Offer a frame for display
    ///
    /// Returns false if the slot was busy and the frame was dropped.
    pub fn send(&self, frame: FrameHandle, stream: StreamId) -> bool {
        let mut slot = self.shared.lock_slot();
        if slot.abort {
            return false;
        }
        if slot.pending.is_some() {
            drop(slot);
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(sequence = frame.sequence(), dropped, "Preview busy, dropping frame");
            return false;
        }
        slot.pending = Some((frame, stream));
        drop(slot);
        self.shared.wake.notify_one();
        true
    }

    /// Geometry of the streams frames will arrive on
    pub fn set_streams(&self, streams: BTreeMap<StreamId, StreamInfo>) {
        *self.shared.streams.lock().unwrap_or_else(|e| e.into_inner()) = streams;
    }

    /// Template for the info text, see [`format_info_text`]
    pub fn set_info_template(&self, template: &str) {
        *self.shared.info_template.lock().unwrap_or_else(|e| e.into_inner()) = template.to_string();
    }

    /// Drop the pending frame and every frame the display still holds
    pub fn clear(&self) {
        let pending = self.shared.lock_slot().pending.take();
        drop(pending);
        self.shared.lock_display().reset();
        self.shared.release_all();
        debug!("Preview cleared");
    }

    pub fn shown(&self) -> u64 {
        self.shared.shown.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting in the slot or held by the display
    pub fn held_frames(&self) -> usize {
        let pending = usize::from(self.shared.lock_slot().pending.is_some());
        pending + self.shared.lock_held().len()
    }

    pub fn max_image_size(&self) -> (u32, u32) {
        self.max_image_size
    }

    /// Stop the consumer thread and release everything it holds
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.lock_slot().abort = true;
        self.shared.wake.notify_all();
        if thread.join().is_err() {
            warn!("Preview thread panicked");
        }
        let pending = self.shared.lock_slot().pending.take();
        drop(pending);
        self.shared.release_all();
        debug!(
            shown = self.shown(),
            dropped = self.dropped(),
            "Preview thread stopped"
        );
    }
}

impl Drop for PreviewChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_consumer(shared: Arc<Shared>, on_quit: QuitHandler) {
    debug!("Preview thread started");
    loop {
        let (frame, stream) = {
            let mut slot = shared.lock_slot();
            while slot.pending.is_none() && !slot.abort {
                slot = shared.wake.wait(slot).unwrap_or_else(|e| e.into_inner());
            }
            if slot.abort {
                drop(slot);
                shared.lock_display().reset();
                break;
            }
            match slot.pending.take() {
                Some(item) => item,
                None => continue,
            }
        };

        let info = shared
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream)
            .copied();
        let (Some(info), Some(buffer)) = (info, frame.buffer(stream)) else {
            warn!(stream = %stream, "No geometry or buffer for preview stream");
            continue;
        };
        let Some(span) = buffer.span().cloned() else {
            continue;
        };
        let buffer_id = buffer.id;

        let template = shared
            .info_template
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let text = format_info_text(&template, &frame);

        // Held until the display says it is done with the buffer
        let replaced = shared.lock_held().insert(buffer_id, frame);
        drop(replaced);

        let (shown, quit) = {
            let mut display = shared.lock_display();
            display.set_info_text(&text);
            let shown = display.show(buffer_id, &span, &info);
            (shown, display.quit())
        };
        match shown {
            Ok(()) => {
                shared.shown.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(error = %e, "Preview display failed");
                shared.done(buffer_id);
            }
        }

        if quit {
            debug!("Display requested quit");
            on_quit();
        }
    }
    debug!("Preview thread exiting");
}

/// Expand the info-text tokens for `frame`
///
/// `%frame`, `%fps`, `%exp`, `%ag`, `%dg`, `%rg`, `%bg`, `%focus` and
/// `%aelock` are replaced; values missing from the metadata read as `0`.
pub fn format_info_text(template: &str, frame: &CompletedFrame) -> String {
    if template.is_empty() {
        return String::new();
    }
    let metadata = frame.metadata();
    let float = |id: ControlId| {
        metadata
            .get_f32(id)
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "0".to_string())
    };
    let int = |id: ControlId| metadata.get_i64(id).unwrap_or(0).to_string();
    let gains = metadata.get_float_pair(ControlId::ColourGains);
    let gain = |index: usize| {
        gains
            .map(|pair| format!("{:.2}", pair[index]))
            .unwrap_or_else(|| "0".to_string())
    };

    let replacements = [
        ("%frame", frame.sequence().to_string()),
        ("%fps", format!("{:.2}", frame.framerate())),
        ("%exp", int(ControlId::ExposureTime)),
        ("%ag", float(ControlId::AnalogueGain)),
        ("%dg", float(ControlId::DigitalGain)),
        ("%rg", gain(0)),
        ("%bg", gain(1)),
        ("%focus", int(ControlId::FocusFoM)),
        (
            "%aelock",
            u8::from(metadata.get_bool(ControlId::AeLocked).unwrap_or(false)).to_string(),
        ),
    ];

    replacements
        .iter()
        .fold(template.to_string(), |text, (token, value)| text.replace(token, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::controls::{ControlList, ControlValue};
    use crate::capture::frame::FrameParts;

    #[test]
    fn test_info_text_tokens() {
        let mut metadata = ControlList::new();
        metadata.set(ControlId::ExposureTime, ControlValue::Int(10_000));
        metadata.set(ControlId::AnalogueGain, ControlValue::Float(2.0));
        metadata.set(ControlId::ColourGains, ControlValue::FloatPair([1.5, 2.25]));
        metadata.set(ControlId::AeLocked, ControlValue::Bool(true));
        let frame = CompletedFrame::new(
            FrameParts {
                sequence: 42,
                framerate: 29.97,
                metadata,
                ..FrameParts::default()
            },
            None,
        );

        let text = format_info_text(
            "#%frame (%fps fps) exp %exp ag %ag dg %dg rg %rg bg %bg focus %focus lock %aelock",
            &frame,
        );
        assert_eq!(
            text,
            "#42 (29.97 fps) exp 10000 ag 2.00 dg 0 rg 1.50 bg 2.25 focus 0 lock 1"
        );
    }

    #[test]
    fn test_empty_template() {
        let frame = CompletedFrame::new(FrameParts::default(), None);
        assert_eq!(format_info_text("", &frame), "");
    }
}
