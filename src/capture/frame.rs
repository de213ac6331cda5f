// SPDX-License-Identifier: GPL-3.0-only

//! Completed frame envelope
//!
//! A [`CompletedFrame`] is shared through [`FrameHandle`] (an `Arc`) between
//! the pipeline, the preview channel and the application. Nobody has to say
//! when they are done with it: dropping the last handle runs the recycle hook
//! exactly once, on whichever thread that happens to be. How long a frame may
//! be retained is therefore independent of how soon buffers return to the
//! hardware, as long as holders let go eventually.

use crate::backends::camera::buffer_pool::MappedSpan;
use crate::backends::camera::controls::{ControlId, ControlList};
use crate::backends::camera::types::{BufferId, StreamId};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

/// Shared handle to a completed frame
pub type FrameHandle = Arc<CompletedFrame>;

/// Receives frames whose last reference was dropped
pub trait Recycle: Send + Sync {
    fn recycle(&self, ticket: RecycleTicket);
}

/// Everything the engine needs to put a released frame's buffers back
#[derive(Debug, Clone)]
pub struct RecycleTicket {
    pub sequence: u64,
    pub cookie: u64,
    /// Configuration epoch the frame was captured in
    pub epoch: u64,
    pub buffers: BTreeMap<StreamId, BufferId>,
}

/// One stream's buffer inside a frame
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub id: BufferId,
    pub spans: Vec<MappedSpan>,
}

impl FrameBuffer {
    /// The first (usually only) mapped span
    pub fn span(&self) -> Option<&MappedSpan> {
        self.spans.first()
    }
}

/// Metadata that stages publish for later stages (or the application)
///
/// Values are typed; a reader asking for the wrong type gets `None`.
#[derive(Default)]
pub struct PostProcessMetadata {
    entries: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl PostProcessMetadata {
    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.lock().insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.lock()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Box<dyn Any + Send + Sync>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PostProcessMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessMetadata")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Parts a frame is assembled from
#[derive(Debug, Clone, Default)]
pub struct FrameParts {
    pub sequence: u64,
    pub cookie: u64,
    pub epoch: u64,
    pub buffers: BTreeMap<StreamId, FrameBuffer>,
    pub metadata: ControlList,
    pub framerate: f64,
    pub timestamp_ns: u64,
}

/// Result of one finished capture
#[derive(Debug)]
pub struct CompletedFrame {
    parts: FrameParts,
    post_process_metadata: PostProcessMetadata,
    recycler: Option<Weak<dyn Recycle>>,
}

impl CompletedFrame {
    /// Wrap `parts` in a handle whose final release calls `recycler`
    pub fn new(parts: FrameParts, recycler: Option<Weak<dyn Recycle>>) -> FrameHandle {
        Arc::new(Self {
            parts,
            post_process_metadata: PostProcessMetadata::default(),
            recycler,
        })
    }

    /// Strictly monotonic per-session counter
    pub fn sequence(&self) -> u64 {
        self.parts.sequence
    }

    /// Instantaneous frame rate (0 for the first frame of a session)
    pub fn framerate(&self) -> f64 {
        self.parts.framerate
    }

    /// Timestamp used for the rate computation, in nanoseconds
    pub fn timestamp_ns(&self) -> u64 {
        self.parts.timestamp_ns
    }

    /// Result metadata reported by the backend
    pub fn metadata(&self) -> &ControlList {
        &self.parts.metadata
    }

    pub fn buffer(&self, stream: StreamId) -> Option<&FrameBuffer> {
        self.parts.buffers.get(&stream)
    }

    pub fn span(&self, stream: StreamId) -> Option<&MappedSpan> {
        self.buffer(stream).and_then(FrameBuffer::span)
    }

    pub fn buffers(&self) -> impl Iterator<Item = (StreamId, &FrameBuffer)> {
        self.parts.buffers.iter().map(|(stream, buffer)| (*stream, buffer))
    }

    pub fn post_process_metadata(&self) -> &PostProcessMetadata {
        &self.post_process_metadata
    }

    /// Shorthand for a numeric metadata value
    pub fn metadata_f32(&self, id: ControlId) -> Option<f32> {
        self.parts.metadata.get_f32(id)
    }
}

impl Drop for CompletedFrame {
    fn drop(&mut self) {
        let Some(recycler) = self.recycler.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let buffers = self
            .parts
            .buffers
            .iter()
            .map(|(stream, buffer)| (*stream, buffer.id))
            .collect();
        recycler.recycle(RecycleTicket {
            sequence: self.parts.sequence,
            cookie: self.parts.cookie,
            epoch: self.parts.epoch,
            buffers,
        });
    }
}
