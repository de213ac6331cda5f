// SPDX-License-Identifier: GPL-3.0-only

//! Buffer pool and mapper
//!
//! Buffers are allocated once per configured stream and mapped once per
//! buffer. Consecutive planes that live in the same memory object are
//! coalesced into a single span, so a three-plane YUV420 buffer backed by one
//! dmabuf shows up as one contiguous byte range.

use super::CaptureBackend;
use super::types::{BufferId, HardwareBuffer, MemoryObject, StreamConfig, StreamId};
use crate::errors::{CaptureError, CaptureResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A mapped byte range of a hardware buffer
#[derive(Debug, Clone)]
pub struct MappedSpan {
    memory: Arc<MemoryObject>,
    offset: usize,
    len: usize,
}

impl MappedSpan {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Identity of the backing memory object
    pub fn memory_id(&self) -> u64 {
        self.memory.id()
    }

    /// Read access to the mapped bytes
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.memory.with_range(self.offset, self.len, f)
    }

    /// Write access to the mapped bytes
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.memory.with_range_mut(self.offset, self.len, f)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.read(|bytes| bytes.to_vec())
    }
}

struct PoolEntry {
    stream: StreamId,
    spans: Vec<MappedSpan>,
}

/// All buffers of the current configuration
#[derive(Default)]
pub struct BufferPool {
    streams: BTreeMap<StreamId, Vec<BufferId>>,
    entries: HashMap<BufferId, PoolEntry>,
}

impl BufferPool {
    /// Allocate and map the buffers of every configured stream
    ///
    /// Streams that will be active at the same time must agree on their
    /// buffer count, since every capture request carries one buffer of each.
    pub fn allocate(backend: &dyn CaptureBackend, configs: &[StreamConfig]) -> CaptureResult<Self> {
        let mut pool = BufferPool::default();

        let result = pool.allocate_all(backend, configs);
        if let Err(e) = result {
            warn!(error = %e, "Buffer allocation failed, releasing partial allocation");
            pool.free(backend);
            return Err(e);
        }

        info!(
            streams = pool.streams.len(),
            buffers_per_stream = pool.buffer_count(),
            "Buffer pool ready"
        );
        Ok(pool)
    }

    fn allocate_all(&mut self, backend: &dyn CaptureBackend, configs: &[StreamConfig]) -> CaptureResult<()> {
        let mut expected_count: Option<usize> = None;

        for config in configs {
            let stream = config.stream.ok_or_else(|| {
                CaptureError::Configuration(format!(
                    "{} stream was never negotiated with the backend",
                    config.role.as_str()
                ))
            })?;

            let buffers = backend
                .allocate(stream)
                .map_err(|e| CaptureError::resource("allocate buffers", e))?;
            if buffers.is_empty() {
                return Err(CaptureError::Resource(format!(
                    "backend returned no buffers for {}",
                    stream
                )));
            }

            // Record before validating so `free` releases this stream too
            let ids: Vec<BufferId> = buffers.iter().map(|b| b.id).collect();
            self.streams.insert(stream, ids);

            match expected_count {
                None => expected_count = Some(buffers.len()),
                Some(count) if count != buffers.len() => {
                    return Err(CaptureError::Configuration(format!(
                        "streams request mismatched buffer counts ({} vs {})",
                        count,
                        buffers.len()
                    )));
                }
                Some(_) => {}
            }

            for buffer in buffers {
                let spans = map_buffer(&buffer)?;
                debug!(
                    buffer = %buffer.id,
                    stream = %stream,
                    planes = buffer.planes.len(),
                    spans = spans.len(),
                    "Mapped buffer"
                );
                self.entries.insert(buffer.id, PoolEntry { stream, spans });
            }
        }

        Ok(())
    }

    /// Mapped spans of a buffer
    pub fn spans(&self, id: BufferId) -> Option<&[MappedSpan]> {
        self.entries.get(&id).map(|entry| entry.spans.as_slice())
    }

    /// Stream a buffer belongs to
    pub fn stream_of(&self, id: BufferId) -> Option<StreamId> {
        self.entries.get(&id).map(|entry| entry.stream)
    }

    /// Buffers of a stream in allocation order
    pub fn buffers(&self, stream: StreamId) -> &[BufferId] {
        self.streams.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.streams.keys().copied()
    }

    /// Buffers per stream (all streams share the same count)
    pub fn buffer_count(&self) -> usize {
        self.streams.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unmap everything and hand the buffers back to the backend
    pub fn free(&mut self, backend: &dyn CaptureBackend) {
        for stream in self.streams.keys() {
            if let Err(e) = backend.free(*stream) {
                warn!(stream = %stream, error = %e, "Failed to free stream buffers");
            }
        }
        self.entries.clear();
        self.streams.clear();
    }
}

/// Map a buffer's planes, coalescing runs of planes that share a memory object
pub fn map_buffer(buffer: &HardwareBuffer) -> CaptureResult<Vec<MappedSpan>> {
    let mut spans: Vec<MappedSpan> = Vec::new();
    // (memory, start, end) of the run being built
    let mut run: Option<(Arc<MemoryObject>, usize, usize)> = None;

    for plane in &buffer.planes {
        let end = plane.offset + plane.length;
        if end > plane.memory.len() {
            return Err(CaptureError::Resource(format!(
                "{} plane [{}..{}) exceeds memory object of {} bytes",
                buffer.id,
                plane.offset,
                end,
                plane.memory.len()
            )));
        }

        run = match run.take() {
            Some((memory, start, run_end)) if memory.id() == plane.memory.id() => {
                Some((memory, start.min(plane.offset), run_end.max(end)))
            }
            Some((memory, start, run_end)) => {
                spans.push(MappedSpan {
                    memory,
                    offset: start,
                    len: run_end - start,
                });
                Some((Arc::clone(&plane.memory), plane.offset, end))
            }
            None => Some((Arc::clone(&plane.memory), plane.offset, end)),
        };
    }

    if let Some((memory, start, end)) = run {
        spans.push(MappedSpan {
            memory,
            offset: start,
            len: end - start,
        });
    }

    if spans.is_empty() {
        return Err(CaptureError::Resource(format!("{} has no planes", buffer.id)));
    }
    Ok(spans)
}
