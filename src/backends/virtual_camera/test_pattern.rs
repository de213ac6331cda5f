// SPDX-License-Identifier: GPL-3.0-only

//! Moving test pattern written into virtual sensor buffers

use crate::backends::camera::types::{HardwareBuffer, PixelFormat, StreamConfig};

/// Fill every plane of `buffer` with frame `frame_index` of the pattern
///
/// Luma is a diagonal ramp that scrolls one pixel per frame; chroma is flat
/// grey. RGB formats get the same ramp in every channel.
pub(crate) fn fill(buffer: &HardwareBuffer, config: &StreamConfig, frame_index: u64) {
    let width = config.size.width as usize;
    let height = config.size.height as usize;
    let stride = config.stride as usize;
    let shift = frame_index as usize;

    match config.pixel_format {
        PixelFormat::YUV420 | PixelFormat::NV12 => {
            if let Some(luma) = buffer.planes.first() {
                luma.memory.with_range_mut(luma.offset, luma.length, |bytes| {
                    for y in 0..height {
                        let row = &mut bytes[y * stride..y * stride + width];
                        for (x, px) in row.iter_mut().enumerate() {
                            *px = ((x + y + shift) & 0xff) as u8;
                        }
                    }
                });
            }
            for chroma in buffer.planes.iter().skip(1) {
                chroma
                    .memory
                    .with_range_mut(chroma.offset, chroma.length, |bytes| bytes.fill(128));
            }
        }
        PixelFormat::RGB888 | PixelFormat::BGR888 => {
            if let Some(plane) = buffer.planes.first() {
                plane.memory.with_range_mut(plane.offset, plane.length, |bytes| {
                    for y in 0..height {
                        let row = &mut bytes[y * stride..y * stride + width * 3];
                        for (x, px) in row.chunks_exact_mut(3).enumerate() {
                            px.fill(((x + y + shift) & 0xff) as u8);
                        }
                    }
                });
            }
        }
    }
}
