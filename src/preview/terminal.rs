// SPDX-License-Identifier: GPL-3.0-only

//! Terminal preview
//!
//! Renders frames to the terminal using Unicode half-block characters for
//! improved vertical resolution. Each cell shows two vertical pixels: the
//! upper one as the foreground of `▀`, the lower one as the background.

use super::{Display, DoneCallback};
use crate::backends::camera::buffer_pool::MappedSpan;
use crate::backends::camera::types::{BufferId, PixelFormat, StreamInfo};
use crate::errors::{CaptureError, CaptureResult};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Terminal, backend::CrosstermBackend, buffer::Buffer, layout::Rect, style::Color,
    widgets::Widget,
};
use std::io::{self, Stdout, stdout};
use std::time::Duration;
use tracing::{debug, warn};

/// Display rendering into the controlling terminal
pub struct TerminalDisplay {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    done: Option<DoneCallback>,
    info_text: String,
    image: HalfBlockImage,
    quit: bool,
}

impl TerminalDisplay {
    /// Switch the terminal to raw mode on the alternate screen
    pub fn new() -> CaptureResult<Self> {
        let setup = || -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
            enable_raw_mode()?;
            let mut stdout = stdout();
            execute!(stdout, EnterAlternateScreen)?;
            Terminal::new(CrosstermBackend::new(stdout))
        };
        let terminal =
            setup().map_err(|e| CaptureError::Resource(format!("terminal setup: {}", e)))?;
        debug!("Terminal preview ready");

        Ok(Self {
            terminal,
            done: None,
            info_text: String::new(),
            image: HalfBlockImage::default(),
            quit: false,
        })
    }

    /// Terminal cells available for the image (one line is the status bar)
    fn image_area(&self) -> (u16, u16) {
        match self.terminal.size() {
            Ok(size) => (size.width, size.height.saturating_sub(1)),
            Err(_) => (0, 0),
        }
    }

    fn poll_input(&mut self) -> io::Result<()> {
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()?
                && key.kind == KeyEventKind::Press
            {
                // Raw mode swallows SIGINT, so Ctrl+C arrives as a key
                let ctrl_c =
                    key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
                if ctrl_c || key.code == KeyCode::Char('q') {
                    self.quit = true;
                }
            }
        }
        Ok(())
    }
}

impl Drop for TerminalDisplay {
    fn drop(&mut self) {
        let restore = |terminal: &mut Terminal<CrosstermBackend<Stdout>>| -> io::Result<()> {
            disable_raw_mode()?;
            execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
            terminal.show_cursor()
        };
        if let Err(e) = restore(&mut self.terminal) {
            warn!(error = %e, "Failed to restore terminal");
        }
    }
}

impl Display for TerminalDisplay {
    fn set_info_text(&mut self, text: &str) {
        self.info_text.clear();
        self.info_text.push_str(text);
    }

    fn show(&mut self, buffer: BufferId, span: &MappedSpan, info: &StreamInfo) -> CaptureResult<()> {
        let (columns, rows) = self.image_area();
        self.image = span.read(|data| HalfBlockImage::sample(data, info, columns, rows));

        // Everything needed is copied out; the buffer can go back
        if let Some(done) = &self.done {
            done(buffer);
        }

        let status = if self.info_text.is_empty() {
            "'q' quit".to_string()
        } else {
            format!("{} | 'q' quit", self.info_text)
        };
        let image = &self.image;
        self.terminal
            .draw(|f| {
                let area = f.area();
                let image_area = Rect {
                    height: area.height.saturating_sub(1),
                    ..area
                };
                f.render_widget(image, image_area);

                let status_area = Rect {
                    x: area.x,
                    y: area.height.saturating_sub(1),
                    width: area.width,
                    height: 1,
                };
                f.render_widget(StatusBar { message: &status }, status_area);
            })
            .map_err(|e| CaptureError::Resource(format!("terminal draw: {}", e)))?;

        self.poll_input()
            .map_err(|e| CaptureError::Resource(format!("terminal input: {}", e)))
    }

    fn set_done_callback(&mut self, callback: DoneCallback) {
        self.done = Some(callback);
    }

    fn reset(&mut self) {
        self.image = HalfBlockImage::default();
    }

    fn max_image_size(&self) -> (u32, u32) {
        let (columns, rows) = self.image_area();
        (columns as u32, rows as u32 * 2)
    }

    fn quit(&mut self) -> bool {
        if let Err(e) = self.poll_input() {
            warn!(error = %e, "Terminal input failed");
        }
        self.quit
    }
}

/// A frame downsampled to terminal cells
#[derive(Default)]
struct HalfBlockImage {
    width: u16,
    height: u16,
    /// (top, bottom) colour per cell, row-major
    cells: Vec<(Color, Color)>,
}

impl HalfBlockImage {
    /// Fit the frame into `columns` x `rows` cells keeping its aspect ratio
    fn sample(data: &[u8], info: &StreamInfo, columns: u16, rows: u16) -> Self {
        if info.width == 0 || info.height == 0 || columns == 0 || rows == 0 {
            return Self::default();
        }

        let frame_aspect = info.width as f64 / info.height as f64;
        let term_width = columns as f64;
        let term_height = (rows * 2) as f64;

        let (width, height) = if term_width / term_height > frame_aspect {
            let h = term_height;
            ((h * frame_aspect) as u16, (h / 2.0) as u16)
        } else {
            let w = term_width;
            (w as u16, (w / frame_aspect / 2.0) as u16)
        };
        let (width, height) = (width.max(1), height.max(1));

        let x_scale = info.width as f64 / width as f64;
        let y_scale = info.height as f64 / (height * 2) as f64;

        let mut cells = Vec::with_capacity(width as usize * height as usize);
        for ty in 0..height {
            for tx in 0..width {
                let src_x = (tx as f64 * x_scale) as u32;
                let src_y_top = (ty as f64 * 2.0 * y_scale) as u32;
                let src_y_bottom = ((ty as f64 * 2.0 + 1.0) * y_scale) as u32;
                cells.push((
                    sample_pixel(data, info, src_x, src_y_top),
                    sample_pixel(data, info, src_x, src_y_bottom),
                ));
            }
        }

        Self { width, height, cells }
    }
}

impl Widget for &HalfBlockImage {
    fn render(self, area: Rect, buf: &mut Buffer) {
        if self.cells.is_empty() {
            let msg = "Waiting for camera...";
            let x = area.x + (area.width.saturating_sub(msg.len() as u16)) / 2;
            let y = area.y + area.height / 2;
            if y < area.y + area.height && x < area.x + area.width {
                buf.set_string(x, y, msg, ratatui::style::Style::default());
            }
            return;
        }

        let x_offset = area.x + (area.width.saturating_sub(self.width)) / 2;
        let y_offset = area.y + (area.height.saturating_sub(self.height)) / 2;

        for ty in 0..self.height {
            for tx in 0..self.width {
                let term_x = x_offset + tx;
                let term_y = y_offset + ty;
                if term_x >= area.x + area.width || term_y >= area.y + area.height {
                    continue;
                }

                let (top, bottom) = self.cells[ty as usize * self.width as usize + tx as usize];
                if let Some(cell) = buf.cell_mut((term_x, term_y)) {
                    cell.set_char('▀');
                    cell.set_fg(top);
                    cell.set_bg(bottom);
                }
            }
        }
    }
}

fn sample_pixel(data: &[u8], info: &StreamInfo, x: u32, y: u32) -> Color {
    let (r, g, b) = sample_pixel_rgb(data, info, x, y);
    Color::Rgb(r, g, b)
}

fn sample_pixel_rgb(data: &[u8], info: &StreamInfo, x: u32, y: u32) -> (u8, u8, u8) {
    let x = x.min(info.width - 1) as usize;
    let y = y.min(info.height - 1) as usize;
    let stride = info.stride as usize;
    let height = info.height as usize;

    match info.pixel_format {
        PixelFormat::RGB888 | PixelFormat::BGR888 => {
            let idx = y * stride + x * 3;
            if idx + 2 >= data.len() {
                return (0, 0, 0);
            }
            if info.pixel_format == PixelFormat::RGB888 {
                (data[idx], data[idx + 1], data[idx + 2])
            } else {
                (data[idx + 2], data[idx + 1], data[idx])
            }
        }
        PixelFormat::NV12 => {
            let y_idx = y * stride + x;
            if y_idx >= data.len() {
                return (0, 0, 0);
            }
            let luma = data[y_idx];

            // Interleaved UV after the Y plane, at half resolution
            let uv_idx = stride * height + (y / 2) * stride + (x & !1);
            if uv_idx + 1 >= data.len() {
                return (luma, luma, luma);
            }
            yuv_to_rgb(luma, data[uv_idx], data[uv_idx + 1])
        }
        PixelFormat::YUV420 => {
            let y_idx = y * stride + x;
            if y_idx >= data.len() {
                return (0, 0, 0);
            }
            let luma = data[y_idx];

            let chroma_stride = stride / 2;
            let u_offset = stride * height;
            let v_offset = u_offset + chroma_stride * height.div_ceil(2);
            let c_idx = (y / 2) * chroma_stride + x / 2;
            if v_offset + c_idx >= data.len() {
                // Chroma lives in another memory object
                return (luma, luma, luma);
            }
            yuv_to_rgb(luma, data[u_offset + c_idx], data[v_offset + c_idx])
        }
    }
}

/// Convert YUV (BT.601) to RGB
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;

    (r, g, b)
}

/// Status bar widget
struct StatusBar<'a> {
    message: &'a str,
}

impl Widget for StatusBar<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for x in area.x..area.x + area.width {
            if let Some(cell) = buf.cell_mut((x, area.y)) {
                cell.set_char(' ');
                cell.set_bg(Color::DarkGray);
            }
        }

        let text: String = self.message.chars().take(area.width as usize).collect();
        buf.set_string(
            area.x,
            area.y,
            text,
            ratatui::style::Style::default()
                .fg(Color::White)
                .bg(Color::DarkGray),
        );
    }
}
