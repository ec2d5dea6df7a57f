use bytes::Bytes;

use crate::config::RecordingConfig;
use crate::media::VideoFrame;

/// Background where the remote picture is missing
pub const BLANK: [u8; 4] = [0, 0, 0, 255];
/// Inset fill where the local picture is missing
pub const INSET_PLACEHOLDER: [u8; 4] = [48, 48, 48, 255];

/// Output geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub inset_width: u32,
    pub inset_height: u32,
    pub inset_margin: u32,
}

impl Layout {
    /// Top-left corner of the local inset (bottom-right of the frame)
    pub fn inset_origin(&self) -> (u32, u32) {
        (
            self.width
                .saturating_sub(self.inset_width + self.inset_margin),
            self.height
                .saturating_sub(self.inset_height + self.inset_margin),
        )
    }
}

impl From<&RecordingConfig> for Layout {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            inset_width: config.inset_width.min(config.width),
            inset_height: config.inset_height.min(config.height),
            inset_margin: config.inset_margin,
        }
    }
}

/// Renders one output frame per recording tick
pub trait Compositor: Send {
    /// Missing sides are drawn as placeholders
    fn compose(
        &mut self,
        remote: Option<&VideoFrame>,
        local: Option<&VideoFrame>,
        timestamp_ms: u64,
    ) -> VideoFrame;
}

/// Draws the remote picture full-frame with the local picture as an inset
pub struct SoftwareCompositor {
    layout: Layout,
    canvas: Vec<u8>,
}

impl SoftwareCompositor {
    pub fn new(layout: Layout) -> Self {
        let canvas = vec![0; (layout.width * layout.height * 4) as usize];
        Self { layout, canvas }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl Compositor for SoftwareCompositor {
    fn compose(
        &mut self,
        remote: Option<&VideoFrame>,
        local: Option<&VideoFrame>,
        timestamp_ms: u64,
    ) -> VideoFrame {
        let Layout {
            width,
            height,
            inset_width,
            inset_height,
            ..
        } = self.layout;
        let (inset_x, inset_y) = self.layout.inset_origin();

        match remote {
            Some(frame) => self.blit(frame, 0, 0, width, height),
            None => self.fill(0, 0, width, height, BLANK),
        }
        match local {
            Some(frame) => self.blit(frame, inset_x, inset_y, inset_width, inset_height),
            None => self.fill(inset_x, inset_y, inset_width, inset_height, INSET_PLACEHOLDER),
        }

        VideoFrame {
            width,
            height,
            data: Bytes::copy_from_slice(&self.canvas),
            timestamp_ms,
        }
    }
}

impl SoftwareCompositor {
    fn fill(&mut self, x0: u32, y0: u32, w: u32, h: u32, rgba: [u8; 4]) {
        let stride = self.layout.width as usize * 4;
        let x_end = (x0 + w).min(self.layout.width) as usize;
        let y_end = (y0 + h).min(self.layout.height) as usize;

        for y in y0 as usize..y_end {
            let row = &mut self.canvas[y * stride..(y + 1) * stride];
            for x in x0 as usize..x_end {
                row[x * 4..x * 4 + 4].copy_from_slice(&rgba);
            }
        }
    }

    /// Nearest-neighbour scale `frame` into the w x h rectangle at (x0, y0)
    fn blit(&mut self, frame: &VideoFrame, x0: u32, y0: u32, w: u32, h: u32) {
        let expected = (frame.width as usize) * (frame.height as usize) * 4;
        if frame.width == 0 || frame.height == 0 || frame.data.len() < expected {
            self.fill(x0, y0, w, h, BLANK);
            return;
        }

        let stride = self.layout.width as usize * 4;
        let src_stride = frame.width as usize * 4;
        let x_end = (x0 + w).min(self.layout.width);
        let y_end = (y0 + h).min(self.layout.height);

        for y in y0..y_end {
            let src_y = ((y - y0) as u64 * frame.height as u64 / h as u64) as usize;
            let src_row = &frame.data[src_y * src_stride..(src_y + 1) * src_stride];
            let row = &mut self.canvas[y as usize * stride..(y as usize + 1) * stride];

            for x in x0..x_end {
                let src_x = ((x - x0) as u64 * frame.width as u64 / w as u64) as usize;
                let dst = x as usize * 4;
                row[dst..dst + 4].copy_from_slice(&src_row[src_x * 4..src_x * 4 + 4]);
            }
        }
    }
}
