//! Annotated-frame rendering.
//!
//! Draws the counting line, lane dividers, and active track boxes over a raw
//! RGB frame. The output is a plain pixel buffer for whatever serving layer
//! sits above the core; nothing here feeds back into counting.

use crate::config::CountingSettings;
use crate::counting::LineOrientation;
use crate::track::Track;

const LINE_COLOR: [u8; 3] = [220, 40, 40];
const DIVIDER_COLOR: [u8; 3] = [128, 128, 128];
const TRACK_COLOR: [u8; 3] = [40, 200, 40];
const COUNTED_COLOR: [u8; 3] = [230, 210, 40];

const LINE_THICKNESS: u32 = 3;
const DASH_ON: u32 = 8;
const DASH_PERIOD: u32 = 14;

/// One rendered overlay frame (RGB, row-major).
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Render the overlay onto a copy of `pixels`. Returns `None` if the buffer
/// does not match the stated dimensions.
pub fn render(
    pixels: &[u8],
    width: u32,
    height: u32,
    tracks: &[Track],
    counting: &CountingSettings,
) -> Option<AnnotatedFrame> {
    if pixels.len() != (width as usize) * (height as usize) * 3 || width == 0 || height == 0 {
        return None;
    }
    let mut canvas = Canvas {
        pixels: pixels.to_vec(),
        width,
        height,
    };

    // Counting line: solid, perpendicular to the crossing axis.
    match counting.orientation {
        LineOrientation::Horizontal => {
            let y = to_pixel(counting.line_position, height);
            canvas.hline(y, LINE_THICKNESS, LINE_COLOR, false);
            for &b in &counting.lane_boundaries {
                canvas.vline(to_pixel(b, width), 1, DIVIDER_COLOR, true);
            }
        }
        LineOrientation::Vertical => {
            let x = to_pixel(counting.line_position, width);
            canvas.vline(x, LINE_THICKNESS, LINE_COLOR, false);
            for &b in &counting.lane_boundaries {
                canvas.hline(to_pixel(b, height), 1, DIVIDER_COLOR, true);
            }
        }
    }

    for track in tracks {
        let color = if track.counted() {
            COUNTED_COLOR
        } else {
            TRACK_COLOR
        };
        canvas.rect(
            to_pixel(track.bbox.x, width),
            to_pixel(track.bbox.y, height),
            to_pixel(track.bbox.w, width),
            to_pixel(track.bbox.h, height),
            color,
        );
    }

    Some(AnnotatedFrame {
        pixels: canvas.pixels,
        width,
        height,
    })
}

fn to_pixel(fraction: f32, extent: u32) -> u32 {
    let clamped = fraction.clamp(0.0, 1.0);
    ((clamped * extent as f32) as u32).min(extent.saturating_sub(1))
}

struct Canvas {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl Canvas {
    fn put(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        self.pixels[idx..idx + 3].copy_from_slice(&color);
    }

    fn hline(&mut self, y: u32, thickness: u32, color: [u8; 3], dashed: bool) {
        for dy in 0..thickness {
            let row = y.saturating_sub(thickness / 2) + dy;
            for x in 0..self.width {
                if dashed && x % DASH_PERIOD >= DASH_ON {
                    continue;
                }
                self.put(x, row, color);
            }
        }
    }

    fn vline(&mut self, x: u32, thickness: u32, color: [u8; 3], dashed: bool) {
        for dx in 0..thickness {
            let col = x.saturating_sub(thickness / 2) + dx;
            for y in 0..self.height {
                if dashed && y % DASH_PERIOD >= DASH_ON {
                    continue;
                }
                self.put(col, y, color);
            }
        }
    }

    /// One-pixel box outline.
    fn rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        if w == 0 || h == 0 {
            return;
        }
        for dx in 0..w {
            self.put(x + dx, y, color);
            self.put(x + dx, y + h - 1, color);
        }
        for dy in 0..h {
            self.put(x, y + dy, color);
            self.put(x + w - 1, y + dy, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn pixel(frame: &AnnotatedFrame, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * frame.width + x) * 3) as usize;
        [
            frame.pixels[idx],
            frame.pixels[idx + 1],
            frame.pixels[idx + 2],
        ]
    }

    #[test]
    fn draws_counting_line_at_configured_position() {
        let counting = PipelineConfig::default().counting;
        let width = 100u32;
        let height = 100u32;
        let raw = vec![0u8; (width * height * 3) as usize];

        let frame = render(&raw, width, height, &[], &counting).expect("render");
        // Default horizontal line at 0.5 -> row 50.
        assert_eq!(pixel(&frame, 10, 50), LINE_COLOR);
        assert_eq!(pixel(&frame, 90, 50), LINE_COLOR);
        // Far from any overlay the frame is untouched.
        assert_eq!(pixel(&frame, 10, 10), [0, 0, 0]);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let counting = PipelineConfig::default().counting;
        assert!(render(&[0u8; 10], 100, 100, &[], &counting).is_none());
        assert!(render(&[], 0, 0, &[], &counting).is_none());
    }
}
