//! Box and label rendering.
//!
//! `Annotator::annotate` is a pure function: it copies the frame, draws one box
//! and one `"<label>: <confidence>"` tag per detection, and returns the copy.
//! Tags sit above the box's top-left corner and are clamped to stay on-frame.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, Detection};
use crate::font::{glyph, text_size, GLYPH_ADVANCE, GLYPH_WIDTH};
use crate::frame::Frame;

/// Gap between a label's baseline and the top edge of its box.
const LABEL_GAP: i32 = 4;

/// Label text for a detection, confidence at two decimals.
pub fn label_text(detection: &Detection) -> String {
    format!("{}: {:.2}", detection.label, detection.confidence)
}

#[derive(Clone, Debug)]
pub struct Annotator {
    pub box_color: Rgb<u8>,
    pub text_color: Rgb<u8>,
    /// Filled behind the label so it stays legible; `None` draws text only.
    pub label_background: Option<Rgb<u8>>,
    pub thickness: u32,
    pub text_scale: u32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            box_color: Rgb([0, 255, 0]),
            text_color: Rgb([255, 255, 255]),
            label_background: Some(Rgb([0, 96, 0])),
            thickness: 2,
            text_scale: 2,
        }
    }
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw every detection onto a copy of `frame`.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Frame {
        let mut image = frame.image().clone();
        for detection in detections {
            self.draw_box(&mut image, &detection.bbox);
            self.draw_label(&mut image, &detection.bbox, &label_text(detection));
        }
        frame.with_image(image)
    }

    pub(crate) fn draw_box(&self, image: &mut RgbImage, bbox: &BoundingBox) {
        let Some(rect) = clamp_rect(bbox, image.width(), image.height()) else {
            return;
        };
        for inset in 0..self.thickness as i32 {
            let w = rect.width() as i32 - 2 * inset;
            let h = rect.height() as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let layer =
                Rect::at(rect.left() + inset, rect.top() + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, layer, self.box_color);
        }
    }

    fn draw_label(&self, image: &mut RgbImage, bbox: &BoundingBox, text: &str) {
        let scale = self.text_scale.max(1);
        let (text_w, text_h) = text_size(text, scale);
        let (x, y) = label_origin(bbox, text_w, text_h, image.width(), image.height());

        if let Some(bg) = self.label_background {
            let w = (text_w + 2).min(image.width().saturating_sub(x as u32)).max(1);
            let h = (text_h + 2).min(image.height().saturating_sub(y as u32)).max(1);
            draw_filled_rect_mut(image, Rect::at(x, y).of_size(w, h), bg);
        }

        for (i, ch) in text.chars().enumerate() {
            let char_x = x + 1 + (i as u32 * GLYPH_ADVANCE * scale) as i32;
            let char_y = y + 1;
            for (row, bits) in glyph(ch).iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = char_x + (col * scale + dx) as i32;
                            let py = char_y + (row as u32 * scale + dy) as i32;
                            put_pixel_checked(image, px, py, self.text_color);
                        }
                    }
                }
            }
        }
    }
}

fn put_pixel_checked(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Intersect a box with the frame. Degenerate boxes still get a 1px outline.
fn clamp_rect(bbox: &BoundingBox, width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = (width - 1) as f32;
    let max_y = (height - 1) as f32;
    let x1 = bbox.x1.clamp(0.0, max_x).round() as i32;
    let y1 = bbox.y1.clamp(0.0, max_y).round() as i32;
    let x2 = bbox.x2.clamp(0.0, max_x).round() as i32;
    let y2 = bbox.y2.clamp(0.0, max_y).round() as i32;
    let w = (x2 - x1 + 1).max(1) as u32;
    let h = (y2 - y1 + 1).max(1) as u32;
    Some(Rect::at(x1, y1).of_size(w, h))
}

/// Top-left corner of a label block of `text_w` x `text_h` (plus a 1px border).
///
/// Preferred position is just above the box's top-left corner. If that would
/// leave the frame the label is pushed back inside: pinned to the top edge when
/// the box touches the top, shifted left when it overhangs the right edge.
pub fn label_origin(
    bbox: &BoundingBox,
    text_w: u32,
    text_h: u32,
    frame_w: u32,
    frame_h: u32,
) -> (i32, i32) {
    let block_w = (text_w + 2) as i32;
    let block_h = (text_h + 2) as i32;
    let max_x = (frame_w as i32 - block_w).max(0);
    let max_y = (frame_h as i32 - block_h).max(0);

    let x = (bbox.x1.round() as i32).clamp(0, max_x);
    let y = (bbox.y1.round() as i32 - LABEL_GAP - block_h).clamp(0, max_y);
    (x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black_frame(w: u32, h: u32) -> Frame {
        Frame::new(RgbImage::new(w, h), 1)
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, label: &str, conf: f32) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), label, conf)
    }

    #[test]
    fn label_text_uses_two_decimals() {
        assert_eq!(
            label_text(&det(0.0, 0.0, 1.0, 1.0, "person", 0.4249)),
            "person: 0.42"
        );
        assert_eq!(label_text(&det(0.0, 0.0, 1.0, 1.0, "car", 1.0)), "car: 1.00");
    }

    #[test]
    fn annotate_leaves_source_frame_untouched() {
        let frame = black_frame(100, 100);
        let annotated =
            Annotator::new().annotate(&frame, &[det(10.0, 30.0, 50.0, 50.0, "person", 0.42)]);

        assert!(frame.pixels().iter().all(|&p| p == 0));
        assert!(annotated.pixels().iter().any(|&p| p != 0));
        assert_eq!(annotated.seq(), frame.seq());
    }

    #[test]
    fn box_outline_is_drawn_at_detection_coordinates() {
        let annotator = Annotator {
            label_background: None,
            ..Annotator::default()
        };
        let frame = black_frame(100, 100);
        let annotated = annotator.annotate(&frame, &[det(60.0, 60.0, 90.0, 90.0, "x", 0.5)]);
        let img = annotated.image();

        assert_eq!(*img.get_pixel(60, 75), annotator.box_color);
        assert_eq!(*img.get_pixel(90, 75), annotator.box_color);
        assert_eq!(*img.get_pixel(75, 60), annotator.box_color);
        assert_eq!(*img.get_pixel(75, 75), Rgb([0, 0, 0]));
    }

    #[test]
    fn no_detections_yields_identical_copy() {
        let frame = Frame::new(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])), 3);
        let annotated = Annotator::new().annotate(&frame, &[]);
        assert_eq!(annotated.pixels(), frame.pixels());
    }

    #[test]
    fn label_sits_above_box_when_room() {
        let bbox = BoundingBox::new(20.0, 60.0, 40.0, 80.0);
        let (x, y) = label_origin(&bbox, 30, 14, 200, 200);
        assert_eq!(x, 20);
        assert_eq!(y, 60 - LABEL_GAP - 16);
    }

    #[test]
    fn label_is_clamped_inside_frame() {
        // box touching the top edge
        let top = BoundingBox::new(10.0, 0.0, 40.0, 30.0);
        assert_eq!(label_origin(&top, 30, 14, 200, 200), (10, 0));

        // box overhanging the right edge
        let right = BoundingBox::new(190.0, 100.0, 199.0, 120.0);
        let (x, _) = label_origin(&right, 60, 14, 200, 200);
        assert_eq!(x, 200 - 62);

        // box partly off the left/top of the frame
        let off = BoundingBox::new(-15.0, -5.0, 10.0, 10.0);
        assert_eq!(label_origin(&off, 30, 14, 200, 200), (0, 0));

        // label wider than the frame pins to the origin
        assert_eq!(label_origin(&top, 400, 14, 200, 200), (0, 0));
    }

    #[test]
    fn boxes_outside_frame_do_not_panic() {
        let frame = black_frame(32, 32);
        let annotated = Annotator::new().annotate(
            &frame,
            &[
                det(-100.0, -100.0, -50.0, -50.0, "ghost", 0.9),
                det(500.0, 500.0, 900.0, 900.0, "far", 0.9),
                det(5.0, 5.0, 5.0, 5.0, "dot", 0.9),
            ],
        );
        assert_eq!(annotated.width(), 32);
    }
}
