//! Overlay rendering and transport encoding for annotated images.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::models::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i32 = 2;
/// Height of the confidence bar drawn above each box.
const TAG_HEIGHT: u32 = 4;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
#[error("failed to encode annotated image: {0}")]
pub struct EncodeError(#[from] image::ImageError);

/// Draw a red rectangle per detection, plus a filled bar above the top
/// edge whose length is proportional to the confidence.
pub fn draw_detections(img: &mut RgbImage, boxes: &[Detection]) {
    for detection in boxes {
        let x1 = detection.x1.round() as i32;
        let y1 = detection.y1.round() as i32;
        let w = detection.width().round() as i32;
        let h = detection.height().round() as i32;
        if w <= 0 || h <= 0 {
            continue;
        }

        for t in 0..BOX_THICKNESS {
            let (tw, th) = (w - 2 * t, h - 2 * t);
            if tw <= 0 || th <= 0 {
                break;
            }
            let rect = Rect::at(x1 + t, y1 + t).of_size(tw as u32, th as u32);
            draw_hollow_rect_mut(img, rect, BOX_COLOR);
        }

        let tag_w = ((w as f32 * detection.conf.clamp(0.0, 1.0)).round() as u32).max(1);
        let tag_y = y1 - TAG_HEIGHT as i32 - 1;
        let tag = Rect::at(x1, tag_y.max(0)).of_size(tag_w, TAG_HEIGHT);
        draw_filled_rect_mut(img, tag, BOX_COLOR);
    }
}

/// JPEG-encode the annotated image and base64 it for the JSON response.
pub fn encode_jpeg_b64(img: &RgbImage) -> Result<String, EncodeError> {
    let mut buf = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode_image(img)?;
    Ok(BASE64.encode(buf.into_inner()))
}
