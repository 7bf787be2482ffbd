//! Section image with the exported boundaries drawn on top, for review.

use std::path::Path;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

use crate::buffer2::Buffer2;
use crate::error::{Error, Result};
use crate::export::ExportShape;

pub const OVERLAY_FILE_NAME: &str = "rois.png";

const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_WIDTH: i32 = 5;

/// Gray copy of `image`, stretched to its maximum, with every ring of
/// `shapes` drawn as a closed red polyline in section pixels.
pub fn render_overlay<'a>(
    image: &Buffer2<f32>,
    shapes: impl IntoIterator<Item = &'a ExportShape>,
) -> RgbImage {
    let max = image.max_value();
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
    let mut out = RgbImage::from_fn(image.width() as u32, image.height() as u32, |x, y| {
        let v = (image[(x as usize, y as usize)] * scale).clamp(0.0, 255.0) as u8;
        Rgb([v, v, v])
    });

    let half = LINE_WIDTH / 2;
    for shape in shapes {
        for ring in &shape.rings {
            let n = ring.section_pixels.len();
            for i in 0..n {
                let a = ring.section_pixels[i];
                let b = ring.section_pixels[(i + 1) % n];
                for dy in -half..=half {
                    for dx in -half..=half {
                        let (ox, oy) = (dx as f32, dy as f32);
                        draw_line_segment_mut(
                            &mut out,
                            (a.x as f32 + ox, a.y as f32 + oy),
                            (b.x as f32 + ox, b.y as f32 + oy),
                            LINE_COLOR,
                        );
                    }
                }
            }
        }
    }
    out
}

pub fn save_overlay<'a>(
    image: &Buffer2<f32>,
    shapes: impl IntoIterator<Item = &'a ExportShape>,
    path: &Path,
) -> Result<()> {
    render_overlay(image, shapes)
        .save(path)
        .map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })
}
