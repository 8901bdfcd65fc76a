use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::{BodyLandmark, Frame, Landmark, PoseResult};

pub const INPUT_SIZE: u32 = 256;
/// Landmark rows in the model output; the trailing six are auxiliary ROI points.
pub const OUTPUT_LANDMARKS: usize = 39;
/// Values per output row: x, y, z, visibility, presence.
pub const VALUES_PER_LANDMARK: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl LetterboxInfo {
    /// Maps a point in model input pixels back to frame-normalized coordinates.
    pub fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
        let px = (x - self.pad_x) / self.scale;
        let py = (y - self.pad_y) / self.scale;
        (px / self.orig_w.max(1) as f32, py / self.orig_h.max(1) as f32)
    }
}

/// Letterboxes the frame into a square RGB tensor in [0, 1], NHWC layout.
pub fn prepare_frame(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    if frame.width == 0 || frame.height == 0 || frame.rgba.len() != expected_len {
        return Err(anyhow!(
            "frame buffer size mismatch: got {} bytes for {}x{}",
            frame.rgba.len(),
            frame.width,
            frame.height
        ));
    }

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round() as u32).clamp(1, target_size);
    let new_h = ((frame.height as f32 * scale).round() as u32).clamp(1, target_size);

    let src_image = fir::images::ImageRef::new(
        frame.width,
        frame.height,
        &frame.rgba,
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let side = target_size as usize;
    let pad_x = (side - new_w as usize) / 2;
    let pad_y = (side - new_h as usize) / 2;
    let src_stride = new_w as usize * 4;

    let mut input = vec![0f32; side * side * 3];
    input
        .par_chunks_exact_mut(side * 3)
        .enumerate()
        .for_each(|(row, dst_row)| {
            if row < pad_y || row >= pad_y + new_h as usize {
                return;
            }
            let src_row = &resized[(row - pad_y) * src_stride..(row - pad_y + 1) * src_stride];
            for (col, px) in src_row.chunks_exact(4).enumerate() {
                let offset = (pad_x + col) * 3;
                dst_row[offset] = px[0] as f32 / 255.0;
                dst_row[offset + 1] = px[1] as f32 / 255.0;
                dst_row[offset + 2] = px[2] as f32 / 255.0;
            }
        });

    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), input)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Decodes the body landmarks of the landmark model output into
/// frame-normalized coordinates. Depth uses the same scale as x.
pub fn decode_landmarks(flat: &[f32], letterbox: &LetterboxInfo) -> Result<PoseResult> {
    let needed = BodyLandmark::COUNT * VALUES_PER_LANDMARK;
    if flat.len() < needed {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            needed
        ));
    }

    let depth_scale = letterbox.scale * letterbox.orig_w.max(1) as f32;
    let landmarks = flat
        .chunks_exact(VALUES_PER_LANDMARK)
        .take(BodyLandmark::COUNT)
        .map(|row| {
            let (x, y) = letterbox.normalize(row[0], row[1]);
            Landmark::new(x, y, row[2] / depth_scale)
        })
        .collect::<Vec<_>>();

    Ok(PoseResult::new(landmarks))
}

pub fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}
