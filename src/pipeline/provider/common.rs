use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::Frame;

/// How a frame was fitted into the square model input.
#[derive(Clone, Debug, PartialEq)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

/// Letterboxes `frame` into a `[1, size, size, 3]` tensor with values in `[0, 1]`.
pub fn letterbox_frame(frame: &Frame, target_size: u32) -> Result<(Array4<f32>, LetterboxInfo)> {
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

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("letterbox resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size - new_w) / 2) as usize;
    let pad_y = ((target_size - new_h) / 2) as usize;
    let side = target_size as usize;
    let mut padded = vec![0u8; side * side * 4];
    let dst_stride = side * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        padded[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = padded
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec((1, side, side, 3), normalized)
        .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    Ok((
        input,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: frame.width,
            orig_h: frame.height,
        },
    ))
}

/// Splits a flat `[x, y, z, x, y, z, ...]` output into `count` points.
pub fn decode_landmarks(flat: &[f32], count: usize) -> Result<Vec<[f32; 3]>> {
    if flat.len() < count * 3 {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            count * 3
        ));
    }

    Ok(flat
        .chunks_exact(3)
        .take(count)
        .map(|c| [c[0], c[1], c[2]])
        .collect())
}

/// Maps model-input coordinates back onto the original frame, clamped to its bounds.
pub fn project_landmarks(landmarks: &[[f32; 3]], letterbox: &LetterboxInfo) -> Vec<(f32, f32)> {
    let max_x = letterbox.orig_w.saturating_sub(1) as f32;
    let max_y = letterbox.orig_h.saturating_sub(1) as f32;
    landmarks
        .iter()
        .map(|[x, y, _z]| {
            let px = (x - letterbox.pad_x) / letterbox.scale;
            let py = (y - letterbox.pad_y) / letterbox.scale;
            (px.clamp(0.0, max_x), py.clamp(0.0, max_y))
        })
        .collect()
}

/// A square, rotated window of the frame that was resampled into the model input.
#[derive(Clone, Debug, PartialEq)]
pub struct CropGeometry {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

impl CropGeometry {
    /// Maps a point from crop pixels back to frame pixels, clamped to the frame.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        let (fx, fy) = self.rotate_out(x, y);
        (
            fx.clamp(0.0, self.orig_w.saturating_sub(1) as f32),
            fy.clamp(0.0, self.orig_h.saturating_sub(1) as f32),
        )
    }

    fn rotate_out(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let step = self.side / self.output_size as f32;
        let (dx, dy) = ((x - half) * step, (y - half) * step);
        let (sin, cos) = self.angle.sin_cos();
        (
            self.center.0 + dx * cos - dy * sin,
            self.center.1 + dx * sin + dy * cos,
        )
    }
}

/// Resamples a `side` x `side` window centred on `center` and rotated by
/// `angle` into a `[1, output_size, output_size, 3]` tensor. Pixels outside
/// the frame read as black.
pub fn rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropGeometry)> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    if frame.rgba.len() != expected_len {
        return Err(anyhow!(
            "frame buffer size mismatch: got {} bytes for {}x{}",
            frame.rgba.len(),
            frame.width,
            frame.height
        ));
    }

    let geometry = CropGeometry {
        center,
        side,
        angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };
    let size = output_size as usize;
    let data: Vec<f32> = (0..size * size)
        .into_par_iter()
        .flat_map_iter(|i| {
            let (x, y) = ((i % size) as f32 + 0.5, (i / size) as f32 + 0.5);
            let (sx, sy) = geometry.rotate_out(x, y);
            bilinear_rgb(frame, sx, sy)
        })
        .collect();

    let input = Array4::<f32>::from_shape_vec((1, size, size, 3), data)
        .map_err(|err| anyhow!("failed to build crop tensor: {err}"))?;
    Ok((input, geometry))
}

fn bilinear_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if !(x.is_finite() && y.is_finite()) {
        return [0.0; 3];
    }
    let (x0, y0) = (x.floor(), y.floor());
    let (tx, ty) = (x - x0, y - y0);
    let texel = |px: f32, py: f32| -> [f32; 3] {
        let (ix, iy) = (px as i64, py as i64);
        if ix < 0 || iy < 0 || ix >= frame.width as i64 || iy >= frame.height as i64 {
            return [0.0; 3];
        }
        let idx = (iy as usize * frame.width as usize + ix as usize) * 4;
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let (c00, c10) = (texel(x0, y0), texel(x0 + 1.0, y0));
    let (c01, c11) = (texel(x0, y0 + 1.0), texel(x0 + 1.0, y0 + 1.0));
    std::array::from_fn(|c| {
        let top = c00[c] + (c10[c] - c00[c]) * tx;
        let bottom = c01[c] + (c11[c] - c01[c]) * tx;
        top + (bottom - top) * ty
    })
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::{f32::consts::PI, time::Instant};

    fn solid_frame(width: u32, height: u32) -> Frame {
        Frame {
            rgba: [255u8, 0, 0, 255].repeat(width as usize * height as usize),
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn landscape_frame_is_padded_vertically() {
        let (input, letterbox) = letterbox_frame(&solid_frame(640, 480), 192).unwrap();

        assert_eq!(input.shape(), &[1, 192, 192, 3]);
        assert_relative_eq!(letterbox.scale, 0.3);
        assert_relative_eq!(letterbox.pad_x, 0.0);
        assert_relative_eq!(letterbox.pad_y, 24.0);
        // Padding rows stay black, content rows carry the frame colour.
        assert_relative_eq!(input[[0, 0, 96, 0]], 0.0);
        assert_relative_eq!(input[[0, 96, 96, 0]], 1.0);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let mut frame = solid_frame(4, 4);
        frame.rgba.truncate(10);
        assert!(letterbox_frame(&frame, 32).is_err());
    }

    #[test]
    fn projection_inverts_letterbox_and_clamps() {
        let letterbox = LetterboxInfo {
            scale: 0.3,
            pad_x: 0.0,
            pad_y: 24.0,
            orig_w: 640,
            orig_h: 480,
        };
        let projected = project_landmarks(&[[96.0, 96.0, 0.0], [-5.0, 500.0, 0.0]], &letterbox);

        assert_relative_eq!(projected[0].0, 320.0, epsilon = 1e-3);
        assert_relative_eq!(projected[0].1, 240.0, epsilon = 1e-3);
        assert_eq!(projected[1], (0.0, 479.0));
    }

    #[test]
    fn unrotated_crop_samples_frame_and_maps_back() {
        let frame = solid_frame(224, 224);
        let (input, geometry) = rotated_crop(&frame, (112.0, 112.0), 224.0, 0.0, 224).unwrap();

        assert_eq!(input.shape(), &[1, 224, 224, 3]);
        assert_relative_eq!(input[[0, 100, 100, 0]], 1.0);
        assert_relative_eq!(input[[0, 100, 100, 1]], 0.0);
        let (x, y) = geometry.to_frame(112.0, 112.0);
        assert_relative_eq!(x, 112.0, epsilon = 1e-4);
        assert_relative_eq!(y, 112.0, epsilon = 1e-4);
    }

    #[test]
    fn quarter_turn_crop_rotates_projected_points() {
        let frame = solid_frame(224, 224);
        let (_, geometry) = rotated_crop(&frame, (112.0, 112.0), 224.0, PI / 2.0, 224).unwrap();

        let (x, y) = geometry.to_frame(122.0, 112.0);
        assert_relative_eq!(x, 112.0, epsilon = 1e-3);
        assert_relative_eq!(y, 122.0, epsilon = 1e-3);
    }

    #[test]
    fn crop_outside_frame_reads_black() {
        let frame = solid_frame(16, 16);
        let (input, _) = rotated_crop(&frame, (-100.0, -100.0), 32.0, 0.0, 8).unwrap();
        assert!(input.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn decode_requires_enough_values() {
        assert!(decode_landmarks(&[0.0; 5], 2).is_err());
        let decoded = decode_landmarks(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], 2).unwrap();
        assert_eq!(decoded, vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    }
}
