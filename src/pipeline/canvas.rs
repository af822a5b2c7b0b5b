use anyhow::{Context, Result};
use fast_image_resize as fir;
use image::RgbaImage;

/// Transparent RGBA drawing surface with the pixel dimensions of the video.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![0u8; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.rgba
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        let mut px = [0u8; 4];
        px.copy_from_slice(&self.rgba[idx..idx + 4]);
        Some(px)
    }

    pub fn is_blank(&self) -> bool {
        self.rgba.iter().all(|&b| b == 0)
    }

    pub fn clear(&mut self) {
        self.rgba.fill(0);
    }

    /// Resizes the surface when the video dimensions change; contents are dropped.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) != (self.width, self.height) {
            *self = Canvas::new(width, height);
        }
    }

    pub fn fill_circle(&mut self, center: (f32, f32), radius: i32, color: [u8; 4]) {
        let (cx, cy) = (center.0.round() as i32, center.1.round() as i32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.blend_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    pub fn polyline(
        &mut self,
        points: &[(f32, f32)],
        closed: bool,
        color: [u8; 4],
        thickness: i32,
    ) {
        for pair in points.windows(2) {
            self.line(pair[0], pair[1], color, thickness);
        }
        if closed && points.len() > 2 {
            if let (Some(&last), Some(&first)) = (points.last(), points.first()) {
                self.line(last, first, color, thickness);
            }
        }
    }

    pub fn stroke_rect(
        &mut self,
        min: (f32, f32),
        max: (f32, f32),
        color: [u8; 4],
        thickness: i32,
    ) {
        let corners = [min, (max.0, min.1), max, (min.0, max.1)];
        self.polyline(&corners, true, color, thickness);
    }

    pub fn line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 4], thickness: i32) {
        let (mut x0, mut y0) = (p0.0.round() as i32, p0.1.round() as i32);
        let (x1, y1) = (p1.0.round() as i32, p1.1.round() as i32);
        let dx = (x1 - x0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let dy = -(y1 - y0).abs();
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (thickness.max(1) - 1) / 2;

        loop {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox.abs() + oy.abs() <= radius {
                        self.put_pixel(x0 + ox, y0 + oy, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    /// Draws `image` uniformly scaled to `width` x `height` with its center at `center`.
    pub fn draw_image(
        &mut self,
        image: &RgbaImage,
        center: (f32, f32),
        width: u32,
        height: u32,
    ) -> Result<()> {
        if width == 0 || height == 0 || image.width() == 0 || image.height() == 0 {
            return Ok(());
        }

        let scaled = scale_image(image, width, height)?;
        let left = (center.0 - width as f32 / 2.0).round() as i32;
        let top = (center.1 - height as f32 / 2.0).round() as i32;
        let stride = width as usize * 4;
        for (row, line) in scaled.chunks_exact(stride).enumerate() {
            for (col, px) in line.chunks_exact(4).enumerate() {
                let color = [px[0], px[1], px[2], px[3]];
                self.blend_pixel(left + col as i32, top + row as i32, color);
            }
        }
        Ok(())
    }

    fn put_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if let Some(idx) = self.index_of(x, y) {
            self.rgba[idx..idx + 4].copy_from_slice(&color);
        }
    }

    /// Source-over compositing of straight-alpha `color`.
    fn blend_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        let Some(idx) = self.index_of(x, y) else {
            return;
        };
        let src_a = color[3] as u32;
        if src_a == 0 {
            return;
        }
        if src_a == 255 {
            self.rgba[idx..idx + 4].copy_from_slice(&color);
            return;
        }

        let dst = &mut self.rgba[idx..idx + 4];
        let dst_a = dst[3] as u32;
        let out_a = src_a + dst_a * (255 - src_a) / 255;
        if out_a == 0 {
            return;
        }
        for c in 0..3 {
            let src_c = color[c] as u32 * src_a;
            let dst_c = dst[c] as u32 * dst_a * (255 - src_a) / 255;
            dst[c] = ((src_c + dst_c) / out_a).min(255) as u8;
        }
        dst[3] = out_a.min(255) as u8;
    }

    fn index_of(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 {
            return None;
        }
        let (ux, uy) = (x as u32, y as u32);
        if ux >= self.width || uy >= self.height {
            return None;
        }
        Some((uy as usize * self.width as usize + ux as usize) * 4)
    }
}

fn scale_image(image: &RgbaImage, width: u32, height: u32) -> Result<Vec<u8>> {
    if image.dimensions() == (width, height) {
        return Ok(image.as_raw().clone());
    }

    let src_image = fir::images::Image::from_vec_u8(
        image.width(),
        image.height(),
        image.as_raw().clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(width, height, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("overlay resize failed")?;
    Ok(dst_image.into_vec())
}

/// Composites `overlay` on top of `frame` pixels, producing an opaque image.
///
/// With `mirror` the frame is flipped horizontally first, matching an overlay
/// drawn in mirrored coordinates.
pub fn composite(frame_rgba: &[u8], overlay: &Canvas, mirror: bool) -> Option<RgbaImage> {
    if frame_rgba.len() != overlay.as_raw().len() {
        return None;
    }

    let (width, height) = (overlay.width(), overlay.height());
    let row_len = width as usize * 4;
    let mut out = Vec::with_capacity(frame_rgba.len());
    for (frame_row, overlay_row) in frame_rgba
        .chunks_exact(row_len.max(1))
        .zip(overlay.as_raw().chunks_exact(row_len.max(1)))
    {
        for (x, src) in overlay_row.chunks_exact(4).enumerate() {
            let frame_x = if mirror { width as usize - 1 - x } else { x };
            let dst = &frame_row[frame_x * 4..frame_x * 4 + 3];
            let a = src[3] as u32;
            for c in 0..3 {
                out.push(((src[c] as u32 * a + dst[c] as u32 * (255 - a)) / 255) as u8);
            }
            out.push(255);
        }
    }
    RgbaImage::from_raw(width, height, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREEN: [u8; 4] = [0, 255, 0, 255];

    #[test]
    fn new_canvas_is_transparent() {
        let canvas = Canvas::new(8, 4);
        assert!(canvas.is_blank());
        assert_eq!(canvas.as_raw().len(), 8 * 4 * 4);
    }

    #[test]
    fn drawing_outside_bounds_is_ignored() {
        let mut canvas = Canvas::new(10, 10);
        canvas.fill_circle((-20.0, -20.0), 3, GREEN);
        canvas.line((50.0, 50.0), (60.0, 60.0), GREEN, 3);
        assert!(canvas.is_blank());
    }

    #[test]
    fn closed_polyline_joins_last_to_first() {
        let mut open = Canvas::new(20, 20);
        let mut closed = Canvas::new(20, 20);
        let triangle = [(2.0, 2.0), (15.0, 2.0), (2.0, 15.0)];
        open.polyline(&triangle, false, GREEN, 1);
        closed.polyline(&triangle, true, GREEN, 1);

        // (2, 10) only lies on the closing edge from (2, 15) back to (2, 2).
        assert_eq!(open.pixel(2, 10), Some([0, 0, 0, 0]));
        assert_eq!(closed.pixel(2, 10), Some(GREEN));
    }

    #[test]
    fn clear_resets_every_pixel() {
        let mut canvas = Canvas::new(16, 16);
        canvas.fill_circle((8.0, 8.0), 4, GREEN);
        assert!(!canvas.is_blank());
        canvas.clear();
        assert!(canvas.is_blank());
    }

    #[test]
    fn draw_image_places_scaled_asset_around_center() {
        let mut canvas = Canvas::new(40, 40);
        let red = RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]));
        canvas.draw_image(&red, (20.0, 20.0), 10, 10).unwrap();

        assert_eq!(canvas.pixel(15, 15), Some([255, 0, 0, 255]));
        assert_eq!(canvas.pixel(24, 24), Some([255, 0, 0, 255]));
        assert_eq!(canvas.pixel(14, 20), Some([0, 0, 0, 0]));
        assert_eq!(canvas.pixel(25, 20), Some([0, 0, 0, 0]));
    }

    #[test]
    fn half_transparent_pixel_blends_over_opaque() {
        let mut canvas = Canvas::new(1, 1);
        canvas.fill_circle((0.0, 0.0), 0, [0, 0, 255, 255]);
        canvas.fill_circle((0.0, 0.0), 0, [255, 0, 0, 128]);

        let px = canvas.pixel(0, 0).unwrap();
        assert_eq!(px[3], 255);
        assert!(px[0] > 100 && px[2] > 100);
    }

    #[test]
    fn composite_keeps_frame_where_overlay_is_empty() {
        let frame = vec![10u8, 20, 30, 255, 10, 20, 30, 255];
        let mut overlay = Canvas::new(2, 1);
        overlay.fill_circle((1.0, 0.0), 0, GREEN);

        let out = composite(&frame, &overlay, false).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [10, 20, 30, 255]);
        assert_eq!(out.get_pixel(1, 0).0, GREEN);
    }

    #[test]
    fn mirrored_composite_flips_frame_under_overlay() {
        let frame = vec![200u8, 0, 0, 255, 0, 0, 200, 255, 0, 0, 0, 255];
        let overlay = Canvas::new(3, 1);

        let out = composite(&frame, &overlay, true).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 200, 255]);
        assert_eq!(out.get_pixel(2, 0).0, [200, 0, 0, 255]);
    }

    #[test]
    fn mismatched_sizes_do_not_composite() {
        assert!(composite(&[0u8; 8], &Canvas::new(3, 1), false).is_none());
    }
}
