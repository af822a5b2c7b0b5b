use anyhow::{Result, anyhow};
use nokhwa::{Buffer, utils::FrameFormat};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

#[derive(Debug)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decodes a raw nokhwa buffer of any supported pixel format into RGBA.
pub fn convert_camera_frame(buffer: &Buffer) -> Result<RgbaFrame> {
    let resolution = buffer.resolution();
    let (width, height) = (resolution.width_x, resolution.height_y);
    let data = buffer.buffer();
    let pixels = width as usize * height as usize;

    let (rgba, width, height) = match buffer.source_frame_format() {
        FrameFormat::MJPEG => mjpeg_to_rgba(data)?,
        FrameFormat::NV12 => {
            ensure_len("NV12", data, pixels + pixels / 2)?;
            (nv12_to_rgba(data, width, height)?, width, height)
        }
        FrameFormat::YUYV => {
            ensure_len("YUYV", data, pixels * 2)?;
            (yuyv_to_rgba(data, width, height)?, width, height)
        }
        FrameFormat::RAWRGB => {
            ensure_len("RGB", data, pixels * 3)?;
            (expand_packed(data, pixels, Channels::Rgb), width, height)
        }
        FrameFormat::RAWBGR => {
            ensure_len("BGR", data, pixels * 3)?;
            (expand_packed(data, pixels, Channels::Bgr), width, height)
        }
        FrameFormat::GRAY => {
            ensure_len("GRAY", data, pixels)?;
            (expand_packed(data, pixels, Channels::Gray), width, height)
        }
    };

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}

fn ensure_len(format: &str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(anyhow!(
            "{format} buffer too small: got {}, expected {expected}",
            data.len()
        ));
    }
    Ok(())
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_len = width as usize * height as usize;
    let image = YuvBiPlanarImage {
        y_plane: &data[..y_len],
        y_stride: width,
        uv_plane: &data[y_len..y_len + y_len / 2],
        uv_stride: width,
        width,
        height,
    };

    let mut rgba = vec![0u8; y_len * 4];
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 conversion failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };

    let mut rgba = vec![0u8; width as usize * height as usize * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV conversion failed: {err:?}"))?;
    Ok(rgba)
}

/// MJPEG carries its own dimensions, which win over the negotiated resolution.
fn mjpeg_to_rgba(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder returned no image info"))?;

    let (width, height) = (info.width as u32, info.height as u32);
    ensure_len("MJPEG output", &rgba, width as usize * height as usize * 4)?;
    Ok((rgba, width, height))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channels {
    Rgb,
    Bgr,
    Gray,
}

impl Channels {
    fn stride(self) -> usize {
        match self {
            Channels::Rgb | Channels::Bgr => 3,
            Channels::Gray => 1,
        }
    }
}

fn expand_packed(data: &[u8], pixels: usize, channels: Channels) -> Vec<u8> {
    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(channels.stride()))
        .for_each(|(dst, src)| {
            let [r, g, b] = match channels {
                Channels::Rgb => [src[0], src[1], src[2]],
                Channels::Bgr => [src[2], src[1], src[0]],
                Channels::Gray => [src[0]; 3],
            };
            dst.copy_from_slice(&[r, g, b, 255]);
        });
    rgba
}
