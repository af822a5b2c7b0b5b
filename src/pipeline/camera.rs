use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, CameraInfo, FrameFormat, RequestedFormat,
        RequestedFormatType, Resolution as NokhwaResolution,
    },
};

use super::{
    frame_source::{FrameSlot, FrameSource},
    rgba_converter,
};
use crate::{config::Resolution, error::TrackerError, types::Frame};

const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::MJPEG,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
];

// Consecutive read failures after which the device counts as unplugged.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 30;

fn requested_formats(resolution: Resolution) -> [RequestedFormat<'static>; 3] {
    let wanted = CameraFormat::new(
        NokhwaResolution::new(resolution.width, resolution.height),
        FrameFormat::MJPEG,
        30,
    );
    [
        RequestedFormat::with_formats(
            RequestedFormatType::Closest(wanted),
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(wanted)),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>, TrackerError> {
    let cameras = query(ApiBackend::Auto)
        .map_err(|err| TrackerError::Device(format!("could not get camera list: {err}")))?;
    Ok(cameras
        .iter()
        .enumerate()
        .map(|(position, info)| CameraDevice {
            index: info.index().clone(),
            label: format_camera_label(info, position),
        })
        .collect())
}

fn format_camera_label(info: &CameraInfo, position: usize) -> String {
    let name = info.human_name();
    if name.trim().is_empty() {
        format!("Camera {}", position + 1)
    } else {
        name
    }
}

/// Picks the device whose label contains `preferred`, otherwise the first one.
pub fn select_camera<'a>(
    devices: &'a [CameraDevice],
    preferred: Option<&str>,
) -> Option<&'a CameraDevice> {
    preferred
        .and_then(|needle| devices.iter().find(|d| d.label.contains(needle)))
        .or_else(|| devices.first())
}

fn build_camera(index: CameraIndex, resolution: Resolution) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats(resolution) {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

#[derive(Debug)]
struct CameraStream {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CameraStream {
    fn start(index: CameraIndex, resolution: Resolution, slot: FrameSlot) -> Result<Self> {
        // Fail fast before spawning the capture thread.
        build_camera(index.clone(), resolution)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let mut camera = match build_camera(index, resolution) {
                Ok(cam) => cam,
                Err(err) => {
                    log::error!("failed to open camera: {err:?}");
                    slot.mark_disconnected();
                    return;
                }
            };
            let format = camera.camera_format();
            log::info!(
                "camera streaming {}x{} {:?} @ {} fps",
                format.width(),
                format.height(),
                format.format(),
                format.frame_rate()
            );

            let mut failures = 0u32;
            while !stop_flag.load(Ordering::Relaxed) {
                let buffer = match camera.frame() {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_READ_FAILURES {
                            log::error!("camera stopped delivering frames: {err:?}");
                            slot.mark_disconnected();
                            break;
                        }
                        log::warn!("camera frame read failed: {err:?}");
                        continue;
                    }
                };
                failures = 0;

                match rgba_converter::convert_camera_frame(&buffer) {
                    Ok(converted) => slot.publish(Frame {
                        rgba: converted.rgba,
                        width: converted.width,
                        height: converted.height,
                        timestamp: Instant::now(),
                    }),
                    Err(err) => log::warn!("failed to decode camera frame: {err:?}"),
                }
            }

            if let Err(err) = camera.stop_stream() {
                log::warn!("failed to release camera stream: {err:?}");
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Frame source backed by a nokhwa capture thread.
pub struct CameraFrameSource {
    stream: Option<CameraStream>,
    slot: FrameSlot,
    resolution: Resolution,
    stall_timeout: Duration,
    device_label: Option<String>,
}

impl CameraFrameSource {
    pub fn new(resolution: Resolution, stall_timeout: Duration) -> Self {
        Self {
            stream: None,
            slot: FrameSlot::new(),
            resolution,
            stall_timeout,
            device_label: None,
        }
    }

    pub fn open(
        device: &CameraDevice,
        resolution: Resolution,
        stall_timeout: Duration,
    ) -> Result<Self, TrackerError> {
        let mut source = Self::new(resolution, stall_timeout);
        source.switch(device)?;
        Ok(source)
    }

    /// Tears down the current stream, then opens `device`.
    pub fn switch(&mut self, device: &CameraDevice) -> Result<(), TrackerError> {
        self.close();
        log::info!("switching camera to {}", device.label);

        let slot = FrameSlot::new();
        let stream = CameraStream::start(device.index.clone(), self.resolution, slot.clone())
            .map_err(|err| {
                TrackerError::Device(format!("could not open {}: {err:#}", device.label))
            })?;

        self.slot = slot;
        self.stream = Some(stream);
        self.device_label = Some(device.label.clone());
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            log::info!(
                "camera {} released",
                self.device_label.as_deref().unwrap_or("<unknown>")
            );
        }
        self.slot.mark_disconnected();
        self.device_label = None;
    }

    pub fn device_label(&self) -> Option<&str> {
        self.device_label.as_deref()
    }
}

impl FrameSource for CameraFrameSource {
    fn current_frame_ready(&self) -> bool {
        self.slot.has_fresh_frame(Instant::now(), self.stall_timeout)
    }

    fn dimensions(&self) -> (u32, u32) {
        self.slot
            .dimensions()
            .unwrap_or((self.resolution.width, self.resolution.height))
    }

    fn current_frame(&self) -> Option<Frame> {
        self.slot.latest()
    }

    fn is_available(&self) -> bool {
        self.stream.is_some() && !self.slot.is_disconnected()
    }
}

impl Drop for CameraFrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
