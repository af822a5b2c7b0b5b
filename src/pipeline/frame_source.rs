use std::{
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};

use crate::types::Frame;

/// A live (or fixed) supply of video frames.
///
/// Callers poll; a disconnected source reports "not ready" forever instead of
/// failing.
pub trait FrameSource: Send {
    /// True once a decodable frame has arrived and the stream is not stalled.
    fn current_frame_ready(&self) -> bool;

    fn dimensions(&self) -> (u32, u32);

    fn current_frame(&self) -> Option<Frame>;

    /// Stream established and not disconnected.
    fn is_available(&self) -> bool;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn current_frame_ready(&self) -> bool {
        (**self).current_frame_ready()
    }

    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }

    fn current_frame(&self) -> Option<Frame> {
        (**self).current_frame()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Latest-frame slot written by a capture thread and read by the render loop.
#[derive(Clone, Debug, Default)]
pub struct FrameSlot {
    latest: Arc<Mutex<Option<Frame>>>,
    disconnected: Arc<AtomicBool>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        *self.lock() = Some(frame);
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().clone()
    }

    /// Whether a frame newer than `stall_timeout` is present, judged at `now`.
    pub fn has_fresh_frame(&self, now: Instant, stall_timeout: Duration) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.lock()
            .as_ref()
            .is_some_and(|frame| now.saturating_duration_since(frame.timestamp) <= stall_timeout)
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.lock().as_ref().map(Frame::dimensions)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Frame>> {
        // A panicking writer leaves a whole frame or none behind.
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A single image served as an always-ready frame.
#[derive(Clone, Debug)]
pub struct StillFrameSource {
    frame: Frame,
}

impl StillFrameSource {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        Ok(Self::new(Frame {
            rgba: image.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
        }))
    }
}

impl FrameSource for StillFrameSource {
    fn current_frame_ready(&self) -> bool {
        !self.frame.rgba.is_empty()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.frame.dimensions()
    }

    fn current_frame(&self) -> Option<Frame> {
        Some(self.frame.clone())
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(timestamp: Instant) -> Frame {
        Frame {
            rgba: vec![0; 4],
            width: 1,
            height: 1,
            timestamp,
        }
    }

    #[test]
    fn empty_slot_is_not_ready() {
        let slot = FrameSlot::new();
        assert!(!slot.has_fresh_frame(Instant::now(), Duration::from_secs(2)));
        assert_eq!(slot.dimensions(), None);
    }

    #[test]
    fn stale_frame_counts_as_stalled() {
        let slot = FrameSlot::new();
        let t0 = Instant::now();
        slot.publish(frame_at(t0));

        assert!(slot.has_fresh_frame(t0 + Duration::from_millis(500), Duration::from_secs(2)));
        assert!(!slot.has_fresh_frame(t0 + Duration::from_secs(3), Duration::from_secs(2)));
    }

    #[test]
    fn disconnect_is_permanent_even_with_a_frame() {
        let slot = FrameSlot::new();
        let t0 = Instant::now();
        slot.publish(frame_at(t0));
        slot.mark_disconnected();

        assert!(!slot.has_fresh_frame(t0, Duration::from_secs(2)));
        slot.publish(frame_at(t0));
        assert!(!slot.has_fresh_frame(t0, Duration::from_secs(2)));
    }

    #[test]
    fn still_source_is_always_ready() {
        let source = StillFrameSource::new(frame_at(Instant::now()));
        assert!(source.current_frame_ready());
        assert!(source.is_available());
        assert_eq!(source.dimensions(), (1, 1));
    }
}
