use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use super::{
    canvas::Canvas,
    frame_source::FrameSource,
    overlay::{OverlayAsset, OverlayRenderer},
    provider::{EstimateOptions, LandmarkProvider},
    transform::transform,
};
use crate::{
    config::TrackerConfig,
    error::TrackerError,
    types::{Detection, Frame, RenderedFrame, SubjectKind, TrackingStatus},
};

const STOP_PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct LoopSettings {
    pub min_interval: Duration,
    pub backoff: Duration,
    pub tick_interval: Duration,
    pub mirror: bool,
    pub max_faces: usize,
    pub max_hands: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

impl LoopSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            backoff: config.backoff(),
            tick_interval: config.tick_interval(),
            mirror: config.mirror,
            max_faces: config.max_faces,
            max_hands: config.max_hands,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Backoff { until: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Backoff,
    SourceLost,
    FrameNotReady,
    RateLimited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Skipped(SkipReason),
    Rendered { faces: usize, hands: usize },
    BackingOff { until: Instant },
    Stopped,
}

enum Control {
    SetOverlay(SubjectKind, Option<OverlayAsset>),
    Stop,
}

/// Cloneable remote control for a running [`RenderLoop`].
#[derive(Clone, Debug)]
pub struct TrackingHandle {
    tracking: Arc<AtomicBool>,
    control_tx: Sender<Control>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::SetOverlay(kind, asset) => {
                write!(f, "SetOverlay({kind:?}, loaded: {})", asset.is_some())
            }
            Control::Stop => write!(f, "Stop"),
        }
    }
}

impl TrackingHandle {
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    /// Stops tracking; an in-flight provider call finishes and its result is dropped.
    pub fn stop(&self) {
        self.tracking.store(false, Ordering::SeqCst);
        let _ = self.control_tx.send(Control::Stop);
    }

    /// Replaces (or with `None`, removes) the overlay asset used for `kind`.
    pub fn set_overlay(&self, kind: SubjectKind, asset: Option<OverlayAsset>) {
        let _ = self.control_tx.send(Control::SetOverlay(kind, asset));
    }

    /// Loads an image as the new overlay for `kind`. On failure the previous
    /// asset (or the debug mesh) stays in effect.
    pub fn load_overlay(
        &self,
        kind: SubjectKind,
        path: &Path,
        scale: f32,
        offset: (i32, i32),
    ) -> Result<(), TrackerError> {
        let asset = OverlayAsset::load(path, scale, offset).inspect_err(|err| {
            log::warn!("{err}");
        })?;
        self.set_overlay(kind, Some(asset));
        Ok(())
    }
}

/// Owns one tracking session: the frame source, providers, overlay state and
/// canvas. Nothing else mutates the canvas.
pub struct RenderLoop {
    source: Box<dyn FrameSource>,
    face: Box<dyn LandmarkProvider>,
    hand: Option<Box<dyn LandmarkProvider>>,
    renderer: OverlayRenderer,
    canvas: Canvas,
    settings: LoopSettings,
    state: LoopState,
    last_cycle: Option<Instant>,
    source_lost: bool,
    tracking: Arc<AtomicBool>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    output: Option<Sender<RenderedFrame>>,
}

impl RenderLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        face: Box<dyn LandmarkProvider>,
        hand: Option<Box<dyn LandmarkProvider>>,
        renderer: OverlayRenderer,
        settings: LoopSettings,
    ) -> Self {
        let (width, height) = source.dimensions();
        let (control_tx, control_rx) = unbounded();
        Self {
            source,
            face,
            hand,
            renderer,
            canvas: Canvas::new(width, height),
            settings,
            state: LoopState::Idle,
            last_cycle: None,
            source_lost: false,
            tracking: Arc::new(AtomicBool::new(false)),
            control_tx,
            control_rx,
            output: None,
        }
    }

    /// Rendered canvases are offered here; frames are dropped while the consumer is busy.
    pub fn with_output(mut self, output: Sender<RenderedFrame>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn handle(&self) -> TrackingHandle {
        TrackingHandle {
            tracking: self.tracking.clone(),
            control_tx: self.control_tx.clone(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) -> Result<(), TrackerError> {
        if self.state != LoopState::Idle {
            log::debug!("start ignored, tracking already active");
            return Ok(());
        }
        if !self.source.is_available() {
            return Err(TrackerError::SourceUnavailable);
        }
        if !self.face.is_ready() {
            return Err(TrackerError::ProviderNotReady {
                kind: self.face.kind(),
            });
        }

        let (width, height) = self.source.dimensions();
        self.canvas.resize(width, height);
        self.canvas.clear();
        self.last_cycle = None;
        self.source_lost = false;
        self.tracking.store(true, Ordering::SeqCst);
        self.state = LoopState::Running;
        log::info!("starting tracking on a {width}x{height} canvas");
        self.publish(None, TrackingStatus::Started);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.tracking.store(false, Ordering::SeqCst);
        if self.state != LoopState::Idle {
            self.enter_idle();
        }
    }

    /// Runs one scheduling tick at time `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        self.drain_controls();

        if self.state == LoopState::Idle {
            return TickOutcome::Idle;
        }
        if !self.is_tracking() {
            self.enter_idle();
            return TickOutcome::Stopped;
        }
        if let LoopState::Backoff { until } = self.state {
            if now < until {
                return TickOutcome::Skipped(SkipReason::Backoff);
            }
            log::info!("backoff elapsed, resuming tracking");
            self.state = LoopState::Running;
        }
        if !self.source.is_available() {
            self.report_source_lost();
            return TickOutcome::Skipped(SkipReason::SourceLost);
        }
        if self.source_lost {
            log::info!("frame source is back");
            self.source_lost = false;
        }
        if !self.source.current_frame_ready() {
            log::debug!("frame not ready, skipping tick");
            return TickOutcome::Skipped(SkipReason::FrameNotReady);
        }
        if let Some(last) = self.last_cycle {
            if now.saturating_duration_since(last) < self.settings.min_interval {
                return TickOutcome::Skipped(SkipReason::RateLimited);
            }
        }
        let Some(frame) = self.source.current_frame() else {
            return TickOutcome::Skipped(SkipReason::FrameNotReady);
        };

        // Mirroring happens once, in the transformer, never in the providers.
        let face_options = EstimateOptions {
            flip_horizontal: false,
            max_subjects: self.settings.max_faces,
        };
        let faces = match self.face.estimate(&frame, &face_options) {
            Ok(faces) => faces,
            Err(err) => return self.provider_failed(now, SubjectKind::Face, err),
        };
        if !self.is_tracking() {
            return self.discard_after_stop();
        }

        let hand_options = EstimateOptions {
            flip_horizontal: false,
            max_subjects: self.settings.max_hands,
        };
        let hands = match self
            .hand
            .as_mut()
            .map(|provider| provider.estimate(&frame, &hand_options))
            .transpose()
        {
            Ok(hands) => hands.unwrap_or_default(),
            Err(err) => return self.provider_failed(now, SubjectKind::Hand, err),
        };
        if !self.is_tracking() {
            return self.discard_after_stop();
        }

        let (width, height) = frame.dimensions();
        self.canvas.resize(width, height);
        self.canvas.clear();
        let drawn_faces = self.draw_subjects(SubjectKind::Face, &faces);
        let drawn_hands = self.draw_subjects(SubjectKind::Hand, &hands);
        self.last_cycle = Some(now);

        let status = if drawn_faces > 0 {
            TrackingStatus::FaceDetected
        } else {
            TrackingStatus::NoFaceDetected
        };
        self.publish(Some(frame), status);

        TickOutcome::Rendered {
            faces: drawn_faces,
            hands: drawn_hands,
        }
    }

    /// Drives ticks until tracking stops.
    pub fn run(&mut self) {
        loop {
            let wait = match self.tick(Instant::now()) {
                TickOutcome::Idle | TickOutcome::Stopped => break,
                _ => self.next_wait(Instant::now()),
            };
            self.wait_for_control(wait);
        }
        log::info!("tracking loop finished");
    }

    /// Starts tracking, then moves the loop onto its own thread.
    pub fn spawn(mut self) -> Result<(TrackingHandle, thread::JoinHandle<()>), TrackerError> {
        self.start()?;
        let handle = self.handle();
        let join = thread::spawn(move || self.run());
        Ok((handle, join))
    }

    fn next_wait(&self, now: Instant) -> Duration {
        match self.state {
            LoopState::Backoff { until } => until.saturating_duration_since(now),
            _ => self.settings.tick_interval,
        }
    }

    fn wait_for_control(&mut self, wait: Duration) {
        match self.control_rx.recv_timeout(wait) {
            Ok(control) => self.apply_control(control),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    fn drain_controls(&mut self) {
        while let Ok(control) = self.control_rx.try_recv() {
            self.apply_control(control);
        }
    }

    fn apply_control(&mut self, control: Control) {
        match control {
            Control::SetOverlay(kind, asset) => {
                log::info!(
                    "{} overlay {}",
                    kind.label(),
                    if asset.is_some() { "loaded" } else { "cleared" }
                );
                self.renderer.set_asset(kind, asset);
            }
            Control::Stop => self.tracking.store(false, Ordering::SeqCst),
        }
    }

    fn draw_subjects(&mut self, kind: SubjectKind, detections: &[Detection]) -> usize {
        let offset = self.renderer.offset(kind);
        let mut drawn = 0;
        for detection in detections {
            let Some(transformed) =
                transform(detection, self.settings.mirror, self.canvas.width(), offset)
            else {
                log::debug!(
                    "skipping {} detection with {} keypoints",
                    kind.label(),
                    detection.keypoints.len()
                );
                continue;
            };
            match self.renderer.draw(&mut self.canvas, kind, &transformed) {
                Ok(()) => drawn += 1,
                Err(err) => log::warn!("failed to draw {} overlay: {err:#}", kind.label()),
            }
        }
        drawn
    }

    fn provider_failed(
        &mut self,
        now: Instant,
        kind: SubjectKind,
        err: anyhow::Error,
    ) -> TickOutcome {
        if !self.is_tracking() {
            return self.discard_after_stop();
        }

        let err = TrackerError::provider(kind, err);
        let until = now + self.settings.backoff;
        log::warn!("{err}; retrying in {:?}", self.settings.backoff);
        self.state = LoopState::Backoff { until };
        self.publish(None, TrackingStatus::ProviderError(err.to_string()));
        TickOutcome::BackingOff { until }
    }

    /// Reported once per outage; tracking stays on and resumes if frames return.
    fn report_source_lost(&mut self) {
        if self.source_lost {
            return;
        }
        self.source_lost = true;
        log::warn!("frame source disconnected");
        self.publish(None, TrackingStatus::DeviceLost);
    }

    fn discard_after_stop(&mut self) -> TickOutcome {
        log::debug!("tracking stopped during detection, discarding result");
        self.enter_idle();
        TickOutcome::Stopped
    }

    fn enter_idle(&mut self) {
        self.state = LoopState::Idle;
        self.last_cycle = None;
        self.canvas.clear();
        log::info!("tracking stopped");
        self.publish(None, TrackingStatus::Stopped);
    }

    fn publish(&self, frame: Option<Frame>, status: TrackingStatus) {
        let Some(output) = &self.output else {
            return;
        };
        let stopping = status == TrackingStatus::Stopped;
        let rendered = RenderedFrame {
            frame,
            overlay: self.canvas.clone(),
            status,
        };
        if stopping {
            let _ = output.send_timeout(rendered, STOP_PUBLISH_TIMEOUT);
        } else {
            let _ = output.try_send(rendered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pipeline::canvas::composite, types::Keypoint};
    use anyhow::anyhow;
    use crossbeam_channel::bounded;
    use image::RgbaImage;
    use std::{
        collections::VecDeque,
        sync::{Mutex, atomic::AtomicUsize},
    };

    const MS: Duration = Duration::from_millis(1);

    struct MockSource {
        ready: Arc<AtomicBool>,
        available: Arc<AtomicBool>,
        frame: Frame,
    }

    impl MockSource {
        fn new() -> Self {
            Self::with_frame(Frame {
                rgba: vec![0; 64 * 48 * 4],
                width: 64,
                height: 48,
                timestamp: Instant::now(),
            })
        }

        fn with_frame(frame: Frame) -> Self {
            Self {
                ready: Arc::new(AtomicBool::new(true)),
                available: Arc::new(AtomicBool::new(true)),
                frame,
            }
        }
    }

    impl FrameSource for MockSource {
        fn current_frame_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn dimensions(&self) -> (u32, u32) {
            self.frame.dimensions()
        }

        fn current_frame(&self) -> Option<Frame> {
            Some(self.frame.clone())
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    type Step = Result<Vec<Detection>, &'static str>;

    struct ScriptedProvider {
        kind: SubjectKind,
        ready: bool,
        calls: Arc<AtomicUsize>,
        script: VecDeque<Step>,
        fallback: Vec<Detection>,
        stop_during_call: Arc<Mutex<Option<TrackingHandle>>>,
    }

    impl ScriptedProvider {
        fn new(kind: SubjectKind, fallback: Vec<Detection>) -> Self {
            Self {
                kind,
                ready: true,
                calls: Arc::new(AtomicUsize::new(0)),
                script: VecDeque::new(),
                fallback,
                stop_during_call: Arc::new(Mutex::new(None)),
            }
        }

        fn then(mut self, step: Step) -> Self {
            self.script.push_back(step);
            self
        }
    }

    impl LandmarkProvider for ScriptedProvider {
        fn kind(&self) -> SubjectKind {
            self.kind
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        fn estimate(
            &mut self,
            _frame: &Frame,
            _options: &EstimateOptions,
        ) -> anyhow::Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.stop_during_call.lock().unwrap().as_ref() {
                handle.stop();
            }
            match self.script.pop_front() {
                Some(Ok(detections)) => Ok(detections),
                Some(Err(msg)) => Err(anyhow!(msg)),
                None => Ok(self.fallback.clone()),
            }
        }
    }

    fn square(min: f32, max: f32) -> Detection {
        Detection::from_points(&[(min, min), (max, max)], 1.0)
    }

    fn solid_asset(color: [u8; 4]) -> OverlayAsset {
        OverlayAsset::new(RgbaImage::from_pixel(4, 4, image::Rgba(color)), 1.0, (0, 0)).unwrap()
    }

    fn build(face: ScriptedProvider, hand: Option<ScriptedProvider>) -> RenderLoop {
        RenderLoop::new(
            Box::new(MockSource::new()),
            Box::new(face),
            hand.map(|h| Box::new(h) as Box<dyn LandmarkProvider>),
            OverlayRenderer::new(false),
            LoopSettings {
                mirror: false,
                ..LoopSettings::default()
            },
        )
    }

    #[test]
    fn start_requires_available_source() {
        let source = MockSource::new();
        source.available.store(false, Ordering::SeqCst);
        let mut render_loop = RenderLoop::new(
            Box::new(source),
            Box::new(ScriptedProvider::new(SubjectKind::Face, vec![])),
            None,
            OverlayRenderer::default(),
            LoopSettings::default(),
        );

        assert!(matches!(
            render_loop.start(),
            Err(TrackerError::SourceUnavailable)
        ));
        assert_eq!(render_loop.state(), LoopState::Idle);
        assert!(!render_loop.is_tracking());
    }

    #[test]
    fn start_requires_ready_face_provider() {
        let mut face = ScriptedProvider::new(SubjectKind::Face, vec![]);
        face.ready = false;
        let mut render_loop = build(face, None);

        assert!(matches!(
            render_loop.start(),
            Err(TrackerError::ProviderNotReady {
                kind: SubjectKind::Face
            })
        ));
    }

    #[test]
    fn idle_loop_does_nothing() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let calls = face.calls.clone();
        let mut render_loop = build(face, None);

        assert_eq!(render_loop.tick(Instant::now()), TickOutcome::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ticks_inside_min_interval_are_rate_limited() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let calls = face.calls.clone();
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();

        let t0 = Instant::now();
        assert_eq!(
            render_loop.tick(t0),
            TickOutcome::Rendered { faces: 1, hands: 0 }
        );
        let before = render_loop.canvas().clone();

        assert_eq!(
            render_loop.tick(t0 + 20 * MS),
            TickOutcome::Skipped(SkipReason::RateLimited)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(render_loop.canvas(), &before);

        assert_eq!(
            render_loop.tick(t0 + 50 * MS),
            TickOutcome::Rendered { faces: 1, hands: 0 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unready_frame_skips_without_calling_providers() {
        let source = MockSource::new();
        let ready = source.ready.clone();
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let calls = face.calls.clone();
        let mut render_loop = RenderLoop::new(
            Box::new(source),
            Box::new(face),
            None,
            OverlayRenderer::default(),
            LoopSettings::default(),
        );
        render_loop.start().unwrap();

        ready.store(false, Ordering::SeqCst);
        assert_eq!(
            render_loop.tick(Instant::now()),
            TickOutcome::Skipped(SkipReason::FrameNotReady)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn provider_failure_backs_off_then_resumes() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)])
            .then(Err("decode glitch"));
        let calls = face.calls.clone();
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();

        let t0 = Instant::now();
        let until = t0 + Duration::from_secs(1);
        assert_eq!(render_loop.tick(t0), TickOutcome::BackingOff { until });
        assert_eq!(render_loop.state(), LoopState::Backoff { until });
        assert!(render_loop.is_tracking());

        assert_eq!(
            render_loop.tick(t0 + 500 * MS),
            TickOutcome::Skipped(SkipReason::Backoff)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            render_loop.tick(until),
            TickOutcome::Rendered { faces: 1, hands: 0 }
        );
        assert_eq!(render_loop.state(), LoopState::Running);
        assert_eq!(
            render_loop.tick(until + 50 * MS),
            TickOutcome::Rendered { faces: 1, hands: 0 }
        );
    }

    #[test]
    fn hand_failure_also_backs_off() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let hand = ScriptedProvider::new(SubjectKind::Hand, vec![]).then(Err("hand model crashed"));
        let mut render_loop = build(face, Some(hand));
        render_loop.start().unwrap();

        assert!(matches!(
            render_loop.tick(Instant::now()),
            TickOutcome::BackingOff { .. }
        ));
    }

    #[test]
    fn stop_during_provider_call_discards_result() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let stopper = face.stop_during_call.clone();
        let (tx, rx) = bounded(8);
        let mut render_loop = build(face, None).with_output(tx);
        render_loop.start().unwrap();
        *stopper.lock().unwrap() = Some(render_loop.handle());

        assert_eq!(render_loop.tick(Instant::now()), TickOutcome::Stopped);
        assert_eq!(render_loop.state(), LoopState::Idle);
        assert!(render_loop.canvas().is_blank());

        let published: Vec<RenderedFrame> = rx.try_iter().collect();
        assert_eq!(published.first().map(|r| &r.status), Some(&TrackingStatus::Started));
        let last = published.last().unwrap();
        assert_eq!(last.status, TrackingStatus::Stopped);
        assert!(last.overlay.is_blank());
        assert!(
            published
                .iter()
                .all(|r| r.status != TrackingStatus::FaceDetected)
        );
    }

    #[test]
    fn explicit_stop_clears_canvas() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();
        render_loop.tick(Instant::now());
        assert!(!render_loop.canvas().is_blank());

        render_loop.stop();
        assert!(render_loop.canvas().is_blank());
        assert_eq!(render_loop.state(), LoopState::Idle);
        assert_eq!(render_loop.tick(Instant::now()), TickOutcome::Idle);
    }

    #[test]
    fn handle_stop_is_observed_at_next_tick() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let calls = face.calls.clone();
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();
        let t0 = Instant::now();
        render_loop.tick(t0);

        render_loop.handle().stop();
        assert_eq!(render_loop.tick(t0 + 100 * MS), TickOutcome::Stopped);
        assert!(render_loop.canvas().is_blank());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rendering_same_detection_twice_is_identical() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();

        let t0 = Instant::now();
        render_loop.tick(t0);
        let first = render_loop.canvas().clone();
        render_loop.tick(t0 + 60 * MS);
        assert_eq!(render_loop.canvas(), &first);
    }

    #[test]
    fn single_keypoint_detection_is_skipped() {
        let lonely = Detection {
            keypoints: vec![Keypoint::new(0, 10.0, 10.0)],
            bbox: None,
            score: 1.0,
        };
        let face = ScriptedProvider::new(SubjectKind::Face, vec![lonely]);
        let mut render_loop = build(face, None);
        render_loop.start().unwrap();

        assert_eq!(
            render_loop.tick(Instant::now()),
            TickOutcome::Rendered { faces: 0, hands: 0 }
        );
        assert!(render_loop.canvas().is_blank());
    }

    #[test]
    fn hand_overlay_is_drawn_over_face_overlay() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(10.0, 30.0)]);
        let hand = ScriptedProvider::new(SubjectKind::Hand, vec![square(10.0, 30.0)]);
        let mut render_loop = build(face, Some(hand));
        let handle = render_loop.handle();
        handle.set_overlay(
            SubjectKind::Face,
            Some(solid_asset([255, 0, 0, 255])),
        );
        handle.set_overlay(
            SubjectKind::Hand,
            Some(solid_asset([0, 0, 255, 255])),
        );
        render_loop.start().unwrap();

        assert_eq!(
            render_loop.tick(Instant::now()),
            TickOutcome::Rendered { faces: 1, hands: 1 }
        );
        assert_eq!(render_loop.canvas().pixel(20, 20), Some([0, 0, 255, 255]));
    }

    #[test]
    fn failed_overlay_load_keeps_previous_asset() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(10.0, 30.0)]);
        let mut render_loop = build(face, None);
        let handle = render_loop.handle();
        handle.set_overlay(
            SubjectKind::Face,
            Some(solid_asset([255, 0, 0, 255])),
        );

        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"garbage").unwrap();
        assert!(
            handle
                .load_overlay(SubjectKind::Face, &broken, 1.0, (0, 0))
                .is_err()
        );

        render_loop.start().unwrap();
        render_loop.tick(Instant::now());
        assert_eq!(render_loop.canvas().pixel(20, 20), Some([255, 0, 0, 255]));
    }

    #[test]
    fn lost_source_is_reported_once_and_recovers() {
        let source = MockSource::new();
        let available = source.available.clone();
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let calls = face.calls.clone();
        let (tx, rx) = bounded(8);
        let mut render_loop = RenderLoop::new(
            Box::new(source),
            Box::new(face),
            None,
            OverlayRenderer::default(),
            LoopSettings::default(),
        )
        .with_output(tx);
        render_loop.start().unwrap();

        let t0 = Instant::now();
        assert!(matches!(render_loop.tick(t0), TickOutcome::Rendered { .. }));

        available.store(false, Ordering::SeqCst);
        for step in 1..=3u32 {
            assert_eq!(
                render_loop.tick(t0 + step * 100 * MS),
                TickOutcome::Skipped(SkipReason::SourceLost)
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(render_loop.is_tracking());

        let lost = rx
            .try_iter()
            .filter(|r| r.status == TrackingStatus::DeviceLost)
            .count();
        assert_eq!(lost, 1);

        available.store(true, Ordering::SeqCst);
        assert!(matches!(
            render_loop.tick(t0 + 500 * MS),
            TickOutcome::Rendered { .. }
        ));
    }

    #[test]
    fn mirrored_overlay_lands_on_subject_in_composite() {
        // Subject occupies columns 5..=15 of a 64x48 frame.
        let mut frame = Frame {
            rgba: vec![0; 64 * 48 * 4],
            width: 64,
            height: 48,
            timestamp: Instant::now(),
        };
        for y in 0..48usize {
            for x in 5..=15usize {
                let idx = (y * 64 + x) * 4;
                frame.rgba[idx..idx + 4].copy_from_slice(&[255, 0, 0, 255]);
            }
        }
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(8.0, 13.0)]);
        let mut render_loop = RenderLoop::new(
            Box::new(MockSource::with_frame(frame.clone())),
            Box::new(face),
            None,
            OverlayRenderer::default(),
            LoopSettings::default(),
        );
        render_loop.start().unwrap();
        render_loop.tick(Instant::now());

        let out = composite(&frame.rgba, render_loop.canvas(), true).unwrap();
        let overlay_columns: Vec<u32> = (0..64)
            .filter(|&x| (0..48).any(|y| out.get_pixel(x, y).0 == [0, 255, 0, 255]))
            .collect();
        assert!(!overlay_columns.is_empty());
        for x in overlay_columns {
            // Mirrored subject spans columns 48..=58.
            assert!((48..=58).contains(&x), "overlay at column {x}");
            assert_eq!(out.get_pixel(x, 47).0, [255, 0, 0, 255]);
        }
    }

    #[test]
    fn spawned_loop_publishes_until_stopped() {
        let face = ScriptedProvider::new(SubjectKind::Face, vec![square(5.0, 20.0)]);
        let (tx, rx) = bounded(1);
        let render_loop = build(face, None).with_output(tx);

        let (handle, join) = render_loop.spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_detection = false;
        while Instant::now() < deadline {
            if let Ok(rendered) = rx.recv_timeout(Duration::from_millis(100)) {
                if rendered.status == TrackingStatus::FaceDetected {
                    saw_detection = true;
                    break;
                }
            }
        }
        assert!(saw_detection);

        handle.stop();
        assert!(!handle.is_tracking());
        // Keep draining so the final publish never blocks the loop thread.
        while !join.is_finished() {
            let _ = rx.recv_timeout(Duration::from_millis(10));
        }
        join.join().unwrap();
    }
}
