#[cfg(feature = "camera-nokhwa")]
mod diagnostics;

mod config;
mod error;
mod model_download;
mod pipeline;
mod types;

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use config::{ModelSource, OverlaySettings, TrackerConfig};
use model_download::{ModelDownloadEvent, ModelKind, ensure_model_ready};
use pipeline::{
    FrameSource, LandmarkModel, LandmarkProvider, LoopSettings, OrtLandmarkProvider,
    OverlayAsset, OverlayRenderer, RenderLoop, StillFrameSource, TickOutcome, composite,
};
use types::{Frame, RenderedFrame, SubjectKind, TrackingStatus};

/// Face and hand landmark overlays for webcams and still images.
#[derive(Parser)]
#[command(name = "face-overlay", version)]
struct Cli {
    /// Config file (defaults to the per-user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Draw landmarks in camera coordinates instead of mirrored.
    #[arg(long, global = true)]
    no_mirror: bool,

    /// Outline each detection's bounding box in debug mesh mode.
    #[arg(long, global = true)]
    boxes: bool,

    /// Skip hand tracking.
    #[arg(long, global = true)]
    no_hands: bool,

    /// Image drawn over each face instead of the debug mesh.
    #[arg(long, global = true)]
    face_overlay: Option<PathBuf>,

    /// Image drawn over each hand instead of the debug mesh.
    #[arg(long, global = true)]
    hand_overlay: Option<PathBuf>,

    /// Overlay size relative to the detection's bounding box.
    #[arg(long, global = true)]
    overlay_scale: Option<f32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected cameras.
    #[cfg(feature = "camera-nokhwa")]
    Cameras,

    /// Check capture backend support, camera permission and camera count.
    #[cfg(feature = "camera-nokhwa")]
    Diagnose,

    /// Track faces and hands on a live camera.
    #[cfg(feature = "camera-nokhwa")]
    Live {
        /// Camera label substring (e.g. "C615"); overrides the config.
        #[arg(long)]
        camera: Option<String>,

        /// Where the latest composited frame is written.
        #[arg(long, default_value = "snapshot.png")]
        snapshot: PathBuf,

        /// Write a snapshot every N rendered frames.
        #[arg(long, default_value_t = 30)]
        snapshot_every: u64,

        /// Seconds to track before stopping.
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Run the pipeline once on an image file.
    Image {
        input: PathBuf,
        output: PathBuf,
    },

    /// Print the effective config as JSON.
    Config {
        /// Also save it to the config file.
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        #[cfg(feature = "camera-nokhwa")]
        Command::Cameras => list_cameras(),
        #[cfg(feature = "camera-nokhwa")]
        Command::Diagnose => {
            println!("{}", diagnostics::run());
            Ok(())
        }
        #[cfg(feature = "camera-nokhwa")]
        Command::Live {
            camera,
            snapshot,
            snapshot_every,
            duration,
        } => run_live(
            &config,
            cli.no_hands,
            camera.as_deref(),
            &snapshot,
            snapshot_every,
            std::time::Duration::from_secs(duration),
        ),
        Command::Image { input, output } => run_image(&config, cli.no_hands, &input, &output),
        Command::Config { write } => show_config(&config, cli.config.as_deref(), write),
    }
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    let path = cli.config.clone().or_else(TrackerConfig::default_path);
    let mut config = match path {
        Some(path) => TrackerConfig::load(&path)?,
        None => TrackerConfig::default(),
    };

    if cli.no_mirror {
        config.mirror = false;
    }
    config.draw_boxes |= cli.boxes;

    let scale = cli.overlay_scale.unwrap_or(1.0);
    if let Some(path) = &cli.face_overlay {
        config.face_overlay = Some(overlay_from_flag(path, scale));
    }
    if let Some(path) = &cli.hand_overlay {
        config.hand_overlay = Some(overlay_from_flag(path, scale));
    }

    config.validate()?;
    Ok(config)
}

fn overlay_from_flag(path: &Path, scale: f32) -> OverlaySettings {
    OverlaySettings {
        path: path.to_path_buf(),
        scale,
        offset_x: 0,
        offset_y: 0,
    }
}

fn show_config(config: &TrackerConfig, path: Option<&Path>, write: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if !write {
        return Ok(());
    }

    let path = path
        .map(Path::to_path_buf)
        .or_else(TrackerConfig::default_path)
        .context("no config directory on this platform; pass --config")?;
    config.save(&path)?;
    log::info!("saved config to {}", path.display());
    Ok(())
}

fn configured_overlays(config: &TrackerConfig) -> [(SubjectKind, Option<&OverlaySettings>); 2] {
    [
        (SubjectKind::Face, config.face_overlay.as_ref()),
        (SubjectKind::Hand, config.hand_overlay.as_ref()),
    ]
}

/// Unreadable overlays fall back to the debug mesh.
fn build_renderer(config: &TrackerConfig) -> OverlayRenderer {
    let mut renderer = OverlayRenderer::new(config.draw_boxes);
    for (kind, settings) in configured_overlays(config) {
        let Some(settings) = settings else {
            continue;
        };
        match OverlayAsset::from_settings(settings) {
            Ok(asset) => renderer.set_asset(kind, Some(asset)),
            Err(err) => log::warn!("{err}; drawing the {} mesh instead", kind.label()),
        }
    }
    renderer
}

fn log_download(event: ModelDownloadEvent) {
    match event {
        ModelDownloadEvent::AlreadyPresent { model } => {
            log::debug!("{} model already on disk", model.label())
        }
        ModelDownloadEvent::Started { model, total } => {
            log::info!("downloading {} model ({total:?} bytes)", model.label())
        }
        ModelDownloadEvent::Progress { .. } => {}
        ModelDownloadEvent::Finished { model } => log::info!("{} model ready", model.label()),
    }
}

fn load_face_provider(source: &ModelSource) -> Result<Box<dyn LandmarkProvider>> {
    ensure_model_ready(ModelKind::FaceMesh, source, log_download)?;
    let provider = OrtLandmarkProvider::new(&source.path, LandmarkModel::mediapipe_face_mesh())?;
    Ok(Box::new(provider))
}

/// Hand tracking runs the palm detector first, then the landmark model on
/// each palm crop.
fn load_hand_provider(
    source: &ModelSource,
    palm: &ModelSource,
) -> Result<Box<dyn LandmarkProvider>> {
    ensure_model_ready(ModelKind::PalmDetector, palm, log_download)?;
    ensure_model_ready(ModelKind::HandPose, source, log_download)?;
    let provider = OrtLandmarkProvider::new(&source.path, LandmarkModel::mediapipe_hand())?
        .with_palm_detector(&palm.path)?;
    Ok(Box::new(provider))
}

type Providers = (Box<dyn LandmarkProvider>, Option<Box<dyn LandmarkProvider>>);

fn build_providers(config: &TrackerConfig, no_hands: bool) -> Result<Providers> {
    let face = load_face_provider(&config.face_model)
        .context("face tracking needs a landmark model")?;

    let hand = match (&config.hand_model, no_hands) {
        (Some(source), false) => match load_hand_provider(source, &config.palm_model) {
            Ok(provider) => Some(provider),
            Err(err) => {
                log::warn!("hand tracking disabled: {err:#}");
                None
            }
        },
        _ => None,
    };

    Ok((face, hand))
}

/// Overlays are drawn in mirrored coordinates when `mirror` is set, so the
/// frame is flipped to match.
fn write_composite(
    frame: &Frame,
    rendered_overlay: &pipeline::Canvas,
    mirror: bool,
    path: &Path,
) -> Result<()> {
    let image = composite(&frame.rgba, rendered_overlay, mirror)
        .context("overlay and frame sizes do not match")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

fn run_image(
    config: &TrackerConfig,
    no_hands: bool,
    input: &Path,
    output: &Path,
) -> Result<()> {
    let source = StillFrameSource::open(input)?;
    let Some(frame) = source.current_frame() else {
        bail!("{} holds no pixels", input.display());
    };
    let (face, hand) = build_providers(config, no_hands)?;

    let mut render_loop = RenderLoop::new(
        Box::new(source),
        face,
        hand,
        build_renderer(config),
        LoopSettings::from_config(config),
    );
    render_loop.start()?;

    match render_loop.tick(Instant::now()) {
        TickOutcome::Rendered { faces, hands } => {
            let status = if faces > 0 {
                TrackingStatus::FaceDetected
            } else {
                TrackingStatus::NoFaceDetected
            };
            log::info!("{} ({faces} faces, {hands} hands)", status.message());
        }
        other => bail!("image was not rendered: {other:?}"),
    }

    write_composite(&frame, render_loop.canvas(), config.mirror, output)?;
    render_loop.stop();
    Ok(())
}

#[cfg(feature = "camera-nokhwa")]
fn list_cameras() -> Result<()> {
    let devices = pipeline::available_cameras()?;
    if devices.is_empty() {
        println!("no cameras found");
    }
    for (position, device) in devices.iter().enumerate() {
        println!("{position}: {}", device.label);
    }
    Ok(())
}

/// Follows the render loop's output: logs status changes and writes a
/// snapshot every `every` rendered frames.
#[cfg(feature = "camera-nokhwa")]
struct SnapshotWriter<'a> {
    path: &'a Path,
    every: u64,
    mirror: bool,
    rendered: u64,
    last_status: Option<TrackingStatus>,
    latest: Option<RenderedFrame>,
}

#[cfg(feature = "camera-nokhwa")]
impl<'a> SnapshotWriter<'a> {
    fn new(path: &'a Path, every: u64, mirror: bool) -> Self {
        Self {
            path,
            every,
            mirror,
            rendered: 0,
            last_status: None,
            latest: None,
        }
    }

    fn observe(&mut self, rendered: RenderedFrame) {
        if self.last_status.as_ref() != Some(&rendered.status) {
            match &rendered.status {
                TrackingStatus::ProviderError(_) | TrackingStatus::DeviceLost => {
                    log::warn!("{}", rendered.status.message())
                }
                status => log::info!("{}", status.message()),
            }
            self.last_status = Some(rendered.status.clone());
        }
        let Some(frame) = &rendered.frame else {
            return;
        };

        self.rendered += 1;
        if self.every > 0 && self.rendered % self.every == 0 {
            if let Err(err) = write_composite(frame, &rendered.overlay, self.mirror, self.path) {
                log::warn!("snapshot skipped: {err:#}");
            }
        }
        self.latest = Some(rendered);
    }

    /// Receives until `deadline` or until the render loop drops its sender.
    fn follow(&mut self, rx: &crossbeam_channel::Receiver<RenderedFrame>, deadline: Instant) {
        use crossbeam_channel::RecvTimeoutError;

        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(rendered) => self.observe(rendered),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("render loop stopped publishing frames");
                    break;
                }
            }
        }
    }

    fn finish(&self) -> Result<()> {
        if let Some(RenderedFrame {
            frame: Some(frame),
            overlay,
            ..
        }) = &self.latest
        {
            write_composite(frame, overlay, self.mirror, self.path)?;
        }
        log::info!("rendered {} frames", self.rendered);
        Ok(())
    }
}

#[cfg(feature = "camera-nokhwa")]
fn run_live(
    config: &TrackerConfig,
    no_hands: bool,
    camera: Option<&str>,
    snapshot: &Path,
    snapshot_every: u64,
    duration: std::time::Duration,
) -> Result<()> {
    use crossbeam_channel::bounded;
    use pipeline::{CameraFrameSource, select_camera};

    let devices = pipeline::available_cameras()?;
    let preferred = camera.or(config.preferred_camera.as_deref());
    let device = select_camera(&devices, preferred)
        .ok_or_else(|| error::TrackerError::Device("no camera found".to_string()))?;
    let source = CameraFrameSource::open(device, config.resolution, config.stall_timeout())?;
    log::info!(
        "tracking on {}",
        source.device_label().unwrap_or("unnamed camera")
    );
    let (face, hand) = build_providers(config, no_hands)?;

    let (rendered_tx, rendered_rx) = bounded::<RenderedFrame>(1);
    let render_loop = RenderLoop::new(
        Box::new(source),
        face,
        hand,
        OverlayRenderer::new(config.draw_boxes),
        LoopSettings::from_config(config),
    )
    .with_output(rendered_tx);
    let (handle, join) = render_loop.spawn()?;

    for (kind, settings) in configured_overlays(config) {
        if let Some(settings) = settings {
            let offset = (settings.offset_x, settings.offset_y);
            if handle
                .load_overlay(kind, &settings.path, settings.scale, offset)
                .is_err()
            {
                log::warn!("drawing the {} mesh instead", kind.label());
            }
        }
    }

    let mut writer = SnapshotWriter::new(snapshot, snapshot_every, config.mirror);
    writer.follow(&rendered_rx, Instant::now() + duration);

    handle.stop();
    while !join.is_finished() {
        let _ = rendered_rx.recv_timeout(std::time::Duration::from_millis(10));
    }
    if join.join().is_err() {
        bail!("render loop thread panicked");
    }

    writer.finish()
}
