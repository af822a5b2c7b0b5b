use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::{
    EstimateOptions, LandmarkProvider,
    common::{self, CropGeometry, sigmoid},
    palm::{PalmDetector, PalmDetectorConfig, PalmRegion, crop_from_palm},
};
use crate::{
    error::TrackerError,
    types::{Detection, Frame, SubjectKind},
};

/// Input geometry and output layout of a single-subject landmark model.
#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkModel {
    pub kind: SubjectKind,
    pub input_size: u32,
    pub num_landmarks: usize,
    /// Whether the score output is a raw logit that needs a sigmoid.
    pub score_is_logit: bool,
    pub score_threshold: f32,
}

impl LandmarkModel {
    pub fn mediapipe_face_mesh() -> Self {
        Self {
            kind: SubjectKind::Face,
            input_size: 192,
            num_landmarks: 468,
            score_is_logit: true,
            score_threshold: 0.5,
        }
    }

    pub fn mediapipe_hand() -> Self {
        Self {
            kind: SubjectKind::Hand,
            input_size: 224,
            num_landmarks: 21,
            score_is_logit: false,
            score_threshold: 0.2,
        }
    }

    fn score_from_raw(&self, raw: f32) -> f32 {
        let score = if self.score_is_logit { sigmoid(raw) } else { raw };
        score.clamp(0.0, 1.0)
    }

    /// Turns decoded model outputs into a detection, or `None` below threshold.
    fn build_detection(
        &self,
        flat_landmarks: &[f32],
        raw_score: f32,
        projection: Projection<'_>,
        flip_horizontal: bool,
    ) -> Result<Option<Detection>> {
        let score = self.score_from_raw(raw_score);
        if score < self.score_threshold {
            return Ok(None);
        }

        let landmarks = common::decode_landmarks(flat_landmarks, self.num_landmarks)?;
        let mut projected = projection.project(&landmarks);
        if flip_horizontal {
            let width = projection.frame_width();
            for point in &mut projected {
                point.0 = width - point.0;
            }
        }

        Ok(Some(Detection::from_points(&projected, score)))
    }
}

/// How model input pixels relate to frame pixels.
#[derive(Clone, Copy)]
enum Projection<'a> {
    Letterbox(&'a common::LetterboxInfo),
    Crop(&'a CropGeometry),
}

impl Projection<'_> {
    fn project(self, landmarks: &[[f32; 3]]) -> Vec<(f32, f32)> {
        match self {
            Projection::Letterbox(letterbox) => common::project_landmarks(landmarks, letterbox),
            Projection::Crop(geometry) => landmarks
                .iter()
                .map(|&[x, y, _]| geometry.to_frame(x, y))
                .collect(),
        }
    }

    fn frame_width(self) -> f32 {
        match self {
            Projection::Letterbox(letterbox) => letterbox.orig_w as f32,
            Projection::Crop(geometry) => geometry.orig_w as f32,
        }
    }
}

/// Landmark provider backed by an ONNX Runtime session.
///
/// With a palm detector attached the landmark model runs once per palm on a
/// rotated crop; without one it sees the whole letterboxed frame.
pub struct OrtLandmarkProvider {
    session: Session,
    model: LandmarkModel,
    palm: Option<PalmDetector>,
}

impl OrtLandmarkProvider {
    pub fn new(model_path: &Path, model: LandmarkModel) -> Result<Self, TrackerError> {
        let session = build_session(model_path).map_err(|err| {
            TrackerError::Model(format!(
                "failed to load {} landmark model: {err:#}",
                model.kind.label()
            ))
        })?;

        log::info!(
            "{} landmark model ready using {}",
            model.kind.label(),
            model_path.display()
        );
        Ok(Self {
            session,
            model,
            palm: None,
        })
    }

    pub fn with_palm_detector(mut self, palm_path: &Path) -> Result<Self, TrackerError> {
        let detector = PalmDetector::new(palm_path, PalmDetectorConfig::default())
            .map_err(|err| TrackerError::Model(format!("failed to load palm detector: {err:#}")))?;
        log::info!("palm detector ready using {}", palm_path.display());
        self.palm = Some(detector);
        Ok(self)
    }

    fn estimate_letterboxed(
        &mut self,
        frame: &Frame,
        options: &EstimateOptions,
    ) -> Result<Vec<Detection>> {
        let (input, letterbox) = common::letterbox_frame(frame, self.model.input_size)?;
        let (flat, raw_score) = run_landmarks(&mut self.session, input)?;
        let detection = self.model.build_detection(
            &flat,
            raw_score,
            Projection::Letterbox(&letterbox),
            options.flip_horizontal,
        )?;
        Ok(detection.into_iter().collect())
    }

    fn estimate_from_palms(
        &mut self,
        frame: &Frame,
        palms: &[PalmRegion],
        options: &EstimateOptions,
    ) -> Result<Vec<Detection>> {
        let mut detections = Vec::new();
        for region in palms.iter().take(options.max_subjects) {
            let crop = crop_from_palm(region);
            let (input, geometry) = common::rotated_crop(
                frame,
                crop.center,
                crop.side,
                crop.angle,
                self.model.input_size,
            )?;
            let (flat, raw_score) = run_landmarks(&mut self.session, input)?;
            let detection = self.model.build_detection(
                &flat,
                raw_score,
                Projection::Crop(&geometry),
                options.flip_horizontal,
            )?;
            detections.extend(detection.map(|d| with_palm_score(d, region.score)));
        }
        Ok(detections)
    }
}

fn with_palm_score(mut detection: Detection, palm_score: f32) -> Detection {
    detection.score = (detection.score * palm_score).clamp(0.0, 1.0);
    detection
}

fn build_session(model_path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(2)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;
    Ok(session)
}

/// Runs one landmark inference, returning the flattened coordinates and the
/// raw score output (0 when the model has none).
fn run_landmarks(session: &mut Session, input: Array4<f32>) -> Result<(Vec<f32>, f32)> {
    let tensor = Tensor::from_array(input)?;
    let outputs = session
        .run(ort::inputs![tensor])
        .context("failed to run landmark session")?;

    if outputs.len() < 1 {
        return Err(anyhow!("model returned no outputs"));
    }

    let coords = outputs[0].try_extract_array::<f32>()?;
    let flattened: Vec<f32> = coords.iter().copied().collect();

    let raw_score = if outputs.len() > 1 {
        outputs[1]
            .try_extract_array::<f32>()
            .ok()
            .and_then(|arr| arr.iter().next().copied())
            .unwrap_or(0.0)
    } else {
        0.0
    };
    Ok((flattened, raw_score))
}

impl LandmarkProvider for OrtLandmarkProvider {
    fn kind(&self) -> SubjectKind {
        self.model.kind
    }

    fn estimate(&mut self, frame: &Frame, options: &EstimateOptions) -> Result<Vec<Detection>> {
        if options.max_subjects == 0 {
            return Ok(Vec::new());
        }

        if self.palm.is_none() {
            return self.estimate_letterboxed(frame, options);
        }
        let palms = match self.palm.as_mut() {
            Some(detector) => detector.detect(frame)?,
            None => Vec::new(),
        };
        if palms.is_empty() {
            return Ok(Vec::new());
        }
        self.estimate_from_palms(frame, &palms, options)
    }
}
