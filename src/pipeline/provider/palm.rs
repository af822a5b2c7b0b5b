use std::{cmp::Ordering, f32::consts::FRAC_PI_2, path::Path};

use anyhow::{Context, Result, anyhow};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use super::common::{self, LetterboxInfo, sigmoid};
use crate::types::{BoundingBox, Frame};

pub const PALM_INPUT_SIZE: u32 = 192;
const PALM_KEYPOINTS: usize = 7;
const PALM_FEATURES: usize = 4 + PALM_KEYPOINTS * 2;
// (stride, anchors per cell) of the SSD feature maps.
const ANCHOR_LAYERS: [(u32, usize); 2] = [(8, 2), (16, 6)];
const MIN_CROP_SIDE: f32 = 80.0;
const CROP_EXPANSION: f32 = 2.4;

#[derive(Clone, Debug)]
pub struct PalmDetectorConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub top_k: usize,
}

impl Default for PalmDetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.3,
            top_k: 8,
        }
    }
}

/// A detected palm in frame pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct PalmRegion {
    pub bbox: BoundingBox,
    pub keypoints: Vec<(f32, f32)>,
    pub score: f32,
}

/// Square rotated window handed to the hand landmark model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PalmCrop {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
}

/// Anchor centres in normalized input space, in model output order.
pub fn palm_anchors() -> Vec<[f32; 2]> {
    let mut anchors = Vec::new();
    for (stride, per_cell) in ANCHOR_LAYERS {
        let cells = PALM_INPUT_SIZE / stride;
        for y in 0..cells {
            for x in 0..cells {
                let center = [
                    (x as f32 + 0.5) / cells as f32,
                    (y as f32 + 0.5) / cells as f32,
                ];
                anchors.extend(std::iter::repeat_n(center, per_cell));
            }
        }
    }
    anchors
}

/// MediaPipe palm detector; the first stage of hand tracking.
pub struct PalmDetector {
    session: Session,
    anchors: Vec<[f32; 2]>,
    config: PalmDetectorConfig,
}

impl PalmDetector {
    pub fn new(model_path: &Path, config: PalmDetectorConfig) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load palm detector from {}", model_path.display())
            })?;

        Ok(Self {
            session,
            anchors: palm_anchors(),
            config,
        })
    }

    /// Palms ordered by descending score.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<PalmRegion>> {
        let (input, letterbox) = common::letterbox_frame(frame, PALM_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run palm detector session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "palm detector returned {} outputs, expected 2",
                outputs.len()
            ));
        }
        let boxes = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();

        decode_palms(&boxes, &scores, &self.anchors, &letterbox, &self.config)
    }
}

fn decode_palms(
    boxes: &[f32],
    scores: &[f32],
    anchors: &[[f32; 2]],
    letterbox: &LetterboxInfo,
    config: &PalmDetectorConfig,
) -> Result<Vec<PalmRegion>> {
    if scores.is_empty() || boxes.len() % scores.len() != 0 {
        return Err(anyhow!(
            "palm outputs disagree: {} box values for {} scores",
            boxes.len(),
            scores.len()
        ));
    }
    let features = boxes.len() / scores.len();
    if features < PALM_FEATURES {
        return Err(anyhow!("palm box feature dimension too small: {features}"));
    }

    let input = PALM_INPUT_SIZE as f32;
    // Offsets are in input pixels relative to the anchor centre.
    let to_frame = |anchor: [f32; 2], dx: f32, dy: f32| {
        (
            ((anchor[0] + dx / input) * input - letterbox.pad_x) / letterbox.scale,
            ((anchor[1] + dy / input) * input - letterbox.pad_y) / letterbox.scale,
        )
    };
    let max_x = letterbox.orig_w.saturating_sub(1) as f32;
    let max_y = letterbox.orig_h.saturating_sub(1) as f32;

    let mut candidates = Vec::new();
    for ((&raw_score, row), &anchor) in scores
        .iter()
        .zip(boxes.chunks_exact(features))
        .zip(anchors)
    {
        let score = sigmoid(raw_score);
        if score < config.score_threshold {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let (x1, y1) = to_frame(anchor, cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = to_frame(anchor, cx + w / 2.0, cy + h / 2.0);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let keypoints = row[4..PALM_FEATURES]
            .chunks_exact(2)
            .map(|kp| to_frame(anchor, kp[0], kp[1]))
            .collect();
        candidates.push(PalmRegion {
            bbox: BoundingBox {
                min_x: x1.clamp(0.0, max_x),
                min_y: y1.clamp(0.0, max_y),
                max_x: x2.clamp(0.0, max_x),
                max_y: y2.clamp(0.0, max_y),
            },
            keypoints,
            score,
        });
    }

    Ok(non_max_suppression(
        candidates,
        config.nms_threshold,
        config.top_k,
    ))
}

fn non_max_suppression(
    mut candidates: Vec<PalmRegion>,
    threshold: f32,
    top_k: usize,
) -> Vec<PalmRegion> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<PalmRegion> = Vec::new();
    for candidate in candidates {
        if kept.len() >= top_k {
            break;
        }
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) < threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.max_x.min(b.max_x) - a.min_x.max(b.min_x)).max(0.0);
    let inter_h = (a.max_y.min(b.max_y) - a.min_y.max(b.min_y)).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Crop around the palm keypoints, enlarged to keep the fingers and turned
/// so the hand points up.
pub fn crop_from_palm(region: &PalmRegion) -> PalmCrop {
    let center = if region.keypoints.is_empty() {
        region.bbox.center()
    } else {
        let n = region.keypoints.len() as f32;
        let (sx, sy) = region
            .keypoints
            .iter()
            .fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };

    let span = region
        .keypoints
        .iter()
        .fold(None, |acc: Option<(f32, f32, f32, f32)>, &(x, y)| {
            Some(match acc {
                None => (x, x, y, y),
                Some((x0, x1, y0, y1)) => (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
            })
        })
        .map(|(x0, x1, y0, y1)| (x1 - x0).max(y1 - y0))
        .unwrap_or(0.0);

    let side = region
        .bbox
        .width()
        .max(region.bbox.height())
        .max(span)
        .max(MIN_CROP_SIDE)
        * CROP_EXPANSION;

    PalmCrop {
        center,
        side,
        angle: palm_orientation(&region.keypoints),
    }
}

/// Principal axis of the palm keypoints, offset so an upright hand is zero.
pub fn palm_orientation(keypoints: &[(f32, f32)]) -> f32 {
    if keypoints.len() < 2 {
        return 0.0;
    }

    let n = keypoints.len() as f32;
    let (mx, my) = keypoints
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p.0 / n, acc.1 + p.1 / n));
    let (mut xx, mut xy, mut yy) = (0.0f32, 0.0f32, 0.0f32);
    for &(x, y) in keypoints {
        let (dx, dy) = (x - mx, y - my);
        xx += dx * dx / n;
        xy += dx * dy / n;
        yy += dy * dy / n;
    }

    let half_trace = (xx + yy) * 0.5;
    let lambda = half_trace + (half_trace * half_trace - (xx * yy - xy * xy)).max(0.0).sqrt();
    let (vx, vy) = if xy.abs() > 1e-6 {
        (lambda - yy, xy)
    } else if xx >= yy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    vy.atan2(vx) - FRAC_PI_2
}
