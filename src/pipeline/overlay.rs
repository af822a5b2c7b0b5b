use std::{path::Path, sync::Arc};

use anyhow::Result;
use image::RgbaImage;

use super::{
    canvas::Canvas,
    topology::MeshTopology,
    transform::TransformedDetection,
};
use crate::{
    config::OverlaySettings,
    error::TrackerError,
    types::SubjectKind,
};

const MESH_COLOR: [u8; 4] = [0, 255, 0, 255];
const BOX_COLOR: [u8; 4] = [50, 205, 50, 255];
const POINT_RADIUS: i32 = 2;
const LINE_THICKNESS: i32 = 1;
const BOX_THICKNESS: i32 = 2;

/// User-supplied image drawn in place of the debug mesh.
#[derive(Clone, Debug)]
pub struct OverlayAsset {
    pub image: Arc<RgbaImage>,
    pub scale: f32,
    pub offset: (i32, i32),
}

impl OverlayAsset {
    pub fn new(image: RgbaImage, scale: f32, offset: (i32, i32)) -> Result<Self, TrackerError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(TrackerError::Asset {
                path: "<memory>".into(),
                reason: format!("scale must be positive, got {scale}"),
            });
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(TrackerError::Asset {
                path: "<memory>".into(),
                reason: "image is empty".to_string(),
            });
        }
        Ok(Self {
            image: Arc::new(image),
            scale,
            offset,
        })
    }

    pub fn load(path: &Path, scale: f32, offset: (i32, i32)) -> Result<Self, TrackerError> {
        let image = image::open(path)
            .map_err(|err| TrackerError::Asset {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?
            .to_rgba8();
        Self::new(image, scale, offset).map_err(|err| match err {
            TrackerError::Asset { reason, .. } => TrackerError::Asset {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_settings(settings: &OverlaySettings) -> Result<Self, TrackerError> {
        Self::load(
            &settings.path,
            settings.scale,
            (settings.offset_x, settings.offset_y),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub center: (f32, f32),
    pub width: u32,
    pub height: u32,
}

/// Where an asset lands for a detection: bbox size times scale, centered on the anchor.
pub fn placement(detection: &TransformedDetection, scale: f32) -> Placement {
    Placement {
        center: detection.anchor,
        width: (detection.bbox.width() * scale).round().max(0.0) as u32,
        height: (detection.bbox.height() * scale).round().max(0.0) as u32,
    }
}

#[derive(Clone, Debug)]
pub enum DrawOp {
    Dot {
        center: (f32, f32),
        radius: i32,
        color: [u8; 4],
    },
    Polyline {
        name: &'static str,
        points: Vec<(f32, f32)>,
        closed: bool,
        color: [u8; 4],
        thickness: i32,
    },
    Rect {
        min: (f32, f32),
        max: (f32, f32),
        color: [u8; 4],
        thickness: i32,
    },
    Image {
        image: Arc<RgbaImage>,
        placement: Placement,
    },
}

impl DrawOp {
    pub fn apply(&self, canvas: &mut Canvas) -> Result<()> {
        match self {
            DrawOp::Dot {
                center,
                radius,
                color,
            } => canvas.fill_circle(*center, *radius, *color),
            DrawOp::Polyline {
                points,
                closed,
                color,
                thickness,
                ..
            } => canvas.polyline(points, *closed, *color, *thickness),
            DrawOp::Rect {
                min,
                max,
                color,
                thickness,
            } => canvas.stroke_rect(*min, *max, *color, *thickness),
            DrawOp::Image { image, placement } => canvas.draw_image(
                image,
                placement.center,
                placement.width,
                placement.height,
            )?,
        }
        Ok(())
    }
}

/// Chooses debug-mesh or image-overlay drawing per subject kind.
#[derive(Clone, Debug, Default)]
pub struct OverlayRenderer {
    face_asset: Option<OverlayAsset>,
    hand_asset: Option<OverlayAsset>,
    draw_boxes: bool,
}

impl OverlayRenderer {
    pub fn new(draw_boxes: bool) -> Self {
        Self {
            draw_boxes,
            ..Self::default()
        }
    }

    pub fn set_asset(&mut self, kind: SubjectKind, asset: Option<OverlayAsset>) {
        match kind {
            SubjectKind::Face => self.face_asset = asset,
            SubjectKind::Hand => self.hand_asset = asset,
        }
    }

    pub fn asset(&self, kind: SubjectKind) -> Option<&OverlayAsset> {
        match kind {
            SubjectKind::Face => self.face_asset.as_ref(),
            SubjectKind::Hand => self.hand_asset.as_ref(),
        }
    }

    /// Offset applied to the anchor of `kind`; zero in debug mesh mode.
    pub fn offset(&self, kind: SubjectKind) -> (i32, i32) {
        self.asset(kind).map(|a| a.offset).unwrap_or((0, 0))
    }

    pub fn plan(&self, kind: SubjectKind, detection: &TransformedDetection) -> Vec<DrawOp> {
        match self.asset(kind) {
            Some(asset) => vec![DrawOp::Image {
                image: asset.image.clone(),
                placement: placement(detection, asset.scale),
            }],
            None => self.plan_mesh(kind, detection),
        }
    }

    fn plan_mesh(&self, kind: SubjectKind, detection: &TransformedDetection) -> Vec<DrawOp> {
        let topology = MeshTopology::for_kind(kind);
        let points: Vec<(f32, f32)> = detection.keypoints.iter().map(|kp| (kp.x, kp.y)).collect();
        let mut ops = Vec::with_capacity(points.len() + topology.contours.len() + 1);

        for &center in &points {
            ops.push(DrawOp::Dot {
                center,
                radius: POINT_RADIUS,
                color: MESH_COLOR,
            });
        }

        for contour in topology.contours {
            let Some(slice) = points.get(contour.indices.clone()) else {
                continue;
            };
            ops.push(DrawOp::Polyline {
                name: contour.name,
                points: slice.to_vec(),
                closed: contour.closed,
                color: MESH_COLOR,
                thickness: LINE_THICKNESS,
            });
        }

        for &(a, b) in topology.connections {
            if let (Some(&pa), Some(&pb)) = (points.get(a), points.get(b)) {
                ops.push(DrawOp::Polyline {
                    name: "bone",
                    points: vec![pa, pb],
                    closed: false,
                    color: MESH_COLOR,
                    thickness: LINE_THICKNESS,
                });
            }
        }

        if self.draw_boxes {
            ops.push(DrawOp::Rect {
                min: (detection.bbox.min_x, detection.bbox.min_y),
                max: (detection.bbox.max_x, detection.bbox.max_y),
                color: BOX_COLOR,
                thickness: BOX_THICKNESS,
            });
        }

        ops
    }

    pub fn draw(
        &self,
        canvas: &mut Canvas,
        kind: SubjectKind,
        detection: &TransformedDetection,
    ) -> Result<()> {
        for op in self.plan(kind, detection) {
            op.apply(canvas)?;
        }
        Ok(())
    }
}
