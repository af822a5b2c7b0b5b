use std::time::Instant;

use crate::pipeline::canvas::Canvas;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Which tracked subject a detection, provider or overlay belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    Face,
    Hand,
}

impl SubjectKind {
    pub fn label(&self) -> &'static str {
        match self {
            SubjectKind::Face => "face",
            SubjectKind::Hand => "hand",
        }
    }
}

/// One landmark in the coordinate space of the frame it came from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub index: usize,
}

impl Keypoint {
    pub fn new(index: usize, x: f32, y: f32) -> Self {
        Self { x, y, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoundingBox {
    /// Axis-aligned box around the points, `None` for fewer than two points.
    pub fn around(points: &[Keypoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        let mut bbox = BoundingBox {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        };
        for point in points {
            bbox.min_x = bbox.min_x.min(point.x);
            bbox.min_y = bbox.min_y.min(point.y);
            bbox.max_x = bbox.max_x.max(point.x);
            bbox.max_y = bbox.max_y.max(point.y);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// One detected subject in one frame, as returned by a landmark provider.
#[derive(Clone, Debug)]
pub struct Detection {
    pub keypoints: Vec<Keypoint>,
    pub bbox: Option<BoundingBox>,
    pub score: f32,
}

impl Detection {
    pub fn from_points(points: &[(f32, f32)], score: f32) -> Self {
        Self {
            keypoints: points
                .iter()
                .enumerate()
                .map(|(index, &(x, y))| Keypoint::new(index, x, y))
                .collect(),
            bbox: None,
            score,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackingStatus {
    Started,
    FaceDetected,
    NoFaceDetected,
    ProviderError(String),
    DeviceLost,
    Stopped,
}

impl TrackingStatus {
    pub fn message(&self) -> String {
        match self {
            TrackingStatus::Started => "Tracking started".to_string(),
            TrackingStatus::FaceDetected => "Face detected".to_string(),
            TrackingStatus::NoFaceDetected => {
                "No face detected - try adjusting your position".to_string()
            }
            TrackingStatus::ProviderError(err) => format!("Error during detection: {err}"),
            TrackingStatus::DeviceLost => {
                "Camera disconnected - reconnect it to resume tracking".to_string()
            }
            TrackingStatus::Stopped => "Tracking stopped".to_string(),
        }
    }
}

/// A rendered overlay together with the frame it was computed from.
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub frame: Option<Frame>,
    pub overlay: Canvas,
    pub status: TrackingStatus,
}
