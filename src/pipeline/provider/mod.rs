mod common;
mod ort;
mod palm;

use crate::types::{Detection, Frame, SubjectKind};

pub use self::ort::{LandmarkModel, OrtLandmarkProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstimateOptions {
    pub flip_horizontal: bool,
    pub max_subjects: usize,
}

impl Default for EstimateOptions {
    fn default() -> Self {
        Self {
            flip_horizontal: false,
            max_subjects: 1,
        }
    }
}

/// Maps a frame to zero or more detections of one subject kind.
///
/// An empty result means nothing was found; `Err` is a transient failure the
/// render loop recovers from by backing off.
pub trait LandmarkProvider: Send {
    fn kind(&self) -> SubjectKind;

    fn is_ready(&self) -> bool {
        true
    }

    fn estimate(
        &mut self,
        frame: &Frame,
        options: &EstimateOptions,
    ) -> anyhow::Result<Vec<Detection>>;
}

impl<P: LandmarkProvider + ?Sized> LandmarkProvider for Box<P> {
    fn kind(&self) -> SubjectKind {
        (**self).kind()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn estimate(
        &mut self,
        frame: &Frame,
        options: &EstimateOptions,
    ) -> anyhow::Result<Vec<Detection>> {
        (**self).estimate(frame, options)
    }
}
