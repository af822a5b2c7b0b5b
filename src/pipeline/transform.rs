use crate::types::{BoundingBox, Detection, Keypoint};

/// A detection moved into canvas space, with its overlay anchor.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformedDetection {
    pub keypoints: Vec<Keypoint>,
    pub bbox: BoundingBox,
    /// Bounding-box center shifted by the user offset.
    pub anchor: (f32, f32),
}

pub fn mirror_x(x: f32, canvas_width: u32) -> f32 {
    canvas_width as f32 - x
}

/// Converts frame-space keypoints into canvas space.
///
/// Returns `None` when the detection has fewer than two keypoints, since no
/// bounding box can be formed.
pub fn transform(
    detection: &Detection,
    mirror: bool,
    canvas_width: u32,
    offset: (i32, i32),
) -> Option<TransformedDetection> {
    let keypoints: Vec<Keypoint> = detection
        .keypoints
        .iter()
        .map(|kp| Keypoint {
            x: if mirror { mirror_x(kp.x, canvas_width) } else { kp.x },
            ..*kp
        })
        .collect();

    let bbox = BoundingBox::around(&keypoints)?;
    let (cx, cy) = bbox.center();

    Some(TransformedDetection {
        keypoints,
        bbox,
        anchor: (cx + offset.0 as f32, cy + offset.1 as f32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn detection(points: &[(f32, f32)]) -> Detection {
        Detection::from_points(points, 1.0)
    }

    #[rstest]
    #[case(&[(10.0, 20.0), (30.0, 5.0)])]
    #[case(&[(0.0, 0.0), (639.0, 479.0), (320.0, 240.0)])]
    #[case(&[(100.5, 50.25), (100.5, 50.25), (99.0, 52.0), (101.0, 49.0)])]
    fn bbox_contains_every_keypoint(#[case] points: &[(f32, f32)]) {
        for mirror in [false, true] {
            let out = transform(&detection(points), mirror, 640, (0, 0)).unwrap();
            for kp in &out.keypoints {
                assert!(out.bbox.contains(kp.x, kp.y), "{kp:?} outside {:?}", out.bbox);
            }
        }
    }

    #[test]
    fn mirroring_twice_restores_coordinates() {
        let original = detection(&[(12.5, 40.0), (600.0, 10.0), (320.0, 479.0)]);
        let once = transform(&original, true, 640, (0, 0)).unwrap();
        let twice = transform(
            &Detection {
                keypoints: once.keypoints.clone(),
                bbox: None,
                score: 1.0,
            },
            true,
            640,
            (0, 0),
        )
        .unwrap();

        for (a, b) in original.keypoints.iter().zip(&twice.keypoints) {
            assert_relative_eq!(a.x, b.x);
            assert_relative_eq!(a.y, b.y);
            assert_eq!(a.index, b.index);
        }
    }

    #[test]
    fn mirror_flips_against_canvas_width() {
        let out = transform(&detection(&[(100.0, 0.0), (200.0, 10.0)]), true, 640, (0, 0)).unwrap();
        assert_relative_eq!(out.keypoints[0].x, 540.0);
        assert_relative_eq!(out.keypoints[1].x, 440.0);
        assert_relative_eq!(out.bbox.min_x, 440.0);
        assert_relative_eq!(out.bbox.max_x, 540.0);
    }

    #[test]
    fn offset_moves_anchor_not_keypoints() {
        let out = transform(
            &detection(&[(295.0, 215.0), (345.0, 265.0)]),
            false,
            640,
            (10, -10),
        )
        .unwrap();

        assert_eq!(out.anchor, (330.0, 230.0));
        assert_eq!(out.bbox.center(), (320.0, 240.0));
        assert_relative_eq!(out.keypoints[0].x, 295.0);
    }

    #[rstest]
    #[case(&[])]
    #[case(&[(5.0, 5.0)])]
    fn fewer_than_two_keypoints_is_skipped(#[case] points: &[(f32, f32)]) {
        assert!(transform(&detection(points), true, 640, (0, 0)).is_none());
    }
}
