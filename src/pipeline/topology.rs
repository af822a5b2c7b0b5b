//! Anatomical index tables used to draw the debug mesh.
//!
//! Tables are tied to the upstream model that produced the keypoints; a new
//! model revision gets a new table rather than edits to an existing one.

use std::ops::Range;

use crate::types::SubjectKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contour {
    pub name: &'static str,
    pub indices: Range<usize>,
    pub closed: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct MeshTopology {
    pub model: &'static str,
    pub version: u32,
    pub contours: &'static [Contour],
    pub connections: &'static [(usize, usize)],
}

const fn contour(name: &'static str, start: usize, end: usize, closed: bool) -> Contour {
    Contour {
        name,
        indices: start..end,
        closed,
    }
}

pub const FACE_MESH_CONTOURS_V1: &[Contour] = &[
    contour("jaw", 0, 17, true),
    contour("left_eyebrow", 17, 22, false),
    contour("right_eyebrow", 22, 27, false),
    contour("left_eye", 36, 42, true),
    contour("right_eye", 42, 48, true),
    contour("mouth_outer", 48, 60, false),
];

pub const HAND_CONNECTIONS_V1: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    (0, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    (0, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
    (5, 9),
    (9, 13),
    (13, 17),
];

pub const MEDIAPIPE_FACE_MESH_V1: MeshTopology = MeshTopology {
    model: "mediapipe-face-mesh",
    version: 1,
    contours: FACE_MESH_CONTOURS_V1,
    connections: &[],
};

pub const MEDIAPIPE_HAND_V1: MeshTopology = MeshTopology {
    model: "mediapipe-hand",
    version: 1,
    contours: &[],
    connections: HAND_CONNECTIONS_V1,
};

impl MeshTopology {
    pub fn for_kind(kind: SubjectKind) -> &'static MeshTopology {
        match kind {
            SubjectKind::Face => &MEDIAPIPE_FACE_MESH_V1,
            SubjectKind::Hand => &MEDIAPIPE_HAND_V1,
        }
    }
}
