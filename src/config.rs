use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

const CONFIG_DIR_NAME: &str = "face-overlay";
const CONFIG_FILE_NAME: &str = "config.json";

pub const HAND_MODEL_FILENAME: &str = "handpose_estimation_mediapipe_2023feb.onnx";
const MODEL_BASE_URL: &str =
    "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/";
pub const PALM_MODEL_FILENAME: &str = "palm_detection_mediapipe_2023feb.onnx";
pub const FACE_MODEL_FILENAME: &str = "face_mesh_mediapipe.onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSource {
    pub path: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlaySettings {
    pub path: PathBuf,
    #[serde(default = "default_overlay_scale")]
    pub scale: f32,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
}

fn default_overlay_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub min_interval_ms: u64,
    pub backoff_ms: u64,
    pub tick_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub mirror: bool,
    pub resolution: Resolution,
    pub preferred_camera: Option<String>,
    pub max_faces: usize,
    pub max_hands: usize,
    pub draw_boxes: bool,
    pub face_model: ModelSource,
    pub hand_model: Option<ModelSource>,
    /// Palm detector that locates the hand crops fed to `hand_model`.
    pub palm_model: ModelSource,
    pub face_overlay: Option<OverlaySettings>,
    pub hand_overlay: Option<OverlaySettings>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
            backoff_ms: 1_000,
            tick_interval_ms: 16,
            stall_timeout_ms: 2_000,
            mirror: true,
            resolution: Resolution::default(),
            preferred_camera: None,
            max_faces: 1,
            max_hands: 2,
            draw_boxes: false,
            face_model: ModelSource {
                path: PathBuf::from("models").join(FACE_MODEL_FILENAME),
                url: None,
            },
            hand_model: Some(ModelSource {
                path: PathBuf::from("models").join(HAND_MODEL_FILENAME),
                url: Some(format!("{MODEL_BASE_URL}{HAND_MODEL_FILENAME}")),
            }),
            palm_model: ModelSource {
                path: PathBuf::from("models").join(PALM_MODEL_FILENAME),
                url: Some(format!("{MODEL_BASE_URL}{PALM_MODEL_FILENAME}")),
            },
            face_overlay: None,
            hand_overlay: None,
        }
    }
}

impl TrackerConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Reads the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|err| {
            TrackerError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: TrackerConfig = serde_json::from_str(&raw).map_err(|err| {
            TrackerError::Config(format!("failed to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                TrackerError::Config(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| TrackerError::Config(err.to_string()))?;
        fs::write(path, json).map_err(|err| {
            TrackerError::Config(format!("failed to write {}: {err}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_interval_ms", self.min_interval_ms),
            ("backoff_ms", self.backoff_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("stall_timeout_ms", self.stall_timeout_ms),
        ] {
            if value == 0 {
                return Err(TrackerError::Config(format!("{name} must be > 0")));
            }
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(TrackerError::Config("resolution must be non-zero".into()));
        }
        for (name, overlay) in [
            ("face_overlay", &self.face_overlay),
            ("hand_overlay", &self.hand_overlay),
        ] {
            if let Some(overlay) = overlay {
                if !(overlay.scale.is_finite() && overlay.scale > 0.0) {
                    return Err(TrackerError::Config(format!(
                        "{name}.scale must be a positive number, got {}",
                        overlay.scale
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}
