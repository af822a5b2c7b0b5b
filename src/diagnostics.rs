use std::fmt;

use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{RequestedFormat, RequestedFormatType},
};

use crate::pipeline::camera::{CameraDevice, available_cameras};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied(String),
    NoCamera,
    Failed(String),
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionStatus::Granted => write!(f, "granted"),
            PermissionStatus::Denied(reason) => write!(f, "denied ({reason})"),
            PermissionStatus::NoCamera => write!(f, "no camera found"),
            PermissionStatus::Failed(reason) => write!(f, "open failed ({reason})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticsReport {
    pub backend: Option<String>,
    pub permission: PermissionStatus,
    pub camera_count: usize,
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Some(backend) => writeln!(f, "capture backend: {backend}")?,
            None => writeln!(f, "capture backend: unsupported on this platform")?,
        }
        writeln!(f, "camera permission: {}", self.permission)?;
        write!(f, "cameras connected: {}", self.camera_count)
    }
}

/// Probes the capture stack the same way `live` would, without tracking.
pub fn run() -> DiagnosticsReport {
    let backend = nokhwa::native_api_backend().map(|backend| format!("{backend:?}"));

    let devices = match available_cameras() {
        Ok(devices) => devices,
        Err(err) => {
            log::warn!("{err}");
            return DiagnosticsReport {
                backend,
                permission: classify_open_error(&err.to_string()),
                camera_count: 0,
            };
        }
    };

    let permission = match devices.first() {
        Some(device) => try_open(device),
        None => PermissionStatus::NoCamera,
    };

    DiagnosticsReport {
        backend,
        permission,
        camera_count: devices.len(),
    }
}

fn try_open(device: &CameraDevice) -> PermissionStatus {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
    let result = Camera::new(device.index.clone(), requested).and_then(|mut camera| {
        camera.open_stream()?;
        camera.stop_stream()
    });
    match result {
        Ok(()) => {
            log::info!("opened and released {}", device.label);
            PermissionStatus::Granted
        }
        Err(err) => classify_open_error(&err.to_string()),
    }
}

fn classify_open_error(message: &str) -> PermissionStatus {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "notallowed"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        PermissionStatus::Denied(message.to_string())
    } else if ["not found", "no device", "no such device", "notfound"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        PermissionStatus::NoCamera
    } else {
        PermissionStatus::Failed(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Permission denied (os error 13)", "denied")]
    #[case("AVFoundation: camera access not authorized", "denied")]
    #[case("No such device", "none")]
    #[case("device busy", "failed")]
    fn open_errors_are_classified(#[case] message: &str, #[case] expected: &str) {
        let status = classify_open_error(message);
        let kind = match status {
            PermissionStatus::Denied(_) => "denied",
            PermissionStatus::NoCamera => "none",
            PermissionStatus::Failed(_) => "failed",
            PermissionStatus::Granted => "granted",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn report_prints_each_check() {
        let report = DiagnosticsReport {
            backend: None,
            permission: PermissionStatus::NoCamera,
            camera_count: 0,
        };
        let text = report.to_string();
        assert!(text.contains("unsupported on this platform"));
        assert!(text.contains("no camera found"));
        assert!(text.contains("cameras connected: 0"));
    }
}
