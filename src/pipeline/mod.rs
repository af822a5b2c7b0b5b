#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod canvas;
pub mod frame_source;
pub mod overlay;
pub mod provider;
pub mod render_loop;
#[cfg(feature = "camera-nokhwa")]
pub mod rgba_converter;
pub mod topology;
pub mod transform;

// Re-exports for convenience
#[cfg(feature = "camera-nokhwa")]
pub use camera::{CameraDevice, CameraFrameSource, available_cameras, select_camera};
pub use canvas::{Canvas, composite};
pub use frame_source::{FrameSource, StillFrameSource};
pub use overlay::{OverlayAsset, OverlayRenderer};
pub use provider::{LandmarkModel, LandmarkProvider, OrtLandmarkProvider};
pub use render_loop::{LoopSettings, RenderLoop, TickOutcome, TrackingHandle};
