//! Rendering engine interface.
//!
//! The spherical projection library is an external collaborator. This module
//! describes the slice of it the viewer core consumes:
//!
//! - view/sphere coordinate conversion for both views (fallible: a point outside the
//!   view or the data is an expected, steady-state failure)
//! - per-view mutable state: angle, zoom, size, PTZ limit options
//! - per-face frame buffers the consumer loop copies decoded planes into
//! - overlay bitmaps, direct rendering and buffer swaps
//!
//! The engine context is not reentrant across its two views, so every call happens on
//! the render thread and `make_current` is issued before working on a given view.
//!
//! `StubEngine` is a reference implementation with linear projections, used by the
//! `replay`/`fixed` commands and by tests.

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{Frame, PLANE_COUNT};
use crate::{Face, PanoramicProjection, ViewKind};

pub mod stub;

pub use stub::StubEngine;

// ----------------------------------------------------------------------------
// Coordinates
// ----------------------------------------------------------------------------

/// Pixel position inside a view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Spherical coordinates in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Spherical {
    pub pan: f32,
    pub tilt: f32,
}

impl Spherical {
    pub const fn new(pan: f32, tilt: f32) -> Self {
        Self { pan, tilt }
    }
}

/// Orientation of a view, in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViewAngle {
    pub pan: f32,
    pub tilt: f32,
}

impl ViewAngle {
    pub const fn new(pan: f32, tilt: f32) -> Self {
        Self { pan, tilt }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewSize {
    pub width: i32,
    pub height: i32,
}

impl ViewSize {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Valid spherical extent of the loaded data. Read-only engine output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataBounds {
    pub pan_start: f32,
    pub pan_end: f32,
    pub origin_pan: f32,
    pub origin_tilt: f32,
}

// ----------------------------------------------------------------------------
// PTZ limiting
// ----------------------------------------------------------------------------

/// How the engine keeps a view inside the data. Opaque to the core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzLimitMode {
    Off,
    #[default]
    ViewCenter,
    ViewEdge,
}

/// Auto-limit policy forwarded to the engine for each view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzLimitOptions {
    pub limit_mode: PtzLimitMode,
    pub auto_zoom_in: bool,
    pub auto_zoom_out: bool,
    pub auto_pan_tilt: bool,
}

impl Default for PtzLimitOptions {
    fn default() -> Self {
        Self {
            limit_mode: PtzLimitMode::default(),
            auto_zoom_in: true,
            auto_zoom_out: true,
            auto_pan_tilt: true,
        }
    }
}

impl PtzLimitOptions {
    /// Same policy with auto-zoom limiting switched off. Pan/tilt limiting stays.
    pub fn without_auto_zoom(self) -> Self {
        Self {
            auto_zoom_in: false,
            auto_zoom_out: false,
            ..self
        }
    }
}

// ----------------------------------------------------------------------------
// Setup
// ----------------------------------------------------------------------------

/// Pixel format of the frames handed to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamImageFormat {
    /// Planar 4:2:0 (live decoder output).
    I420,
    /// Packed BGRA (fixed still images).
    Bgra,
}

/// One face as declared to the engine's video stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaceSetup {
    pub face: Face,
    pub layout_metadata: String,
    pub width: u32,
    pub height: u32,
}

/// Everything the engine needs to build its context, video stream and both views.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSetup {
    pub faces: Vec<FaceSetup>,
    pub format: StreamImageFormat,
    pub stream_optimization: String,
    pub panoramic_projection: PanoramicProjection,
    pub letterbox_color: [u8; 3],
    pub ptz_limits: PtzLimitOptions,
    pub camera_tilt_enabled: bool,
    pub camera_tilt_radians: f32,
}

// ----------------------------------------------------------------------------
// Frame buffers
// ----------------------------------------------------------------------------

/// Writable, engine-owned planes for one face.
pub struct FacePlanesMut<'a> {
    pub planes: [&'a mut [u8]; PLANE_COUNT],
}

impl FacePlanesMut<'_> {
    /// A destination plane is missing when the source has bytes for it but the engine
    /// handed out nothing.
    pub fn accepts(&self, frame: &Frame) -> bool {
        frame
            .sizes()
            .iter()
            .zip(self.planes.iter())
            .all(|(size, dst)| *size == 0 || !dst.is_empty())
    }

    /// Byte-exact copy of each plane. Sizes come from the frame; a destination
    /// smaller than its source plane is a caller bug and panics.
    pub fn copy_from(&mut self, frame: &Frame) {
        for (dst, src) in self.planes.iter_mut().zip(frame.planes().iter()) {
            dst[..src.len()].copy_from_slice(src);
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Coordinate conversion failure. Expected in steady state: callers skip the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("point lies outside the view")]
    OutsideView,
    #[error("coordinates lie outside the loaded data")]
    OutsideData,
    #[error("view is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render engine is not set up")]
    NotSetUp,
    #[error("overlay bitmap rejected: {0}")]
    Overlay(String),
    #[error("render engine failure: {0}")]
    Engine(String),
}

// ----------------------------------------------------------------------------
// RenderEngine trait
// ----------------------------------------------------------------------------

/// The rendering-engine ABI consumed by the viewer core.
///
/// All methods are called from the single render thread.
pub trait RenderEngine: Send {
    /// Build the context, the per-face video stream and both views.
    fn setup(&mut self, setup: &EngineSetup) -> Result<(), RenderError>;

    /// Bind the context of the given view.
    fn make_current(&mut self, view: ViewKind);

    fn view_to_spherical(
        &self,
        view: ViewKind,
        point: PixelPoint,
    ) -> Result<Spherical, ProjectionError>;

    fn spherical_to_view(
        &self,
        view: ViewKind,
        coords: Spherical,
    ) -> Result<PixelPoint, ProjectionError>;

    fn view_angle(&self, view: ViewKind) -> ViewAngle;
    fn set_view_angle(&mut self, view: ViewKind, angle: ViewAngle);

    fn zoom(&self, view: ViewKind) -> f32;
    fn set_zoom(&mut self, view: ViewKind, zoom: f32);

    fn view_size(&self, view: ViewKind) -> ViewSize;
    fn set_view_size(&mut self, view: ViewKind, size: ViewSize);

    fn set_ptz_limit_options(&mut self, view: ViewKind, options: PtzLimitOptions);

    fn data_bounds(&self) -> DataBounds;

    /// Map data-relative coordinates through the context's origin.
    fn map_spherical_coordinates(
        &self,
        pan: f32,
        tilt: f32,
        origin_pan: f32,
        origin_tilt: f32,
    ) -> Spherical;

    fn set_camera_tilt_correction(&mut self, enabled: bool, angle_radians: f32);

    /// Acquire the GPU-visible buffer for a face. `None` when unavailable.
    fn frame_buffer(&mut self, face: Face) -> Option<FacePlanesMut<'_>>;

    /// Hand a buffer acquired with `frame_buffer` back to the engine.
    fn release_frame_buffer(&mut self, face: Face);

    fn add_bitmap_to_overlay(
        &mut self,
        view: ViewKind,
        bitmap: &RgbaImage,
        offset: PixelPoint,
    ) -> Result<(), RenderError>;

    fn render_direct(&mut self, view: ViewKind) -> Result<(), RenderError>;

    fn swap_buffers(&mut self, view: ViewKind);

    /// Release views, video stream and context. Idempotent.
    fn teardown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_auto_zoom_keeps_pan_tilt_limiting() {
        let opts = PtzLimitOptions {
            limit_mode: PtzLimitMode::ViewEdge,
            auto_zoom_in: true,
            auto_zoom_out: true,
            auto_pan_tilt: true,
        };
        let relaxed = opts.without_auto_zoom();
        assert!(!relaxed.auto_zoom_in);
        assert!(!relaxed.auto_zoom_out);
        assert!(relaxed.auto_pan_tilt);
        assert_eq!(relaxed.limit_mode, PtzLimitMode::ViewEdge);
    }

    #[test]
    fn copy_uses_source_sizes() {
        let frame = Frame::from_planes([vec![1, 2], vec![3], vec![4]]);
        let mut y = [0u8; 4];
        let mut u = [0u8; 2];
        let mut v = [0u8; 2];
        let mut planes = FacePlanesMut {
            planes: [&mut y, &mut u, &mut v],
        };
        assert!(planes.accepts(&frame));
        planes.copy_from(&frame);
        assert_eq!(y, [1, 2, 0, 0]);
        assert_eq!(u, [3, 0]);
        assert_eq!(v, [4, 0]);
    }

    #[test]
    fn missing_destination_plane_is_rejected() {
        let frame = Frame::from_planes([vec![1], vec![2], vec![3]]);
        let mut y = [0u8; 1];
        let mut u = [0u8; 1];
        let planes = FacePlanesMut {
            planes: [&mut y, &mut u, &mut []],
        };
        assert!(!planes.accepts(&frame));
    }

    #[test]
    fn bgra_frame_needs_only_first_plane() {
        let frame = Frame::packed_bgra(vec![9; 8]);
        let mut bgra = [0u8; 8];
        let planes = FacePlanesMut {
            planes: [&mut bgra, &mut [], &mut []],
        };
        assert!(planes.accepts(&frame));
    }
}
