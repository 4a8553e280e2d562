//! Panomersive viewer core
//!
//! This crate drives multi-face panoramic camera video into two independent view
//! renderers: an immersive perspective view and a panoramic (mercator or optimized)
//! view, kept in sync by a viewbox overlay.
//!
//! # Architecture
//!
//! - `discovery`: asks a camera for its face endpoints, resolutions and layout
//!   metadata, and classifies the result into a [`CameraType`].
//! - `ingest`: one [`StreamSession`] per face, binding a decoder to a double-buffered
//!   frame slot.
//! - `scheduler`: a single consumer loop that round-robins over all sessions and
//!   composes one render per full cycle.
//! - `navigation`: pan/tilt/zoom arithmetic against the external rendering engine.
//! - `overlay`: projects the immersive footprint into the panoramic view, including
//!   the 360° seam split, and rasterizes overlay bitmaps.
//! - `manager`: owns all of the above and serializes rendering onto one thread.
//!
//! The spherical projection math and the video codecs live outside this crate,
//! behind the [`engine::RenderEngine`] and [`ingest::VideoDecoder`] traits.

use serde::{Deserialize, Serialize};

pub mod config;
pub mod discovery;
pub mod engine;
pub mod frame;
pub mod ingest;
pub mod manager;
pub mod navigation;
pub mod overlay;
pub mod scheduler;

pub use config::ViewerConfig;
pub use discovery::{
    classify, face_from_endpoint, CameraConnection, DeviceProtocolClient, DiscoveryError,
    StreamDescriptor,
};
pub use engine::{
    DataBounds, PixelPoint, ProjectionError, PtzLimitMode, PtzLimitOptions, RenderEngine,
    RenderError, Spherical, StubEngine, ViewAngle, ViewSize,
};
pub use frame::{Frame, FrameBuffer, FrameSignal, PlaneLayout};
pub use ingest::{BindError, DecoderFactory, StreamSession, SyntheticDecoderFactory, VideoDecoder};
pub use manager::{NavigationCommand, SessionManager};
pub use navigation::{NavigationController, ZoomAnimation};
pub use overlay::{clip_to_window, OverlayCompositor, VisibleWindow};
pub use scheduler::{FpsCounter, FrameScheduler, StepOutcome};

// -------------------- Faces --------------------

/// Identity of one physical lens (or the combined mosaic) of a multi-sensor camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    Left,
    Right,
    Up,
    Down,
    Front,
    Back,
    Mosaic,
    Illegal,
}

impl Face {
    pub fn as_str(&self) -> &'static str {
        match self {
            Face::Left => "left",
            Face::Right => "right",
            Face::Up => "up",
            Face::Down => "down",
            Face::Front => "front",
            Face::Back => "back",
            Face::Mosaic => "mosaic",
            Face::Illegal => "illegal",
        }
    }
}

impl std::fmt::Display for Face {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

// -------------------- Camera classification --------------------

/// Camera geometry derived once from the stream-count/resolution signature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraType {
    #[default]
    Unknown,
    Optera180,
    Optera270,
    Optera360,
    Full360,
    Custom,
}

impl CameraType {
    /// 360° cameras wrap around the panoramic seam.
    pub fn wraps_around(&self) -> bool {
        matches!(self, CameraType::Optera360)
    }

    /// Panoramic projection the engine should use for this geometry.
    pub fn panoramic_projection(&self) -> PanoramicProjection {
        match self {
            CameraType::Optera270 => PanoramicProjection::Optimized270,
            _ => PanoramicProjection::Mercator,
        }
    }
}

// -------------------- Layout --------------------

/// Which views are on screen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutOptions {
    /// Panoramic (mercator) view only.
    Panoramic,
    /// Immersive view only.
    Immersive,
    /// Panoramic over immersive, with the viewbox overlay.
    #[default]
    Panomersive,
}

impl std::str::FromStr for LayoutOptions {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "panoramic" => Ok(LayoutOptions::Panoramic),
            "immersive" => Ok(LayoutOptions::Immersive),
            "panomersive" => Ok(LayoutOptions::Panomersive),
            other => Err(anyhow::anyhow!("unknown layout '{}'", other)),
        }
    }
}

/// One of the two renderers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Immersive,
    Panoramic,
}

impl ViewKind {
    pub fn from_panoramic(is_panoramic: bool) -> Self {
        if is_panoramic {
            ViewKind::Panoramic
        } else {
            ViewKind::Immersive
        }
    }
}

/// Projection used by the panoramic view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanoramicProjection {
    Mercator,
    Optimized270,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_optera360_wraps() {
        assert!(CameraType::Optera360.wraps_around());
        assert!(!CameraType::Optera180.wraps_around());
        assert!(!CameraType::Full360.wraps_around());
    }

    #[test]
    fn optera270_uses_optimized_projection() {
        assert_eq!(
            CameraType::Optera270.panoramic_projection(),
            PanoramicProjection::Optimized270
        );
        assert_eq!(
            CameraType::Optera360.panoramic_projection(),
            PanoramicProjection::Mercator
        );
    }

    #[test]
    fn layout_parses_case_insensitively() {
        assert_eq!(
            "Immersive".parse::<LayoutOptions>().unwrap(),
            LayoutOptions::Immersive
        );
        assert!("split".parse::<LayoutOptions>().is_err());
    }
}
