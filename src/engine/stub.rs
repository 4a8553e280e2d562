//! Linear-projection reference engine.
//!
//! Immersive view: pixels map linearly onto pan/tilt around the view angle, with a
//! field of view that narrows as zoom grows. Panoramic view: the data's pan extent is
//! stretched across the view width minus a letterbox on either side, tilt across the
//! full height. Wrapping happens only when the data covers a full turn.
//!
//! Used by the `replay`/`fixed` commands and by tests, which inspect its counters.

use std::collections::HashMap;
use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};
use std::time::Duration;

use image::RgbaImage;

use super::{
    DataBounds, EngineSetup, FacePlanesMut, PixelPoint, ProjectionError, PtzLimitOptions,
    RenderEngine, RenderError, Spherical, StreamImageFormat, ViewAngle, ViewSize,
};
use crate::frame::{PlaneLayout, PLANE_COUNT};
use crate::{Face, ViewKind};

/// Immersive field of view at zoom 0.
const BASE_FOV: f32 = FRAC_PI_2;
/// Fraction of the field of view removed at zoom 1.
const ZOOM_RANGE: f32 = 0.75;

#[derive(Clone, Debug)]
struct StubView {
    angle: ViewAngle,
    zoom: f32,
    size: ViewSize,
    ptz_history: Vec<PtzLimitOptions>,
    renders: u64,
    swaps: u64,
}

impl StubView {
    fn new(size: ViewSize) -> Self {
        Self {
            angle: ViewAngle::default(),
            zoom: 0.0,
            size,
            ptz_history: Vec::new(),
            renders: 0,
            swaps: 0,
        }
    }

    fn contains(&self, point: PixelPoint) -> bool {
        point.x >= 0 && point.y >= 0 && point.x < self.size.width && point.y < self.size.height
    }

    /// Radians per immersive pixel.
    fn radians_per_pixel(&self) -> f32 {
        let fov = BASE_FOV * (1.0 - ZOOM_RANGE * self.zoom.clamp(0.0, 1.0));
        fov / self.size.width.max(1) as f32
    }
}

/// Last bitmap composited into a view.
#[derive(Clone, Debug)]
pub struct OverlayRecord {
    pub bitmap: RgbaImage,
    pub offset: PixelPoint,
}

#[derive(Debug)]
pub struct StubEngine {
    immersive: StubView,
    panoramic: StubView,
    bounds: DataBounds,
    tilt_extent: f32,
    letterbox: i32,
    setup: Option<EngineSetup>,
    buffers: HashMap<Face, [Vec<u8>; PLANE_COUNT]>,
    buffers_available: bool,
    releases: u64,
    overlays: HashMap<ViewKind, OverlayRecord>,
    overlay_count: u64,
    current: Option<ViewKind>,
    tilt_correction: (bool, f32),
    render_delay: Duration,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StubEngine {
    /// Full-turn data, 640x480 immersive view, 1200x400 panoramic view with a 100 px
    /// letterbox on either side.
    pub fn new() -> Self {
        Self {
            immersive: StubView::new(ViewSize::new(640, 480)),
            panoramic: StubView::new(ViewSize::new(1200, 400)),
            bounds: DataBounds {
                pan_start: -PI,
                pan_end: PI,
                origin_pan: 0.0,
                origin_tilt: 0.0,
            },
            tilt_extent: FRAC_PI_4,
            letterbox: 100,
            setup: None,
            buffers: HashMap::new(),
            buffers_available: true,
            releases: 0,
            overlays: HashMap::new(),
            overlay_count: 0,
            current: None,
            tilt_correction: (false, 0.0),
            render_delay: Duration::ZERO,
        }
    }

    pub fn with_data_bounds(mut self, bounds: DataBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_letterbox(mut self, letterbox: i32) -> Self {
        self.letterbox = letterbox;
        self
    }

    pub fn with_view_size(mut self, view: ViewKind, size: ViewSize) -> Self {
        self.view_mut(view).size = size;
        self
    }

    /// Stall every render by `delay`, as a slow GPU would.
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    /// Simulate a context that refuses to hand out frame buffers.
    pub fn set_buffers_available(&mut self, available: bool) {
        self.buffers_available = available;
    }

    pub fn setup_info(&self) -> Option<&EngineSetup> {
        self.setup.as_ref()
    }

    pub fn render_count(&self, view: ViewKind) -> u64 {
        self.view(view).renders
    }

    pub fn swap_count(&self, view: ViewKind) -> u64 {
        self.view(view).swaps
    }

    /// Number of `release_frame_buffer` calls, one per completed copy.
    pub fn release_count(&self) -> u64 {
        self.releases
    }

    pub fn face_planes(&self, face: Face) -> Option<&[Vec<u8>; PLANE_COUNT]> {
        self.buffers.get(&face)
    }

    pub fn last_overlay(&self, view: ViewKind) -> Option<&OverlayRecord> {
        self.overlays.get(&view)
    }

    pub fn overlay_count(&self) -> u64 {
        self.overlay_count
    }

    pub fn ptz_history(&self, view: ViewKind) -> &[PtzLimitOptions] {
        &self.view(view).ptz_history
    }

    pub fn tilt_correction(&self) -> (bool, f32) {
        self.tilt_correction
    }

    pub fn current_view(&self) -> Option<ViewKind> {
        self.current
    }

    fn view(&self, view: ViewKind) -> &StubView {
        match view {
            ViewKind::Immersive => &self.immersive,
            ViewKind::Panoramic => &self.panoramic,
        }
    }

    fn view_mut(&mut self, view: ViewKind) -> &mut StubView {
        match view {
            ViewKind::Immersive => &mut self.immersive,
            ViewKind::Panoramic => &mut self.panoramic,
        }
    }

    fn pan_extent(&self) -> f32 {
        self.bounds.pan_end - self.bounds.pan_start
    }

    fn full_turn(&self) -> bool {
        self.pan_extent() >= TAU - 1e-4
    }

    fn content_width(&self) -> f32 {
        (self.panoramic.size.width - 2 * self.letterbox).max(1) as f32
    }

    /// Pan relative to the panoramic view, folded into the data range on full-turn data.
    fn panoramic_relative_pan(&self, pan: f32) -> f32 {
        let relative = pan - self.panoramic.angle.pan;
        if self.full_turn() {
            self.bounds.pan_start + (relative - self.bounds.pan_start).rem_euclid(TAU)
        } else {
            relative
        }
    }
}

fn wrap_pi(angle: f32) -> f32 {
    (angle + PI).rem_euclid(TAU) - PI
}

impl RenderEngine for StubEngine {
    fn setup(&mut self, setup: &EngineSetup) -> Result<(), RenderError> {
        if setup.faces.is_empty() {
            return Err(RenderError::Engine("no faces declared".to_string()));
        }
        self.buffers.clear();
        for face in &setup.faces {
            let planes = match setup.format {
                StreamImageFormat::I420 => {
                    let [y, u, v] = PlaneLayout::i420(face.width, face.height).plane_sizes();
                    [vec![0u8; y], vec![0u8; u], vec![0u8; v]]
                }
                StreamImageFormat::Bgra => {
                    let len = face.width as usize * face.height as usize * 4;
                    [vec![0u8; len], Vec::new(), Vec::new()]
                }
            };
            self.buffers.insert(face.face, planes);
        }
        self.tilt_correction = (setup.camera_tilt_enabled, setup.camera_tilt_radians);
        self.setup = Some(setup.clone());
        self.set_ptz_limit_options(ViewKind::Immersive, setup.ptz_limits);
        self.set_ptz_limit_options(ViewKind::Panoramic, setup.ptz_limits);
        Ok(())
    }

    fn make_current(&mut self, view: ViewKind) {
        self.current = Some(view);
    }

    fn view_to_spherical(
        &self,
        view: ViewKind,
        point: PixelPoint,
    ) -> Result<Spherical, ProjectionError> {
        let state = self.view(view);
        if state.size.is_empty() {
            return Err(ProjectionError::NotConfigured);
        }
        if !state.contains(point) {
            return Err(ProjectionError::OutsideView);
        }
        match view {
            ViewKind::Immersive => {
                let k = state.radians_per_pixel();
                let half_w = state.size.width as f32 / 2.0;
                let half_h = state.size.height as f32 / 2.0;
                Ok(Spherical::new(
                    state.angle.pan + (point.x as f32 - half_w) * k,
                    state.angle.tilt - (point.y as f32 - half_h) * k,
                ))
            }
            ViewKind::Panoramic => {
                let x = (point.x - self.letterbox) as f32;
                let content = self.content_width();
                if x < 0.0 || x >= content {
                    return Err(ProjectionError::OutsideData);
                }
                let mut pan = self.bounds.pan_start + x / content * self.pan_extent()
                    + state.angle.pan;
                if self.full_turn() {
                    pan = wrap_pi(pan);
                }
                let tilt = self.tilt_extent
                    - point.y as f32 / state.size.height as f32 * 2.0 * self.tilt_extent;
                Ok(Spherical::new(pan, tilt))
            }
        }
    }

    fn spherical_to_view(
        &self,
        view: ViewKind,
        coords: Spherical,
    ) -> Result<PixelPoint, ProjectionError> {
        let state = self.view(view);
        if state.size.is_empty() {
            return Err(ProjectionError::NotConfigured);
        }
        let point = match view {
            ViewKind::Immersive => {
                let k = state.radians_per_pixel();
                let x = state.size.width as f32 / 2.0 + wrap_pi(coords.pan - state.angle.pan) / k;
                let y = state.size.height as f32 / 2.0 - (coords.tilt - state.angle.tilt) / k;
                PixelPoint::new(x.round() as i32, y.round() as i32)
            }
            ViewKind::Panoramic => {
                let pan = self.panoramic_relative_pan(coords.pan);
                if pan < self.bounds.pan_start || pan > self.bounds.pan_end {
                    return Err(ProjectionError::OutsideData);
                }
                if coords.tilt.abs() > self.tilt_extent {
                    return Err(ProjectionError::OutsideData);
                }
                let x = self.letterbox as f32
                    + (pan - self.bounds.pan_start) / self.pan_extent() * self.content_width();
                let y = (self.tilt_extent - coords.tilt) / (2.0 * self.tilt_extent)
                    * state.size.height as f32;
                PixelPoint::new(x.round() as i32, y.round() as i32)
            }
        };
        if !state.contains(point) {
            return Err(ProjectionError::OutsideView);
        }
        Ok(point)
    }

    fn view_angle(&self, view: ViewKind) -> ViewAngle {
        self.view(view).angle
    }

    fn set_view_angle(&mut self, view: ViewKind, angle: ViewAngle) {
        self.view_mut(view).angle = angle;
    }

    fn zoom(&self, view: ViewKind) -> f32 {
        self.view(view).zoom
    }

    fn set_zoom(&mut self, view: ViewKind, zoom: f32) {
        self.view_mut(view).zoom = zoom;
    }

    fn view_size(&self, view: ViewKind) -> ViewSize {
        self.view(view).size
    }

    fn set_view_size(&mut self, view: ViewKind, size: ViewSize) {
        self.view_mut(view).size = size;
    }

    fn set_ptz_limit_options(&mut self, view: ViewKind, options: PtzLimitOptions) {
        self.view_mut(view).ptz_history.push(options);
    }

    fn data_bounds(&self) -> DataBounds {
        self.bounds
    }

    fn map_spherical_coordinates(
        &self,
        pan: f32,
        tilt: f32,
        _origin_pan: f32,
        _origin_tilt: f32,
    ) -> Spherical {
        Spherical::new(pan, tilt)
    }

    fn set_camera_tilt_correction(&mut self, enabled: bool, angle_radians: f32) {
        self.tilt_correction = (enabled, angle_radians);
    }

    fn frame_buffer(&mut self, face: Face) -> Option<FacePlanesMut<'_>> {
        if !self.buffers_available {
            return None;
        }
        let [y, u, v] = self.buffers.get_mut(&face)?;
        Some(FacePlanesMut {
            planes: [y.as_mut_slice(), u.as_mut_slice(), v.as_mut_slice()],
        })
    }

    fn release_frame_buffer(&mut self, _face: Face) {
        self.releases += 1;
    }

    fn add_bitmap_to_overlay(
        &mut self,
        view: ViewKind,
        bitmap: &RgbaImage,
        offset: PixelPoint,
    ) -> Result<(), RenderError> {
        if self.setup.is_none() {
            return Err(RenderError::NotSetUp);
        }
        if bitmap.width() == 0 || bitmap.height() == 0 {
            return Err(RenderError::Overlay("empty bitmap".to_string()));
        }
        self.overlays.insert(
            view,
            OverlayRecord {
                bitmap: bitmap.clone(),
                offset,
            },
        );
        self.overlay_count += 1;
        Ok(())
    }

    fn render_direct(&mut self, view: ViewKind) -> Result<(), RenderError> {
        if self.setup.is_none() {
            return Err(RenderError::NotSetUp);
        }
        if !self.render_delay.is_zero() {
            std::thread::sleep(self.render_delay);
        }
        self.view_mut(view).renders += 1;
        Ok(())
    }

    fn swap_buffers(&mut self, view: ViewKind) {
        self.view_mut(view).swaps += 1;
    }

    fn teardown(&mut self) {
        self.setup = None;
        self.buffers.clear();
        self.overlays.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FaceSetup;
    use crate::PanoramicProjection;

    fn setup(format: StreamImageFormat) -> EngineSetup {
        EngineSetup {
            faces: vec![FaceSetup {
                face: Face::Mosaic,
                layout_metadata: "layout".to_string(),
                width: 8,
                height: 4,
            }],
            format,
            stream_optimization: "balanced".to_string(),
            panoramic_projection: PanoramicProjection::Mercator,
            letterbox_color: [40, 40, 40],
            ptz_limits: PtzLimitOptions::default(),
            camera_tilt_enabled: false,
            camera_tilt_radians: 0.0,
        }
    }

    #[test]
    fn immersive_round_trip_is_exact_at_pixel_centres() {
        let engine = StubEngine::new();
        let p = PixelPoint::new(100, 50);
        let s = engine.view_to_spherical(ViewKind::Immersive, p).unwrap();
        let back = engine.spherical_to_view(ViewKind::Immersive, s).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn points_outside_view_fail() {
        let engine = StubEngine::new();
        assert_eq!(
            engine.view_to_spherical(ViewKind::Immersive, PixelPoint::new(640, 0)),
            Err(ProjectionError::OutsideView)
        );
        assert_eq!(
            engine.view_to_spherical(ViewKind::Panoramic, PixelPoint::new(50, 10)),
            Err(ProjectionError::OutsideData)
        );
    }

    #[test]
    fn panoramic_spans_content_between_letterboxes() {
        let engine = StubEngine::new();
        let left = engine
            .spherical_to_view(ViewKind::Panoramic, Spherical::new(-PI + 0.001, 0.0))
            .unwrap();
        let right = engine
            .spherical_to_view(ViewKind::Panoramic, Spherical::new(PI - 0.001, 0.0))
            .unwrap();
        assert_eq!(left.x, 100);
        assert_eq!(right.x, 1100);
        assert_eq!(left.y, 200);
    }

    #[test]
    fn full_turn_data_wraps_pan() {
        let engine = StubEngine::new();
        let a = engine
            .spherical_to_view(ViewKind::Panoramic, Spherical::new(0.5, 0.0))
            .unwrap();
        let b = engine
            .spherical_to_view(ViewKind::Panoramic, Spherical::new(0.5 + TAU, 0.0))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn partial_data_rejects_pan_outside_bounds() {
        let engine = StubEngine::new().with_data_bounds(DataBounds {
            pan_start: -1.0,
            pan_end: 1.0,
            origin_pan: 0.0,
            origin_tilt: 0.0,
        });
        assert_eq!(
            engine.spherical_to_view(ViewKind::Panoramic, Spherical::new(2.0, 0.0)),
            Err(ProjectionError::OutsideData)
        );
    }

    #[test]
    fn setup_allocates_buffers_per_format() {
        let mut engine = StubEngine::new();
        engine.setup(&setup(StreamImageFormat::I420)).unwrap();
        let sizes: Vec<usize> = engine
            .face_planes(Face::Mosaic)
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![32, 8, 8]);

        engine.setup(&setup(StreamImageFormat::Bgra)).unwrap();
        let sizes: Vec<usize> = engine
            .face_planes(Face::Mosaic)
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![128, 0, 0]);
    }

    #[test]
    fn unavailable_buffers_are_none() {
        let mut engine = StubEngine::new();
        engine.setup(&setup(StreamImageFormat::I420)).unwrap();
        assert!(engine.frame_buffer(Face::Mosaic).is_some());
        assert!(engine.frame_buffer(Face::Left).is_none());
        engine.set_buffers_available(false);
        assert!(engine.frame_buffer(Face::Mosaic).is_none());
    }

    #[test]
    fn render_requires_setup() {
        let mut engine = StubEngine::new();
        assert_eq!(
            engine.render_direct(ViewKind::Immersive),
            Err(RenderError::NotSetUp)
        );
        engine.setup(&setup(StreamImageFormat::I420)).unwrap();
        engine.render_direct(ViewKind::Immersive).unwrap();
        assert_eq!(engine.render_count(ViewKind::Immersive), 1);
        engine.teardown();
        engine.teardown();
        assert!(engine.setup_info().is_none());
    }
}
