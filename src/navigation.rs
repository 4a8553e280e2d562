//! Pan/tilt/zoom arithmetic against the rendering engine.
//!
//! Every call runs on the render thread. Projection failures mean the cursor is
//! outside the view or the data and end the interaction quietly.

use std::thread;
use std::time::Duration;

use crate::config::ViewerConfig;
use crate::engine::{PixelPoint, PtzLimitOptions, RenderEngine, ViewAngle};
use crate::overlay::OverlayCompositor;
use crate::{LayoutOptions, ViewKind};

/// Empirical zoom per wheel notch, and the size of one notch.
const ZOOM_SPEED: f32 = 0.02;
const WHEEL_DELTA: f32 = 120.0;

/// Steps in a double-click zoom animation.
pub const ZOOM_ANIMATION_STEPS: u32 = 10;

/// Wheel units per animation step for the current zoom, so the animation covers a
/// similar visual distance at any zoom level.
pub fn zoom_step_for(current_zoom: f32) -> i32 {
    if (0.2..=0.4).contains(&current_zoom) {
        80
    } else if (0.4..=0.6).contains(&current_zoom) {
        60
    } else if (0.6..=0.8).contains(&current_zoom) {
        40
    } else if current_zoom > 0.8 {
        20
    } else {
        100
    }
}

/// Remaining steps of a zoom toward a clicked point, applied one per render-loop
/// iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoomAnimation {
    pub location: PixelPoint,
    pub delta: i32,
    pub is_panoramic: bool,
    remaining: u32,
}

impl ZoomAnimation {
    pub fn new(location: PixelPoint, delta: i32, is_panoramic: bool) -> Self {
        Self {
            location,
            delta,
            is_panoramic,
            remaining: ZOOM_ANIMATION_STEPS,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_finished(&self) -> bool {
        self.remaining == 0
    }

    /// Apply one step. Returns false once the animation is exhausted.
    pub fn advance<E: RenderEngine + ?Sized>(
        &mut self,
        navigation: &NavigationController,
        engine: &mut E,
        overlay: &OverlayCompositor,
    ) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        navigation.perform_zoom(engine, overlay, self.location, self.delta, self.is_panoramic);
        true
    }
}

#[derive(Clone, Debug)]
pub struct NavigationController {
    ptz_limits: PtzLimitOptions,
    target_dwell: Duration,
}

impl NavigationController {
    pub fn new(ptz_limits: PtzLimitOptions, target_dwell: Duration) -> Self {
        Self {
            ptz_limits,
            target_dwell,
        }
    }

    pub fn from_config(config: &ViewerConfig) -> Self {
        Self::new(
            config.ptz.limit_options(),
            Duration::from_millis(config.target_dwell_ms),
        )
    }

    pub fn ptz_limits(&self) -> PtzLimitOptions {
        self.ptz_limits
    }

    /// Point the immersive view at the clicked pixel. Returns the zoom animation to
    /// run when `do_zoom` is set.
    pub fn move_to_position<E: RenderEngine + ?Sized>(
        &self,
        engine: &mut E,
        overlay: &OverlayCompositor,
        location: PixelPoint,
        is_panoramic: bool,
        do_zoom: bool,
    ) -> Option<ZoomAnimation> {
        let view = ViewKind::from_panoramic(is_panoramic);
        engine.make_current(view);
        let target = engine.view_to_spherical(view, location).ok()?;

        if overlay.layout() != LayoutOptions::Panoramic {
            overlay.draw_target(engine, location, view, false);
            engine.make_current(view);
            match engine.render_direct(view) {
                Ok(()) => engine.swap_buffers(view),
                Err(err) => log::warn!("target render failed: {}", err),
            }
            if !self.target_dwell.is_zero() {
                thread::sleep(self.target_dwell);
            }
        }

        engine.make_current(ViewKind::Immersive);
        engine.set_view_angle(ViewKind::Immersive, ViewAngle::new(target.pan, target.tilt));

        overlay.draw_target(engine, location, view, true);
        overlay.refresh_views(engine);

        if !do_zoom {
            return None;
        }
        let step = zoom_step_for(engine.zoom(ViewKind::Immersive));
        Some(ZoomAnimation::new(location, step, is_panoramic))
    }

    /// Drag: move the view opposite to the cursor so the data follows the pointer.
    pub fn perform_pan_tilt<E: RenderEngine + ?Sized>(
        &self,
        engine: &mut E,
        overlay: &OverlayCompositor,
        anchor: PixelPoint,
        location: PixelPoint,
        is_panoramic: bool,
    ) {
        let view = ViewKind::from_panoramic(is_panoramic);
        engine.make_current(view);
        let (Ok(from), Ok(to)) = (
            engine.view_to_spherical(view, anchor),
            engine.view_to_spherical(view, location),
        ) else {
            return;
        };
        let angle = engine.view_angle(view);
        engine.set_view_angle(
            view,
            ViewAngle::new(
                angle.pan - (to.pan - from.pan),
                angle.tilt - (to.tilt - from.tilt),
            ),
        );
        overlay.refresh_views(engine);
    }

    /// Wheel zoom on the immersive view. Returns false when the zoom did not change.
    ///
    /// On the immersive view the point under the cursor stays put: the angle is
    /// corrected by how far that point moved, with auto-zoom limiting switched off for
    /// the correction.
    pub fn perform_zoom<E: RenderEngine + ?Sized>(
        &self,
        engine: &mut E,
        overlay: &OverlayCompositor,
        location: PixelPoint,
        delta: i32,
        is_panoramic: bool,
    ) -> bool {
        let step = delta as f32 * ZOOM_SPEED / WHEEL_DELTA;
        engine.make_current(ViewKind::Immersive);
        let before = engine.view_to_spherical(ViewKind::Immersive, location);

        let current = engine.zoom(ViewKind::Immersive);
        let zoom = (current + step).clamp(0.0, 1.0);
        if (zoom - current).abs() <= 0.0 {
            return false;
        }
        engine.set_zoom(ViewKind::Immersive, zoom);

        if !is_panoramic {
            if let (Ok(before), Ok(after)) =
                (before, engine.view_to_spherical(ViewKind::Immersive, location))
            {
                let angle = engine.view_angle(ViewKind::Immersive);
                let corrected = ViewAngle::new(
                    angle.pan - (after.pan - before.pan),
                    angle.tilt - (after.tilt - before.tilt),
                );
                engine.set_ptz_limit_options(
                    ViewKind::Immersive,
                    self.ptz_limits.without_auto_zoom(),
                );
                engine.set_view_angle(ViewKind::Immersive, corrected);
                engine.set_ptz_limit_options(ViewKind::Immersive, self.ptz_limits);
            }
        }

        overlay.refresh_views(engine);
        true
    }

    /// Forward tilt correction to the engine and redraw.
    pub fn adjust_camera_tilt<E: RenderEngine + ?Sized>(
        &self,
        engine: &mut E,
        overlay: &OverlayCompositor,
        angle_degrees: f32,
        enabled: bool,
    ) {
        engine.set_camera_tilt_correction(enabled, angle_degrees.to_radians());
        overlay.refresh_views(engine);
    }
}
