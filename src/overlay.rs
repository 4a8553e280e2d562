//! Overlay composition for both views.
//!
//! - `draw_view_box`: outline of the immersive footprint drawn into the panoramic
//!   view (panomersive layout only). On 360° cameras the footprint is unwrapped across
//!   the seam and clipped into at most two closed polygons.
//! - `draw_fps`: translucent FPS badge in the primary view.
//! - `draw_target`: reticle shown around a point of interest during a jump.
//! - `refresh_views`: re-upload fixed stills, redraw the view box, render and swap.
//!
//! Projection failures while sampling the footprint only drop that point.

use std::sync::Arc;

use image::{Rgba, RgbaImage};

use crate::engine::{PixelPoint, RenderEngine, ViewSize};
use crate::frame::Frame;
use crate::scheduler::FpsCounter;
use crate::{CameraType, Face, LayoutOptions, ViewKind};

/// Inward nudge applied to the data's pan bounds before projecting them.
const PAN_EDGE_NUDGE: f32 = 0.001;
/// Pan extents narrower than this have no measurable width.
const MIN_PAN_EXTENT: f32 = 1e-6;

const FPS_BADGE_SIZE: (u32, u32) = (60, 30);
const TARGET_SIZE: u32 = 22;
const TARGET_HALF: i32 = 10;

const VIEW_BOX_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BADGE_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 100]);
const BADGE_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TARGET_FILL: Rgba<u8> = Rgba([135, 206, 250, 170]);
const TARGET_CROSS: Rgba<u8> = Rgba([255, 255, 255, 170]);

// ----------------------------------------------------------------------------
// Visible window and clipping
// ----------------------------------------------------------------------------

/// Horizontal span of the panoramic view that holds data: `[left, left + width)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisibleWindow {
    pub left: i32,
    pub width: i32,
}

impl VisibleWindow {
    pub fn new(left: i32, width: i32) -> Self {
        Self { left, width }
    }

    /// First column past the window.
    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn contains(&self, x: i32) -> bool {
        x >= self.left && x < self.right()
    }

    fn clamp(&self, x: i32) -> i32 {
        x.clamp(self.left, self.right() - 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Move points that jumped across the seam back next to point 0.
pub fn unwrap_seam(points: &[PixelPoint], half_view_width: i32, real_width: i32) -> Vec<PixelPoint> {
    let Some(first) = points.first().copied() else {
        return Vec::new();
    };
    points
        .iter()
        .map(|p| {
            let mut p = *p;
            if p.x - first.x > half_view_width {
                p.x -= real_width;
            } else if first.x - p.x > half_view_width {
                p.x += real_width;
            }
            p
        })
        .collect()
}

/// Clip a closed polygon against the visible window.
///
/// Returns no polygon for empty input, the polygon itself when it lies inside, or
/// two polygons when it crosses one window edge: the inside part closed along that
/// edge, and the overhang shifted by the window width and closed along the opposite
/// edge. Both share the same two interpolated seam Y values. Every returned point
/// lies inside the window.
pub fn clip_to_window(points: &[PixelPoint], window: VisibleWindow) -> Vec<Vec<PixelPoint>> {
    if points.is_empty() || window.width <= 0 {
        return Vec::new();
    }
    let inside = |p: &PixelPoint| window.contains(p.x);

    let Some(start) = points.iter().position(inside) else {
        // Whole footprint beyond the seam: shift it back as one piece.
        let shift = match side_of(points[0], window) {
            Side::Right => -window.width,
            Side::Left => window.width,
        };
        return vec![points
            .iter()
            .map(|p| PixelPoint::new(window.clamp(p.x + shift), p.y))
            .collect()];
    };
    if points.iter().all(inside) {
        return vec![points.to_vec()];
    }

    let mut pts = points.to_vec();
    pts.rotate_left(start);
    let n = pts.len();

    // pts[0] is inside and at least one point is not, so `exit` exists.
    let exit = (1..n).find(|&k| !inside(&pts[k])).unwrap_or(n - 1);
    let reentry = (exit + 1..n).find(|&k| inside(&pts[k])).unwrap_or(n);

    let side = side_of(pts[exit], window);
    let (seam_x, inner_x, outer_x, shift) = match side {
        Side::Right => (window.right(), window.right() - 1, window.left, -window.width),
        Side::Left => (window.left, window.left, window.right() - 1, window.width),
    };
    let y_out = intercept_y(pts[exit - 1], pts[exit], seam_x);
    let y_back = intercept_y(pts[reentry - 1], pts[reentry % n], seam_x);

    let mut kept = Vec::with_capacity(n + 2);
    kept.extend(pts[..exit].iter().map(|p| PixelPoint::new(window.clamp(p.x), p.y)));
    kept.push(PixelPoint::new(inner_x, y_out));
    kept.push(PixelPoint::new(inner_x, y_back));
    kept.extend(pts[reentry..].iter().map(|p| PixelPoint::new(window.clamp(p.x), p.y)));

    let mut wrapped = Vec::with_capacity(reentry - exit + 2);
    wrapped.push(PixelPoint::new(outer_x, y_out));
    wrapped.extend(
        pts[exit..reentry]
            .iter()
            .map(|p| PixelPoint::new(window.clamp(p.x + shift), p.y)),
    );
    wrapped.push(PixelPoint::new(outer_x, y_back));

    vec![kept, wrapped]
}

fn side_of(p: PixelPoint, window: VisibleWindow) -> Side {
    if p.x >= window.right() {
        Side::Right
    } else {
        Side::Left
    }
}

/// Y where the segment `a -> b` crosses the vertical line `x`.
fn intercept_y(a: PixelPoint, b: PixelPoint, x: i32) -> i32 {
    if a.x == b.x {
        return a.y;
    }
    let t = (x - a.x) as f64 / (b.x - a.x) as f64;
    (a.y as f64 + t * (b.y - a.y) as f64).round() as i32
}

/// The 12 points sampled around the immersive view's border, clockwise from the
/// top-left corner.
pub fn view_box_samples(size: ViewSize) -> [PixelPoint; 12] {
    let (w, h) = (size.width, size.height);
    [
        PixelPoint::new(0, 0),
        PixelPoint::new(w / 4, 0),
        PixelPoint::new(w / 2, 0),
        PixelPoint::new(3 * w / 4, 0),
        PixelPoint::new(w - 1, 0),
        PixelPoint::new(w - 1, h / 2),
        PixelPoint::new(w - 1, h - 1),
        PixelPoint::new(3 * w / 4, h - 1),
        PixelPoint::new(w / 2, h - 1),
        PixelPoint::new(w / 4, h - 1),
        PixelPoint::new(0, h - 1),
        PixelPoint::new(0, h / 2),
    ]
}

/// Pixel width the data's full pan extent occupies in the panoramic view.
/// 0 when the extent is degenerate or either edge fails to project.
pub fn mercator_real_width<E: RenderEngine + ?Sized>(engine: &E) -> i32 {
    let bounds = engine.data_bounds();
    if (bounds.pan_start - bounds.pan_end).abs() < MIN_PAN_EXTENT {
        return 0;
    }
    let pano_pan = engine.view_angle(ViewKind::Panoramic).pan;
    let start = bounds.pan_start + PAN_EDGE_NUDGE + pano_pan;
    let end = bounds.pan_end - (PAN_EDGE_NUDGE + pano_pan);

    let start = engine.map_spherical_coordinates(start, 0.0, bounds.origin_pan, bounds.origin_tilt);
    let end = engine.map_spherical_coordinates(end, 0.0, bounds.origin_pan, bounds.origin_tilt);
    match (
        engine.spherical_to_view(ViewKind::Panoramic, start),
        engine.spherical_to_view(ViewKind::Panoramic, end),
    ) {
        (Ok(left), Ok(right)) => right.x - left.x,
        _ => 0,
    }
}

// ----------------------------------------------------------------------------
// OverlayCompositor
// ----------------------------------------------------------------------------

pub struct OverlayCompositor {
    camera_type: CameraType,
    layout: LayoutOptions,
    show_fps: bool,
    stills: Vec<(Face, Frame)>,
    fps: Arc<FpsCounter>,
}

impl OverlayCompositor {
    pub fn new(camera_type: CameraType, layout: LayoutOptions) -> Self {
        Self {
            camera_type,
            layout,
            show_fps: false,
            stills: Vec::new(),
            fps: Arc::new(FpsCounter::new()),
        }
    }

    pub fn with_show_fps(mut self, show_fps: bool) -> Self {
        self.show_fps = show_fps;
        self
    }

    /// Fixed still images, re-uploaded on every refresh.
    pub fn with_stills(mut self, stills: Vec<(Face, Frame)>) -> Self {
        self.stills = stills;
        self
    }

    /// Share the counter the scheduler records into.
    pub fn with_fps_counter(mut self, fps: Arc<FpsCounter>) -> Self {
        self.fps = fps;
        self
    }

    pub fn camera_type(&self) -> CameraType {
        self.camera_type
    }

    pub fn layout(&self) -> LayoutOptions {
        self.layout
    }

    pub fn set_layout(&mut self, layout: LayoutOptions) {
        self.layout = layout;
    }

    pub fn is_fixed(&self) -> bool {
        !self.stills.is_empty()
    }

    /// Polygons of the immersive footprint in panoramic pixels, after the seam
    /// unwrap and clip on 360° cameras.
    pub fn view_box_polygons<E: RenderEngine + ?Sized>(
        &self,
        engine: &E,
    ) -> Option<(Vec<Vec<PixelPoint>>, Option<VisibleWindow>)> {
        let immersive = engine.view_size(ViewKind::Immersive);
        let panoramic = engine.view_size(ViewKind::Panoramic);

        let points: Vec<PixelPoint> = view_box_samples(immersive)
            .into_iter()
            .filter_map(|p| {
                let coords = engine.view_to_spherical(ViewKind::Immersive, p).ok()?;
                engine.spherical_to_view(ViewKind::Panoramic, coords).ok()
            })
            .collect();

        if !self.camera_type.wraps_around() {
            // no seam: every edge is a real footprint edge
            return Some((vec![points], None));
        }
        let real_width = mercator_real_width(engine);
        if real_width <= 0 {
            return None;
        }
        let window = VisibleWindow::new((panoramic.width - real_width) / 2, real_width);
        let unwrapped = unwrap_seam(&points, panoramic.width / 2, real_width);
        Some((clip_to_window(&unwrapped, window), Some(window)))
    }

    /// Outline the immersive footprint in the panoramic view.
    pub fn draw_view_box<E: RenderEngine + ?Sized>(&self, engine: &mut E) {
        if self.layout != LayoutOptions::Panomersive {
            return;
        }
        let Some((polygons, window)) = self.view_box_polygons(engine) else {
            return;
        };
        let size = engine.view_size(ViewKind::Panoramic);
        if size.is_empty() {
            return;
        }

        let mut bitmap = RgbaImage::new(size.width as u32, size.height as u32);
        for polygon in &polygons {
            stroke_polygon(&mut bitmap, polygon, window);
        }
        if self.show_fps && !self.is_fixed() {
            paint_fps_badge(&mut bitmap, self.fps.latest());
        }

        engine.make_current(ViewKind::Panoramic);
        if let Err(err) =
            engine.add_bitmap_to_overlay(ViewKind::Panoramic, &bitmap, PixelPoint::new(0, 0))
        {
            log::warn!("view box overlay failed: {}", err);
        }
    }

    /// FPS badge in the primary view. With FPS display off this clears the badge.
    ///
    /// In the panomersive layout the badge rides on the view box bitmap, so the box
    /// is redrawn instead of being replaced by a bare badge.
    pub fn draw_fps<E: RenderEngine + ?Sized>(&self, engine: &mut E) {
        if self.layout == LayoutOptions::Panomersive && !self.is_fixed() {
            self.draw_view_box(engine);
            return;
        }
        let view = match self.layout {
            LayoutOptions::Immersive => ViewKind::Immersive,
            _ => ViewKind::Panoramic,
        };
        let fps = self.fps.latest();
        let (width, height) = if self.show_fps {
            fps_badge_size(fps)
        } else {
            FPS_BADGE_SIZE
        };
        let mut bitmap = RgbaImage::new(width, height);
        if self.show_fps {
            paint_fps_badge(&mut bitmap, fps);
        }
        engine.make_current(view);
        if let Err(err) = engine.add_bitmap_to_overlay(view, &bitmap, PixelPoint::new(0, 0)) {
            log::warn!("fps overlay failed: {}", err);
        }
    }

    /// Reticle centred on `center`, or an empty bitmap in its place when `clear`.
    pub fn draw_target<E: RenderEngine + ?Sized>(
        &self,
        engine: &mut E,
        center: PixelPoint,
        view: ViewKind,
        clear: bool,
    ) {
        let mut bitmap = RgbaImage::new(TARGET_SIZE, TARGET_SIZE);
        if !clear {
            fill_ellipse(&mut bitmap, 0, 0, 20, 20, TARGET_FILL);
            paint_dashed_line(
                &mut bitmap,
                PixelPoint::new(10, 1),
                PixelPoint::new(10, 19),
                TARGET_CROSS,
            );
            paint_dashed_line(
                &mut bitmap,
                PixelPoint::new(1, 10),
                PixelPoint::new(19, 10),
                TARGET_CROSS,
            );
        }
        let offset = PixelPoint::new(center.x - TARGET_HALF, center.y - TARGET_HALF);
        engine.make_current(view);
        if let Err(err) = engine.add_bitmap_to_overlay(view, &bitmap, offset) {
            log::warn!("target overlay failed: {}", err);
        }
    }

    /// Redraw both views outside the frame cycle (navigation, resize, fixed images).
    pub fn refresh_views<E: RenderEngine + ?Sized>(&self, engine: &mut E) {
        if engine.view_size(ViewKind::Immersive).is_empty()
            || engine.view_size(ViewKind::Panoramic).is_empty()
        {
            return;
        }

        if self.is_fixed() {
            engine.make_current(ViewKind::Immersive);
            for (face, still) in &self.stills {
                let copied = match engine.frame_buffer(*face) {
                    Some(mut planes) if planes.accepts(still) => {
                        planes.copy_from(still);
                        true
                    }
                    _ => false,
                };
                if copied {
                    engine.release_frame_buffer(*face);
                }
            }
        }

        engine.make_current(ViewKind::Immersive);
        match engine.render_direct(ViewKind::Immersive) {
            Ok(()) => engine.swap_buffers(ViewKind::Immersive),
            Err(err) => log::warn!("immersive refresh failed: {}", err),
        }

        self.draw_view_box(engine);
        engine.make_current(ViewKind::Panoramic);
        match engine.render_direct(ViewKind::Panoramic) {
            Ok(()) => engine.swap_buffers(ViewKind::Panoramic),
            Err(err) => log::warn!("panoramic refresh failed: {}", err),
        }
    }
}

// ----------------------------------------------------------------------------
// Rasterizers
// ----------------------------------------------------------------------------

fn put_pixel_checked(image: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= image.width() as i32 || y >= image.height() as i32 {
        return;
    }
    image.put_pixel(x as u32, y as u32, color);
}

/// Integer points of the segment `a -> b` (Bresenham).
fn line_points(a: PixelPoint, b: PixelPoint) -> Vec<PixelPoint> {
    let dx = (b.x - a.x).abs();
    let dy = -(b.y - a.y).abs();
    let sx = if a.x < b.x { 1 } else { -1 };
    let sy = if a.y < b.y { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (a.x, a.y);
    let mut points = Vec::with_capacity((dx - dy + 1) as usize);
    loop {
        points.push(PixelPoint::new(x, y));
        if x == b.x && y == b.y {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    points
}

/// Segments lying on the window edge are seam artifacts, not footprint edges.
fn skip_segment(a: PixelPoint, b: PixelPoint, window: Option<VisibleWindow>) -> bool {
    if a.x < 0 || a.y < 0 || b.x < 0 || b.y < 0 {
        return true;
    }
    match window {
        Some(window) => {
            a.x == b.x && (a.x == window.left || a.x == window.right() - 1)
        }
        None => false,
    }
}

/// Closed 2 px outline.
fn stroke_polygon(image: &mut RgbaImage, polygon: &[PixelPoint], window: Option<VisibleWindow>) {
    let n = polygon.len();
    if n < 2 {
        return;
    }
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        if skip_segment(a, b, window) {
            continue;
        }
        for p in line_points(a, b) {
            put_pixel_checked(image, p.x, p.y, VIEW_BOX_COLOR);
            put_pixel_checked(image, p.x + 1, p.y, VIEW_BOX_COLOR);
            put_pixel_checked(image, p.x, p.y + 1, VIEW_BOX_COLOR);
            put_pixel_checked(image, p.x + 1, p.y + 1, VIEW_BOX_COLOR);
        }
    }
}

fn paint_dashed_line(image: &mut RgbaImage, a: PixelPoint, b: PixelPoint, color: Rgba<u8>) {
    for (i, p) in line_points(a, b).into_iter().enumerate() {
        // 3 on, 2 off
        if i % 5 < 3 {
            put_pixel_checked(image, p.x, p.y, color);
        }
    }
}

/// Solid ellipse inscribed in `(x, y, width, height)`, sampled at pixel centres.
fn fill_ellipse(image: &mut RgbaImage, x: i32, y: i32, width: i32, height: i32, color: Rgba<u8>) {
    let rx = width as f32 / 2.0;
    let ry = height as f32 / 2.0;
    if rx <= 0.0 || ry <= 0.0 {
        return;
    }
    let cx = x as f32 + rx;
    let cy = y as f32 + ry;
    for py in y..y + height {
        for px in x..x + width {
            let dx = (px as f32 + 0.5 - cx) / rx;
            let dy = (py as f32 + 0.5 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                put_pixel_checked(image, px, py, color);
            }
        }
    }
}

fn fill_rect(image: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    for y in y0..y1 {
        for x in x0..x1 {
            put_pixel_checked(image, x, y, color);
        }
    }
}

const BADGE_MARGIN: i32 = 5;
const VALUE_SCALE: i32 = 2;
const GLYPH_ADVANCE: i32 = 6;

/// Column where the "fps" label starts after a value of `digits` characters.
fn fps_label_x(digits: usize) -> i32 {
    BADGE_MARGIN + digits as i32 * GLYPH_ADVANCE * VALUE_SCALE + 1
}

/// Bitmap size of the badge for `fps`; at least `FPS_BADGE_SIZE`, wider for three
/// or more digits.
fn fps_badge_size(fps: u32) -> (u32, u32) {
    let digits = format!("{:02}", fps).len();
    let right = fps_label_x(digits) + 3 * GLYPH_ADVANCE + BADGE_MARGIN;
    (FPS_BADGE_SIZE.0.max(right as u32 + 2), FPS_BADGE_SIZE.1)
}

/// Badge in the top-left corner: background, the value (at least two digits), "fps".
fn paint_fps_badge(image: &mut RgbaImage, fps: u32) {
    let value = format!("{:02}", fps);
    let label_x = fps_label_x(value.len());
    let background_right = (label_x + 3 * GLYPH_ADVANCE + 2).max(55);
    fill_rect(image, BADGE_MARGIN, BADGE_MARGIN, background_right, 22, BADGE_BACKGROUND);
    paint_text(image, &value, BADGE_MARGIN, BADGE_MARGIN, VALUE_SCALE, BADGE_TEXT);
    paint_text(image, "fps", label_x, 8, 1, BADGE_TEXT);
}

// 5x7 glyphs, one byte per row, low 5 bits, MSB on the left.
fn glyph(c: char) -> Option<[u8; 7]> {
    Some(match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'f' => [0x06, 0x09, 0x08, 0x1C, 0x08, 0x08, 0x08],
        'p' => [0x00, 0x00, 0x1E, 0x11, 0x1E, 0x10, 0x10],
        's' => [0x00, 0x00, 0x0F, 0x10, 0x0E, 0x01, 0x1E],
        _ => return None,
    })
}

fn paint_text(image: &mut RgbaImage, text: &str, x: i32, y: i32, scale: i32, color: Rgba<u8>) {
    let mut pen_x = x;
    for c in text.chars() {
        if let Some(rows) = glyph(c) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..5 {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    let px = pen_x + col * scale;
                    let py = y + row as i32 * scale;
                    fill_rect(image, px, py, px + scale, py + scale, color);
                }
            }
        }
        pen_x += GLYPH_ADVANCE * scale;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
