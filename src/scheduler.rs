//! Round-robin frame scheduling.
//!
//! `FrameScheduler::step` visits one session per call (`idx = (idx + 1) % n`), takes
//! its pending frame and copies the planes into the engine's buffer for that face.
//! When the index reaches `n - 1` and the cycle copied at least one frame, the step
//! also composes a render: count the frame, draw the FPS badge, render and swap
//! both views. Faces are written one by one but only ever shown together.
//!
//! The loop never sleeps on wall-clock time. After a full cycle with nothing to copy
//! it waits on the shared `FrameSignal`, bounded, so a quiet camera does not pin a
//! core.
//!
//! `FpsTimer` samples the frame counter once per second on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::RenderEngine;
use crate::frame::FrameSignal;
use crate::ingest::StreamSession;
use crate::overlay::OverlayCompositor;
use crate::ViewKind;

/// Bound on the idle wait between empty cycles.
pub const IDLE_WAIT: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// FPS accounting
// ----------------------------------------------------------------------------

/// Composed renders in the current second, the last sampled value, and a running
/// total.
#[derive(Debug, Default)]
pub struct FpsCounter {
    frames: AtomicU32,
    latest: AtomicU32,
    total: AtomicU64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the running count as the displayed value and reset it.
    pub fn sample(&self) -> u32 {
        let frames = self.frames.swap(0, Ordering::Relaxed);
        self.latest.store(frames, Ordering::Relaxed);
        frames
    }

    pub fn latest(&self) -> u32 {
        self.latest.load(Ordering::Relaxed)
    }

    /// Renders composed since creation; never reset by sampling.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Samples an `FpsCounter` every `period` until stopped.
#[derive(Debug)]
pub struct FpsTimer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl FpsTimer {
    pub fn spawn(counter: Arc<FpsCounter>, period: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = thread::Builder::new()
            .name("fps-timer".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while !stop_thread.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now >= next {
                        let fps = counter.sample();
                        log::debug!("fps: {}", fps);
                        next += period;
                        continue;
                    }
                    thread::sleep((next - now).min(Duration::from_millis(50)));
                }
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("fps timer thread panicked");
            }
        }
    }
}

impl Drop for FpsTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// FrameScheduler
// ----------------------------------------------------------------------------

/// What one scheduler step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    /// Session index visited.
    pub index: usize,
    /// A frame was copied into the engine.
    pub copied: bool,
    /// The step closed a cycle and composed a render.
    pub rendered: bool,
}

pub struct FrameScheduler {
    sessions: Vec<Arc<StreamSession>>,
    index: usize,
    cycle_dirty: bool,
    idle_steps: usize,
    fps: Arc<FpsCounter>,
    signal: Arc<FrameSignal>,
    seen_generation: u64,
}

impl FrameScheduler {
    /// The session list is fixed for the scheduler's lifetime.
    pub fn new(
        sessions: Vec<Arc<StreamSession>>,
        fps: Arc<FpsCounter>,
        signal: Arc<FrameSignal>,
    ) -> Self {
        let seen_generation = signal.generation();
        Self {
            sessions,
            index: 0,
            cycle_dirty: false,
            idle_steps: 0,
            fps,
            signal,
            seen_generation,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn fps(&self) -> &Arc<FpsCounter> {
        &self.fps
    }

    /// Visit the next session. `None` when there are no sessions.
    pub fn step<E: RenderEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        overlay: &OverlayCompositor,
    ) -> Option<StepOutcome> {
        let count = self.sessions.len();
        if count == 0 {
            return None;
        }
        self.index = (self.index + 1) % count;
        let index = self.index;
        let session = &self.sessions[index];

        let mut copied = false;
        if let Some(frame) = session.dequeue() {
            let face = session.face();
            engine.make_current(ViewKind::Immersive);
            copied = match engine.frame_buffer(face) {
                Some(mut planes) if planes.accepts(&frame) => {
                    planes.copy_from(&frame);
                    true
                }
                _ => false,
            };
            if copied {
                engine.release_frame_buffer(face);
                self.cycle_dirty = true;
            } else {
                log::debug!("{}: no engine buffer, frame dropped", face);
            }
            session.recycle(frame);
        }

        if copied {
            self.idle_steps = 0;
        } else {
            self.idle_steps += 1;
        }

        let mut rendered = false;
        if index == count - 1 && self.cycle_dirty {
            self.cycle_dirty = false;
            self.compose(engine, overlay);
            rendered = true;
        }

        Some(StepOutcome {
            index,
            copied,
            rendered,
        })
    }

    /// After a whole cycle came up empty, wait (bounded) for any session to publish.
    /// Returns true when a wait happened.
    pub fn wait_if_idle(&mut self, timeout: Duration) -> bool {
        if self.sessions.is_empty() || self.idle_steps < self.sessions.len() {
            return false;
        }
        self.seen_generation = self.signal.wait_for_change(self.seen_generation, timeout);
        self.idle_steps = 0;
        true
    }

    fn compose<E: RenderEngine + ?Sized>(&self, engine: &mut E, overlay: &OverlayCompositor) {
        self.fps.record_frame();
        overlay.draw_fps(engine);
        for view in [ViewKind::Immersive, ViewKind::Panoramic] {
            engine.make_current(view);
            if let Err(err) = engine.render_direct(view) {
                log::warn!("render of {:?} view failed: {}", view, err);
                continue;
            }
            engine.swap_buffers(view);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StreamDescriptor;
    use crate::engine::{EngineSetup, FaceSetup, PtzLimitOptions, StreamImageFormat, StubEngine};
    use crate::frame::PlaneLayout;
    use crate::{CameraType, Face, LayoutOptions, PanoramicProjection};

    const FACES: [Face; 4] = [Face::Front, Face::Left, Face::Back, Face::Right];

    fn rig(count: usize) -> (Vec<Arc<StreamSession>>, StubEngine, Arc<FrameSignal>) {
        let signal = Arc::new(FrameSignal::new());
        let sessions: Vec<Arc<StreamSession>> = FACES[..count]
            .iter()
            .map(|face| {
                let session = Arc::new(StreamSession::new(
                    StreamDescriptor {
                        face: *face,
                        endpoint: format!("stub://{face}"),
                        layout_metadata: String::new(),
                        width: 4,
                        height: 2,
                    },
                    signal.clone(),
                ));
                session.callbacks().on_format(4, 2);
                session
            })
            .collect();
        let mut engine = StubEngine::new();
        engine
            .setup(&EngineSetup {
                faces: sessions
                    .iter()
                    .map(|s| FaceSetup {
                        face: s.face(),
                        layout_metadata: String::new(),
                        width: 4,
                        height: 2,
                    })
                    .collect(),
                format: StreamImageFormat::I420,
                stream_optimization: String::new(),
                panoramic_projection: PanoramicProjection::Mercator,
                letterbox_color: [40, 40, 40],
                ptz_limits: PtzLimitOptions::default(),
                camera_tilt_enabled: false,
                camera_tilt_radians: 0.0,
            })
            .unwrap();
        (sessions, engine, signal)
    }

    fn overlay() -> OverlayCompositor {
        OverlayCompositor::new(CameraType::Optera270, LayoutOptions::Panoramic).with_show_fps(true)
    }

    fn publish(session: &StreamSession, tag: u8) {
        let callbacks = session.callbacks();
        let mut frame = callbacks.on_lock().unwrap();
        frame.planes_mut()[0].fill(tag);
        callbacks.on_display(frame);
    }

    fn scheduler(sessions: &[Arc<StreamSession>], signal: &Arc<FrameSignal>) -> FrameScheduler {
        FrameScheduler::new(sessions.to_vec(), Arc::new(FpsCounter::new()), signal.clone())
    }

    #[test]
    fn renders_exactly_once_per_full_cycle() {
        let (sessions, mut engine, signal) = rig(4);
        let mut scheduler = scheduler(&sessions, &signal);
        let overlay = overlay();

        let mut renders = 0;
        for _ in 0..4 {
            for session in &sessions {
                publish(session, 7);
            }
            let outcome = scheduler.step(&mut engine, &overlay).unwrap();
            assert!(outcome.copied);
            if outcome.rendered {
                renders += 1;
            }
        }
        assert_eq!(renders, 1);
        assert_eq!(engine.render_count(ViewKind::Immersive), 1);
        assert_eq!(engine.render_count(ViewKind::Panoramic), 1);
        assert_eq!(engine.swap_count(ViewKind::Panoramic), 1);
    }

    #[test]
    fn round_robin_starts_after_index_zero() {
        let (sessions, mut engine, signal) = rig(3);
        let mut scheduler = scheduler(&sessions, &signal);
        let overlay = overlay();
        let visited: Vec<usize> = (0..4)
            .map(|_| scheduler.step(&mut engine, &overlay).unwrap().index)
            .collect();
        assert_eq!(visited, vec![1, 2, 0, 1]);
    }

    #[test]
    fn copies_planes_byte_exact() {
        let (sessions, mut engine, signal) = rig(1);
        let mut scheduler = scheduler(&sessions, &signal);
        publish(&sessions[0], 9);
        let outcome = scheduler.step(&mut engine, &overlay()).unwrap();
        assert!(outcome.copied && outcome.rendered);
        let planes = engine.face_planes(Face::Front).unwrap();
        assert_eq!(planes[0], vec![9u8; 8]);
        assert_eq!(planes[1].len(), PlaneLayout::i420(4, 2).plane_sizes()[1]);
        assert_eq!(engine.release_count(), 1);
    }

    #[test]
    fn empty_cycles_do_not_render() {
        let (sessions, mut engine, signal) = rig(2);
        let mut scheduler = scheduler(&sessions, &signal);
        let overlay = overlay();
        for _ in 0..6 {
            assert!(!scheduler.step(&mut engine, &overlay).unwrap().rendered);
        }
        assert_eq!(engine.render_count(ViewKind::Immersive), 0);
    }

    #[test]
    fn missing_engine_buffer_drops_frame_silently() {
        let (sessions, mut engine, signal) = rig(1);
        let mut scheduler = scheduler(&sessions, &signal);
        engine.set_buffers_available(false);
        publish(&sessions[0], 3);
        let outcome = scheduler.step(&mut engine, &overlay()).unwrap();
        assert!(!outcome.copied);
        assert!(!outcome.rendered);
        assert_eq!(engine.release_count(), 0);
        assert!(sessions[0].dequeue().is_none(), "dropped, not retried");
    }

    #[test]
    fn fps_badge_uses_last_sample() {
        let (sessions, mut engine, signal) = rig(1);
        let mut scheduler = scheduler(&sessions, &signal);
        let overlay = overlay();
        publish(&sessions[0], 1);
        scheduler.step(&mut engine, &overlay);
        assert_eq!(scheduler.fps().sample(), 1);
        assert_eq!(scheduler.fps().latest(), 1);
        assert_eq!(scheduler.fps().sample(), 0);
        assert_eq!(scheduler.fps().total(), 1);
        let badge = engine.last_overlay(ViewKind::Panoramic).expect("fps badge");
        assert_eq!(badge.bitmap.dimensions(), (60, 30));
    }

    #[test]
    fn idle_wait_only_after_full_empty_cycle() {
        let (sessions, mut engine, signal) = rig(2);
        let mut scheduler = scheduler(&sessions, &signal);
        let overlay = overlay();
        scheduler.step(&mut engine, &overlay);
        assert!(!scheduler.wait_if_idle(Duration::from_millis(1)));
        scheduler.step(&mut engine, &overlay);
        assert!(scheduler.wait_if_idle(Duration::from_millis(1)));
    }

    #[test]
    fn no_sessions_no_step() {
        let signal = Arc::new(FrameSignal::new());
        let mut scheduler = FrameScheduler::new(Vec::new(), Arc::new(FpsCounter::new()), signal);
        let mut engine = StubEngine::new();
        assert!(scheduler.step(&mut engine, &overlay()).is_none());
    }

    #[test]
    fn fps_timer_samples_and_stops() {
        let counter = Arc::new(FpsCounter::new());
        counter.record_frame();
        counter.record_frame();
        let mut timer = FpsTimer::spawn(counter.clone(), Duration::from_millis(20)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.latest() != 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        timer.stop();
        assert!(counter.latest() == 2 || counter.latest() == 0);
    }
}
