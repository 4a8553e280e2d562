//! Session lifecycle and the render thread.
//!
//! `SessionManager` owns the engine, the stream sessions and the FPS timer. Loading a
//! camera (or a directory of fixed faces) sets the engine up on the caller's thread,
//! binds the sessions, then moves the engine onto a dedicated render thread that runs
//! the frame scheduler and applies `NavigationCommand`s between scheduler steps.
//! Nothing else touches the engine while that thread runs.
//!
//! Shutdown sets the cancellation flag, waits a bounded time for the render thread to
//! hand the engine back, then tears sessions, timer and engine down. Every step is
//! idempotent.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::config::ViewerConfig;
use crate::discovery::{
    classify_streams, CameraConnection, DeviceProtocolClient, DiscoveryError, StreamDescriptor,
};
use crate::engine::{
    EngineSetup, FaceSetup, PixelPoint, RenderEngine, StreamImageFormat, ViewSize,
};
use crate::frame::FrameSignal;
use crate::ingest::{load_fixed_faces, DecoderFactory, StreamSession};
use crate::navigation::{NavigationController, ZoomAnimation};
use crate::overlay::OverlayCompositor;
use crate::scheduler::{FpsCounter, FpsTimer, FrameScheduler, IDLE_WAIT};
use crate::{CameraType, LayoutOptions, ViewKind};

const LETTERBOX_COLOR: [u8; 3] = [40, 40, 40];
const FPS_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// User interaction, applied on the render thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NavigationCommand {
    MoveToPosition {
        location: PixelPoint,
        is_panoramic: bool,
        do_zoom: bool,
    },
    PanTilt {
        anchor: PixelPoint,
        location: PixelPoint,
        is_panoramic: bool,
    },
    Zoom {
        location: PixelPoint,
        delta: i32,
        is_panoramic: bool,
    },
    AdjustTilt {
        angle_degrees: f32,
        enabled: bool,
    },
    SetLayout(LayoutOptions),
    Resize {
        view: ViewKind,
        size: ViewSize,
    },
    Refresh,
}

struct RenderWorker<E> {
    cancel: Arc<AtomicBool>,
    commands: Sender<NavigationCommand>,
    done: Receiver<()>,
    join: JoinHandle<E>,
}

pub struct SessionManager<E: RenderEngine + 'static> {
    config: ViewerConfig,
    engine: Option<E>,
    worker: Option<RenderWorker<E>>,
    sessions: Vec<Arc<StreamSession>>,
    camera_type: CameraType,
    fps: Arc<FpsCounter>,
    fps_timer: Option<FpsTimer>,
    signal: Arc<FrameSignal>,
    shutdown_timeout: Duration,
}

impl<E: RenderEngine + 'static> SessionManager<E> {
    pub fn new(engine: E, config: ViewerConfig) -> Self {
        Self {
            config,
            engine: Some(engine),
            worker: None,
            sessions: Vec::new(),
            camera_type: CameraType::Unknown,
            fps: Arc::new(FpsCounter::new()),
            fps_timer: None,
            signal: Arc::new(FrameSignal::new()),
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn camera_type(&self) -> CameraType {
        self.camera_type
    }

    pub fn sessions(&self) -> &[Arc<StreamSession>] {
        &self.sessions
    }

    pub fn fps(&self) -> &Arc<FpsCounter> {
        &self.fps
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The engine, while no render thread holds it.
    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    /// Discover the camera's faces and start streaming them.
    pub fn load_camera(
        &mut self,
        client: &DeviceProtocolClient,
        camera: &CameraConnection,
        decoders: &dyn DecoderFactory,
    ) -> Result<CameraType> {
        let (camera_type, streams) = client
            .discover(camera)
            .with_context(|| format!("discover camera {}", camera.ip_address))?;
        self.load_streams(camera_type, streams, decoders)?;
        Ok(camera_type)
    }

    /// Start a live session group from already-resolved descriptors.
    ///
    /// A face whose decoder fails to bind stays in the group and never produces
    /// frames. Decoders are bound only once the timer and render thread are running,
    /// so a failed load never leaves a session bound.
    pub fn load_streams(
        &mut self,
        camera_type: CameraType,
        streams: Vec<StreamDescriptor>,
        decoders: &dyn DecoderFactory,
    ) -> Result<()> {
        if streams.is_empty() {
            return Err(DiscoveryError::NoUsableStreams.into());
        }
        self.shutdown();

        let sessions: Vec<Arc<StreamSession>> = streams
            .into_iter()
            .map(|descriptor| Arc::new(StreamSession::new(descriptor, self.signal.clone())))
            .collect();
        let overlay = OverlayCompositor::new(camera_type, self.config.layout)
            .with_show_fps(self.config.show_fps)
            .with_fps_counter(self.fps.clone());
        let mut engine = self.setup_engine(camera_type, &sessions, StreamImageFormat::I420)?;
        overlay.refresh_views(&mut engine);

        let timer = match FpsTimer::spawn(self.fps.clone(), FPS_PERIOD) {
            Ok(timer) => timer,
            Err(err) => {
                engine.teardown();
                self.engine = Some(engine);
                return Err(err).context("spawn fps timer");
            }
        };
        self.start_worker(engine, sessions.clone(), overlay)?;
        self.fps_timer = Some(timer);

        for session in &sessions {
            if let Err(err) = session.bind(decoders) {
                log::warn!("{}: session degraded: {}", session.face(), err);
            }
        }
        self.camera_type = camera_type;
        self.sessions = sessions;
        Ok(())
    }

    /// Load still faces from a directory and show them.
    pub fn load_fixed(&mut self, dir: &Path) -> Result<CameraType> {
        let faces = load_fixed_faces(dir)?;
        if faces.is_empty() {
            return Err(anyhow!("no complete faces in {}", dir.display()));
        }
        self.shutdown();

        let descriptors: Vec<StreamDescriptor> =
            faces.iter().map(|face| face.descriptor.clone()).collect();
        let camera_type = classify_streams(&descriptors);
        if camera_type == CameraType::Unknown {
            log::warn!("fixed faces in {} match no known camera", dir.display());
        }

        let sessions: Vec<Arc<StreamSession>> = faces
            .into_iter()
            .map(|face| {
                Arc::new(StreamSession::fixed(
                    face.descriptor,
                    face.still,
                    self.signal.clone(),
                ))
            })
            .collect();
        let stills = sessions
            .iter()
            .filter_map(|s| s.still().map(|still| (s.face(), still.clone())))
            .collect();
        let overlay = OverlayCompositor::new(camera_type, self.config.layout)
            .with_show_fps(self.config.show_fps)
            .with_fps_counter(self.fps.clone())
            .with_stills(stills);
        let mut engine = self.setup_engine(camera_type, &sessions, StreamImageFormat::Bgra)?;
        overlay.refresh_views(&mut engine);

        self.camera_type = camera_type;
        self.sessions = sessions;
        // stills are uploaded on refresh; the scheduler has nothing to poll
        self.start_worker(engine, Vec::new(), overlay)?;
        Ok(camera_type)
    }

    /// Queue a navigation command for the render thread.
    pub fn send(&self, command: NavigationCommand) -> Result<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| anyhow!("no session is running"))?;
        worker
            .commands
            .send(command)
            .map_err(|_| anyhow!("render thread has exited"))
    }

    pub fn set_layout(&mut self, layout: LayoutOptions) -> Result<()> {
        self.config.layout = layout;
        self.send(NavigationCommand::SetLayout(layout))
    }

    /// Stop the render thread, sessions and timer, and release the engine's views.
    pub fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.store(true, Ordering::Release);
            match worker.done.recv_timeout(self.shutdown_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => match worker.join.join() {
                    Ok(engine) => self.engine = Some(engine),
                    Err(_) => log::warn!("render thread panicked; engine lost"),
                },
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "render thread did not stop within {:?}; detaching it",
                        self.shutdown_timeout
                    );
                }
            }
        }
        for session in self.sessions.drain(..) {
            session.teardown();
        }
        if let Some(mut timer) = self.fps_timer.take() {
            timer.stop();
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.teardown();
        }
        self.camera_type = CameraType::Unknown;
    }

    fn setup_engine(
        &mut self,
        camera_type: CameraType,
        sessions: &[Arc<StreamSession>],
        format: StreamImageFormat,
    ) -> Result<E> {
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| anyhow!("render engine was lost by an earlier session"))?;
        let setup = EngineSetup {
            faces: sessions
                .iter()
                .map(|s| FaceSetup {
                    face: s.face(),
                    layout_metadata: s.layout_metadata().to_string(),
                    width: s.width(),
                    height: s.height(),
                })
                .collect(),
            format,
            stream_optimization: self.config.stream_optimization.clone(),
            panoramic_projection: camera_type.panoramic_projection(),
            letterbox_color: LETTERBOX_COLOR,
            ptz_limits: self.config.ptz.limit_options(),
            camera_tilt_enabled: self.config.camera_tilt.enabled,
            camera_tilt_radians: self.config.camera_tilt.angle_degrees.to_radians(),
        };
        if let Err(err) = engine.setup(&setup) {
            engine.teardown();
            self.engine = Some(engine);
            return Err(err).context("render engine setup failed");
        }
        Ok(engine)
    }

    fn start_worker(
        &mut self,
        engine: E,
        sessions: Vec<Arc<StreamSession>>,
        overlay: OverlayCompositor,
    ) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::channel();
        let (done_tx, done) = mpsc::channel();

        let scheduler = FrameScheduler::new(sessions, self.fps.clone(), self.signal.clone());
        let navigation = NavigationController::from_config(&self.config);
        let cancel_thread = cancel.clone();
        let join = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || {
                let engine = render_loop(
                    engine,
                    scheduler,
                    overlay,
                    navigation,
                    command_rx,
                    cancel_thread,
                );
                let _ = done_tx.send(());
                engine
            })
            .context("spawn render thread")?;

        self.worker = Some(RenderWorker {
            cancel,
            commands,
            done,
            join,
        });
        Ok(())
    }
}

impl<E: RenderEngine + 'static> Drop for SessionManager<E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render_loop<E: RenderEngine>(
    mut engine: E,
    mut scheduler: FrameScheduler,
    mut overlay: OverlayCompositor,
    navigation: NavigationController,
    commands: Receiver<NavigationCommand>,
    cancel: Arc<AtomicBool>,
) -> E {
    let mut animation: Option<ZoomAnimation> = None;
    let polls_frames = scheduler.session_count() > 0;

    while !cancel.load(Ordering::Acquire) {
        loop {
            match commands.try_recv() {
                Ok(command) => apply_command(
                    command,
                    &mut engine,
                    &mut overlay,
                    &navigation,
                    &mut animation,
                ),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if let Some(step) = animation.as_mut() {
            if !step.advance(&navigation, &mut engine, &overlay) {
                animation = None;
            }
        }

        if polls_frames {
            scheduler.step(&mut engine, &overlay);
            scheduler.wait_if_idle(IDLE_WAIT);
        } else if animation.is_none() {
            match commands.recv_timeout(IDLE_WAIT) {
                Ok(command) => apply_command(
                    command,
                    &mut engine,
                    &mut overlay,
                    &navigation,
                    &mut animation,
                ),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }
    engine
}

fn apply_command<E: RenderEngine>(
    command: NavigationCommand,
    engine: &mut E,
    overlay: &mut OverlayCompositor,
    navigation: &NavigationController,
    animation: &mut Option<ZoomAnimation>,
) {
    match command {
        NavigationCommand::MoveToPosition {
            location,
            is_panoramic,
            do_zoom,
        } => {
            if let Some(next) =
                navigation.move_to_position(engine, overlay, location, is_panoramic, do_zoom)
            {
                *animation = Some(next);
            }
        }
        NavigationCommand::PanTilt {
            anchor,
            location,
            is_panoramic,
        } => navigation.perform_pan_tilt(engine, overlay, anchor, location, is_panoramic),
        NavigationCommand::Zoom {
            location,
            delta,
            is_panoramic,
        } => {
            navigation.perform_zoom(engine, overlay, location, delta, is_panoramic);
        }
        NavigationCommand::AdjustTilt {
            angle_degrees,
            enabled,
        } => navigation.adjust_camera_tilt(engine, overlay, angle_degrees, enabled),
        NavigationCommand::SetLayout(layout) => {
            overlay.set_layout(layout);
            overlay.refresh_views(engine);
        }
        NavigationCommand::Resize { view, size } => {
            engine.set_view_size(view, size);
            overlay.refresh_views(engine);
        }
        NavigationCommand::Refresh => overlay.refresh_views(engine),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StubEngine;
    use crate::ingest::SyntheticDecoderFactory;
    use crate::Face;
    use std::time::Instant;

    fn descriptor(face: Face) -> StreamDescriptor {
        StreamDescriptor {
            face,
            endpoint: format!("stub://{face}?width=16&height=8&fps=200"),
            layout_metadata: format!("{face}-layout"),
            width: 16,
            height: 8,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn quiet_config() -> ViewerConfig {
        ViewerConfig {
            target_dwell_ms: 0,
            ..ViewerConfig::default()
        }
    }

    #[test]
    fn live_streams_render_and_shut_down_cleanly() {
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        manager
            .load_streams(
                CameraType::Optera180,
                vec![descriptor(Face::Left), descriptor(Face::Right)],
                &SyntheticDecoderFactory::default(),
            )
            .unwrap();
        assert!(manager.is_running());
        assert!(manager.engine().is_none());
        assert!(wait_until(|| manager.fps().total() >= 3));

        manager.shutdown();
        assert!(!manager.is_running());
        let engine = manager.engine().unwrap();
        // the initial refresh plus at least the composed renders counted above
        assert!(engine.render_count(ViewKind::Immersive) >= 4);
        assert!(engine.setup_info().is_none(), "engine torn down");
        assert!(manager.sessions().is_empty());

        manager.shutdown();
    }

    #[test]
    fn setup_declares_faces_and_projection() {
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        manager
            .load_streams(
                CameraType::Optera270,
                vec![
                    descriptor(Face::Left),
                    descriptor(Face::Front),
                    descriptor(Face::Right),
                ],
                &SyntheticDecoderFactory::default(),
            )
            .unwrap();
        assert_eq!(manager.camera_type(), CameraType::Optera270);
        assert_eq!(manager.sessions().len(), 3);
        assert!(manager.sessions().iter().all(|s| s.is_bound()));
        manager.shutdown();
    }

    #[test]
    fn failed_bind_degrades_only_that_face() {
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        let mut broken = descriptor(Face::Front);
        broken.endpoint = "stub://front?width=15".to_string();
        manager
            .load_streams(
                CameraType::Optera180,
                vec![descriptor(Face::Left), broken],
                &SyntheticDecoderFactory::default(),
            )
            .unwrap();
        let bound: Vec<bool> = manager.sessions().iter().map(|s| s.is_bound()).collect();
        assert_eq!(bound, vec![true, false]);
        assert!(wait_until(|| manager.fps().total() >= 1));
        manager.shutdown();
    }

    #[test]
    fn empty_stream_list_is_rejected() {
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        let err = manager
            .load_streams(CameraType::Optera180, Vec::new(), &SyntheticDecoderFactory::default())
            .unwrap_err();
        assert!(err.downcast_ref::<DiscoveryError>().is_some());
        assert!(!manager.is_running());
        assert!(manager.engine().is_some());
    }

    #[test]
    fn commands_reach_the_render_thread() {
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        manager
            .load_streams(
                CameraType::Optera180,
                vec![descriptor(Face::Left), descriptor(Face::Right)],
                &SyntheticDecoderFactory::default(),
            )
            .unwrap();
        let baseline = manager.fps().total();
        manager
            .send(NavigationCommand::Zoom {
                location: PixelPoint::new(320, 240),
                delta: 600,
                is_panoramic: false,
            })
            .unwrap();
        manager
            .send(NavigationCommand::AdjustTilt {
                angle_degrees: 10.0,
                enabled: true,
            })
            .unwrap();
        manager.set_layout(LayoutOptions::Immersive).unwrap();
        assert_eq!(manager.config().layout, LayoutOptions::Immersive);

        // commands are drained before the next scheduler step
        assert!(wait_until(|| manager.fps().total() >= baseline + 2));
        manager.shutdown();
        assert!(manager.send(NavigationCommand::Refresh).is_err());

        let engine = manager.engine().unwrap();
        assert!((engine.zoom(ViewKind::Immersive) - 0.1).abs() < 1e-6);
        let (enabled, radians) = engine.tilt_correction();
        assert!(enabled);
        assert!((radians - 10f32.to_radians()).abs() < 1e-6);
    }

    /// Counts decoders handed out, delegating to the synthetic factory.
    #[derive(Default)]
    struct CountingFactory {
        created: std::sync::atomic::AtomicUsize,
        inner: SyntheticDecoderFactory,
    }

    impl DecoderFactory for CountingFactory {
        fn create(
            &self,
            endpoint: &str,
        ) -> Result<Box<dyn crate::ingest::VideoDecoder>, crate::ingest::BindError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.inner.create(endpoint)
        }
    }

    #[test]
    fn stuck_render_thread_is_detached_after_the_timeout() {
        let engine = StubEngine::new().with_render_delay(Duration::from_millis(400));
        let mut manager = SessionManager::new(engine, quiet_config())
            .with_shutdown_timeout(Duration::from_millis(50));
        manager
            .load_streams(
                CameraType::Optera180,
                vec![descriptor(Face::Left), descriptor(Face::Right)],
                &SyntheticDecoderFactory::default(),
            )
            .unwrap();
        // two slow renders keep the render thread busy well past the timeout
        manager.send(NavigationCommand::Refresh).unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        manager.shutdown();
        assert!(started.elapsed() < Duration::from_millis(350));
        assert!(!manager.is_running());
        assert!(manager.sessions().is_empty());
        assert!(manager.engine().is_none(), "engine left with the detached thread");

        // the next load fails before any decoder is bound
        let factory = CountingFactory::default();
        let err = manager
            .load_streams(CameraType::Optera180, vec![descriptor(Face::Left)], &factory)
            .unwrap_err();
        assert!(err.to_string().contains("render engine was lost"));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(manager.sessions().is_empty());
        assert!(!manager.is_running());
    }

    #[test]
    fn decoders_bind_after_the_render_thread_starts() {
        let factory = CountingFactory::default();
        let mut manager = SessionManager::new(StubEngine::new(), quiet_config());
        manager
            .load_streams(
                CameraType::Optera180,
                vec![descriptor(Face::Left), descriptor(Face::Right)],
                &factory,
            )
            .unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert!(manager.is_running());
        let sessions = manager.sessions().to_vec();
        assert!(sessions.iter().all(|s| s.is_bound()));
        manager.shutdown();
        assert!(sessions.iter().all(|s| !s.is_bound()));
    }

    #[test]
    fn commands_without_a_session_fail() {
        let manager = SessionManager::new(StubEngine::new(), quiet_config());
        assert!(manager.send(NavigationCommand::Refresh).is_err());
    }
}
