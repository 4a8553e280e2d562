//! Stream sessions and the decoder callback surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{BindError, DecoderFactory, VideoDecoder};
use crate::discovery::StreamDescriptor;
use crate::frame::{lock_recover, Frame, FrameBuffer, FrameSignal, PlaneLayout};
use crate::Face;

/// Recycled frames kept per session beyond the one in flight.
const MAX_SPARES: usize = 2;

/// Frame bookkeeping for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames published through `on_display`.
    pub frames_displayed: u64,
    /// Frames swapped out of the slot before the consumer saw them.
    pub frames_discarded: u64,
}

// ----------------------------------------------------------------------------
// DecoderCallbacks
// ----------------------------------------------------------------------------

/// State shared between a decoder thread and the consumer loop.
///
/// Plane buffers are owned `Frame`s cycled between the decoder, the slot and a small
/// spare pool. No lock is held while a frame is allocated or filled.
pub struct DecoderCallbacks {
    face: Face,
    buffer: FrameBuffer,
    signal: Arc<FrameSignal>,
    layout: Mutex<Option<PlaneLayout>>,
    spares: Mutex<Vec<Frame>>,
    display_lock: Mutex<()>,
    active: AtomicBool,
    displayed: AtomicU64,
    discarded: AtomicU64,
}

impl DecoderCallbacks {
    fn new(face: Face, signal: Arc<FrameSignal>) -> Self {
        Self {
            face,
            buffer: FrameBuffer::new(),
            signal,
            layout: Mutex::new(None),
            spares: Mutex::new(Vec::new()),
            display_lock: Mutex::new(()),
            active: AtomicBool::new(true),
            displayed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn face(&self) -> Face {
        self.face
    }

    /// Format negotiation: declare the 4:2:0 layout and allocate the first set of
    /// planes for it.
    pub fn on_format(&self, width: u32, height: u32) -> PlaneLayout {
        let layout = PlaneLayout::i420(width, height);
        let first = layout.allocate();
        *lock_recover(&self.layout) = Some(layout);
        let mut spares = lock_recover(&self.spares);
        spares.clear();
        spares.push(first);
        log::debug!(
            "{}: negotiated {}x{} (pitches {:?}, lines {:?})",
            self.face,
            width,
            height,
            layout.pitches,
            layout.lines
        );
        layout
    }

    /// Writable planes for the next picture. `None` before negotiation or after
    /// teardown, in which case the decoder drops the picture.
    pub fn on_lock(&self) -> Option<Frame> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        let layout = (*lock_recover(&self.layout))?;
        let spare = lock_recover(&self.spares).pop();
        match spare {
            Some(frame) if frame.matches(&layout) => Some(frame),
            _ => Some(layout.allocate()),
        }
    }

    /// Publish a fully written picture into the slot.
    pub fn on_display(&self, frame: Frame) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let discarded = {
            let _display = lock_recover(&self.display_lock);
            self.buffer.enqueue(frame)
        };
        self.displayed.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = discarded {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            self.recycle(old);
        }
        self.signal.notify();
    }

    /// Return a consumed frame to the spare pool.
    pub fn recycle(&self, frame: Frame) {
        let Some(layout) = *lock_recover(&self.layout) else {
            return;
        };
        if !frame.matches(&layout) {
            return;
        }
        let mut spares = lock_recover(&self.spares);
        if spares.len() < MAX_SPARES {
            spares.push(frame);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn detach(&self) {
        self.active.store(false, Ordering::Release);
        self.buffer.clear();
        lock_recover(&self.spares).clear();
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            frames_displayed: self.displayed.load(Ordering::Relaxed),
            frames_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// StreamSession
// ----------------------------------------------------------------------------

/// One face's stream: descriptor, latest-frame slot and (once bound) its decoder.
pub struct StreamSession {
    descriptor: StreamDescriptor,
    callbacks: Arc<DecoderCallbacks>,
    decoder: Mutex<Option<Box<dyn VideoDecoder>>>,
    still: Option<Frame>,
}

impl StreamSession {
    pub fn new(descriptor: StreamDescriptor, signal: Arc<FrameSignal>) -> Self {
        let callbacks = Arc::new(DecoderCallbacks::new(descriptor.face, signal));
        Self {
            descriptor,
            callbacks,
            decoder: Mutex::new(None),
            still: None,
        }
    }

    /// Session backed by a single still image instead of a decoder.
    pub fn fixed(descriptor: StreamDescriptor, still: Frame, signal: Arc<FrameSignal>) -> Self {
        let mut session = Self::new(descriptor, signal);
        session.still = Some(still);
        session
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn face(&self) -> Face {
        self.descriptor.face
    }

    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }

    pub fn layout_metadata(&self) -> &str {
        &self.descriptor.layout_metadata
    }

    pub fn still(&self) -> Option<&Frame> {
        self.still.as_ref()
    }

    pub fn callbacks(&self) -> Arc<DecoderCallbacks> {
        self.callbacks.clone()
    }

    /// Attach a decoder to this face's endpoint and start it.
    pub fn bind(&self, factory: &dyn DecoderFactory) -> Result<(), BindError> {
        let mut slot = lock_recover(&self.decoder);
        if slot.is_some() {
            return Err(BindError::AlreadyBound(self.face()));
        }
        if !self.callbacks.is_active() {
            return Err(BindError::Backend("session was torn down".to_string()));
        }
        let endpoint = self.descriptor.endpoint.as_str();
        if endpoint.trim().is_empty() {
            return Err(BindError::InvalidEndpoint(endpoint.to_string()));
        }
        let mut decoder = factory.create(endpoint)?;
        decoder.start(self.callbacks.clone())?;
        log::info!("{}: bound decoder to {}", self.face(), endpoint);
        *slot = Some(decoder);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        lock_recover(&self.decoder).is_some()
    }

    /// Swap a frame into the slot, returning the one it displaced.
    pub fn enqueue(&self, frame: Frame) -> Option<Frame> {
        self.callbacks.buffer.enqueue(frame)
    }

    /// Take the pending frame, if any.
    pub fn dequeue(&self) -> Option<Frame> {
        self.callbacks.buffer.dequeue()
    }

    /// Hand a consumed frame back for reuse by the decoder.
    pub fn recycle(&self, frame: Frame) {
        self.callbacks.recycle(frame);
    }

    pub fn stats(&self) -> SessionStats {
        self.callbacks.stats()
    }

    /// Stop the decoder and drop all plane buffers. Safe on an unbound or already
    /// torn-down session.
    pub fn teardown(&self) {
        self.callbacks.detach();
        let decoder = lock_recover(&self.decoder).take();
        if let Some(mut decoder) = decoder {
            decoder.stop();
            log::info!("{}: session torn down", self.face());
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("descriptor", &self.descriptor)
            .field("fixed", &self.still.is_some())
            .field("bound", &self.is_bound())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn descriptor(face: Face, endpoint: &str) -> StreamDescriptor {
        StreamDescriptor {
            face,
            endpoint: endpoint.to_string(),
            layout_metadata: "meta".to_string(),
            width: 8,
            height: 4,
        }
    }

    struct CountingDecoder {
        stops: Arc<AtomicUsize>,
    }

    impl VideoDecoder for CountingDecoder {
        fn start(&mut self, callbacks: Arc<DecoderCallbacks>) -> Result<(), BindError> {
            callbacks.on_format(8, 4);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        stops: Arc<AtomicUsize>,
    }

    impl DecoderFactory for CountingFactory {
        fn create(&self, _endpoint: &str) -> Result<Box<dyn VideoDecoder>, BindError> {
            Ok(Box::new(CountingDecoder {
                stops: self.stops.clone(),
            }))
        }
    }

    struct FailingFactory;

    impl DecoderFactory for FailingFactory {
        fn create(&self, endpoint: &str) -> Result<Box<dyn VideoDecoder>, BindError> {
            Err(BindError::DecoderUnavailable {
                endpoint: endpoint.to_string(),
                reason: "no codec".to_string(),
            })
        }
    }

    #[test]
    fn callbacks_publish_and_count_discards() {
        let signal = Arc::new(FrameSignal::new());
        let session = StreamSession::new(descriptor(Face::Front, "stub://front"), signal.clone());
        let callbacks = session.callbacks();
        let before = signal.generation();

        assert!(callbacks.on_lock().is_none(), "no planes before negotiation");
        let layout = callbacks.on_format(8, 4);
        assert_eq!(layout.plane_sizes(), [32, 8, 8]);

        let first = callbacks.on_lock().expect("planes after negotiation");
        callbacks.on_display(first);
        let second = callbacks.on_lock().expect("second planes");
        callbacks.on_display(second);

        assert_ne!(signal.generation(), before);
        assert_eq!(
            session.stats(),
            SessionStats {
                frames_displayed: 2,
                frames_discarded: 1,
            }
        );
        assert!(session.dequeue().is_some());
        assert!(session.dequeue().is_none());
    }

    #[test]
    fn lock_reuses_recycled_frames() {
        let session = StreamSession::new(
            descriptor(Face::Left, "stub://left"),
            Arc::new(FrameSignal::new()),
        );
        let callbacks = session.callbacks();
        callbacks.on_format(8, 4);
        let mut frame = callbacks.on_lock().unwrap();
        frame.planes_mut()[0][0] = 42;
        callbacks.on_display(frame);
        let consumed = session.dequeue().unwrap();
        session.recycle(consumed);
        let reused = callbacks.on_lock().unwrap();
        assert_eq!(reused.plane(0)[0], 42);
    }

    #[test]
    fn bind_twice_is_rejected() {
        let stops = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            stops: stops.clone(),
        };
        let session = StreamSession::new(
            descriptor(Face::Back, "rtsp://cam/back"),
            Arc::new(FrameSignal::new()),
        );
        session.bind(&factory).unwrap();
        assert!(session.is_bound());
        assert!(matches!(
            session.bind(&factory),
            Err(BindError::AlreadyBound(Face::Back))
        ));
    }

    #[test]
    fn failed_bind_leaves_session_unbound() {
        let session = StreamSession::new(
            descriptor(Face::Up, "rtsp://cam/up"),
            Arc::new(FrameSignal::new()),
        );
        assert!(session.bind(&FailingFactory).is_err());
        assert!(!session.is_bound());
        assert!(session.dequeue().is_none());
    }

    #[test]
    fn empty_endpoint_is_invalid() {
        let session = StreamSession::new(descriptor(Face::Up, "  "), Arc::new(FrameSignal::new()));
        assert!(matches!(
            session.bind(&FailingFactory),
            Err(BindError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn teardown_is_idempotent_and_stops_decoder_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            stops: stops.clone(),
        };
        let session = StreamSession::new(
            descriptor(Face::Down, "rtsp://cam/down"),
            Arc::new(FrameSignal::new()),
        );
        session.bind(&factory).unwrap();
        session.teardown();
        session.teardown();
        drop(session);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_without_bind_is_noop() {
        let session = StreamSession::new(
            descriptor(Face::Right, "rtsp://cam/right"),
            Arc::new(FrameSignal::new()),
        );
        session.teardown();
        assert!(!session.is_bound());
    }

    #[test]
    fn detached_callbacks_drop_frames() {
        let session = StreamSession::new(
            descriptor(Face::Front, "stub://front"),
            Arc::new(FrameSignal::new()),
        );
        let callbacks = session.callbacks();
        callbacks.on_format(8, 4);
        session.teardown();
        assert!(callbacks.on_lock().is_none());
        callbacks.on_display(Frame::packed_bgra(vec![1]));
        assert!(session.dequeue().is_none());
    }
}
