//! Synthetic decoder for `stub://` endpoints.
//!
//! Produces I420 pictures on its own thread at a fixed rate, driving the same
//! callbacks a real decoder would. The endpoint query may override the factory
//! defaults: `stub://front?width=64&height=32&fps=60&frames=10`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use url::Url;

use super::{BindError, DecoderCallbacks, DecoderFactory, VideoDecoder};
use crate::frame::Frame;

/// Defaults for synthetic decoders created from `stub://` endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticDecoderFactory {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Stop after this many pictures.
    pub max_frames: Option<u64>,
}

impl Default for SyntheticDecoderFactory {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 30,
            max_frames: None,
        }
    }
}

impl DecoderFactory for SyntheticDecoderFactory {
    fn create(&self, endpoint: &str) -> Result<Box<dyn VideoDecoder>, BindError> {
        Ok(Box::new(SyntheticDecoder::from_endpoint(endpoint, self)?))
    }
}

pub struct SyntheticDecoder {
    endpoint: String,
    width: u32,
    height: u32,
    fps: u32,
    max_frames: Option<u64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyntheticDecoder {
    fn from_endpoint(
        endpoint: &str,
        defaults: &SyntheticDecoderFactory,
    ) -> Result<Self, BindError> {
        let url =
            Url::parse(endpoint).map_err(|_| BindError::InvalidEndpoint(endpoint.to_string()))?;
        if url.scheme() != "stub" {
            return Err(BindError::InvalidEndpoint(endpoint.to_string()));
        }

        let mut decoder = Self {
            endpoint: endpoint.to_string(),
            width: defaults.width,
            height: defaults.height,
            fps: defaults.fps,
            max_frames: defaults.max_frames,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        };
        for (key, value) in url.query_pairs() {
            let parsed: u64 = value
                .parse()
                .map_err(|_| BindError::InvalidEndpoint(endpoint.to_string()))?;
            match key.as_ref() {
                "width" => decoder.width = parsed as u32,
                "height" => decoder.height = parsed as u32,
                "fps" => decoder.fps = parsed as u32,
                "frames" => decoder.max_frames = Some(parsed),
                _ => {}
            }
        }
        if decoder.width == 0 || decoder.height == 0 || decoder.width % 2 != 0 || decoder.height % 2 != 0
        {
            return Err(BindError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(decoder)
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

impl VideoDecoder for SyntheticDecoder {
    fn start(&mut self, callbacks: Arc<DecoderCallbacks>) -> Result<(), BindError> {
        if self.handle.is_some() {
            return Err(BindError::Backend(format!(
                "{} is already decoding",
                self.endpoint
            )));
        }
        callbacks.on_format(self.width, self.height);

        let stop = self.stop.clone();
        let interval = self.frame_interval();
        let max_frames = self.max_frames;
        let endpoint = self.endpoint.clone();
        let handle = thread::Builder::new()
            .name(format!("decode-{}", callbacks.face()))
            .spawn(move || {
                let mut produced = 0u64;
                while !stop.load(Ordering::Acquire) {
                    if max_frames.is_some_and(|max| produced >= max) {
                        break;
                    }
                    match callbacks.on_lock() {
                        Some(mut frame) => {
                            paint(&mut frame, produced);
                            callbacks.on_display(frame);
                            produced += 1;
                        }
                        None if !callbacks.is_active() => break,
                        None => {}
                    }
                    thread::sleep(interval);
                }
                log::debug!("{}: synthetic decoder stopped after {} frames", endpoint, produced);
            })
            .map_err(|err| BindError::Backend(format!("spawn decoder thread: {err}")))?;
        self.handle = Some(handle);
        log::info!("{}: decoding started (synthetic)", self.endpoint);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("{}: synthetic decoder thread panicked", self.endpoint);
            }
        }
    }
}

impl Drop for SyntheticDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Flat luma that changes with every picture, neutral chroma.
fn paint(frame: &mut Frame, sequence: u64) {
    let [y, u, v] = frame.planes_mut();
    y.fill((sequence % 256) as u8);
    u.fill(128);
    v.fill(128);
}
