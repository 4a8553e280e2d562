//! Per-face frame acquisition.
//!
//! A `StreamSession` owns one face's descriptor and its latest-frame slot. Binding a
//! session attaches a decoder to the face endpoint; the decoder then drives the three
//! callbacks on `DecoderCallbacks`:
//!
//! 1. `on_format` once before decoding, to negotiate the fixed 4:2:0 plane layout
//! 2. `on_lock` before each picture, to obtain writable planes
//! 3. `on_display` after each picture, to publish it into the slot
//!
//! Decoders:
//! - `stub://` endpoints: synthetic decoder thread (tests, `replay`)
//! - anything else: GStreamer (feature: decode-gstreamer)
//!
//! Fixed still images bypass decoding entirely (see `fixed`).
//!
//! Decoder failures are never surfaced past `bind`: a session that stops playing
//! simply never enqueues again.

use std::sync::Arc;

use thiserror::Error;

use crate::Face;

pub mod decoder;
pub mod fixed;
#[cfg(feature = "decode-gstreamer")]
mod live;
pub mod session;

pub use decoder::{SyntheticDecoder, SyntheticDecoderFactory};
pub use fixed::{load_fixed_faces, FixedFace};
pub use session::{DecoderCallbacks, SessionStats, StreamSession};

/// Failure to attach a decoder to a face endpoint.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("no decoder available for {endpoint}: {reason}")]
    DecoderUnavailable { endpoint: String, reason: String },
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("session for face {0} is already bound")]
    AlreadyBound(Face),
    #[error("decoder backend failed: {0}")]
    Backend(String),
}

/// A running decoder instance for one endpoint.
pub trait VideoDecoder: Send {
    /// Start decoding, driving `callbacks` from the decoder's own thread(s).
    fn start(&mut self, callbacks: Arc<DecoderCallbacks>) -> Result<(), BindError>;

    /// Stop decoding and release the instance. Must tolerate repeated calls.
    fn stop(&mut self);
}

/// Creates decoder instances for endpoints.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Result<Box<dyn VideoDecoder>, BindError>;
}

// ----------------------------------------------------------------------------
// Default factory: synthetic for stub://, GStreamer otherwise
// ----------------------------------------------------------------------------

/// Picks the synthetic decoder for `stub://` endpoints and the GStreamer decoder for
/// everything else.
#[derive(Clone, Debug, Default)]
pub struct DefaultDecoderFactory {
    synthetic: SyntheticDecoderFactory,
}

impl DefaultDecoderFactory {
    pub fn new(synthetic: SyntheticDecoderFactory) -> Self {
        Self { synthetic }
    }
}

impl DecoderFactory for DefaultDecoderFactory {
    fn create(&self, endpoint: &str) -> Result<Box<dyn VideoDecoder>, BindError> {
        if endpoint.starts_with("stub://") {
            return self.synthetic.create(endpoint);
        }
        #[cfg(feature = "decode-gstreamer")]
        {
            Ok(Box::new(live::GstreamerDecoder::new(endpoint)?))
        }
        #[cfg(not(feature = "decode-gstreamer"))]
        {
            Err(BindError::DecoderUnavailable {
                endpoint: endpoint.to_string(),
                reason: "live decoding requires the decode-gstreamer feature".to_string(),
            })
        }
    }
}
