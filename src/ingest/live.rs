//! Live decoding with GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! I420 appsink`. The appsink's
//! new-sample callback negotiates the layout on the first picture (and again on a
//! size change), then copies each plane row by row into a frame from `on_lock`.

use std::sync::Arc;

use anyhow::{Context, Result};
use gstreamer::prelude::*;

use super::{BindError, DecoderCallbacks, VideoDecoder};
use crate::frame::{Frame, PlaneLayout, PLANE_COUNT};

pub(crate) struct GstreamerDecoder {
    endpoint: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    playing: bool,
}

impl GstreamerDecoder {
    pub(crate) fn new(endpoint: &str) -> Result<Self, BindError> {
        build(endpoint).map_err(|err| BindError::Backend(format!("{err:#}")))
    }
}

fn build(endpoint: &str) -> Result<GstreamerDecoder> {
    gstreamer::init().context("initialize gstreamer")?;

    let pipeline_description = format!(
        "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=I420 ! \
         appsink name=appsink sync=false max-buffers=1 drop=true",
        endpoint
    );
    let pipeline = gstreamer::parse::launch(&pipeline_description)
        .context("build decode pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow::anyhow!("decode pipeline is not a Pipeline"))?;

    let appsink = pipeline
        .by_name("appsink")
        .context("appsink element missing from pipeline")?
        .downcast::<gstreamer_app::AppSink>()
        .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

    let caps = gstreamer::Caps::builder("video/x-raw")
        .field("format", "I420")
        .build();
    appsink.set_caps(Some(&caps));

    Ok(GstreamerDecoder {
        endpoint: endpoint.to_string(),
        pipeline,
        appsink,
        playing: false,
    })
}

impl VideoDecoder for GstreamerDecoder {
    fn start(&mut self, callbacks: Arc<DecoderCallbacks>) -> Result<(), BindError> {
        let endpoint = self.endpoint.clone();
        let mut negotiated: Option<PlaneLayout> = None;
        self.appsink.set_callbacks(
            gstreamer_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink
                        .pull_sample()
                        .map_err(|_| gstreamer::FlowError::Eos)?;
                    if let Err(err) = deliver(&sample, &callbacks, &mut negotiated) {
                        log::warn!("{}: dropped picture: {:#}", endpoint, err);
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .build(),
        );

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| BindError::Backend(format!("start {}: {err}", self.endpoint)))?;
        self.playing = true;
        log::info!("{}: decoding started (gstreamer)", self.endpoint);
        Ok(())
    }

    fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("{}: stopping pipeline failed: {}", self.endpoint, err);
        }
    }
}

impl Drop for GstreamerDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver(
    sample: &gstreamer::Sample,
    callbacks: &DecoderCallbacks,
    negotiated: &mut Option<PlaneLayout>,
) -> Result<()> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let layout = match negotiated {
        Some(layout) if layout.width == info.width() && layout.height == info.height() => *layout,
        _ => {
            let layout = callbacks.on_format(info.width(), info.height());
            *negotiated = Some(layout);
            layout
        }
    };

    let Some(mut frame) = callbacks.on_lock() else {
        return Ok(());
    };
    let video = gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .context("map video frame")?;
    copy_planes(&video, &layout, &mut frame)?;
    callbacks.on_display(frame);
    Ok(())
}

fn copy_planes(
    video: &gstreamer_video::VideoFrameRef<&gstreamer::BufferRef>,
    layout: &PlaneLayout,
    frame: &mut Frame,
) -> Result<()> {
    let strides = video.plane_stride();
    for (index, dst) in frame.planes_mut().iter_mut().enumerate().take(PLANE_COUNT) {
        let src = video
            .plane_data(index as u32)
            .context("plane missing from video frame")?;
        let stride = strides[index] as usize;
        let row_bytes = layout.pitches[index] as usize;
        for row in 0..layout.lines[index] as usize {
            let start = row * stride;
            let chunk = src
                .get(start..start + row_bytes)
                .context("plane row is out of bounds")?;
            dst[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(chunk);
        }
    }
    Ok(())
}
