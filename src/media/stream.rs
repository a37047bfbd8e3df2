//! GStreamer pipeline wrapper delivering decoded RGBA frames
//!
//! Decode threads belong to the pipeline; the latest decoded frame is
//! published through a mutex-guarded slot that the render thread swaps out
//! in `update()`. The render thread never blocks on the decoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::frame::Image;

/// One decoded frame with its presentation time
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Image,
    pub pts: Option<u64>,
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<VideoFrame>>,
    eos: AtomicBool,
    failed: AtomicBool,
    error: Mutex<Option<String>>,
}

/// A playing pipeline ending in an RGBA appsink
pub struct GstStream {
    description: String,
    pipeline: gst::Pipeline,
    shared: Arc<Shared>,
}

impl GstStream {
    /// Builds and starts a pipeline from a launch description. The
    /// description must not name a sink; an `appsink` is appended here.
    pub fn open(description: &str) -> Result<Self> {
        let launch = format!("{} ! videoconvert ! appsink name=sink", description);
        debug!(pipeline = %launch, "Opening stream");

        let pipeline = gst::parse::launch(&launch)
            .context("Failed to parse stream pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("Stream description is not a pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .context("Pipeline has no appsink")?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("sink element is not an appsink"))?;

        appsink.set_caps(Some(
            &gst::Caps::builder("video/x-raw").field("format", "RGBA").build(),
        ));
        appsink.set_max_buffers(2);
        appsink.set_drop(true);

        let shared = Arc::new(Shared::default());
        let cb_shared = shared.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Some(frame) = sample_to_frame(&sample) {
                        *cb_shared.latest.lock() = Some(frame);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set stream pipeline to Playing")?;

        Ok(GstStream {
            description: description.to_string(),
            pipeline,
            shared,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Takes the most recently decoded frame, if a new one arrived.
    pub fn take_frame(&self) -> Option<VideoFrame> {
        self.shared.latest.lock().take()
    }

    /// Drains pending bus messages; marks failure and end-of-stream.
    pub fn poll_bus(&self) {
        let Some(bus) = self.pipeline.bus() else { return };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    let text = format!("{}", err.error());
                    warn!(pipeline = %self.description, error = %text, "Stream error");
                    *self.shared.error.lock() = Some(text);
                    self.shared.failed.store(true, Ordering::Release);
                }
                gst::MessageView::Eos(_) => {
                    self.shared.eos.store(true, Ordering::Release);
                }
                _ => {}
            }
        }
    }

    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn end_of_stream(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Pauses or resumes the pipeline
    pub fn play(&self, on: bool) {
        let state = if on { gst::State::Playing } else { gst::State::Paused };
        if let Err(e) = self.pipeline.set_state(state) {
            warn!(pipeline = %self.description, error = %e, "Failed to change stream state");
        }
    }

    /// Current decoder position, if known
    pub fn position(&self) -> Option<u64> {
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(|p| p.nseconds())
    }

    /// Non-blocking flushing seek; completion is observed via [`position`].
    pub fn seek(&self, to_ns: u64, rate: f64) -> bool {
        self.shared.eos.store(false, Ordering::Release);
        let position = gst::ClockTime::from_nseconds(to_ns);
        let flags = gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE;
        let res = if rate >= 0.0 {
            self.pipeline.seek(
                rate.max(0.01),
                flags,
                gst::SeekType::Set,
                position,
                gst::SeekType::End,
                gst::ClockTime::ZERO,
            )
        } else {
            self.pipeline.seek(
                rate.min(-0.01),
                flags,
                gst::SeekType::Set,
                gst::ClockTime::ZERO,
                gst::SeekType::Set,
                position,
            )
        };
        if let Err(e) = res {
            warn!(pipeline = %self.description, error = %e, "Seek failed");
            return false;
        }
        true
    }
}

impl Drop for GstStream {
    fn drop(&mut self) {
        debug!(pipeline = %self.description, "Closing stream");
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn sample_to_frame(sample: &gst::Sample) -> Option<VideoFrame> {
    let caps = sample.caps()?;
    let info = gst_video::VideoInfo::from_caps(caps).ok()?;
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let row = (width * 4) as usize;

    let mut image = Image::new(width, height);
    for y in 0..height as usize {
        let src = &map[y * stride..y * stride + row];
        let dst = &mut image.pixels[y * row..(y + 1) * row];
        dst.copy_from_slice(src);
    }

    Some(VideoFrame {
        image,
        pts: buffer.pts().map(|t| t.nseconds()),
    })
}
