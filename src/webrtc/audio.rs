//! Microphone audio track (spec.md §1: "a live, hardware-encoded H.264 video
//! track (and a microphone audio track)").
//!
//! Not one of the ten budgeted core components (C1-C10 sum to 100% of the
//! video pipeline's share) — audio capture/encoding is peripheral to the
//! core's adaptive H.264 path, the same way the SDP/ICE/SRTP stack is an
//! external collaborator. This module is the minimal GStreamer bridge that
//! makes the crate actually publish the second track spec.md §1 describes,
//! built the same way C3's appsink bridge is (`encoder::wrapper`): a short
//! GStreamer graph whose `appsink` callback forwards samples into the
//! `webrtc` crate's sample sink.

use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::EncoderError;

pub const OPUS_MIME_TYPE: &str = "audio/opus";
pub const OPUS_CLOCK_RATE: u32 = 48_000;
pub const OPUS_CHANNELS: u16 = 2;
pub const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Owns the microphone capture pipeline and forwards encoded Opus packets to
/// a `TrackLocalStaticSample`. Built and torn down alongside its
/// `WebRtcPeer`, the same lifetime as the video Encoder Adapter.
pub struct AudioTrack {
    pipeline: gst::Pipeline,
    forward_handle: tokio::task::JoinHandle<()>,
}

impl AudioTrack {
    /// Builds `alsasrc ! audioconvert ! audioresample ! opusenc ! appsink`
    /// (or `audiotestsrc` under `test_mode`, matching the Encoder Wrapper's
    /// own test-mode switch) and spawns a task forwarding samples to `track`.
    pub fn start(test_mode: bool, track: Arc<TrackLocalStaticSample>) -> Result<Self, EncoderError> {
        let pipeline_desc = if test_mode {
            "audiotestsrc is-live=true wave=silence ! audioconvert ! audioresample \
             ! opusenc ! appsink name=sink"
                .to_string()
        } else {
            "alsasrc ! audioconvert ! audioresample ! opusenc ! appsink name=sink".to_string()
        };

        let pipeline = gst::parse::launch(&pipeline_desc)
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| EncoderError::Gstreamer("launched element is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| EncoderError::Gstreamer("no appsink named 'sink'".into()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| EncoderError::Gstreamer("'sink' is not an appsink".into()))?;
        appsink.set_property("max-buffers", 8u32);
        appsink.set_property("drop", true);
        appsink.set_property("emit-signals", false);

        let (tx, rx): (UnboundedSender<Vec<u8>>, UnboundedReceiver<Vec<u8>>) = mpsc::unbounded_channel();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let Some(buffer) = sample.buffer() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let Ok(map) = buffer.map_readable() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let _ = tx.send(map.as_slice().to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Gstreamer(format!("{e:?}")))?;

        let forward_handle = tokio::spawn(forward_samples(rx, track));

        Ok(AudioTrack { pipeline, forward_handle })
    }

    pub async fn stop(&self) {
        self.forward_handle.abort();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(error = ?e, "failed to tear down audio capture pipeline");
        }
    }
}

/// 20 ms Opus frames at 48 kHz, matching `opusenc`'s default frame duration.
async fn forward_samples(mut rx: UnboundedReceiver<Vec<u8>>, track: Arc<TrackLocalStaticSample>) {
    while let Some(data) = rx.recv().await {
        let sample = Sample {
            data: data.into(),
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!(error = %e, "audio write_sample failed");
        }
    }
}
