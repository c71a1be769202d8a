//! C3 Encoder Wrapper (spec.md §4.3).
//!
//! Grounded on `examples/angkira-rpi-webrtc-streamer/rust/src/streaming/pipeline.rs`
//! (state handling, `new_with_mode` test-mode switch, bus watch, Drop
//! teardown) and `rust/src/webrtc/pipeline.rs` (encoder property shape). The
//! hardware MMAL/VideoCore camera+encoder graph is realized here as a
//! GStreamer pipeline whose appsink feeds the Frame Queue (C2) write path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::EncoderError;
use crate::frame::{FrameFlags, FrameQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    InitializedIdle,
    Capturing,
    /// Held for the duration of `reinit()`'s stop/teardown/build/start
    /// sequence (spec.md §3 Data Model). The wrapper's own `state` mutex
    /// already serializes callers through this window; the variant exists
    /// so `state()` reports it accurately rather than stale `Capturing`.
    ReinitPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
}

impl EncoderParams {
    /// Resolution whitelist (4:3/16:9 family) and framerate range [5,30]
    /// per spec.md §3 "Encoding Parameters".
    pub fn validate(&self) -> Result<(), EncoderError> {
        let aspect_ok = {
            let (w, h) = (self.width as f64, self.height as f64);
            let ratio = w / h;
            (ratio - 4.0 / 3.0).abs() < 0.02 || (ratio - 16.0 / 9.0).abs() < 0.02
        };
        if !aspect_ok || !(5..=30).contains(&self.framerate) {
            return Err(EncoderError::Gstreamer(format!(
                "invalid encoder params: {self:?}"
            )));
        }
        Ok(())
    }
}

struct Graph {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    _bus_watch: gst::bus::BusWatchGuard,
}

/// Owns the camera+encoder graph exclusively, along with the Frame Queue it
/// feeds. Serializes all graph-touching operations behind `state`.
pub struct EncoderWrapper {
    state: Mutex<EncoderState>,
    graph: Mutex<Option<Graph>>,
    queue: Arc<FrameQueue>,
    params: Mutex<Option<EncoderParams>>,
    test_mode: bool,
    keyframe_requested: Arc<AtomicBool>,
}

const QUEUE_CAPACITY: usize = 8;
const BUFFER_SIZE: usize = 1024 * 1024;

impl EncoderWrapper {
    pub fn new(test_mode: bool) -> Self {
        EncoderWrapper {
            state: Mutex::new(EncoderState::Uninitialized),
            graph: Mutex::new(None),
            queue: Arc::new(FrameQueue::new(QUEUE_CAPACITY, BUFFER_SIZE)),
            params: Mutex::new(None),
            test_mode,
            keyframe_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> EncoderState {
        *self.state.lock()
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn frame_queue(&self) -> Arc<FrameQueue> {
        self.queue.clone()
    }

    /// Constructs the camera+encoder graph and wires the segment callback
    /// into the Frame Queue. Returns once the pipeline is ready but not yet
    /// capturing (spec.md §4.3).
    pub fn init(&self, params: EncoderParams) -> Result<(), EncoderError> {
        params.validate()?;
        let mut state = self.state.lock();
        if *state != EncoderState::Uninitialized {
            return Err(EncoderError::AlreadyInitialized);
        }

        let graph = self.build_graph(&params)?;
        *self.graph.lock() = Some(graph);
        *self.params.lock() = Some(params);
        *state = EncoderState::InitializedIdle;
        info!(?params, "encoder initialized");
        Ok(())
    }

    fn build_graph(&self, params: &EncoderParams) -> Result<Graph, EncoderError> {
        let pipeline = gst::Pipeline::builder()
            .name("rpi-webrtc-streamer-encoder")
            .build();

        let camera_src = if self.test_mode {
            gst::ElementFactory::make("videotestsrc")
                .property("is-live", true)
                .build()
        } else {
            gst::ElementFactory::make("libcamerasrc").build()
        }
        .map_err(|e| {
            if self.test_mode {
                EncoderError::Gstreamer(e.to_string())
            } else {
                EncoderError::DeviceMissing
            }
        })?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("width", params.width as i32)
            .field("height", params.height as i32)
            .field("framerate", gst::Fraction::new(params.framerate as i32, 1))
            .build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;

        let encoder = gst::ElementFactory::make("x264enc")
            .property_from_str("tune", "zerolatency")
            .property("bitrate", params.bitrate / 1000)
            .build()
            .map_err(|_| EncoderError::InsufficientGpuMemory)?;

        let appsink = gst_app::AppSink::builder()
            .caps(&gst::Caps::builder("video/x-h264").build())
            .max_buffers(4)
            .drop(true)
            .build();

        let elements: Vec<&gst::Element> = vec![
            &camera_src,
            &capsfilter,
            &videoconvert,
            &encoder,
            appsink.upcast_ref(),
        ];
        pipeline
            .add_many(&elements)
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;
        gst::Element::link_many(&elements).map_err(|e| EncoderError::Gstreamer(e.to_string()))?;

        let queue = self.queue.clone();
        let keyframe_requested = Arc::clone(&self.keyframe_requested);
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
                    let flags = segment_flags(buffer);
                    queue.write_back(&map, flags);
                    if keyframe_requested.swap(false, Ordering::AcqRel) {
                        let event = gst_video::UpstreamForceKeyUnitEvent::builder().all_headers(true).build();
                        if !sink.send_event(event) {
                            warn!("force-key-unit event rejected upstream of encoder");
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let bus = pipeline
            .bus()
            .ok_or_else(|| EncoderError::Gstreamer("pipeline has no bus".into()))?;
        let bus_watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        error!(error = %err.error(), debug = ?err.debug(), "encoder pipeline error");
                    }
                    MessageView::Warning(w) => {
                        warn!(warning = %w.error(), "encoder pipeline warning");
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;

        Ok(Graph {
            pipeline,
            appsink,
            _bus_watch: bus_watch,
        })
    }

    /// Tears down and reconstructs the graph with new params. Only legal
    /// when currently initialized (spec.md §4.3).
    pub fn reinit(&self, params: EncoderParams) -> Result<(), EncoderError> {
        params.validate()?;
        let mut state = self.state.lock();
        if *state == EncoderState::Uninitialized {
            return Err(EncoderError::NotInitialized);
        }
        if *state == EncoderState::Capturing {
            self.stop_capture_locked(&mut state)?;
        }
        *state = EncoderState::ReinitPending;
        self.teardown_locked();
        let graph = match self.build_graph(&params) {
            Ok(g) => g,
            Err(e) => {
                *state = EncoderState::Uninitialized;
                return Err(EncoderError::ReinitFailed(e.to_string()));
            }
        };
        *self.graph.lock() = Some(graph);
        *self.params.lock() = Some(params);
        *state = EncoderState::InitializedIdle;
        self.start_capture_locked(&mut state)?;
        info!(?params, "encoder reinitialized");
        Ok(())
    }

    fn teardown_locked(&self) {
        if let Some(graph) = self.graph.lock().take() {
            let _ = graph.pipeline.set_state(gst::State::Null);
        }
    }

    pub fn start_capture(&self) -> Result<(), EncoderError> {
        let mut state = self.state.lock();
        self.start_capture_locked(&mut state)
    }

    fn start_capture_locked(&self, state: &mut EncoderState) -> Result<(), EncoderError> {
        if *state == EncoderState::Capturing {
            debug!("start_capture: already capturing");
            return Ok(());
        }
        let graph = self.graph.lock();
        let graph = graph.as_ref().ok_or(EncoderError::NotInitialized)?;
        graph
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;
        *state = EncoderState::Capturing;
        Ok(())
    }

    pub fn stop_capture(&self) -> Result<(), EncoderError> {
        let mut state = self.state.lock();
        self.stop_capture_locked(&mut state)
    }

    fn stop_capture_locked(&self, state: &mut EncoderState) -> Result<(), EncoderError> {
        if *state != EncoderState::Capturing {
            debug!("stop_capture: already stopped");
            return Ok(());
        }
        if let Some(graph) = self.graph.lock().as_ref() {
            graph
                .pipeline
                .set_state(gst::State::Paused)
                .map_err(|e| EncoderError::Gstreamer(e.to_string()))?;
        }
        *state = EncoderState::InitializedIdle;
        Ok(())
    }

    /// Stops capture (if running) and tears the graph down, returning to
    /// `UNINITIALIZED` (spec.md §4.3 state machine's `teardown` arrow). Called
    /// by the Encoder Adapter's `release()` so the next session's `init_encode`
    /// starts from a clean slate.
    pub fn uninit(&self) -> Result<(), EncoderError> {
        let mut state = self.state.lock();
        self.stop_capture_locked(&mut state)?;
        self.teardown_locked();
        *state = EncoderState::Uninitialized;
        Ok(())
    }

    /// Parameter patch without reinit; applies iff values changed
    /// (spec.md §4.3). Safe at any time.
    pub fn set_rate(&self, framerate: u32, bitrate: u32) -> Result<(), EncoderError> {
        let mut params = self.params.lock();
        let Some(current) = params.as_mut() else {
            return Ok(());
        };
        if current.framerate == framerate && current.bitrate == bitrate {
            return Ok(());
        }
        current.framerate = framerate;
        current.bitrate = bitrate;
        if let Some(graph) = self.graph.lock().as_ref() {
            if let Some(encoder) = graph.pipeline.by_name("x264enc0") {
                encoder.set_property("bitrate", bitrate / 1000);
            }
        }
        Ok(())
    }

    /// Requests an IDR at the next opportunity (spec.md §4.3). Actual
    /// coalescing against the 3000 ms window lives in the Encoder Adapter
    /// (C6); this just flips a flag the appsink's `new-sample` callback
    /// consults, pushing an upstream force-key-unit event to the encoder
    /// once it sees it set.
    pub fn force_next_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.swap(false, Ordering::AcqRel)
    }

    /// Pulls rotation/flip/ROI/AWB/exposure/flicker/DRC/annotation values
    /// from the Config Registry into the graph (spec.md §4.3). A no-op in
    /// this reference realization beyond rotation/flip, since the rest are
    /// libcamera-specific properties not exposed by the generic elements
    /// used here.
    pub fn apply_media_config(&self, registry: &crate::config::ConfigRegistry) {
        let rotation = registry.get_int("rotation").unwrap_or(0);
        let flip_h = registry.get_bool("flip_horizontal").unwrap_or(false);
        let flip_v = registry.get_bool("flip_vertical").unwrap_or(false);
        debug!(rotation, flip_h, flip_v, "applying media config to encoder graph");
        if let Some(graph) = self.graph.lock().as_ref() {
            if let Some(flip) = graph.pipeline.by_name("videoflip0") {
                let method = rotation_to_flip_method(rotation, flip_h, flip_v);
                flip.set_property_from_str("method", method);
            }
        }
    }
}

fn rotation_to_flip_method(rotation: i64, flip_h: bool, flip_v: bool) -> &'static str {
    match (rotation, flip_h, flip_v) {
        (90, _, _) => "clockwise",
        (180, _, _) => "rotate-180",
        (270, _, _) => "counterclockwise",
        (_, true, true) => "rotate-180",
        (_, true, false) => "horizontal-flip",
        (_, false, true) => "vertical-flip",
        _ => "none",
    }
}

fn segment_flags(buffer: &gst::BufferRef) -> FrameFlags {
    let mut flags = FrameFlags::NONE;
    if buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
        // not a keyframe
    } else {
        flags = flags | FrameFlags::KEYFRAME;
    }
    flags | FrameFlags::FRAME_START | FrameFlags::FRAME_END
}

impl Drop for EncoderWrapper {
    fn drop(&mut self) {
        self.teardown_locked();
        self.queue.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> EncoderParams {
        EncoderParams {
            width: 1280,
            height: 720,
            framerate: 30,
            bitrate: 2_000_000,
        }
    }

    #[test]
    fn rejects_framerate_outside_range() {
        let mut p = valid_params();
        p.framerate = 60;
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_non_whitelisted_aspect_ratio() {
        let mut p = valid_params();
        p.width = 1000;
        p.height = 333;
        assert!(p.validate().is_err());
    }

    #[test]
    fn accepts_4_3_and_16_9_family() {
        assert!(EncoderParams { width: 640, height: 480, framerate: 30, bitrate: 1_000_000 }.validate().is_ok());
        assert!(EncoderParams { width: 1280, height: 720, framerate: 30, bitrate: 1_000_000 }.validate().is_ok());
    }

    #[test]
    fn initial_state_is_uninitialized() {
        let wrapper = EncoderWrapper::new(true);
        assert_eq!(wrapper.state(), EncoderState::Uninitialized);
    }

    #[test]
    fn keyframe_request_flag_is_consumed_once() {
        let wrapper = EncoderWrapper::new(true);
        wrapper.force_next_keyframe();
        assert!(wrapper.take_keyframe_request());
        assert!(!wrapper.take_keyframe_request());
    }
}
