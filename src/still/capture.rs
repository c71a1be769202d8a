//! C9 Still Capture (spec.md §4.9, §4.9a).
//!
//! Grounded on the teacher's `rust-mjpeg-rtp/src/capture/mod.rs`: a
//! short-lived GStreamer pipeline with a bounded appsink (`max-buffers=2`,
//! `drop=true`) feeding a channel, except here the pipeline is torn down
//! again as soon as one JPEG frame lands rather than streamed continuously.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::encoder::{EncoderState, EncoderWrapper};
use crate::error::CaptureError;

const RECOGNIZED_EXTENSIONS: &[&str] = &["jpg", "png", "gif", "bmp"];

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub force_capture: bool,
    pub width: u32,
    pub height: u32,
    pub quality: u32,
    pub timeout: Duration,
    pub prefix: String,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            force_capture: false,
            width: 1280,
            height: 960,
            quality: 85,
            timeout: Duration::from_millis(2000),
            prefix: "still".to_owned(),
        }
    }
}

struct FrameGate {
    frame: Mutex<Option<Vec<u8>>>,
    ready: Condvar,
}

impl FrameGate {
    fn new() -> Self {
        FrameGate { frame: Mutex::new(None), ready: Condvar::new() }
    }

    fn deliver(&self, bytes: Vec<u8>) {
        let mut slot = self.frame.lock();
        if slot.is_none() {
            *slot = Some(bytes);
            self.ready.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut slot = self.frame.lock();
        if slot.is_none() {
            let result = self.ready.wait_for(&mut slot, timeout);
            if result.timed_out() && slot.is_none() {
                return None;
            }
        }
        slot.take()
    }
}

/// Implements `get_latest_or_capture` (spec.md §4.9). Holds a reference to
/// the live Encoder Wrapper only to observe its state for the
/// mutual-exclusion check; it never drives the encoder itself.
pub struct StillCapture {
    encoder: Arc<EncoderWrapper>,
    directory: PathBuf,
    max_age: Duration,
}

impl StillCapture {
    pub fn new(encoder: Arc<EncoderWrapper>, directory: impl Into<PathBuf>, max_age: Duration) -> Self {
        StillCapture { encoder, directory: directory.into(), max_age }
    }

    pub fn get_latest_or_capture(&self, options: &CaptureOptions) -> Result<PathBuf, CaptureError> {
        if !options.force_capture {
            if let Some(existing) = self.scan_and_evict()? {
                return Ok(existing);
            }
        }
        self.capture(options)
    }

    /// Step 2 of spec.md §4.9: evicts stale files, returns the newest file
    /// if it is younger than `max_age`.
    fn scan_and_evict(&self) -> Result<Option<PathBuf>, CaptureError> {
        let now = SystemTime::now();
        let mut newest: Option<(PathBuf, SystemTime)> = None;

        let entries = match fs::read_dir(&self.directory) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CaptureError::Io(e)),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !is_recognized(&path) {
                continue;
            }
            let metadata = entry.metadata()?;
            let modified = metadata.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > self.max_age {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to evict stale still");
                }
                continue;
            }
            if newest.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
                newest = Some((path, modified));
            }
        }

        Ok(newest.map(|(path, _)| path))
    }

    /// Step 3 of spec.md §4.9: acquires the camera, runs a short-lived JPEG
    /// pipeline, and returns the written file path.
    fn capture(&self, options: &CaptureOptions) -> Result<PathBuf, CaptureError> {
        if self.encoder.state() != EncoderState::Uninitialized {
            return Err(CaptureError::DeviceBusy);
        }

        fs::create_dir_all(&self.directory)?;
        let timestamp = file_timestamp();
        let filename = format!("{}_{}.jpg", options.prefix, timestamp);
        let final_path = self.directory.join(&filename);
        let tmp_path = self.directory.join(format!("{filename}.saving"));

        let gate = Arc::new(FrameGate::new());
        let pipeline_desc = build_still_pipeline(options);
        info!(pipeline = %pipeline_desc, "starting still capture pipeline");

        let pipeline = gst::parse::launch(&pipeline_desc)
            .map_err(|e| CaptureError::Gstreamer(e.to_string()))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| CaptureError::Gstreamer("launched element is not a pipeline".into()))?;

        let app_sink = pipeline
            .by_name("sink")
            .ok_or_else(|| CaptureError::Gstreamer("no appsink named 'sink'".into()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::Gstreamer("'sink' is not an appsink".into()))?;
        app_sink.set_property("max-buffers", 2u32);
        app_sink.set_property("drop", true);
        app_sink.set_property("emit-signals", false);

        let gate_cb = Arc::clone(&gate);
        app_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    gate_cb.deliver(map.as_slice().to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let _guard = PipelineGuard(&pipeline);
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CaptureError::Gstreamer(format!("{e:?}")))?;

        let bytes = gate.wait(options.timeout).ok_or(CaptureError::Timeout)?;

        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &final_path)?;
        info!(path = %final_path.display(), bytes = bytes.len(), "still capture complete");
        Ok(final_path)
    }
}

/// Tears the pipeline down on every exit path, per spec.md §5 "Still-capture
/// timeout aborts the capture and tears down the pipeline even if no
/// FRAME_END arrived."
struct PipelineGuard<'a>(&'a gst::Pipeline);

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.set_state(gst::State::Null) {
            warn!(error = ?e, "failed to tear down still pipeline");
        }
    }
}

fn is_recognized(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RECOGNIZED_EXTENSIONS.iter().any(|r| r.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn file_timestamp() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn build_still_pipeline(options: &CaptureOptions) -> String {
    if cfg!(feature = "test-mode") {
        format!(
            "videotestsrc num-buffers=1 ! video/x-raw,width={},height={} ! videoconvert ! jpegenc quality={} ! appsink name=sink",
            options.width, options.height, options.quality
        )
    } else {
        format!(
            "libcamerasrc ! video/x-raw,width={},height={} ! videoconvert ! jpegenc quality={} ! appsink name=sink",
            options.width, options.height, options.quality
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_supported_extensions_case_insensitively() {
        assert!(is_recognized(Path::new("/tmp/a.JPG")));
        assert!(is_recognized(Path::new("/tmp/a.png")));
        assert!(!is_recognized(Path::new("/tmp/a.txt")));
    }

    #[test]
    fn frame_gate_delivers_first_frame_only() {
        let gate = FrameGate::new();
        gate.deliver(vec![1, 2, 3]);
        gate.deliver(vec![4, 5, 6]);
        assert_eq!(gate.wait(Duration::from_millis(10)), Some(vec![1, 2, 3]));
    }

    #[test]
    fn frame_gate_times_out_with_no_delivery() {
        let gate = FrameGate::new();
        assert_eq!(gate.wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn scan_and_evict_removes_files_older_than_max_age() {
        let dir = std::env::temp_dir().join(format!("still-test-{}", file_timestamp()));
        fs::create_dir_all(&dir).unwrap();
        let old_file = dir.join("old.jpg");
        fs::write(&old_file, b"x").unwrap();
        let old_time = SystemTime::now() - Duration::from_secs(1000);
        let file = fs::File::open(&old_file).unwrap();
        file.set_modified(old_time).unwrap();

        let encoder = Arc::new(EncoderWrapper::new(true));
        let still = StillCapture::new(encoder, &dir, Duration::from_secs(300));
        let found = still.scan_and_evict().unwrap();
        assert!(found.is_none());
        assert!(!old_file.exists());

        fs::remove_dir_all(&dir).ok();
    }
}
