//! C9 Still Capture: mutually-exclusive JPEG pipeline with latest-or-capture
//! semantics (spec.md §4.9).

mod capture;

pub use capture::{CaptureOptions, StillCapture};
