//! C5 Quality Controller: maps bandwidth-estimator feedback to an Operating
//! Point (resolution, framerate, bitrate).

mod controller;

pub use controller::{AdaptationHint, OperatingPoint, QualityController, Resolution};
