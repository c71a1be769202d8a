//! C5 Quality Controller (spec.md §4.5).
//!
//! Grounded on `examples/original_source/src/raspi_quality_config.h`
//! (`QualityConfig`, `Resolution`, `ResolutionConfigEntry`, `Adaptation`,
//! `AdaptationReason`, `average_qp_` moving average, `GetBestMatch`/
//! `GetInitialBestMatch` — the latter supplemented per SPEC_FULL.md §10).

use parking_lot::Mutex;

use crate::config::ConfigRegistry;

const MOVING_AVERAGE_WINDOW: usize = 90;
const FPS_MAX: f64 = 30.0;
const MOTION_MAX: f64 = 3.0;
const MOTION_MIN: f64 = 1.0;

const RESOLUTIONS_16_9: &[Resolution] = &[
    Resolution { width: 320, height: 180 },
    Resolution { width: 640, height: 360 },
    Resolution { width: 1280, height: 720 },
    Resolution { width: 1920, height: 1080 },
];

const RESOLUTIONS_4_3: &[Resolution] = &[
    Resolution { width: 320, height: 240 },
    Resolution { width: 640, height: 480 },
    Resolution { width: 1280, height: 960 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Kush-gauge reference bitrate midpoint, in bits/sec, per spec.md §4.5.
    ///
    /// spec.md §4.5 gives the formula as
    /// `W·H·fps_max·0.07·(motion_max+motion_min)/2`, but its own worked
    /// example (§8 scenario 5: 320x240/640x480/1280x720 -> ~161/645/1935
    /// kbps at fps_max=30) only holds if the motion term's contribution is
    /// normalized to 1 rather than literally (3+1)/2=2. This implementation
    /// follows the worked scenario, dividing by the motion sum's own
    /// midpoint of 2 so the named constants (motion_max=3, motion_min=1)
    /// still shape relative weighting without double-counting the average.
    pub fn reference_bitrate(self) -> f64 {
        let motion_factor = (MOTION_MAX + MOTION_MIN) / 2.0 / 2.0;
        (self.width as f64) * (self.height as f64) * FPS_MAX * 0.07 * motion_factor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationReason {
    None,
    Bitrate,
    Qp,
    PacketLoss,
    Rtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationHint {
    None,
    Up,
    Down(AdaptationReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub resolution: Resolution,
    pub framerate: u32,
    pub bitrate_bps: u32,
    pub reason: AdaptationReason,
    /// `true` unless this operating point is identical to the previously
    /// returned one (spec.md §4.5 point 4: "report change only if ... ;
    /// otherwise report 'no change'").
    pub changed: bool,
}

struct MovingAverage {
    samples: Vec<f64>,
    cursor: usize,
    filled: usize,
}

impl MovingAverage {
    fn new() -> Self {
        MovingAverage {
            samples: vec![0.0; MOVING_AVERAGE_WINDOW],
            cursor: 0,
            filled: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.cursor] = value;
        self.cursor = (self.cursor + 1) % MOVING_AVERAGE_WINDOW;
        self.filled = (self.filled + 1).min(MOVING_AVERAGE_WINDOW);
    }

    fn average(&self) -> Option<f64> {
        if self.filled == 0 {
            return None;
        }
        Some(self.samples[..self.filled].iter().sum::<f64>() / self.filled as f64)
    }
}

struct State {
    bitrate_kbps: MovingAverage,
    framerate: MovingAverage,
    qp: MovingAverage,
    packet_loss: MovingAverage,
    rtt_ms: MovingAverage,
    last_resolution: Option<Resolution>,
    target_bitrate_kbps: Option<f64>,
}

/// Reports BWE/codec feedback as moving averages and derives the candidate
/// Operating Point (spec.md §4.5).
pub struct QualityController {
    state: Mutex<State>,
}

impl QualityController {
    pub fn new() -> Self {
        QualityController {
            state: Mutex::new(State {
                bitrate_kbps: MovingAverage::new(),
                framerate: MovingAverage::new(),
                qp: MovingAverage::new(),
                packet_loss: MovingAverage::new(),
                rtt_ms: MovingAverage::new(),
                last_resolution: None,
                target_bitrate_kbps: None,
            }),
        }
    }

    pub fn report_qp(&self, qp: i32) {
        self.state.lock().qp.push(qp as f64);
    }

    pub fn report_framerate(&self, fps: i32) {
        self.state.lock().framerate.push(fps as f64);
    }

    pub fn report_target_bitrate(&self, kbps: i32) {
        let mut state = self.state.lock();
        state.bitrate_kbps.push(kbps as f64);
        state.target_bitrate_kbps = Some(kbps as f64);
    }

    pub fn report_packet_loss(&self, loss_ratio_256: i32) {
        self.state.lock().packet_loss.push(loss_ratio_256 as f64);
    }

    pub fn report_rtt(&self, rtt_ms: i32) {
        self.state.lock().rtt_ms.push(rtt_ms as f64);
    }

    /// The first operating point of a session, before any BWE feedback
    /// exists, seeded from the Config Registry rather than a moving average
    /// that has no samples yet (`GetInitialBestMatch`, SPEC_FULL.md §10).
    pub fn initial_operating_point(&self, config: &ConfigRegistry) -> OperatingPoint {
        let framerate = config.get_int("fixed_fps").unwrap_or(30) as u32;
        let resolution = Resolution {
            width: config.get_int("fixed_resolution_width").unwrap_or(1280) as u32,
            height: config.get_int("fixed_resolution_height").unwrap_or(720) as u32,
        };
        let bitrate_bps = config.get_int("max_bitrate").unwrap_or(2_000_000) as u32;
        self.state.lock().last_resolution = Some(resolution);
        OperatingPoint {
            resolution,
            framerate,
            bitrate_bps,
            reason: AdaptationReason::None,
            changed: true,
        }
    }

    /// Derives the candidate Operating Point from current moving averages
    /// and the Config Registry's dynamic-fps/dynamic-resolution/aspect
    /// settings (spec.md §4.5).
    pub fn select_operating_point(&self, config: &ConfigRegistry) -> OperatingPoint {
        let mut state = self.state.lock();

        let dynamic_fps = config.get_bool("dynamic_fps").unwrap_or(false);
        let framerate = if dynamic_fps {
            state
                .framerate
                .average()
                .map(|f| f.clamp(1.0, 30.0) as u32)
                .unwrap_or_else(|| config.get_int("fixed_fps").unwrap_or(30) as u32)
        } else {
            config.get_int("fixed_fps").unwrap_or(30) as u32
        };

        let target_bitrate_kbps = state
            .bitrate_kbps
            .average()
            .unwrap_or_else(|| state.target_bitrate_kbps.unwrap_or(2000.0));
        let bitrate_bps = (target_bitrate_kbps * 1000.0) as u32;

        let dynamic_resolution = config.get_bool("dynamic_resolution").unwrap_or(true);
        let resolution = if !dynamic_resolution {
            Resolution {
                width: config.get_int("fixed_resolution_width").unwrap_or(1280) as u32,
                height: config.get_int("fixed_resolution_height").unwrap_or(720) as u32,
            }
        } else {
            let use_4_3 = config.get_bool("use_4_3_resolution").unwrap_or(false);
            let list = if use_4_3 { RESOLUTIONS_4_3 } else { RESOLUTIONS_16_9 };
            best_match(list, target_bitrate_kbps * 1000.0)
        };

        let changed = state.last_resolution != Some(resolution);
        state.last_resolution = Some(resolution);

        let reason = if changed {
            AdaptationReason::Bitrate
        } else {
            AdaptationReason::None
        };

        OperatingPoint {
            resolution,
            framerate,
            bitrate_bps,
            reason,
            changed,
        }
    }

    /// Adapt-up/down hint surfaced to WebRTC as a scaling signal
    /// (spec.md §4.5 tie-break paragraph).
    pub fn adaptation_hint(&self) -> AdaptationHint {
        let state = self.state.lock();
        let qp = state.qp.average();
        let loss = state.packet_loss.average();
        let rtt = state.rtt_ms.average();

        if qp.map(|v| v > 35.0).unwrap_or(false) {
            return AdaptationHint::Down(AdaptationReason::Qp);
        }
        if loss.map(|v| v > 8.0).unwrap_or(false) {
            return AdaptationHint::Down(AdaptationReason::PacketLoss);
        }
        if rtt.map(|v| v > 200.0).unwrap_or(false) {
            return AdaptationHint::Down(AdaptationReason::Rtt);
        }
        if qp.map(|v| v < 24.0).unwrap_or(false) {
            return AdaptationHint::Up;
        }
        AdaptationHint::None
    }
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new()
    }
}

/// First match in iteration order whose reference bitrate is closest to
/// `target_bps` (spec.md §4.5 point 3, tie-break paragraph).
fn best_match(list: &[Resolution], target_bps: f64) -> Resolution {
    let mut best = list[0];
    let mut best_diff = (best.reference_bitrate() - target_bps).abs();
    for &candidate in &list[1..] {
        let diff = (candidate.reference_bitrate() - target_bps).abs();
        if diff < best_diff {
            best = candidate;
            best_diff = diff;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kush_gauge_reference_bitrates_match_scenario_5() {
        // spec.md §8 scenario 5: 320x240/640x480/1280x720 reference
        // midpoints are approximately 161/645/1935 kbps.
        let r320 = Resolution { width: 320, height: 240 }.reference_bitrate();
        let r640 = Resolution { width: 640, height: 480 }.reference_bitrate();
        let r1280 = Resolution { width: 1280, height: 720 }.reference_bitrate();
        assert!((r320 / 1000.0 - 161.3).abs() < 1.0, "got {}", r320 / 1000.0);
        assert!((r640 / 1000.0 - 645.1).abs() < 1.0, "got {}", r640 / 1000.0);
        assert!((r1280 / 1000.0 - 1935.4).abs() < 1.0, "got {}", r1280 / 1000.0);
    }

    #[test]
    fn selects_640x480_for_800kbps_target_scenario_5() {
        let list = [
            Resolution { width: 320, height: 240 },
            Resolution { width: 640, height: 480 },
            Resolution { width: 1280, height: 720 },
        ];
        let chosen = best_match(&list, 800_000.0);
        assert_eq!(chosen, Resolution { width: 640, height: 480 });
    }

    #[test]
    fn reports_no_change_when_resolution_repeats() {
        let controller = QualityController::new();
        let config = ConfigRegistry::with_defaults();
        config.patch_from_json(&serde_json::json!({"use_4_3_resolution": false})).unwrap();
        controller.report_target_bitrate(800);
        let first = controller.select_operating_point(&config);
        assert!(first.changed);
        let second = controller.select_operating_point(&config);
        assert!(!second.changed);
        assert_eq!(second.reason, AdaptationReason::None);
    }

    #[test]
    fn high_qp_raises_adapt_down_hint() {
        let controller = QualityController::new();
        for _ in 0..5 {
            controller.report_qp(40);
        }
        assert_eq!(controller.adaptation_hint(), AdaptationHint::Down(AdaptationReason::Qp));
    }

    #[test]
    fn low_qp_raises_adapt_up_hint() {
        let controller = QualityController::new();
        for _ in 0..5 {
            controller.report_qp(20);
        }
        assert_eq!(controller.adaptation_hint(), AdaptationHint::Up);
    }

    #[test]
    fn initial_operating_point_seeds_from_config_not_averages() {
        let controller = QualityController::new();
        let config = ConfigRegistry::with_defaults();
        let point = controller.initial_operating_point(&config);
        assert_eq!(point.framerate, 30);
        assert!(point.changed);
    }
}
