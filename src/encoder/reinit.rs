//! C4 Delayed-Reinit Controller (spec.md §4.4).
//!
//! Debounces encoder parameter changes into a single hardware reinit no
//! more often than once per `Δ = 4000 ms`, so the bandwidth estimator isn't
//! perturbed by back-to-back tear-downs.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::wrapper::EncoderParams;

pub const DELTA: Duration = Duration::from_millis(4000);
/// Periodic tick interval while status != PASS, per spec.md §4.4/§5.
pub const TICK_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinitStatus {
    Pass,
    Waiting,
    Delay,
}

struct State {
    status: ReinitStatus,
    t_last: Instant,
    cached: Option<EncoderParams>,
}

/// Serializes encoder reinit requests behind the debounce state machine in
/// spec.md §4.4. Callers drive it with `request_reinit` (from `set_rates`/
/// the Quality Controller) and `tick` (from a 100 ms periodic task).
pub struct DelayedReinitController {
    state: Mutex<State>,
}

/// Action the caller must perform after a `request_reinit` or `tick` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReinitAction {
    /// No hardware reinit is due yet.
    None,
    /// Perform the actual hardware reinit with these params now.
    ReinitNow(EncoderParams),
}

impl DelayedReinitController {
    pub fn new() -> Self {
        DelayedReinitController {
            state: Mutex::new(State {
                status: ReinitStatus::Pass,
                t_last: Instant::now(),
                cached: None,
            }),
        }
    }

    pub fn status(&self) -> ReinitStatus {
        self.state.lock().status
    }

    /// Called whenever the Quality Controller (or a direct caller) wants a
    /// parameter change applied. PASS executes immediately; WAITING/DELAY
    /// cache the request for the next tick.
    pub fn request_reinit(&self, params: EncoderParams) -> ReinitAction {
        let mut state = self.state.lock();
        match state.status {
            ReinitStatus::Pass => {
                state.t_last = Instant::now();
                state.status = ReinitStatus::Waiting;
                state.cached = None;
                ReinitAction::ReinitNow(params)
            }
            ReinitStatus::Waiting | ReinitStatus::Delay => {
                let changed = state.cached.as_ref() != Some(&params);
                if changed {
                    state.t_last = Instant::now();
                    state.cached = Some(params);
                }
                state.status = ReinitStatus::Delay;
                ReinitAction::None
            }
        }
    }

    /// Periodic ~100 ms tick. Returns `ReinitNow` when `Δ` has elapsed in
    /// DELAY with a cached request; transitions WAITING back to PASS once
    /// `Δ` has elapsed with no newer cached params.
    pub fn tick(&self) -> ReinitAction {
        let mut state = self.state.lock();
        let elapsed = state.t_last.elapsed();
        match state.status {
            ReinitStatus::Delay if elapsed >= DELTA => {
                let params = state.cached.take();
                state.t_last = Instant::now();
                state.status = ReinitStatus::Waiting;
                match params {
                    Some(p) => ReinitAction::ReinitNow(p),
                    None => ReinitAction::None,
                }
            }
            ReinitStatus::Waiting if elapsed >= DELTA => {
                state.status = ReinitStatus::Pass;
                ReinitAction::None
            }
            _ => ReinitAction::None,
        }
    }
}

impl Default for DelayedReinitController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(w: u32) -> EncoderParams {
        EncoderParams {
            width: w,
            height: w * 9 / 16,
            framerate: 30,
            bitrate: 1_000_000,
        }
    }

    #[test]
    fn first_reinit_executes_immediately_from_pass() {
        let ctl = DelayedReinitController::new();
        assert_eq!(ctl.status(), ReinitStatus::Pass);
        let action = ctl.request_reinit(params(1280));
        assert_eq!(action, ReinitAction::ReinitNow(params(1280)));
        assert_eq!(ctl.status(), ReinitStatus::Waiting);
    }

    #[test]
    fn subsequent_reinits_are_cached_not_executed() {
        let ctl = DelayedReinitController::new();
        ctl.request_reinit(params(1280));
        let action = ctl.request_reinit(params(640));
        assert_eq!(action, ReinitAction::None);
        assert_eq!(ctl.status(), ReinitStatus::Delay);
    }

    #[test]
    fn tick_before_delta_does_nothing() {
        let ctl = DelayedReinitController::new();
        ctl.request_reinit(params(1280));
        ctl.request_reinit(params(640));
        assert_eq!(ctl.tick(), ReinitAction::None);
    }

    #[test]
    fn rate_is_bounded_to_one_reinit_per_delta() {
        // Functional analogue of scenario 4 (spec.md §8): two cached
        // requests collapse into exactly one reinit with the most recent
        // params once the controller is forced past Δ.
        let ctl = DelayedReinitController::new();
        ctl.request_reinit(params(1280));
        ctl.request_reinit(params(640));
        // force the debounce window to have elapsed without a real sleep
        ctl.state.lock().t_last = Instant::now() - DELTA;
        let action = ctl.tick();
        assert_eq!(action, ReinitAction::ReinitNow(params(640)));
        assert_eq!(ctl.status(), ReinitStatus::Waiting);
    }

    #[test]
    fn waiting_returns_to_pass_after_delta_with_no_new_request() {
        let ctl = DelayedReinitController::new();
        ctl.request_reinit(params(1280));
        ctl.state.lock().t_last = Instant::now() - DELTA;
        assert_eq!(ctl.tick(), ReinitAction::None);
        assert_eq!(ctl.status(), ReinitStatus::Pass);
    }
}
