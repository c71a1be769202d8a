//! C3 Encoder Wrapper and C4 Delayed-Reinit Controller.

mod reinit;
mod wrapper;

pub use reinit::{DelayedReinitController, ReinitAction, ReinitStatus};
pub use wrapper::{EncoderParams, EncoderState, EncoderWrapper};
