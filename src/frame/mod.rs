//! C1 Frame Buffer and C2 Frame Queue: the encoded-frame pipeline that turns
//! encoder segment callbacks into complete access units.

mod buffer;
mod queue;

pub use buffer::{FrameBuffer, FrameFlags};
pub use queue::FrameQueue;
