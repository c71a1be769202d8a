//! C6 Encoder Adapter: bridges the Frame Queue/Encoder Wrapper to the
//! `webrtc` crate's sample-track sink.

pub mod adapter;
pub mod audio;
pub mod session;

pub use adapter::{EncodedImage, EncoderAdapter, NalFragment};
pub use audio::AudioTrack;
pub use session::WebRtcPeer;
