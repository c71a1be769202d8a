//! C8 WebSocket Signaling: chunked-JSON reassembly, command dispatch,
//! per-session state.

mod chunked;
mod messages;
mod server;

pub use chunked::ChunkedFrameBuffer;
pub use messages::{ClientCommand, ConfigAction, ServerEnvelope};
pub use server::SignalingServer;
