//! C7 Session Proxy: enforces the single-active-peer invariant.

mod proxy;

pub use proxy::{FrontEnd, Session, SessionProxy, SessionStatus};
