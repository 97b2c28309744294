//! Realtime session bridge
//!
//! Owns the upstream connection, the session state machine, and the request
//! sequencing that turns queued text into spoken audio.

mod bridge;
mod limiter;
mod protocol;
mod retry;
mod session;
mod state;
mod upstream;

pub use bridge::{
    Bridge, BridgeBuilder, BridgeEvent, BridgeHandle, BridgeSettings, Role, Transcript,
};
pub use limiter::ConnectLimiter;
pub use protocol::{
    ClientEvent, ControlKind, ErrorBody, ItemRef, ResponseRef, ServerEvent, SessionConfig,
    SessionRef, VERBATIM_PREAMBLE,
};
pub use retry::{RetryPolicy, delay_for_attempt, is_recoverable};
pub use session::{Session, SessionId, SessionInfo};
pub use state::SessionState;
pub use upstream::{Connector, UpstreamLink, WireMessage, WsConnector};
