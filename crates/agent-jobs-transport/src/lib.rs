//! Streaming relay and HTTP API for agent execution jobs.
//!
//! Provides:
//! - Wire frames and request/response bodies
//! - `StreamRelay` - Forwards one agent's events to one client channel
//! - HTTP routes (feature: http)

pub mod protocol;
pub mod relay;

#[cfg(feature = "http")]
pub mod error;

#[cfg(feature = "http")]
pub mod routes;

pub use protocol::{DONE_SENTINEL, RelayFrame};
pub use relay::{FrameWriter, RelayOutcome, StreamRelay};

#[cfg(feature = "http")]
pub use error::ApiError;

#[cfg(feature = "http")]
pub use routes::{ApiState, build_router};
