//! Shared foundation of the kiln UDF execution service.
//!
//! This crate holds everything both sides of the process boundary agree
//! on: token shapes, error kinds, the control-protocol messages, the
//! length-delimited and padded framings, request tags, configuration, and
//! the respawn policy. It has no I/O of its own beyond the blocking frame
//! helpers; the host and the worker runner build their transports on top.

pub mod backoff;
pub mod config;
pub mod error;
pub mod framing;
pub mod messages;
pub mod padded;
pub mod tags;
pub mod token;

pub use backoff::{Backoff, RespawnPolicy, RespawnTracker};
pub use config::ServiceConfig;
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use framing::{FrameCodec, FrameError, MAX_FRAME_LEN, read_frame, write_frame};
pub use messages::{ExecStatus, LoaderKind, WireError, WireMessage};
pub use padded::{CompressionKind, PaddedCodec, PaddedFrame, PaddedFrameError};
pub use tags::Severity;
pub use token::{CodeToken, ExecutionToken, TOKEN_LEN, TokenError};
