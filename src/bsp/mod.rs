//! Build Server Protocol relay
//!
//! - **framing**: incremental Content-Length parser and atomic re-emitter
//! - **forwarder**: two framed pumps bridging client and server channels

pub mod forwarder;
pub mod framing;

pub use forwarder::{DuplexForwarder, ForwardError, SessionSummary};
