//! I/O layer - Byte channels, socket connections and child processes
//!
//! Nothing in here knows about BSP framing:
//!
//! - **Channel**: owned duplex endpoint with independent halves
//! - **Connector**: one connection attempt to a server address
//! - **Process**: detached build server child process

pub mod channel;
pub mod connector;
pub mod process;

pub use channel::Channel;
pub use connector::{Connector, ServerAddress, TcpConnector};
pub use process::ServerProcess;
