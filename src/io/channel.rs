//! Duplex byte channels
//!
//! A [`Channel`] is an owned byte endpoint with independent read and write
//! halves. The relay takes ownership of two channels for the lifetime of a
//! session; dropping a half closes it.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Read half of a channel
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a channel
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Owned duplex endpoint
pub struct Channel {
    /// Human readable name used in logs
    name: String,

    reader: ChannelReader,

    writer: ChannelWriter,
}

impl Channel {
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The launcher's own stdin/stdout, i.e. the BSP client's connection
    pub fn stdio() -> Self {
        Self::new("client", tokio::io::stdin(), tokio::io::stdout())
    }

    /// Split a connected TCP stream into a channel
    pub fn from_tcp(stream: TcpStream) -> Self {
        let name = stream
            .peer_addr()
            .map(|addr| format!("server@{addr}"))
            .unwrap_or_else(|_| "server".to_string());
        let (reader, writer) = stream.into_split();
        Self::new(name, reader, writer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}
