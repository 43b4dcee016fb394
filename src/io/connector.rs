//! Socket connection seam
//!
//! The resolver checks and the supervisor polls the server's advertised
//! address through [`Connector`], which keeps both testable without a real
//! server.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Default bound on a single connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Address a build server listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens connections to a server address
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one connection attempt
    async fn connect(&self, address: &ServerAddress) -> io::Result<TcpStream>;
}

/// Plain TCP connector with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> io::Result<TcpStream> {
        trace!("TcpConnector: connecting to {}", address);

        let attempt = TcpStream::connect((address.host.as_str(), address.port));
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {address} timed out after {:?}", self.timeout),
            )),
        }
    }
}
