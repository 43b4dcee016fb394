//! Launcher - from a version string to a running BSP session
//!
//! - **config**: defaults, environment and CLI configuration
//! - **resolver**: where a server for a version is reachable
//! - **installer**: fetch and place server artifacts
//! - **supervisor**: start the server and poll its socket
//! - **manifest**: on-disk record of an install
//! - **retry**: bounded polling schedule
//! - **error**: error types for all of the above

pub mod config;
pub mod error;
pub mod installer;
pub mod manifest;
pub mod resolver;
pub mod retry;
pub mod supervisor;

pub use config::LauncherConfig;

use config::validate_version;
use error::LaunchError;
use installer::Installer;
use resolver::{ServerLocation, ServerResolver, ServerState};
use supervisor::Supervisor;

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{Instrument, Level, info, info_span};

use crate::bsp::{DuplexForwarder, SessionSummary};
use crate::io::{Channel, Connector, TcpConnector};
use crate::log_timing;

/// Resolves, installs and starts a server, then relays a client to it
pub struct Launcher {
    config: Arc<LauncherConfig>,
    resolver: ServerResolver,
    installer: Installer,
    supervisor: Supervisor,
}

impl Launcher {
    /// Launcher talking TCP and installing with the configured command
    pub fn new(config: LauncherConfig) -> Result<Self, LaunchError> {
        config.validate()?;
        let config = Arc::new(config);
        let connector = Arc::new(TcpConnector::new(config.connect_timeout));
        let installer = Installer::from_config(Arc::clone(&config));
        Ok(Self::with_parts(config, connector, installer))
    }

    pub fn with_parts(
        config: Arc<LauncherConfig>,
        connector: Arc<dyn Connector>,
        installer: Installer,
    ) -> Self {
        Self {
            resolver: ServerResolver::new(Arc::clone(&config), Arc::clone(&connector)),
            installer,
            supervisor: Supervisor::new(Arc::clone(&config), connector),
            config,
        }
    }

    /// Resolve `version`, installing it when no server is found
    pub async fn prepare(&self, version: &str) -> Result<ServerLocation, LaunchError> {
        validate_version(version)?;

        match self.resolver.resolve(version).await {
            ServerState::AvailableAt(location) => Ok(location),
            ServerState::NotFound => {
                info!("No server {} found, installing", version);
                let started = Instant::now();
                let binary = self.installer.install(version, &self.resolver).await?;
                log_timing!(Level::INFO, "install", started.elapsed());
                Ok(ServerLocation::InstalledBinary(binary))
            }
        }
    }

    /// Open a connection to a running server for `version`
    pub async fn connect(&self, version: &str) -> Result<TcpStream, LaunchError> {
        let location = self.prepare(version).await?;
        info!("Using {}", location);

        let started = Instant::now();
        let stream = self.supervisor.start(version, location).await?;
        log_timing!(Level::DEBUG, "server start-up", started.elapsed());
        Ok(stream)
    }

    /// Relay `client` to the server for `version` until either side closes
    pub async fn run(&self, version: &str, client: Channel) -> Result<SessionSummary, LaunchError> {
        let stream = self.connect(version).await?;
        let forwarder = DuplexForwarder::new(client, Channel::from_tcp(stream))
            .with_chunk_size(self.config.read_chunk_size)
            .with_max_message_size(self.config.max_message_size);

        let span = info_span!("session", id = %forwarder.session_id(), version);
        let summary = forwarder.run().instrument(span).await?;
        for (direction, stats) in [
            ("client->server", &summary.client_to_server),
            ("server->client", &summary.server_to_client),
        ] {
            info!(
                session_id = %summary.session_id,
                direction,
                messages = stats.messages,
                bytes = stats.bytes_read,
                dropped_frames = stats.dropped_frames,
                trailing_bytes = stats.trailing_bytes,
                "Session stream closed"
            );
        }
        info!(
            session_id = %summary.session_id,
            closed_first = %summary.closed_first,
            "Session finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsp::forwarder::Direction;
    use crate::launcher::error::InstallError;
    use crate::launcher::installer::ArtifactFetcher;
    use crate::launcher::retry::RetryConfig;
    use crate::test_utils::closed_port;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactFetcher for CountingFetcher {
        async fn fetch(&self, _version: &str, dest: &Path) -> Result<(), InstallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest.join("bsp-server"), b"#!/bin/sh\nexit 0\n")
                .await
                .unwrap();
            Ok(())
        }
    }

    fn launcher(root: &Path, port: u16, fetcher: Arc<CountingFetcher>) -> Launcher {
        let config = Arc::new(
            LauncherConfig::default()
                .with_overrides(None, Some(port), Some(root.to_path_buf()))
                .with_port_span(1)
                .with_search_path(Vec::new())
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(5)
                        .with_base_delay(Duration::from_millis(10)),
                ),
        );
        let installer = Installer::new(Arc::clone(&config), Some(fetcher));
        Launcher::with_parts(config, Arc::new(TcpConnector::default()), installer)
    }

    /// Accept one connection and echo every byte back
    async fn echo_server() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            // The resolver's liveness check is the first connection
            let _ = listener.accept().await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, mut writer) = stream.into_split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_running_server_skips_installer() {
        let root = tempfile::tempdir().unwrap();
        let (port, _server) = echo_server().await;
        let fetcher = Arc::new(CountingFetcher::default());
        let launcher = launcher(root.path(), port, fetcher.clone());

        let location = launcher.prepare("1.0.0").await.unwrap();

        assert!(matches!(location, ServerLocation::RunningSocket(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_absent_server_is_installed() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let launcher = launcher(root.path(), closed_port().await, fetcher.clone());

        let location = launcher.prepare("1.0.0").await.unwrap();

        assert_eq!(
            location,
            ServerLocation::InstalledBinary(root.path().join("1.0.0").join("bsp-server"))
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        launcher.prepare("1.0.0").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_version_touches_nothing() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let launcher = launcher(root.path(), closed_port().await, fetcher.clone());

        let result = launcher.prepare("../escape").await;

        assert!(matches!(result, Err(LaunchError::InvalidVersion { .. })));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_session_relays_through_running_server() {
        let root = tempfile::tempdir().unwrap();
        let (port, _server) = echo_server().await;
        let launcher = launcher(root.path(), port, Arc::new(CountingFetcher::default()));

        let (relay_in, mut client_out) = duplex(4096);
        let (mut client_in, relay_out) = duplex(4096);
        let client = Channel::new("client", relay_in, relay_out);

        let session = tokio::spawn(async move { launcher.run("1.0.0", client).await });

        let frame = b"Content-Length: 17\r\n\r\n{\"jsonrpc\":\"2.0\"}";
        client_out.write_all(frame).await.unwrap();

        let mut echoed = vec![0u8; frame.len()];
        client_in.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, frame);

        drop(client_out);
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.closed_first, Direction::ClientToServer);
        assert_eq!(summary.client_to_server.messages, 1);
        assert_eq!(summary.server_to_client.messages, 1);
    }
}
