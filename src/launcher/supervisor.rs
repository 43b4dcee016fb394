//! Server start-up supervision
//!
//! Starts the server process when the resolved location is a binary, then
//! polls the advertised socket with a bounded number of attempts. The
//! process is detached once the socket opens, so it outlives the launcher.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::io::process::ProcessError;
use crate::io::{Connector, ServerAddress, ServerProcess};
use crate::launcher::config::LauncherConfig;
use crate::launcher::error::LaunchError;
use crate::launcher::resolver::ServerLocation;

pub struct Supervisor {
    config: Arc<LauncherConfig>,
    connector: Arc<dyn Connector>,
}

impl Supervisor {
    pub fn new(config: Arc<LauncherConfig>, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Bring up the server at `location` and return an open connection to it
    pub async fn start(
        &self,
        version: &str,
        location: ServerLocation,
    ) -> Result<TcpStream, LaunchError> {
        let binary = match location {
            ServerLocation::RunningSocket(address) => return self.poll(&address, None).await,
            ServerLocation::RunningBinary(binary) | ServerLocation::InstalledBinary(binary) => {
                binary
            }
        };

        let log_path = self.config.server_log_path();
        if let Some(dir) = log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ProcessError::LogFile {
                    path: log_path.clone(),
                    source,
                })?;
        }

        let mut process =
            ServerProcess::new(binary, self.config.server_args_for(version)).with_log_file(log_path);
        process.start()?;

        let address = self.config.server_address(version);
        match self.poll(&address, Some(&mut process)).await {
            Ok(stream) => {
                if let Some(pid) = process.detach() {
                    debug!("Server process {} left running", pid);
                }
                Ok(stream)
            }
            Err(e) => {
                if process.state().is_running()
                    && let Err(kill_error) = process.kill().await
                {
                    warn!("Failed to stop server after failed start-up: {}", kill_error);
                }
                Err(e)
            }
        }
    }

    /// Connect to `address` within the configured attempt bound
    ///
    /// When `process` is given, its early exit aborts polling.
    async fn poll(
        &self,
        address: &ServerAddress,
        mut process: Option<&mut ServerProcess>,
    ) -> Result<TcpStream, LaunchError> {
        let retry = &self.config.retry;
        let mut last_error = String::from("no connection attempted");
        debug!(
            "Polling {} for up to {} attempts ({:?} of back-off)",
            address,
            retry.max_attempts,
            retry.total_delay()
        );

        for attempt in 0..retry.max_attempts {
            if let Some(process) = process.as_deref_mut()
                && let Some(status) = process.try_exit_status()?
            {
                return Err(LaunchError::ServerExited {
                    address: address.clone(),
                    status,
                });
            }

            match self.connector.connect(address).await {
                Ok(stream) => {
                    info!("Connected to server at {} (attempt {})", address, attempt + 1);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        retry.max_attempts,
                        address,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < retry.max_attempts {
                tokio::time::sleep(retry.delay_for(attempt)).await;
            }
        }

        Err(LaunchError::startup_timeout(
            address.clone(),
            retry.max_attempts,
            last_error,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TcpConnector;
    use crate::launcher::retry::RetryConfig;
    use crate::test_utils::{closed_port, write_executable};
    use async_trait::async_trait;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    /// Refuses the first `fail_first` attempts, then connects for real
    struct CountingConnector {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingConnector {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, address: &ServerAddress) -> io::Result<TcpStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            TcpConnector::default().connect(address).await
        }
    }

    fn config(root: &Path, port: u16, attempts: u32, delay: Duration) -> Arc<LauncherConfig> {
        Arc::new(
            LauncherConfig::default()
                .with_overrides(None, Some(port), Some(root.to_path_buf()))
                .with_port_span(1)
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(attempts)
                        .with_base_delay(delay)
                        .with_max_delay(delay),
                ),
        )
    }

    #[tokio::test]
    async fn test_fails_after_exactly_max_attempts() {
        let root = tempfile::tempdir().unwrap();
        let port = closed_port().await;
        let config = config(root.path(), port, 4, Duration::ZERO);
        let connector = CountingConnector::new(u32::MAX);
        let supervisor = Supervisor::new(config.clone(), connector.clone());

        let result = supervisor
            .start(
                "1.0.0",
                ServerLocation::RunningSocket(config.server_address("1.0.0")),
            )
            .await;

        assert!(matches!(
            result,
            Err(LaunchError::StartupTimeout { attempts: 4, .. })
        ));
        assert_eq!(connector.calls(), 4);
    }

    #[tokio::test]
    async fn test_connects_once_socket_opens() {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = config(root.path(), port, 10, Duration::from_millis(1));
        let connector = CountingConnector::new(2);
        let supervisor = Supervisor::new(config.clone(), connector.clone());

        let stream = supervisor
            .start(
                "1.0.0",
                ServerLocation::RunningSocket(config.server_address("1.0.0")),
            )
            .await;

        assert!(stream.is_ok());
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_exiting_early_fails_fast() {
        let root = tempfile::tempdir().unwrap();
        let binary = root.path().join("bin/bsp-server");
        write_executable(&binary, "#!/bin/sh\necho giving up >&2\nexit 1\n").await;

        let config = config(root.path(), closed_port().await, 1000, Duration::from_millis(10));
        let connector = CountingConnector::new(u32::MAX);
        let supervisor = Supervisor::new(config.clone(), connector.clone());

        let result = supervisor
            .start("1.0.0", ServerLocation::InstalledBinary(binary))
            .await;

        match result {
            Err(LaunchError::ServerExited { status, .. }) => assert_eq!(status.code(), Some(1)),
            other => panic!("expected ServerExited, got {other:?}"),
        }
        assert!(connector.calls() < 1000);

        let log = std::fs::read_to_string(config.server_log_path()).unwrap();
        assert!(log.contains("giving up"));
    }

    #[tokio::test]
    async fn test_spawned_server_receives_arguments() {
        let root = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let binary = root.path().join("bsp-server");
        write_executable(&binary, "#!/bin/sh\necho \"args: $@\"\nexec sleep 2\n").await;

        let config = config(root.path(), port, 50, Duration::from_millis(20));
        let connector = CountingConnector::new(3);
        let supervisor = Supervisor::new(config.clone(), connector);

        supervisor
            .start("1.0.0", ServerLocation::RunningBinary(binary))
            .await
            .unwrap();

        let expected = format!("args: server --host 127.0.0.1 --port {port}");
        let mut log = String::new();
        for _ in 0..100 {
            log = std::fs::read_to_string(config.server_log_path()).unwrap_or_default();
            if log.contains(&expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(log.contains(&expected), "{log}");
    }

    #[tokio::test]
    async fn test_timeout_with_spawned_server() {
        let root = tempfile::tempdir().unwrap();
        let binary = root.path().join("bsp-server");
        write_executable(&binary, "#!/bin/sh\nexec sleep 30\n").await;

        let config = config(root.path(), closed_port().await, 3, Duration::from_millis(5));
        let connector = CountingConnector::new(u32::MAX);
        let supervisor = Supervisor::new(config, connector.clone());

        let result = supervisor
            .start("1.0.0", ServerLocation::InstalledBinary(binary))
            .await;

        assert!(matches!(
            result,
            Err(LaunchError::StartupTimeout { attempts: 3, .. })
        ));
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_process_error() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path(), closed_port().await, 3, Duration::ZERO);
        let supervisor = Supervisor::new(config, CountingConnector::new(0));

        let result = supervisor
            .start(
                "1.0.0",
                ServerLocation::InstalledBinary(root.path().join("missing")),
            )
            .await;

        assert!(matches!(
            result,
            Err(LaunchError::Process(ProcessError::Spawn { .. }))
        ));
    }
}
