//! Test utilities and global setup
//!
//! Provides centralized test logging configuration, in-memory stand-ins
//! for the streams and sinks the relay talks to, and fixtures for fake
//! server installs.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::Utc;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use crate::bsp::framing::{DiagnosticSink, FrameDiagnostic};
use crate::launcher::config::{LauncherConfig, MANIFEST_FILE};
use crate::launcher::manifest::{InstallManifest, sha256_file};

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate and info for
    /// tokio. Output goes through the test writer so it is captured per test.
    ///
    /// ```bash
    /// RUST_LOG=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the enclosing module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Diagnostic sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    diagnostics: Mutex<Vec<FrameDiagnostic>>,
}

impl RecordingSink {
    pub fn diagnostics(&self) -> Vec<FrameDiagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, _source: &str, diagnostic: &FrameDiagnostic) {
        self.diagnostics.lock().unwrap().push(diagnostic.clone());
    }
}

/// Writer that records every write call and counts flushes
#[derive(Debug, Default)]
pub struct RecordingWriter {
    pub writes: Vec<Vec<u8>>,
    pub flushes: usize,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.writes.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Formatted log output of the current thread, kept in memory
#[derive(Clone, Debug, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Route this thread's events here until the guard drops
    pub fn install(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// A localhost port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Write a shell script and mark it executable
pub async fn write_executable(path: &Path, script: &str) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, script).await.unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(path, permissions).await.unwrap();
    }
}

/// Lay out a verified install of a do-nothing server for `version`
pub async fn install_fake_server(config: &LauncherConfig, version: &str) -> PathBuf {
    let dir = config.version_dir(version);
    let binary = dir.join("bin").join(&config.server_binary);
    write_executable(&binary, "#!/bin/sh\nexit 0\n").await;

    let manifest = InstallManifest {
        version: version.to_string(),
        binary: PathBuf::from("bin").join(&config.server_binary),
        sha256: sha256_file(&binary).await.unwrap(),
        installed_at: Utc::now(),
    };
    manifest.save(&dir.join(MANIFEST_FILE)).await.unwrap();
    binary
}
