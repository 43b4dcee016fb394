mod bsp;
mod io;
mod launcher;
mod logging;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use io::Channel;
use launcher::{Launcher, LauncherConfig};
use logging::{LogConfig, init_logging};

use std::path::PathBuf;
use tracing::{error, info};

/// Printed when the positional arguments are not exactly one version
const USAGE_ERROR: &str = "accepts only one argument: the server version";

/// Exit status for command-line usage errors
const EXIT_USAGE: i32 = 2;

/// CLI arguments for the BSP launcher
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Build server version to connect to
    #[arg(value_name = "VERSION")]
    versions: Vec<String>,

    /// Host the server listens on (overrides BSP_LAUNCHER_HOST)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Well-known server port (overrides BSP_LAUNCHER_PORT)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory for installed servers (overrides BSP_LAUNCHER_HOME)
    #[arg(long, value_name = "DIR")]
    install_root: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides BSP_LAUNCHER_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Command line that cannot be acted on
#[derive(Debug, PartialEq, Eq)]
struct UsageError {
    message: &'static str,
    exit_code: i32,
}

impl Args {
    /// The single requested version
    fn version(&self) -> Result<&str, UsageError> {
        match self.versions.as_slice() {
            [version] => Ok(version.as_str()),
            _ => Err(UsageError {
                message: USAGE_ERROR,
                exit_code: EXIT_USAGE,
            }),
        }
    }
}

/// Report a fatal error and exit with status 1
///
/// The message always reaches stderr, even when logs go to a file.
fn fail(log_config: &LogConfig, message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    if log_config.file_path.is_some() {
        eprintln!("bsp-launcher: {message}");
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let version = match args.version() {
        Ok(version) => version.to_string(),
        Err(usage) => {
            eprintln!("{}", usage.message);
            std::process::exit(usage.exit_code);
        }
    };

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match LauncherConfig::from_env() {
        Ok(config) => config.with_overrides(args.host, args.port, args.install_root),
        Err(e) => fail(&log_config, e),
    };

    let launcher = match Launcher::new(config) {
        Ok(launcher) => launcher,
        Err(e) => fail(&log_config, e),
    };

    info!("BSP launcher starting for server version {}", version);

    match launcher.run(&version, Channel::stdio()).await {
        Ok(summary) => {
            info!("Session {} closed", summary.session_id);
            // A blocking stdin read may still hold a runtime thread
            std::process::exit(0);
        }
        Err(e) => fail(&log_config, format_args!("Launch failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_version_accepted() {
        let args = Args::parse_from(["bsp-launcher", "2.1.0"]);
        assert_eq!(args.version(), Ok("2.1.0"));
    }

    #[test]
    fn test_wrong_arity_is_a_usage_error() {
        let expected = UsageError {
            message: "accepts only one argument: the server version",
            exit_code: 2,
        };

        let args = Args::parse_from(["bsp-launcher"]);
        assert_eq!(args.version(), Err(expected));

        let args = Args::parse_from(["bsp-launcher", "1.0.0", "2.0.0"]);
        let usage = args.version().unwrap_err();
        assert_eq!(usage.message, USAGE_ERROR);
        assert_eq!(usage.exit_code, EXIT_USAGE);
    }

    #[test]
    fn test_options_parse() {
        let args = Args::parse_from([
            "bsp-launcher",
            "--port",
            "9000",
            "--install-root",
            "/opt/bsp",
            "1.0.0",
        ]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.install_root, Some(PathBuf::from("/opt/bsp")));
        assert_eq!(args.version(), Ok("1.0.0"));
    }
}
